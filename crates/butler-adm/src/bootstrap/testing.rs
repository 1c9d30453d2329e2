//! In-memory [`ResourceStore`] for tests

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::discovery::ApiResource;
use serde_json::{json, Value};

use butler_common::kube_utils::ResourceStore;
use butler_common::{Error, Result};

type Key = (String, Option<String>, String);
type Reaction = Box<dyn Fn(&mut Value) + Send + Sync>;

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        format!("{}.{}", resource.plural, resource.group),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    creates: usize,
    replaces: usize,
    failing_gets: usize,
    reactions: HashMap<String, Vec<Reaction>>,
    scripts: HashMap<Key, VecDeque<Value>>,
}

impl State {
    fn stamp(&mut self, object: &mut Value) {
        self.next_version += 1;
        object["metadata"]["resourceVersion"] = json!(self.next_version.to_string());
    }

    fn react(&self, kind: &str, object: &mut Value) {
        for reaction in self.reactions.get(kind).into_iter().flatten() {
            reaction(object);
        }
    }
}

/// Object store kept in memory, with optional reactions that play the part
/// of controllers (marking CRDs established, Deployments ready, ...)
#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store where created CRDs are immediately Established and Deployments
    /// immediately ready
    pub(crate) fn with_ready_workloads() -> Self {
        let store = Self::new();
        store.on_write("CustomResourceDefinition", |obj| {
            obj["status"] = json!({
                "acceptedNames": obj["spec"]["names"].clone(),
                "conditions": [{"type": "Established", "status": "True"}]
            });
        });
        store.on_write("Deployment", |obj| {
            let replicas = obj["spec"]["replicas"].as_i64().unwrap_or(1);
            let generation = obj["metadata"]["generation"].as_i64().unwrap_or(0);
            obj["status"] = json!({
                "replicas": replicas,
                "readyReplicas": replicas,
                "observedGeneration": generation
            });
        });
        store
    }

    /// Run `reaction` on every created or replaced object of `kind`
    pub(crate) fn on_write(&self, kind: &str, reaction: impl Fn(&mut Value) + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .reactions
            .entry(kind.to_string())
            .or_default()
            .push(Box::new(reaction));
    }

    /// Successive gets of the object see these statuses in turn; the last
    /// one repeats
    pub(crate) fn script_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        statuses: Vec<Value>,
    ) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(key(resource, namespace, name), statuses.into());
    }

    /// The next `count` gets fail
    pub(crate) fn fail_next_gets(&self, count: usize) {
        self.state.lock().unwrap().failing_gets = count;
    }

    /// Insert an object as-is
    pub(crate) fn insert(&self, resource: &ApiResource, namespace: Option<&str>, mut object: Value) {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        state.stamp(&mut object);
        state.objects.insert(key(resource, namespace, &name), object);
    }

    pub(crate) fn object(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub(crate) fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub(crate) fn replaces(&self) -> usize {
        self.state.lock().unwrap().replaces
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        let mut state = self.state.lock().unwrap();
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(Error::environment("connection refused"));
        }

        let k = key(resource, namespace, name);
        let status = match state.scripts.get_mut(&k) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        let Some(object) = state.objects.get_mut(&k) else {
            return Ok(None);
        };
        if let Some(status) = status {
            object["status"] = status;
        }
        Ok(Some(object.clone()))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<()> {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let k = key(resource, namespace, &name);
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&k) {
            return Err(Error::already_exists(&resource.kind, name));
        }
        let mut object = object.clone();
        state.stamp(&mut object);
        state.react(&resource.kind, &mut object);
        state.creates += 1;
        state.objects.insert(k, object);
        Ok(())
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
    ) -> Result<()> {
        let k = key(resource, namespace, name);
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.objects.get(&k) else {
            return Err(Error::environment(format!("{} {} not found", resource.kind, name)));
        };
        if current["metadata"]["resourceVersion"] != object["metadata"]["resourceVersion"] {
            return Err(Error::environment(format!(
                "conflict replacing {} {}: stale resourceVersion",
                resource.kind, name
            )));
        }
        let mut object = object.clone();
        state.stamp(&mut object);
        state.react(&resource.kind, &mut object);
        state.replaces += 1;
        state.objects.insert(k, object);
        Ok(())
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let k = key(resource, namespace, name);
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.objects.get_mut(&k) else {
            return Err(Error::environment(format!("{} {} not found", resource.kind, name)));
        };
        merge(current, patch);
        Ok(())
    }
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
