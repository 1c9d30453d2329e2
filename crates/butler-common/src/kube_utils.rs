//! Shared Kubernetes utilities using kube-rs
//!
//! Provides the handful of kubectl-equivalent operations the bootstrap flow
//! needs (create, get, replace, merge-patch of arbitrary manifests) without
//! shelling out to kubectl.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition,
};
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Condition type marking a CRD as served by the API server
pub const CONDITION_ESTABLISHED: &str = "Established";

/// Condition status string for a satisfied condition
pub const STATUS_TRUE: &str = "True";

/// Connection timeout for kube clients (the substrate API server is local)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Client
// =============================================================================

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::environment(format!(
            "failed to read kubeconfig {}: {}",
            kubeconfig.display(),
            e
        ))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::environment(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::environment(format!("failed to create client: {}", e)))
}

// =============================================================================
// ApiResource building
// =============================================================================

/// Parse an apiVersion string into (group, version)
///
/// Core resources ("v1") have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind as found in a manifest
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Kinds whose plural isn't produced by the fallback rules below
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("priorityclass", "priorityclasses"),
    ("storageclass", "storageclasses"),
    ("ingressclass", "ingressclasses"),
];

/// Pluralize a resource kind for use in API paths
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Manifest parsing
// =============================================================================

/// Metadata extracted from a single manifest document
#[derive(Clone, Debug)]
pub struct ManifestMetadata {
    /// The full document
    pub value: Value,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if the object is namespaced
    pub namespace: Option<String>,
    /// API resource derived from apiVersion/kind
    pub api_resource: ApiResource,
}

impl ManifestMetadata {
    /// Short human readable identifier, e.g. `Deployment/butler-system/foo`
    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.api_resource.kind, ns, self.name),
            None => format!("{}/{}", self.api_resource.kind, self.name),
        }
    }
}

/// Extract manifest metadata from a parsed document
pub fn parse_manifest(value: Value) -> Result<ManifestMetadata> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::deploy("manifest", "manifest missing apiVersion"))?
        .to_string();
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::deploy("manifest", "manifest missing kind"))?
        .to_string();
    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::deploy(&kind, "manifest missing metadata.name"))?
        .to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ManifestMetadata {
        api_resource: build_api_resource(&api_version, &kind),
        value,
        name,
        namespace,
    })
}

/// Split a multi-document YAML stream into manifests.
///
/// Empty and comment-only documents are skipped, as are documents that are not
/// Kubernetes objects (no apiVersion).
pub fn parse_manifests(source: &str, content: &str) -> Result<Vec<ManifestMetadata>> {
    let mut manifests = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            Error::deploy(
                format!("{}#{}", source, index),
                format!("invalid YAML: {}", e),
            )
        })?;

        if value.is_null() {
            continue;
        }
        if value.get("apiVersion").is_none() {
            debug!(source, index, "skipping document without apiVersion");
            continue;
        }

        let manifest = parse_manifest(value).map_err(|e| {
            Error::deploy(format!("{}#{}", source, index), e.to_string())
        })?;
        manifests.push(manifest);
    }

    Ok(manifests)
}

// =============================================================================
// Conditions and readiness
// =============================================================================

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for CustomResourceDefinitionCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check whether a condition of the given type is present with status True
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Whether a CRD reports the Established condition
pub fn crd_is_established(crd: &CustomResourceDefinition) -> bool {
    let conditions = crd.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_ESTABLISHED)
}

/// Whether a Deployment has rolled out its current generation with exactly
/// the desired number of ready replicas
///
/// A surplus of ready replicas means an old ReplicaSet is still draining, and
/// an `observedGeneration` behind `metadata.generation` means the status
/// describes an earlier spec.
pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
    let generation = deployment.metadata.generation.unwrap_or(0);
    desired > 0 && ready == desired && observed >= generation
}

// =============================================================================
// ResourceStore
// =============================================================================

/// Minimal object store over the Kubernetes API.
///
/// Objects travel as JSON values so bundled manifests of any kind can be
/// applied; typed callers serialize into and out of this representation.
/// `create` reports an existing object as [`Error::AlreadyExists`] and `get`
/// reports a missing one as `Ok(None)`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>>;

    /// Create an object
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<()>;

    /// Replace an object; `object` must carry the current resourceVersion
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
    ) -> Result<()>;

    /// Apply a JSON merge patch
    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()>;
}

/// [`ResourceStore`] backed by a live API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using a kubeconfig file
    pub async fn connect(kubeconfig: &Path) -> Result<Self> {
        Ok(Self::new(create_client(kubeconfig).await?))
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>> {
        match self.api(resource, namespace).get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        match self
            .api(resource, namespace)
            .create(&PostParams::default(), &obj)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(Error::already_exists(&resource.kind, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
    ) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        self.api(resource, namespace)
            .replace(name, &PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
