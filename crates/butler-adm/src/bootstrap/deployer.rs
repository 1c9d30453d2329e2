//! Bundled manifests and how they are applied
//!
//! CRDs and controller workloads ship inside the binary. Applying is
//! create-or-update, so a reused substrate converges to the bundled state.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::discovery::ApiResource;
use serde::Serialize;
use tracing::{debug, info};

use butler_common::crd::ProviderType;
use butler_common::kube_utils::{
    crd_is_established, deployment_is_ready, parse_manifest, parse_manifests, ManifestMetadata,
    ResourceStore,
};
use butler_common::{
    context::DEFAULT_POLL_INTERVAL, poll_until, Error, Result, RunContext, BUTLER_NAMESPACE,
};

/// A manifest file compiled into the binary
#[derive(Clone, Copy, Debug)]
pub struct BundledManifest {
    /// Path relative to the manifests directory, used in errors
    pub source: &'static str,
    /// YAML stream
    pub content: &'static str,
}

macro_rules! bundled {
    ($path:literal) => {
        BundledManifest {
            source: $path,
            content: include_str!(concat!("../../manifests/", $path)),
        }
    };
}

/// Butler CRDs
pub const CRD_MANIFESTS: &[BundledManifest] = &[
    bundled!("crds/butler.butlerlabs.dev_machinerequests.yaml"),
    bundled!("crds/butler.butlerlabs.dev_providerconfigs.yaml"),
    bundled!("crds/butler.butlerlabs.dev_clusterbootstraps.yaml"),
];

/// Names of the CRDs in [`CRD_MANIFESTS`]
pub const CRD_NAMES: &[&str] = &[
    "machinerequests.butler.butlerlabs.dev",
    "providerconfigs.butler.butlerlabs.dev",
    "clusterbootstraps.butler.butlerlabs.dev",
];

const BOOTSTRAP_CONTROLLER_MANIFEST: BundledManifest =
    bundled!("controllers/butler-bootstrap.yaml");
const HARVESTER_CONTROLLER_MANIFEST: BundledManifest =
    bundled!("controllers/butler-provider-harvester.yaml");
const NUTANIX_CONTROLLER_MANIFEST: BundledManifest =
    bundled!("controllers/butler-provider-nutanix.yaml");
const PROXMOX_CONTROLLER_MANIFEST: BundledManifest =
    bundled!("controllers/butler-provider-proxmox.yaml");

/// Deployment running the bootstrap controller
pub const BOOTSTRAP_CONTROLLER_NAME: &str = "butler-bootstrap-controller";

/// How long CRDs get to become Established
pub const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// How long controller Deployments get to become ready
pub const CONTROLLER_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Deployment running the controller for `provider`
pub fn provider_controller_name(provider: ProviderType) -> String {
    format!("butler-provider-{provider}")
}

/// Manifests for the bootstrap controller and the controller for `provider`
pub fn controller_manifests(provider: ProviderType) -> [BundledManifest; 2] {
    let provider_manifest = match provider {
        ProviderType::Harvester => HARVESTER_CONTROLLER_MANIFEST,
        ProviderType::Nutanix => NUTANIX_CONTROLLER_MANIFEST,
        ProviderType::Proxmox => PROXMOX_CONTROLLER_MANIFEST,
    };
    [BOOTSTRAP_CONTROLLER_MANIFEST, provider_manifest]
}

/// Result of applying one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist
    Created,
    /// The object existed and was replaced
    Updated,
}

/// Applies manifests to a substrate and waits on them
pub struct ManifestDeployer {
    store: Arc<dyn ResourceStore>,
    poll_interval: Duration,
}

impl ManifestDeployer {
    /// Deployer for the substrate behind `store`
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Pause between readiness checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Apply the bundled CRDs
    pub async fn deploy_definitions(&self, ctx: &RunContext) -> Result<()> {
        for manifest in CRD_MANIFESTS {
            self.apply_bundle(ctx, manifest).await?;
        }
        Ok(())
    }

    /// Apply the bootstrap controller and the controller for `provider`
    pub async fn deploy_controllers(&self, ctx: &RunContext, provider: ProviderType) -> Result<()> {
        for manifest in controller_manifests(provider) {
            self.apply_bundle(ctx, &manifest).await?;
        }
        Ok(())
    }

    async fn apply_bundle(&self, ctx: &RunContext, bundle: &BundledManifest) -> Result<()> {
        let manifests = parse_manifests(bundle.source, bundle.content)?;
        debug!(source = bundle.source, count = manifests.len(), "applying bundled manifest");
        for manifest in &manifests {
            self.apply(ctx, manifest).await?;
        }
        Ok(())
    }

    /// Serialize `object` and create-or-update it
    pub async fn apply_object<T: Serialize>(&self, ctx: &RunContext, object: &T) -> Result<ApplyOutcome> {
        let manifest = parse_manifest(serde_json::to_value(object)?)?;
        self.apply(ctx, &manifest).await
    }

    /// Create the object, or replace it at its current resourceVersion if it
    /// already exists
    pub async fn apply(&self, ctx: &RunContext, manifest: &ManifestMetadata) -> Result<ApplyOutcome> {
        let target = manifest.display_name();
        let resource = &manifest.api_resource;
        let namespace = manifest.namespace.as_deref();

        let created = ctx
            .run(&target, self.store.create(resource, namespace, &manifest.value))
            .await;
        match created {
            Ok(()) => {
                debug!(target = %target, "created");
                return Ok(ApplyOutcome::Created);
            }
            Err(Error::AlreadyExists { .. }) => {}
            Err(e) => return Err(deploy_error(&target, e)),
        }

        let existing = ctx
            .run(&target, self.store.get(resource, namespace, &manifest.name))
            .await
            .map_err(|e| deploy_error(&target, e))?
            .ok_or_else(|| Error::deploy(&target, "object disappeared during update"))?;

        let mut desired = manifest.value.clone();
        if let Some(version) = existing.pointer("/metadata/resourceVersion") {
            desired["metadata"]["resourceVersion"] = version.clone();
        }
        ctx.run(
            &target,
            self.store.replace(resource, namespace, &manifest.name, &desired),
        )
        .await
        .map_err(|e| deploy_error(&target, e))?;
        debug!(target = %target, "updated");
        Ok(ApplyOutcome::Updated)
    }

    /// Wait until every named CRD is Established, for at most `timeout`
    pub async fn await_established(
        &self,
        ctx: &RunContext,
        names: &[&str],
        timeout: Duration,
    ) -> Result<()> {
        let ctx = ctx.child_with_timeout(timeout);
        let resource = ApiResource::erase::<CustomResourceDefinition>(&());

        for &name in names {
            let operation = format!("CRD {name} to be established");
            poll_until(&ctx, &operation, self.poll_interval, || async {
                let crd: Option<CustomResourceDefinition> =
                    self.get_typed(&resource, None, name).await;
                Ok(crd.filter(crd_is_established).map(|_| ()))
            })
            .await?;
            debug!(crd = name, "established");
        }
        info!("{} CRD(s) established", names.len());
        Ok(())
    }

    /// Wait until the Deployment has all desired replicas ready, for at most `timeout`
    pub async fn await_ready(
        &self,
        ctx: &RunContext,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let ctx = ctx.child_with_timeout(timeout);
        let resource = ApiResource::erase::<Deployment>(&());
        let operation = format!("deployment {namespace}/{name} to be ready");

        poll_until(&ctx, &operation, self.poll_interval, || async {
            let deployment: Option<Deployment> =
                self.get_typed(&resource, Some(namespace), name).await;
            Ok(deployment.filter(deployment_is_ready).map(|_| ()))
        })
        .await?;
        info!("Deployment {}/{} is ready", namespace, name);
        Ok(())
    }

    /// Wait for the bootstrap controller and the controller for `provider`
    pub async fn await_controllers(
        &self,
        ctx: &RunContext,
        provider: ProviderType,
        timeout: Duration,
    ) -> Result<()> {
        let ctx = ctx.child_with_timeout(timeout);
        for name in [BOOTSTRAP_CONTROLLER_NAME.to_string(), provider_controller_name(provider)] {
            self.await_ready(&ctx, BUTLER_NAMESPACE, &name, timeout).await?;
        }
        Ok(())
    }

    /// Fetch and decode an object; lookup or decode failures read as "not yet"
    async fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<T> {
        match self.store.get(resource, namespace, name).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    debug!(kind = %resource.kind, name, error = %e, "could not decode object yet");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(kind = %resource.kind, name, error = %e, "lookup failed, retrying");
                None
            }
        }
    }
}

/// Attach the apply target to a failure, leaving run-level errors as they are
fn deploy_error(target: &str, err: Error) -> Error {
    match err {
        Error::Cancelled | Error::Timeout { .. } | Error::Deploy { .. } => err,
        other => Error::deploy(target, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::testing::FakeStore;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RunContext {
        RunContext::new(CancellationToken::new())
    }

    #[test]
    fn test_bundled_manifests_parse() {
        let crds: usize = CRD_MANIFESTS
            .iter()
            .map(|m| parse_manifests(m.source, m.content).unwrap().len())
            .sum();
        assert_eq!(crds, CRD_NAMES.len());

        for provider in ProviderType::ALL {
            let [bootstrap, provider_manifest] = controller_manifests(provider);
            let docs = parse_manifests(provider_manifest.source, provider_manifest.content).unwrap();
            assert!(docs.iter().any(|d| d.api_resource.kind == "Deployment"
                && d.name == provider_controller_name(provider)
                && d.namespace.as_deref() == Some(BUTLER_NAMESPACE)));

            let docs = parse_manifests(bootstrap.source, bootstrap.content).unwrap();
            assert!(docs
                .iter()
                .any(|d| d.api_resource.kind == "Deployment" && d.name == BOOTSTRAP_CONTROLLER_NAME));
        }
    }

    #[tokio::test]
    async fn test_definitions_apply_is_idempotent() {
        let store = Arc::new(FakeStore::with_ready_workloads());
        let deployer = ManifestDeployer::new(store.clone());

        deployer.deploy_definitions(&ctx()).await.unwrap();
        deployer
            .deploy_controllers(&ctx(), ProviderType::Nutanix)
            .await
            .unwrap();
        let objects = store.len();
        assert_eq!(store.creates(), objects);
        assert_eq!(store.replaces(), 0);

        deployer.deploy_definitions(&ctx()).await.unwrap();
        deployer
            .deploy_controllers(&ctx(), ProviderType::Nutanix)
            .await
            .unwrap();
        assert_eq!(store.len(), objects);
        assert_eq!(store.replaces(), objects);
    }

    #[tokio::test]
    async fn test_apply_reports_outcome() {
        let store = Arc::new(FakeStore::new());
        let deployer = ManifestDeployer::new(store.clone());
        let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "butler-system"}});

        assert_eq!(
            deployer.apply_object(&ctx(), &ns).await.unwrap(),
            ApplyOutcome::Created
        );
        assert_eq!(
            deployer.apply_object(&ctx(), &ns).await.unwrap(),
            ApplyOutcome::Updated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_established_and_ready() {
        let store = Arc::new(FakeStore::with_ready_workloads());
        let deployer = ManifestDeployer::new(store.clone());

        deployer.deploy_definitions(&ctx()).await.unwrap();
        deployer
            .await_established(&ctx(), CRD_NAMES, CRD_ESTABLISH_TIMEOUT)
            .await
            .unwrap();

        deployer
            .deploy_controllers(&ctx(), ProviderType::Harvester)
            .await
            .unwrap();
        deployer
            .await_controllers(&ctx(), ProviderType::Harvester, CONTROLLER_READY_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_established_times_out_naming_crd() {
        // No reactions: CRDs never become Established
        let store = Arc::new(FakeStore::new());
        let deployer = ManifestDeployer::new(store.clone());
        deployer.deploy_definitions(&ctx()).await.unwrap();

        let err = deployer
            .await_established(&ctx(), CRD_NAMES, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("machinerequests.butler.butlerlabs.dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_tolerates_transient_errors() {
        let store = Arc::new(FakeStore::with_ready_workloads());
        let deployer = ManifestDeployer::new(store.clone());
        deployer
            .deploy_controllers(&ctx(), ProviderType::Proxmox)
            .await
            .unwrap();

        store.fail_next_gets(3);
        deployer
            .await_ready(&ctx(), BUTLER_NAMESPACE, "butler-provider-proxmox", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_respects_run_deadline() {
        let store = Arc::new(FakeStore::new());
        let deployer = ManifestDeployer::new(store.clone());
        let run = RunContext::with_timeout(CancellationToken::new(), Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let err = deployer
            .await_ready(&run, BUTLER_NAMESPACE, BOOTSTRAP_CONTROLLER_NAME, CONTROLLER_READY_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
