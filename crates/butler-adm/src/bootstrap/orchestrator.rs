//! Bootstrap orchestration
//!
//! Drives a run through its phases in order:
//! - check local tooling
//! - acquire the kind substrate
//! - build and load local images (development only)
//! - deploy and await the Butler CRDs
//! - create the namespace and provider credentials
//! - deploy and await the controllers
//! - submit the ProviderConfig and ClusterBootstrap
//! - watch the ClusterBootstrap until it is Ready or Failed
//! - persist the new cluster's credentials
//!
//! Each phase logs an unnumbered `[Phase] <description>...` banner, since
//! the image build is skipped outside development runs.
//!
//! The substrate is released afterwards according to the cleanup flags, no
//! matter which phase failed, including acquisition itself.

use std::fmt::{self, Write as _};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use butler_common::context::DEFAULT_POLL_INTERVAL;
use butler_common::kube_utils::ResourceStore;
use butler_common::{Error, Result, RunContext, BUTLER_NAMESPACE};

use super::config::Config;
use super::credentials::{CredentialStore, PersistedCredentials};
use super::deployer::{
    ManifestDeployer, CONTROLLER_READY_TIMEOUT, CRD_ESTABLISH_TIMEOUT, CRD_NAMES,
};
use super::images;
use super::intent;
use super::runner::CommandRunner;
use super::substrate::{CaSources, SubstrateHandle, SubstrateManager, SubstrateRequest};
use super::watcher::{BootstrapWatcher, WATCH_INTERVAL};

/// Default bound on a whole run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Options for a bootstrap run
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    /// Print the planned objects and exit without touching anything
    pub dry_run: bool,
    /// Never delete the substrate
    pub skip_cleanup: bool,
    /// Keep the substrate when the run fails
    pub keep_on_failure: bool,
    /// Deadline for the whole run
    pub timeout: Duration,
    /// Build controller images from sibling checkouts under this directory
    pub local_repo_root: Option<PathBuf>,
    /// Patch substrate DNS even without CAs or host aliases
    pub force_dns_patch: bool,
    /// Bound on CRD establishment
    pub crd_timeout: Duration,
    /// Bound on controller readiness
    pub controller_timeout: Duration,
    /// Pause between readiness checks
    pub poll_interval: Duration,
    /// Pause between ClusterBootstrap status reads
    pub watch_interval: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            skip_cleanup: false,
            keep_on_failure: false,
            timeout: DEFAULT_TIMEOUT,
            local_repo_root: None,
            force_dns_patch: false,
            crd_timeout: CRD_ESTABLISH_TIMEOUT,
            controller_timeout: CONTROLLER_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            watch_interval: WATCH_INTERVAL,
        }
    }
}

/// Steps of a run, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Local tooling check
    Init,
    /// Create or reuse the substrate
    AcquireSubstrate,
    /// Build and load controller images
    BuildLocalImages,
    /// Apply the CRDs
    DeployDefinitions,
    /// Wait for the CRDs
    AwaitDefinitionsEstablished,
    /// Namespace and provider credentials
    CreateNamespaceAndSecrets,
    /// Apply the controllers
    DeployControllers,
    /// Wait for the controllers
    AwaitControllersReady,
    /// Create the ProviderConfig
    SubmitProviderConfig,
    /// Create the ClusterBootstrap
    SubmitClusterBootstrap,
    /// Wait for a terminal phase
    Watch,
    /// Write kubeconfig and talosconfig
    PersistCredentials,
}

impl Phase {
    /// Log line announcing the phase
    fn banner(self) -> String {
        format!("[Phase] {}...", self.description())
    }

    fn description(self) -> &'static str {
        match self {
            Self::Init => "Checking prerequisites",
            Self::AcquireSubstrate => "Creating temporary kind cluster",
            Self::BuildLocalImages => "Building and loading controller images",
            Self::DeployDefinitions => "Deploying Butler CRDs",
            Self::AwaitDefinitionsEstablished => "Waiting for CRDs to be established",
            Self::CreateNamespaceAndSecrets => "Creating namespace and secrets",
            Self::DeployControllers => "Deploying Butler controllers",
            Self::AwaitControllersReady => "Waiting for controllers to be ready",
            Self::SubmitProviderConfig => "Creating ProviderConfig",
            Self::SubmitClusterBootstrap => "Creating ClusterBootstrap",
            Self::Watch => "Waiting for cluster bootstrap",
            Self::PersistCredentials => "Saving cluster credentials",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Log the phase banner, run it, and tag any failure with the phase
async fn phase<T>(phase: Phase, fut: impl Future<Output = Result<T>>) -> Result<T> {
    info!("{}", phase.banner());
    fut.await.map_err(|e| e.in_phase(phase.to_string()))
}

/// What a run produced
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Rendered plan of a dry run
    DryRun(String),
    /// A bootstrapped cluster
    Completed(BootstrapSummary),
}

/// Result of a successful run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapSummary {
    /// Cluster name
    pub cluster_name: String,
    /// Where the credentials were written
    pub credentials: PersistedCredentials,
    /// Console URL or port-forward hint
    pub console_url: Option<String>,
}

impl BootstrapSummary {
    /// Human readable summary printed after a successful run
    pub fn render(&self) -> String {
        let kubeconfig = self.credentials.kubeconfig_path.display();
        let talosconfig = self.credentials.talosconfig_path.display();
        let mut out = String::new();

        let _ = writeln!(out, "Bootstrap of {} complete!\n", self.cluster_name);
        let _ = writeln!(out, "Cluster credentials saved to:");
        let _ = writeln!(out, "  Kubeconfig:   {kubeconfig}");
        let _ = writeln!(out, "  Talosconfig:  {talosconfig}\n");

        if let Some(url) = &self.console_url {
            let _ = writeln!(out, "Butler Console:");
            if url.starts_with("kubectl") {
                let _ = writeln!(out, "  Access via: {url}");
            } else {
                let _ = writeln!(out, "  URL: {url}");
            }
            let _ = writeln!(out, "  Credentials: admin / admin (change after first login)\n");
        }

        let _ = writeln!(out, "Usage:");
        let _ = writeln!(out, "  export KUBECONFIG={kubeconfig}");
        let _ = writeln!(out, "  export TALOSCONFIG={talosconfig}\n");
        let _ = writeln!(out, "  kubectl get nodes");
        let _ = writeln!(out, "  talosctl health --nodes <CONTROL_PLANE_IP>");
        out
    }
}

/// Runs bootstraps against a substrate
pub struct Orchestrator {
    options: BootstrapOptions,
    substrate: Arc<dyn SubstrateManager>,
    runner: Arc<dyn CommandRunner>,
    credentials: CredentialStore,
    ca_sources: CaSources,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(
        options: BootstrapOptions,
        substrate: Arc<dyn SubstrateManager>,
        runner: Arc<dyn CommandRunner>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            options,
            substrate,
            runner,
            credentials,
            ca_sources: CaSources::from_env(),
        }
    }

    /// CA sources listed in dry-run output
    pub fn with_ca_sources(mut self, sources: CaSources) -> Self {
        self.ca_sources = sources;
        self
    }

    /// Run a bootstrap, or render the plan when `dry_run` is set
    pub async fn run(&self, cfg: &Config, token: CancellationToken) -> Result<Outcome> {
        if self.options.dry_run {
            return self.plan(cfg).map(Outcome::DryRun);
        }

        info!(
            cluster = %cfg.cluster.name,
            provider = %cfg.provider,
            topology = %cfg.cluster.topology,
            "Bootstrapping management cluster"
        );
        let ctx = RunContext::with_timeout(token, self.options.timeout);

        phase(Phase::Init, self.substrate.preflight(&ctx)).await?;

        let request = SubstrateRequest {
            host_aliases: cfg.host_aliases().to_vec(),
            force_dns_patch: self.options.force_dns_patch,
        };
        let handle = match phase(Phase::AcquireSubstrate, self.substrate.acquire(&ctx, &request)).await {
            Ok(handle) => handle,
            Err(e) => {
                // an interrupted or partial create can leave a cluster behind
                self.release(&self.substrate.pending_handle(), false).await;
                return Err(e);
            }
        };

        let result = self.provision(&ctx, cfg, &handle).await;
        self.release(&handle, result.is_ok()).await;
        result.map(Outcome::Completed)
    }

    async fn provision(
        &self,
        ctx: &RunContext,
        cfg: &Config,
        handle: &SubstrateHandle,
    ) -> Result<BootstrapSummary> {
        if let Some(repo_root) = &self.options.local_repo_root {
            phase(
                Phase::BuildLocalImages,
                images::build_and_load(
                    ctx,
                    self.runner.as_ref(),
                    self.substrate.as_ref(),
                    handle,
                    repo_root,
                    cfg.provider,
                ),
            )
            .await?;
        }

        let store: Arc<dyn ResourceStore> = self
            .substrate
            .connect(handle)
            .await
            .map_err(|e| e.in_phase(Phase::AcquireSubstrate.to_string()))?;
        let deployer =
            ManifestDeployer::new(store.clone()).with_poll_interval(self.options.poll_interval);

        phase(Phase::DeployDefinitions, deployer.deploy_definitions(ctx)).await?;

        phase(
            Phase::AwaitDefinitionsEstablished,
            deployer.await_established(ctx, CRD_NAMES, self.options.crd_timeout),
        )
        .await?;

        phase(Phase::CreateNamespaceAndSecrets, async {
            deployer.apply_object(ctx, &intent::build_namespace()).await?;
            let secret = intent::build_credentials_secret(cfg)?;
            deployer.apply_object(ctx, &secret).await?;
            Ok::<_, Error>(())
        })
        .await?;

        phase(
            Phase::DeployControllers,
            deployer.deploy_controllers(ctx, cfg.provider),
        )
        .await?;

        phase(
            Phase::AwaitControllersReady,
            deployer.await_controllers(ctx, cfg.provider, self.options.controller_timeout),
        )
        .await?;

        phase(
            Phase::SubmitProviderConfig,
            intent::submit(ctx, store.as_ref(), &intent::build_provider_config(cfg)),
        )
        .await?;

        phase(
            Phase::SubmitClusterBootstrap,
            intent::submit(ctx, store.as_ref(), &intent::build_cluster_bootstrap(cfg)),
        )
        .await?;

        let watcher = BootstrapWatcher::new(store.clone(), cfg.cluster.name.clone())
            .with_interval(self.options.watch_interval);
        let creds = phase(Phase::Watch, watcher.watch(ctx)).await?;

        let persisted = phase(Phase::PersistCredentials, async {
            self.credentials.persist(&cfg.cluster.name, &creds)
        })
        .await?;

        Ok(BootstrapSummary {
            cluster_name: cfg.cluster.name.clone(),
            credentials: persisted,
            console_url: creds.console_url,
        })
    }

    /// Release the substrate unless the cleanup flags say to keep it. Never
    /// fails the run.
    async fn release(&self, handle: &SubstrateHandle, succeeded: bool) {
        if self.options.skip_cleanup {
            info!("Skipping cleanup, kind cluster {} left running", handle.name);
            return;
        }
        if !succeeded && self.options.keep_on_failure {
            info!(
                "Keeping kind cluster {} for debugging (kubeconfig: {})",
                handle.name,
                handle.kubeconfig.display()
            );
            return;
        }
        info!("Cleaning up kind cluster {}...", handle.name);
        if let Err(e) = self.substrate.release(handle).await {
            warn!(error = %e, "Failed to delete kind cluster {}", handle.name);
        }
    }

    /// Render what a run would create
    pub fn plan(&self, cfg: &Config) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "DRY RUN - showing what would be created");

        let _ = writeln!(out, "\n--- Cluster Topology ---");
        let _ = writeln!(out, "Topology: {}", cfg.cluster.topology);
        if cfg.is_single_node() {
            let _ = writeln!(out, "Mode: Single control plane node running workloads (no workers)");
            let _ = writeln!(out, "Note: Control plane replicas forced to 1, workers ignored");
        } else {
            let _ = writeln!(out, "Mode: HA with separate control plane and workers");
        }

        let _ = writeln!(out, "\n--- ProviderConfig ---");
        out.push_str(&serde_yaml::to_string(&intent::build_provider_config(cfg))?);

        let _ = writeln!(out, "\n--- ClusterBootstrap ---");
        out.push_str(&serde_yaml::to_string(&intent::build_cluster_bootstrap(cfg))?);

        let _ = writeln!(out, "\n--- MachineRequests (created by controller) ---");
        for machine in intent::machine_previews(cfg) {
            let _ = writeln!(
                out,
                "- {} ({}, {} CPU, {} MB RAM)",
                machine.name, machine.role, machine.cpu, machine.memory_mb
            );
        }
        if cfg.is_single_node() {
            let _ = writeln!(out, "(no workers - single-node topology)");
        }

        let ca_certs = self.ca_sources.discover();
        if !ca_certs.is_empty() {
            let _ = writeln!(out, "\n--- CA Certificates (will be injected into kind) ---");
            for cert in &ca_certs {
                let _ = writeln!(out, "- {}", cert.display());
            }
        }

        let aliases = cfg.host_aliases();
        if !aliases.is_empty() {
            let _ = writeln!(out, "\n--- Host Aliases (will be injected into kind /etc/hosts) ---");
            for alias in aliases {
                let _ = writeln!(out, "- {alias}");
            }
        }

        let console = &cfg.addons.console;
        if console.enabled {
            let _ = writeln!(out, "\n--- Butler Console ---");
            let _ = writeln!(out, "Version: {}", console.version.as_deref().unwrap_or("latest"));
            if console.ingress.enabled {
                let scheme = if console.ingress.tls { "https" } else { "http" };
                let _ = writeln!(out, "URL: {scheme}://{}", console.ingress.host);
                if let Some(class) = &console.ingress.class_name {
                    let _ = writeln!(out, "Ingress Class: {class}");
                }
            } else {
                let _ = writeln!(out, "Access: via port-forward (no ingress configured)");
            }
        }

        let _ = writeln!(
            out,
            "\nObjects would be created in namespace {BUTLER_NAMESPACE} of a temporary kind cluster."
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::config::{load_from_str, CredentialFallbacks};
    use crate::bootstrap::runner::MockCommandRunner;
    use crate::bootstrap::substrate::MockSubstrateManager;
    use crate::bootstrap::testing::FakeStore;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::json;

    const CONFIG: &str = r#"
provider: nutanix
cluster:
  name: mgmt
  controlPlane:
    replicas: 3
    cpu: 4
    memoryMB: 8192
  workers:
    replicas: 2
    cpu: 8
    memoryMB: 16384
network:
  vip: 10.0.0.100
addons:
  console:
    enabled: true
providerConfig:
  nutanix:
    endpoint: https://prism.example.com
    username: admin
    password: secret
    clusterUUID: c-1
    subnetUUID: s-1
    imageUUID: i-1
    hostAliases:
      - 10.0.0.5 prism.corp.local
"#;

    fn config() -> Config {
        load_from_str(CONFIG, &CredentialFallbacks::none(), &|_| None).unwrap()
    }

    fn handle() -> SubstrateHandle {
        SubstrateHandle {
            name: "butler-bootstrap".to_string(),
            kubeconfig: PathBuf::from("/tmp/butler-bootstrap-kubeconfig"),
            reused: false,
        }
    }

    fn orchestrator(
        options: BootstrapOptions,
        substrate: MockSubstrateManager,
        dir: &std::path::Path,
    ) -> Orchestrator {
        Orchestrator::new(
            options,
            Arc::new(substrate),
            Arc::new(MockCommandRunner::new()),
            CredentialStore::new(dir.join(".butler")),
        )
        .with_ca_sources(CaSources::default())
    }

    /// Substrate whose store plays the controllers; the ClusterBootstrap goes
    /// through `statuses` once created
    fn live_substrate(store: Arc<FakeStore>, release_times: usize) -> MockSubstrateManager {
        let mut substrate = MockSubstrateManager::new();
        substrate.expect_preflight().times(1).returning(|_| Ok(()));
        substrate
            .expect_acquire()
            .withf(|_, req| req.host_aliases == ["10.0.0.5 prism.corp.local".to_string()])
            .times(1)
            .returning(|_, _| Ok(handle()));
        substrate
            .expect_connect()
            .returning(move |_| Ok(store.clone() as Arc<dyn ResourceStore>));
        substrate
            .expect_release()
            .times(release_times)
            .returning(|_| Ok(()));
        substrate
    }

    fn store_reporting(final_status: serde_json::Value) -> Arc<FakeStore> {
        let store = Arc::new(FakeStore::with_ready_workloads());
        store.on_write("ClusterBootstrap", move |obj| {
            obj["status"] = final_status.clone();
        });
        store
    }

    fn ready_status() -> serde_json::Value {
        json!({
            "phase": "Ready",
            "kubeconfig": STANDARD.encode("apiVersion: v1\nkind: Config\n"),
            "talosconfig": STANDARD.encode("context: mgmt\ncontexts:\n  mgmt:\n    endpoints: []\n"),
            "machines": [{"name": "mgmt-cp-0", "role": "control-plane", "ipAddress": "10.0.0.10"}],
            "consoleURL": "kubectl port-forward -n butler-system svc/butler-console 8080:80"
        })
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        // No expectations: any substrate call panics
        let orch = orchestrator(
            BootstrapOptions {
                dry_run: true,
                ..Default::default()
            },
            MockSubstrateManager::new(),
            tmp.path(),
        );

        let Outcome::DryRun(plan) = orch.run(&config(), CancellationToken::new()).await.unwrap() else {
            panic!("expected a dry-run plan");
        };
        assert!(plan.contains("--- ProviderConfig ---"));
        assert!(plan.contains("kind: ClusterBootstrap"));
        assert!(plan.contains("- mgmt-cp-2 (control-plane, 4 CPU, 8192 MB RAM)"));
        assert!(plan.contains("- mgmt-worker-1 (worker, 8 CPU, 16384 MB RAM)"));
        assert!(plan.contains("- 10.0.0.5 prism.corp.local"));
        assert!(plan.contains("Access: via port-forward"));
        assert!(!tmp.path().join(".butler").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_run_persists_and_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(ready_status());
        let orch = orchestrator(
            BootstrapOptions::default(),
            live_substrate(store.clone(), 1),
            tmp.path(),
        );

        let Outcome::Completed(summary) = orch.run(&config(), CancellationToken::new()).await.unwrap() else {
            panic!("expected a completed run");
        };

        assert_eq!(summary.cluster_name, "mgmt");
        let kubeconfig = std::fs::read_to_string(&summary.credentials.kubeconfig_path).unwrap();
        assert_eq!(kubeconfig, "apiVersion: v1\nkind: Config\n");
        let talosconfig = std::fs::read_to_string(&summary.credentials.talosconfig_path).unwrap();
        assert!(talosconfig.contains("10.0.0.10"));

        let rendered = summary.render();
        assert!(rendered.contains("Access via: kubectl port-forward"));
        assert!(rendered.contains("export KUBECONFIG="));

        let secrets = kube::discovery::ApiResource::erase::<k8s_openapi::api::core::v1::Secret>(&());
        assert!(store
            .object(&secrets, Some(BUTLER_NAMESPACE), "mgmt-nutanix-credentials")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_names_phase_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(json!({
            "phase": "Failed",
            "failureReason": "ImageNotFound",
            "failureMessage": "image i-1 does not exist"
        }));
        let orch = orchestrator(
            BootstrapOptions::default(),
            live_substrate(store, 1),
            tmp.path(),
        );

        let err = orch
            .run(&config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.root().is_provisioning_failure());
        assert_eq!(
            err.to_string(),
            "Watch failed: cluster bootstrap failed: ImageNotFound: image i-1 does not exist"
        );
        assert!(!tmp.path().join(".butler").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_on_failure_keeps_substrate() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(json!({"phase": "Failed", "failureReason": "X"}));
        let orch = orchestrator(
            BootstrapOptions {
                keep_on_failure: true,
                ..Default::default()
            },
            live_substrate(store, 0),
            tmp.path(),
        );
        assert!(orch.run(&config(), CancellationToken::new()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cleanup_keeps_substrate_on_success() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(ready_status());
        let orch = orchestrator(
            BootstrapOptions {
                skip_cleanup: true,
                ..Default::default()
            },
            live_substrate(store, 0),
            tmp.path(),
        );
        assert!(orch.run(&config(), CancellationToken::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_provider_config_is_not_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(ready_status());
        let resource = kube::discovery::ApiResource::erase::<butler_common::crd::ProviderConfig>(&());
        store.insert(
            &resource,
            Some(BUTLER_NAMESPACE),
            json!({"metadata": {"name": "mgmt-provider", "namespace": BUTLER_NAMESPACE}}),
        );
        let orch = orchestrator(
            BootstrapOptions::default(),
            live_substrate(store, 1),
            tmp.path(),
        );

        let err = orch
            .run(&config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::AlreadyExists { .. }));
        assert!(err.to_string().starts_with("SubmitProviderConfig failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_still_releases() {
        let tmp = tempfile::tempdir().unwrap();
        // The bootstrap never finishes
        let store = store_reporting(json!({"phase": "ProvisioningMachines"}));
        let orch = orchestrator(
            BootstrapOptions::default(),
            live_substrate(store, 1),
            tmp.path(),
        );

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                token.cancel();
            })
        };
        let err = orch.run(&config(), token).await.unwrap_err();
        assert!(err.root().is_cancelled());
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_is_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_reporting(json!({"phase": "InstallingAddons"}));
        let orch = orchestrator(
            BootstrapOptions {
                timeout: Duration::from_secs(120),
                ..Default::default()
            },
            live_substrate(store, 1),
            tmp.path(),
        );

        let err = orch
            .run(&config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.root().is_timeout());
        assert!(!err.root().is_provisioning_failure());
    }

    /// Substrate whose acquisition is interrupted partway through
    fn interrupted_substrate(token: CancellationToken, release_times: usize) -> MockSubstrateManager {
        let mut substrate = MockSubstrateManager::new();
        substrate.expect_preflight().times(1).returning(|_| Ok(()));
        substrate.expect_acquire().times(1).returning(move |_, _| {
            token.cancel();
            Err(Error::Cancelled)
        });
        substrate.expect_pending_handle().returning(handle);
        substrate
            .expect_release()
            .withf(|h| *h == handle())
            .times(release_times)
            .returning(|_| Ok(()));
        substrate
    }

    #[tokio::test]
    async fn test_interrupted_acquire_releases_partial_cluster() {
        let tmp = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let orch = orchestrator(
            BootstrapOptions::default(),
            interrupted_substrate(token.clone(), 1),
            tmp.path(),
        );

        let err = orch.run(&config(), token).await.unwrap_err();
        assert!(err.to_string().starts_with("AcquireSubstrate failed"));
        assert!(err.root().is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupted_acquire_honors_cleanup_flags() {
        for options in [
            BootstrapOptions {
                keep_on_failure: true,
                ..Default::default()
            },
            BootstrapOptions {
                skip_cleanup: true,
                ..Default::default()
            },
        ] {
            let tmp = tempfile::tempdir().unwrap();
            let token = CancellationToken::new();
            let orch = orchestrator(options, interrupted_substrate(token.clone(), 0), tmp.path());

            let err = orch.run(&config(), token).await.unwrap_err();
            assert!(err.root().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_failed_acquire_releases_partial_cluster() {
        let tmp = tempfile::tempdir().unwrap();
        let mut substrate = MockSubstrateManager::new();
        substrate.expect_preflight().returning(|_| Ok(()));
        substrate
            .expect_acquire()
            .returning(|_, _| Err(Error::environment("kind create cluster failed: node not ready")));
        substrate.expect_pending_handle().returning(handle);
        substrate.expect_release().times(1).returning(|_| Ok(()));
        let orch = orchestrator(BootstrapOptions::default(), substrate, tmp.path());

        let err = orch
            .run(&config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node not ready"));
    }

    #[test]
    fn test_phase_banners_are_unnumbered() {
        assert_eq!(Phase::Init.banner(), "[Phase] Checking prerequisites...");
        assert_eq!(
            Phase::DeployDefinitions.banner(),
            "[Phase] Deploying Butler CRDs..."
        );
        assert!(!Phase::PersistCredentials
            .banner()
            .chars()
            .any(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_preflight_failure_skips_substrate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut substrate = MockSubstrateManager::new();
        substrate
            .expect_preflight()
            .returning(|_| Err(Error::environment("kind is required")));
        let orch = orchestrator(BootstrapOptions::default(), substrate, tmp.path());

        let err = orch
            .run(&config(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Init failed"));
    }
}
