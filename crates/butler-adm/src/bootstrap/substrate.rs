//! Temporary local Kubernetes substrate
//!
//! The bootstrap controllers run in a throwaway kind cluster. [`SubstrateManager`]
//! is the seam the orchestrator drives; [`KindSubstrate`] is the only
//! production implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::discovery::ApiResource;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, warn};

use butler_common::kube_utils::{KubeStore, ResourceStore};
use butler_common::{Error, Result, RunContext};

use super::config::BUTLER_DIR_NAME;
use super::credentials::write_private_file;
use super::runner::{run_checked, CommandRunner, CommandSpec};

/// Name of the kind cluster hosting the bootstrap controllers
pub const KIND_CLUSTER_NAME: &str = "butler-bootstrap";

/// Environment variable naming a CA certificate file or directory to trust
pub const CA_CERT_PATH_ENV: &str = "BUTLER_CA_CERT_PATH";

const DEFAULT_CA_CERT_DIR: &str = "certificates";
const CA_MOUNT_DIR: &str = "/usr/local/share/ca-certificates";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const INOTIFY_LIMITS: [&str; 2] = [
    "fs.inotify.max_user_instances=1024",
    "fs.inotify.max_user_watches=524288",
];

const COREFILE: &str = r#".:53 {
    errors
    health {
       lameduck 5s
    }
    ready
    kubernetes cluster.local in-addr.arpa ip6.arpa {
       pods insecure
       fallthrough in-addr.arpa ip6.arpa
       ttl 30
    }
    prometheus :9153
    forward . 8.8.8.8 8.8.4.4 {
       max_concurrent 1000
    }
    cache 30
    loop
    reload
    loadbalance
}
"#;

/// An acquired substrate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubstrateHandle {
    /// Substrate name
    pub name: String,
    /// Admin kubeconfig for the substrate's API server
    pub kubeconfig: PathBuf,
    /// True if an existing substrate was reused rather than created
    pub reused: bool,
}

/// What the substrate needs beyond a bare cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubstrateRequest {
    /// `"ip hostname"` entries appended to the node's /etc/hosts
    pub host_aliases: Vec<String>,
    /// Patch cluster DNS even without CAs or host aliases
    pub force_dns_patch: bool,
}

/// Lifecycle of the local substrate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubstrateManager: Send + Sync {
    /// Check that the local tooling the substrate needs is available
    async fn preflight(&self, ctx: &RunContext) -> Result<()>;

    /// Create the substrate, or reuse an existing one with the same name
    async fn acquire(&self, ctx: &RunContext, request: &SubstrateRequest) -> Result<SubstrateHandle>;

    /// Object store for the substrate's API server
    async fn connect(&self, handle: &SubstrateHandle) -> Result<Arc<dyn ResourceStore>>;

    /// Make a locally built image available to the substrate's nodes
    async fn load_image(&self, ctx: &RunContext, handle: &SubstrateHandle, image: &str) -> Result<()>;

    /// Delete the substrate. Runs without a context so it still works after
    /// the run was cancelled.
    async fn release(&self, handle: &SubstrateHandle) -> Result<()>;

    /// Handle naming whatever a failed or interrupted [`acquire`] may have
    /// left behind
    ///
    /// [`acquire`]: SubstrateManager::acquire
    fn pending_handle(&self) -> SubstrateHandle;
}

// =============================================================================
// CA discovery
// =============================================================================

/// Where extra CA certificates are looked up
#[derive(Clone, Debug, Default)]
pub struct CaSources {
    /// A certificate file or a directory of them, from the environment
    pub env_path: Option<PathBuf>,
    /// The per-user certificate directory
    pub user_dir: Option<PathBuf>,
}

impl CaSources {
    /// `BUTLER_CA_CERT_PATH` and `~/.butler/certificates`
    pub fn from_env() -> Self {
        Self {
            env_path: std::env::var_os(CA_CERT_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            user_dir: dirs::home_dir().map(|h| h.join(BUTLER_DIR_NAME).join(DEFAULT_CA_CERT_DIR)),
        }
    }

    /// Certificates found in all sources, environment first
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut certs = Vec::new();
        if let Some(path) = &self.env_path {
            if path.is_dir() {
                certs.extend(certificates_in(path));
            } else if path.is_file() {
                certs.push(path.clone());
            } else {
                warn!(path = %path.display(), "{} does not exist, ignoring", CA_CERT_PATH_ENV);
            }
        }
        if let Some(dir) = &self.user_dir {
            if dir.is_dir() {
                certs.extend(certificates_in(dir));
            }
        }
        // kind mounts need absolute host paths
        certs
            .into_iter()
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .collect()
    }
}

fn certificates_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut certs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("crt" | "pem")))
        .collect();
    certs.sort();
    certs
}

/// Path inside the node where the `index`th CA is mounted
pub fn ca_mount_path(index: usize) -> String {
    format!("{CA_MOUNT_DIR}/butler-custom-{index}.crt")
}

/// kind cluster configuration with one read-only mount per CA certificate
pub fn build_kind_config(ca_certs: &[PathBuf]) -> Result<String> {
    let mut node = json!({ "role": "control-plane" });
    if !ca_certs.is_empty() {
        let mounts: Vec<_> = ca_certs
            .iter()
            .enumerate()
            .map(|(i, path)| {
                json!({
                    "hostPath": path.to_string_lossy(),
                    "containerPath": ca_mount_path(i),
                    "readOnly": true,
                })
            })
            .collect();
        node["extraMounts"] = json!(mounts);
    }
    let config = json!({
        "kind": "Cluster",
        "apiVersion": "kind.x-k8s.io/v1alpha4",
        "nodes": [node],
    });
    Ok(serde_yaml::to_string(&config)?)
}

// =============================================================================
// kind
// =============================================================================

/// [`SubstrateManager`] backed by kind
pub struct KindSubstrate {
    runner: Arc<dyn CommandRunner>,
    name: String,
    kubeconfig_path: PathBuf,
    ca_sources: CaSources,
}

impl KindSubstrate {
    /// kind substrate named [`KIND_CLUSTER_NAME`] with CAs from the environment
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            name: KIND_CLUSTER_NAME.to_string(),
            kubeconfig_path: std::env::temp_dir().join(format!("{KIND_CLUSTER_NAME}-kubeconfig")),
            ca_sources: CaSources::from_env(),
        }
    }

    /// Write the substrate kubeconfig to `path`
    pub fn with_kubeconfig_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = path.into();
        self
    }

    /// Look up CA certificates in `sources`
    pub fn with_ca_sources(mut self, sources: CaSources) -> Self {
        self.ca_sources = sources;
        self
    }

    fn node_name(&self) -> String {
        format!("{}-control-plane", self.name)
    }

    fn node_exec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("docker")
            .args(["exec".to_string(), self.node_name()])
            .args(args)
    }

    async fn exists(&self, ctx: &RunContext) -> Result<bool> {
        let output = run_checked(
            self.runner.as_ref(),
            ctx,
            &CommandSpec::new("kind").args(["get", "clusters"]),
        )
        .await?;
        Ok(output.stdout.lines().any(|l| l.trim() == self.name))
    }

    async fn create(&self, ctx: &RunContext, ca_certs: &[PathBuf]) -> Result<()> {
        info!("Creating kind cluster: {}", self.name);
        let config = build_kind_config(ca_certs)?;
        let cmd = CommandSpec::new("kind")
            .args(["create", "cluster", "--name", self.name.as_str(), "--config", "-"])
            .stdin(config);
        run_checked(self.runner.as_ref(), ctx, &cmd).await?;
        Ok(())
    }

    async fn tune_node(&self, ctx: &RunContext) -> Result<()> {
        for limit in INOTIFY_LIMITS {
            run_checked(self.runner.as_ref(), ctx, &self.node_exec(["sysctl", "-w", limit])).await?;
        }
        debug!("Raised inotify limits on {}", self.node_name());
        Ok(())
    }

    async fn install_ca_certificates(&self, ctx: &RunContext) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            ctx,
            &self.node_exec(["update-ca-certificates"]),
        )
        .await?;
        info!("CA certificates installed in {}", self.node_name());
        Ok(())
    }

    async fn inject_host_aliases(&self, ctx: &RunContext, aliases: &[String]) -> Result<()> {
        for alias in aliases {
            // Appending is skipped when the exact line exists, so reuse does not duplicate entries
            let script = format!("grep -qxF '{alias}' /etc/hosts || echo '{alias}' >> /etc/hosts");
            run_checked(self.runner.as_ref(), ctx, &self.node_exec(["sh", "-c", script.as_str()])).await?;
            debug!(alias = %alias, "Injected host alias");
        }
        info!("Injected {} host alias(es) into {}", aliases.len(), self.node_name());
        Ok(())
    }

    async fn export_kubeconfig(&self, ctx: &RunContext) -> Result<PathBuf> {
        let output = run_checked(
            self.runner.as_ref(),
            ctx,
            &CommandSpec::new("kind").args(["get", "kubeconfig", "--name", self.name.as_str()]),
        )
        .await?;
        write_private_file(&self.kubeconfig_path, output.stdout.as_bytes()).map_err(|e| {
            Error::environment(format!(
                "writing kubeconfig {}: {}",
                self.kubeconfig_path.display(),
                e
            ))
        })?;
        Ok(self.kubeconfig_path.clone())
    }
}

#[async_trait]
impl SubstrateManager for KindSubstrate {
    async fn preflight(&self, ctx: &RunContext) -> Result<()> {
        for tool in ["docker", "kind"] {
            run_checked(self.runner.as_ref(), ctx, &CommandSpec::new(tool).args(["version"]))
                .await
                .map_err(|e| match e {
                    Error::Cancelled | Error::Timeout { .. } => e,
                    other => Error::environment(format!(
                        "{tool} is required and must be working: {}",
                        other
                    )),
                })?;
        }
        Ok(())
    }

    async fn acquire(&self, ctx: &RunContext, request: &SubstrateRequest) -> Result<SubstrateHandle> {
        let ca_certs = self.ca_sources.discover();
        if !ca_certs.is_empty() {
            info!("Found {} custom CA certificate(s)", ca_certs.len());
        }

        let reused = self.exists(ctx).await?;
        if reused {
            warn!("kind cluster {} already exists, reusing it", self.name);
        } else {
            self.create(ctx, &ca_certs).await?;

            if let Err(e) = self.tune_node(ctx).await {
                warn!(error = %e, "Failed to raise inotify limits, continuing");
            }
            if !ca_certs.is_empty() {
                if let Err(e) = self.install_ca_certificates(ctx).await {
                    warn!(error = %e, "Failed to install CA certificates, continuing");
                }
            }
        }

        let kubeconfig = self.export_kubeconfig(ctx).await?;
        let handle = SubstrateHandle {
            name: self.name.clone(),
            kubeconfig,
            reused,
        };

        if !request.host_aliases.is_empty() {
            if let Err(e) = self.inject_host_aliases(ctx, &request.host_aliases).await {
                warn!(error = %e, "Failed to inject host aliases, continuing");
            }
        }

        if request.force_dns_patch || !ca_certs.is_empty() || !request.host_aliases.is_empty() {
            let patched = match self.connect(&handle).await {
                Ok(store) => patch_coredns(ctx, store.as_ref()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = patched {
                warn!(error = %e, "Failed to patch CoreDNS, continuing");
            }
        }

        Ok(handle)
    }

    async fn connect(&self, handle: &SubstrateHandle) -> Result<Arc<dyn ResourceStore>> {
        Ok(Arc::new(KubeStore::connect(&handle.kubeconfig).await?))
    }

    async fn load_image(&self, ctx: &RunContext, handle: &SubstrateHandle, image: &str) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            ctx,
            &CommandSpec::new("kind").args(["load", "docker-image", image, "--name", handle.name.as_str()]),
        )
        .await?;
        Ok(())
    }

    async fn release(&self, handle: &SubstrateHandle) -> Result<()> {
        info!("Deleting kind cluster: {}", handle.name);
        let output = self
            .runner
            .run(&CommandSpec::new("kind").args(["delete", "cluster", "--name", handle.name.as_str()]))
            .await?;
        if !output.success() {
            return Err(Error::environment(format!(
                "kind delete cluster failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn pending_handle(&self) -> SubstrateHandle {
        SubstrateHandle {
            name: self.name.clone(),
            kubeconfig: self.kubeconfig_path.clone(),
            reused: false,
        }
    }
}

/// Point cluster DNS at public resolvers and restart it
pub async fn patch_coredns(ctx: &RunContext, store: &dyn ResourceStore) -> Result<()> {
    let config_maps = ApiResource::erase::<ConfigMap>(&());
    let deployments = ApiResource::erase::<Deployment>(&());

    ctx.run(
        "patching CoreDNS",
        store.merge_patch(
            &config_maps,
            Some("kube-system"),
            "coredns",
            &json!({ "data": { "Corefile": COREFILE } }),
        ),
    )
    .await?;

    let mut annotations = serde_json::Map::new();
    annotations.insert(
        RESTARTED_AT_ANNOTATION.to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    let restart = json!({
        "spec": { "template": { "metadata": { "annotations": annotations } } }
    });
    ctx.run(
        "restarting CoreDNS",
        store.merge_patch(&deployments, Some("kube-system"), "coredns", &restart),
    )
    .await?;

    info!("CoreDNS now forwards to public resolvers");
    Ok(())
}
