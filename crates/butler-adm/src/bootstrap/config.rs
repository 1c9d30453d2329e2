//! Bootstrap configuration
//!
//! The configuration file is a YAML document. It is deserialized into a loose
//! [`ConfigFile`] shape, then defaulted and validated into a [`Config`] that the
//! rest of the bootstrap flow treats as read-only.
//!
//! The file location is resolved in order:
//! 1. Explicit `--config` flag (or `BUTLER_CONFIG`)
//! 2. `./bootstrap.yaml`
//! 3. `~/.butler/bootstrap.yaml`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use butler_common::crd::{
    AddonType, ButlerControllerSpec, ComponentSpec, ConsoleIngressSpec, LoadBalancerSpec,
    NetworkSpec, NodePoolSpec, ProviderType, TalosSpec, Topology,
};
use butler_common::{Error, Result};

/// Name of the configuration file looked up in the working and per-user directories
pub const CONFIG_FILE_NAME: &str = "bootstrap.yaml";

/// Per-user Butler directory under $HOME
pub const BUTLER_DIR_NAME: &str = ".butler";

const DEFAULT_POD_CIDR: &str = "10.244.0.0/16";
const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
const DEFAULT_TALOS_VERSION: &str = "v1.9.0";
const DEFAULT_CNI: &str = "cilium";
const DEFAULT_STORAGE: &str = "longhorn";
const DEFAULT_LOAD_BALANCER: &str = "metallb";
const DEFAULT_GITOPS: &str = "flux";
const DEFAULT_NUTANIX_PORT: u16 = 9440;

// =============================================================================
// Validated configuration
// =============================================================================

/// Validated bootstrap configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Infrastructure provider
    pub provider: ProviderType,
    /// Cluster shape
    pub cluster: ClusterConfig,
    /// Networking
    pub network: NetworkSpec,
    /// Talos image
    pub talos: TalosSpec,
    /// Addons
    pub addons: AddonsConfig,
    /// Settings for `provider`; always the matching variant
    pub provider_settings: ProviderSettings,
}

impl Config {
    /// Returns true for the single-node topology
    pub fn is_single_node(&self) -> bool {
        self.cluster.topology.is_single_node()
    }

    /// `/etc/hosts` entries to inject into the substrate node
    pub fn host_aliases(&self) -> &[String] {
        match &self.provider_settings {
            ProviderSettings::Harvester(_) => &[],
            ProviderSettings::Nutanix(n) => &n.host_aliases,
            ProviderSettings::Proxmox(p) => &p.host_aliases,
        }
    }
}

/// Cluster name, topology and node pools
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name, used for VM names and resource names
    pub name: String,
    /// Topology
    pub topology: Topology,
    /// Control plane pool; replicas is 1 for single-node
    pub control_plane: NodePoolSpec,
    /// Worker pool; ignored for single-node
    pub workers: NodePoolSpec,
}

/// Provider-specific settings
#[derive(Debug, Clone)]
pub enum ProviderSettings {
    /// Harvester
    Harvester(HarvesterConfig),
    /// Nutanix
    Nutanix(NutanixConfig),
    /// Proxmox
    Proxmox(ProxmoxConfig),
}

/// Addons section of the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddonsConfig {
    /// CNI
    pub cni: AddonType,
    /// Storage
    pub storage: AddonType,
    /// Load balancer
    pub load_balancer: LoadBalancerSpec,
    /// GitOps engine
    pub git_ops: AddonType,
    /// Cluster API
    pub capi: ComponentSpec,
    /// Butler controller
    pub butler_controller: ButlerControllerSpec,
    /// Butler console
    pub console: ConsoleConfig,
}

/// Console addon as written in the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleConfig {
    /// Install the console
    pub enabled: bool,
    /// Console version
    pub version: Option<String>,
    /// Ingress exposure
    pub ingress: ConsoleIngressSpec,
}

/// Harvester settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarvesterConfig {
    /// Path to the Harvester kubeconfig; `~` is expanded
    pub kubeconfig_path: String,
    /// Namespace for VMs
    pub namespace: String,
    /// VM network (namespace/name)
    pub network_name: String,
    /// Talos image (namespace/name)
    pub image_name: String,
}

/// Nutanix settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NutanixConfig {
    /// Prism Central URL
    pub endpoint: String,
    /// Prism Central API port
    pub port: u16,
    /// Skip TLS verification
    pub insecure: bool,
    /// Prism Central username
    pub username: String,
    /// Prism Central password
    pub password: String,
    /// Target cluster
    #[serde(rename = "clusterUUID")]
    pub cluster_uuid: String,
    /// VM subnet
    #[serde(rename = "subnetUUID")]
    pub subnet_uuid: String,
    /// Talos image
    #[serde(rename = "imageUUID")]
    pub image_uuid: String,
    /// Storage container for VM disks
    #[serde(rename = "storageContainerUUID")]
    pub storage_container_uuid: Option<String>,
    /// `"ip hostname"` entries for names only resolvable on a private network
    pub host_aliases: Vec<String>,
}

/// Proxmox settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxmoxConfig {
    /// Proxmox API URL
    pub endpoint: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// API token ID (user@realm!token)
    pub token_id: String,
    /// API token secret
    pub token_secret: String,
    /// Username, when not using a token
    pub username: String,
    /// Password, when not using a token
    pub password: String,
    /// Nodes available for VM placement
    pub nodes: Vec<String>,
    /// Storage for VM disks
    pub storage: String,
    /// Template VM to clone
    #[serde(rename = "templateID")]
    pub template_id: Option<i32>,
    /// First VM ID to allocate
    pub vmid_start: Option<i32>,
    /// Last VM ID to allocate
    pub vmid_end: Option<i32>,
    /// `"ip hostname"` entries for names only resolvable on a private network
    pub host_aliases: Vec<String>,
}

impl ProxmoxConfig {
    /// Returns true when API token credentials are configured
    pub fn uses_token(&self) -> bool {
        !self.token_id.is_empty() && !self.token_secret.is_empty()
    }
}

// =============================================================================
// Credential fallbacks
// =============================================================================

/// A credential field that may be filled from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CredentialField {
    /// Nutanix username
    NutanixUsername,
    /// Nutanix password
    NutanixPassword,
    /// Proxmox API token ID
    ProxmoxTokenId,
    /// Proxmox API token secret
    ProxmoxTokenSecret,
    /// Proxmox username
    ProxmoxUsername,
    /// Proxmox password
    ProxmoxPassword,
}

/// Environment variables consulted, in order, for credential fields left empty
/// in the configuration file.
///
/// Adding a name here is a compatibility decision; the default table only
/// carries the names the provider tooling documents.
#[derive(Debug, Clone)]
pub struct CredentialFallbacks {
    sources: BTreeMap<CredentialField, Vec<String>>,
}

impl Default for CredentialFallbacks {
    fn default() -> Self {
        Self::none()
            .with(CredentialField::NutanixUsername, ["NUTANIX_USER"])
            .with(CredentialField::NutanixPassword, ["NUTANIX_PASSWORD"])
            .with(CredentialField::ProxmoxTokenId, ["PROXMOX_TOKEN_ID"])
            .with(CredentialField::ProxmoxTokenSecret, ["PROXMOX_TOKEN_SECRET"])
            .with(CredentialField::ProxmoxUsername, ["PROXMOX_USER"])
            .with(CredentialField::ProxmoxPassword, ["PROXMOX_PASSWORD"])
    }
}

impl CredentialFallbacks {
    /// No fallbacks at all
    pub fn none() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    /// Set the variables consulted for `field`
    pub fn with<I, S>(mut self, field: CredentialField, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources
            .insert(field, vars.into_iter().map(Into::into).collect());
        self
    }

    /// First non-empty value among the variables configured for `field`
    pub fn resolve(&self, field: CredentialField, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
        self.sources
            .get(&field)?
            .iter()
            .filter_map(|var| env(var))
            .find(|value| !value.is_empty())
    }

    fn fill(&self, target: &mut String, field: CredentialField, env: &dyn Fn(&str) -> Option<String>) {
        if target.is_empty() {
            if let Some(value) = self.resolve(field, env) {
                debug!(?field, "credential taken from environment");
                *target = value;
            }
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Resolve the configuration file location
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    resolve_config_path_in(explicit, &cwd, dirs::home_dir().as_deref())
}

fn resolve_config_path_in(
    explicit: Option<&Path>,
    cwd: &Path,
    home: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(Error::validation(
                "config",
                format!("configuration file not found: {}", path.display()),
            ));
        }
        return Ok(path.to_path_buf());
    }

    let mut candidates = vec![cwd.join(CONFIG_FILE_NAME)];
    if let Some(home) = home {
        candidates.push(home.join(BUTLER_DIR_NAME).join(CONFIG_FILE_NAME));
    }

    candidates.into_iter().find(|p| p.is_file()).ok_or_else(|| {
        Error::validation(
            "config",
            format!(
                "no configuration file given and none found at ./{} or ~/{}/{}",
                CONFIG_FILE_NAME, BUTLER_DIR_NAME, CONFIG_FILE_NAME
            ),
        )
    })
}

/// Load and validate a configuration file, consulting the process environment
/// for credential fallbacks
pub fn load(path: &Path, fallbacks: &CredentialFallbacks) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(
            "config",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    load_from_str(&content, fallbacks, &|var| std::env::var(var).ok())
}

/// Parse, default and validate configuration text
pub fn load_from_str(
    content: &str,
    fallbacks: &CredentialFallbacks,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Config> {
    let file: ConfigFile = serde_yaml::from_str(content)
        .map_err(|e| Error::validation("config", format!("invalid YAML: {}", e)))?;
    file.into_config(fallbacks, env)
}

/// Configuration file as written, before defaults and validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    provider: String,
    cluster: ClusterFile,
    network: NetworkSpec,
    talos: TalosSpec,
    addons: AddonsConfig,
    provider_config: ProviderConfigFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ClusterFile {
    name: String,
    topology: Option<String>,
    control_plane: NodePoolSpec,
    workers: NodePoolSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderConfigFile {
    harvester: Option<HarvesterConfig>,
    nutanix: Option<NutanixConfig>,
    proxmox: Option<ProxmoxConfig>,
}

impl ConfigFile {
    fn into_config(
        mut self,
        fallbacks: &CredentialFallbacks,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Config> {
        let provider_name = self.provider.trim();
        if provider_name.is_empty() {
            return Err(Error::validation("provider", "provider is required"));
        }
        let provider: ProviderType = provider_name.parse()?;

        let name = self.cluster.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("cluster.name", "cluster name is required"));
        }
        if !is_dns_label(&name) {
            return Err(Error::validation(
                "cluster.name",
                format!("{name:?} must be lowercase alphanumerics and '-', at most 63 characters"),
            ));
        }

        let topology = match self.cluster.topology.as_deref().map(str::trim) {
            None | Some("") => Topology::default(),
            Some("single-node") => Topology::SingleNode,
            Some("ha") => Topology::Ha,
            Some(other) => {
                return Err(Error::validation(
                    "cluster.topology",
                    format!("unknown topology {other:?}, expected single-node or ha"),
                ))
            }
        };

        let provider_settings = self.provider_config.take(provider, fallbacks, env)?;

        if self.network.vip.trim().is_empty() {
            return Err(Error::validation("network.vip", "control plane VIP is required"));
        }

        let mut control_plane = self.cluster.control_plane;
        let workers = self.cluster.workers;
        if control_plane.replicas < 1 {
            return Err(Error::validation(
                "cluster.controlPlane.replicas",
                "control plane needs at least 1 replica",
            ));
        }
        if workers.replicas < 0 {
            return Err(Error::validation(
                "cluster.workers.replicas",
                "replicas cannot be negative",
            ));
        }
        if topology.is_single_node() && control_plane.replicas != 1 {
            warn!(
                requested = control_plane.replicas,
                "single-node topology: control plane replicas forced to 1"
            );
            control_plane.replicas = 1;
        }

        let console = &self.addons.console;
        if console.enabled && console.ingress.enabled && console.ingress.host.trim().is_empty() {
            return Err(Error::validation(
                "addons.console.ingress.host",
                "host is required when the console ingress is enabled",
            ));
        }

        apply_defaults(&mut self.network, &mut self.talos, &mut self.addons);

        Ok(Config {
            provider,
            cluster: ClusterConfig {
                name,
                topology,
                control_plane,
                workers,
            },
            network: self.network,
            talos: self.talos,
            addons: self.addons,
            provider_settings,
        })
    }
}

impl ProviderConfigFile {
    fn take(
        self,
        provider: ProviderType,
        fallbacks: &CredentialFallbacks,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<ProviderSettings> {
        let populated: Vec<ProviderType> = [
            (ProviderType::Harvester, self.harvester.is_some()),
            (ProviderType::Nutanix, self.nutanix.is_some()),
            (ProviderType::Proxmox, self.proxmox.is_some()),
        ]
        .into_iter()
        .filter(|(p, set)| *set && *p != provider)
        .map(|(p, _)| p)
        .collect();
        if let Some(other) = populated.first() {
            return Err(Error::validation(
                format!("providerConfig.{other}"),
                format!("only providerConfig.{provider} may be set when provider is {provider}"),
            ));
        }

        let missing = || {
            Error::validation(
                format!("providerConfig.{provider}"),
                format!("required when provider is {provider}"),
            )
        };

        match provider {
            ProviderType::Harvester => {
                let mut h = self.harvester.ok_or_else(missing)?;
                h.kubeconfig_path = expand_path(h.kubeconfig_path.trim());
                require("providerConfig.harvester.kubeconfigPath", &h.kubeconfig_path)?;
                require("providerConfig.harvester.namespace", &h.namespace)?;
                require("providerConfig.harvester.networkName", &h.network_name)?;
                require("providerConfig.harvester.imageName", &h.image_name)?;
                check_readable("providerConfig.harvester.kubeconfigPath", &h.kubeconfig_path)?;
                Ok(ProviderSettings::Harvester(h))
            }
            ProviderType::Nutanix => {
                let mut n = self.nutanix.ok_or_else(missing)?;
                fallbacks.fill(&mut n.username, CredentialField::NutanixUsername, env);
                fallbacks.fill(&mut n.password, CredentialField::NutanixPassword, env);
                if n.port == 0 {
                    n.port = DEFAULT_NUTANIX_PORT;
                }
                n.storage_container_uuid = n.storage_container_uuid.filter(|s| !s.is_empty());
                require("providerConfig.nutanix.endpoint", &n.endpoint)?;
                require("providerConfig.nutanix.username", &n.username)?;
                require("providerConfig.nutanix.password", &n.password)?;
                require("providerConfig.nutanix.clusterUUID", &n.cluster_uuid)?;
                require("providerConfig.nutanix.subnetUUID", &n.subnet_uuid)?;
                require("providerConfig.nutanix.imageUUID", &n.image_uuid)?;
                validate_host_aliases("providerConfig.nutanix.hostAliases", &n.host_aliases)?;
                Ok(ProviderSettings::Nutanix(n))
            }
            ProviderType::Proxmox => {
                let mut p = self.proxmox.ok_or_else(missing)?;
                fallbacks.fill(&mut p.token_id, CredentialField::ProxmoxTokenId, env);
                fallbacks.fill(&mut p.token_secret, CredentialField::ProxmoxTokenSecret, env);
                fallbacks.fill(&mut p.username, CredentialField::ProxmoxUsername, env);
                fallbacks.fill(&mut p.password, CredentialField::ProxmoxPassword, env);
                require("providerConfig.proxmox.endpoint", &p.endpoint)?;
                if p.nodes.iter().all(|n| n.trim().is_empty()) {
                    return Err(Error::validation(
                        "providerConfig.proxmox.nodes",
                        "at least one node is required",
                    ));
                }
                require("providerConfig.proxmox.storage", &p.storage)?;
                let has_password = !p.username.is_empty() && !p.password.is_empty();
                if !p.uses_token() && !has_password {
                    return Err(Error::validation(
                        "providerConfig.proxmox",
                        "credentials required: tokenId and tokenSecret, or username and password",
                    ));
                }
                if let (Some(start), Some(end)) = (p.vmid_start, p.vmid_end) {
                    if start > end {
                        return Err(Error::validation(
                            "providerConfig.proxmox.vmidStart",
                            "vmidStart must not exceed vmidEnd",
                        ));
                    }
                }
                validate_host_aliases("providerConfig.proxmox.hostAliases", &p.host_aliases)?;
                Ok(ProviderSettings::Proxmox(p))
            }
        }
    }
}

fn apply_defaults(network: &mut NetworkSpec, talos: &mut TalosSpec, addons: &mut AddonsConfig) {
    default_if_empty(&mut network.pod_cidr, DEFAULT_POD_CIDR);
    default_if_empty(&mut network.service_cidr, DEFAULT_SERVICE_CIDR);
    default_if_empty(&mut talos.version, DEFAULT_TALOS_VERSION);
    talos.schematic = talos.schematic.take().filter(|s| !s.is_empty());
    default_if_empty(&mut addons.cni.type_, DEFAULT_CNI);
    default_if_empty(&mut addons.storage.type_, DEFAULT_STORAGE);
    default_if_empty(&mut addons.load_balancer.type_, DEFAULT_LOAD_BALANCER);
    default_if_empty(&mut addons.git_ops.type_, DEFAULT_GITOPS);
}

fn default_if_empty(field: &mut String, default: &str) {
    if field.trim().is_empty() {
        *field = default.to_string();
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(field, "required"));
    }
    Ok(())
}

/// Reject a file path that does not name a readable regular file
fn check_readable(field: &str, path: &str) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::validation(field, format!("cannot read {path}: {e}")))?;
    if !meta.is_file() {
        return Err(Error::validation(field, format!("{path} is not a file")));
    }
    std::fs::File::open(path)
        .map(|_| ())
        .map_err(|e| Error::validation(field, format!("cannot read {path}: {e}")))
}

fn validate_host_aliases(field: &str, aliases: &[String]) -> Result<()> {
    for alias in aliases {
        let parts = alias.split_whitespace().count();
        if parts < 2 || alias.contains(['\'', '\n', '\r']) {
            return Err(Error::validation(
                field,
                format!("invalid host alias {alias:?}, expected \"<ip> <hostname>\""),
            ));
        }
    }
    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Expand a leading `~` to the user's home directory
pub fn expand_path(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home
            .join(rest.trim_start_matches('/'))
            .to_string_lossy()
            .into_owned(),
        _ => path.to_string(),
    }
}
