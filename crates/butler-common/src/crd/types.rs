//! Supporting types shared by the Butler CRDs and the bootstrap configuration

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported infrastructure provider types
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Harvester HCI
    Harvester,
    /// Nutanix AHV via Prism Central
    Nutanix,
    /// Proxmox VE
    Proxmox,
}

impl ProviderType {
    /// All provider types, in display order
    pub const ALL: [ProviderType; 3] = [Self::Harvester, Self::Nutanix, Self::Proxmox];

    /// Provider name as used in resource names and manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Harvester => "harvester",
            Self::Nutanix => "nutanix",
            Self::Proxmox => "proxmox",
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "harvester" => Ok(Self::Harvester),
            "nutanix" => Ok(Self::Nutanix),
            "proxmox" => Ok(Self::Proxmox),
            _ => Err(crate::Error::validation(
                "provider",
                format!("invalid provider type: {s}, expected one of: harvester, nutanix, proxmox"),
            )),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster topology
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One control plane node that also runs workloads; no workers
    SingleNode,
    /// Dedicated control plane nodes plus a worker pool
    #[default]
    Ha,
}

impl Topology {
    /// Returns true for the single-node topology
    pub fn is_single_node(&self) -> bool {
        matches!(self, Self::SingleNode)
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleNode => write!(f, "single-node"),
            Self::Ha => write!(f, "ha"),
        }
    }
}

/// Reference to a namespaced object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

/// Reference to a key-bearing Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Key inside the secret, when the provider reads a single key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Size and shape of a group of identical machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Number of machines
    #[serde(default)]
    pub replicas: i32,
    /// vCPUs per machine
    #[serde(default)]
    pub cpu: i32,
    /// Memory per machine in MB
    #[serde(default, rename = "memoryMB")]
    pub memory_mb: i32,
    /// Boot disk size in GB
    #[serde(default, rename = "diskGB")]
    pub disk_gb: i32,
    /// Additional disks, typically for distributed storage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_disks: Vec<DiskSpec>,
}

/// An additional disk attached to each machine in a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Disk size in GB
    #[serde(rename = "sizeGB")]
    pub size_gb: i32,
    /// Storage class hint for the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Cluster networking
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Pod network CIDR
    #[serde(default, rename = "podCIDR")]
    pub pod_cidr: String,
    /// Service network CIDR
    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: String,
    /// Control plane virtual IP
    #[serde(default)]
    pub vip: String,
}

/// Talos Linux image selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TalosSpec {
    /// Talos version, e.g. "v1.9.0"
    #[serde(default)]
    pub version: String,
    /// Image factory schematic ID selecting system extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<String>,
}

/// An addon selected only by its implementation type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AddonType {
    /// Implementation, e.g. "cilium"
    #[serde(default, rename = "type")]
    pub type_: String,
}

/// Load balancer addon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Implementation, e.g. "metallb"
    #[serde(default, rename = "type")]
    pub type_: String,
    /// IP range handed out to LoadBalancer services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_pool: Option<String>,
}

/// Optional component with a pinned version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ComponentSpec {
    /// Whether to install the component
    #[serde(default)]
    pub enabled: bool,
    /// Version to install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Butler controller addon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ButlerControllerSpec {
    /// Whether to install the controller
    #[serde(default)]
    pub enabled: bool,
    /// Version to install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Butler console addon as submitted to the controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ConsoleSpec {
    /// Whether to install the console
    pub enabled: bool,
    /// Console version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Ingress exposure; absent means port-forward access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<ConsoleIngressSpec>,
}

/// Console ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleIngressSpec {
    /// Whether an Ingress is created
    #[serde(default)]
    pub enabled: bool,
    /// Hostname
    #[serde(default)]
    pub host: String,
    /// IngressClass name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Serve over TLS
    #[serde(default)]
    pub tls: bool,
    /// Secret holding the TLS certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parse_and_display() {
        for provider in ProviderType::ALL {
            let parsed: ProviderType = provider.as_str().parse().unwrap();
            assert_eq!(parsed, provider);
            assert_eq!(parsed.to_string(), provider.as_str());
        }
        assert_eq!(
            "Nutanix".parse::<ProviderType>().unwrap(),
            ProviderType::Nutanix
        );
        assert!("vsphere".parse::<ProviderType>().unwrap_err().is_validation());
    }

    #[test]
    fn test_topology_serde_names() {
        let single: Topology = serde_yaml::from_str("single-node").unwrap();
        assert!(single.is_single_node());
        let ha: Topology = serde_yaml::from_str("ha").unwrap();
        assert_eq!(ha, Topology::Ha);
        assert!(serde_yaml::from_str::<Topology>("triple").is_err());
        assert_eq!(Topology::SingleNode.to_string(), "single-node");
    }

    #[test]
    fn test_node_pool_wire_names() {
        let pool = NodePoolSpec {
            replicas: 3,
            cpu: 4,
            memory_mb: 8192,
            disk_gb: 50,
            extra_disks: vec![DiskSpec {
                size_gb: 100,
                storage_class: None,
            }],
        };
        let value = serde_json::to_value(&pool).unwrap();
        assert_eq!(value["memoryMB"], 8192);
        assert_eq!(value["diskGB"], 50);
        assert_eq!(value["extraDisks"][0]["sizeGB"], 100);
        assert!(value["extraDisks"][0].get("storageClass").is_none());
    }
}
