//! ClusterBootstrap Custom Resource Definition
//!
//! The bootstrap intent: what cluster to build and with which addons. The spec
//! is written once by `butleradm`; the status is owned by the bootstrap
//! controller and only read back here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AddonType, ButlerControllerSpec, ComponentSpec, ConsoleSpec, LoadBalancerSpec, NetworkSpec,
    NodePoolSpec, ObjectReference, ProviderType, TalosSpec, Topology,
};

/// Specification for a ClusterBootstrap
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "butler.butlerlabs.dev",
    version = "v1alpha1",
    kind = "ClusterBootstrap",
    plural = "clusterbootstraps",
    namespaced,
    status = "ClusterBootstrapStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBootstrapSpec {
    /// Infrastructure provider
    pub provider: ProviderType,
    /// The ProviderConfig to provision with
    pub provider_ref: ObjectReference,
    /// Cluster shape
    pub cluster: ClusterShape,
    /// Networking
    pub network: NetworkSpec,
    /// Operating system image
    pub talos: TalosSpec,
    /// Platform addons
    pub addons: AddonsSpec,
}

/// Cluster name, topology and node pools
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterShape {
    /// Cluster name
    pub name: String,
    /// Topology
    pub topology: Topology,
    /// Control plane pool
    pub control_plane: NodePoolSpec,
    /// Worker pool. Absent (not zero) for single-node clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<NodePoolSpec>,
}

/// Addons installed once the cluster is up
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonsSpec {
    /// CNI
    #[serde(default)]
    pub cni: AddonType,
    /// Storage
    #[serde(default)]
    pub storage: AddonType,
    /// Load balancer
    #[serde(default)]
    pub load_balancer: LoadBalancerSpec,
    /// GitOps engine
    #[serde(default)]
    pub git_ops: AddonType,
    /// Cluster API
    #[serde(default)]
    pub capi: ComponentSpec,
    /// Butler controller
    #[serde(default)]
    pub butler_controller: ButlerControllerSpec,
    /// Butler console
    #[serde(default)]
    pub console: ConsoleSpec,
}

/// Observed state written by the bootstrap controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBootstrapStatus {
    /// Current phase; absent until the controller first reconciles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub phase: Option<BootstrapPhase>,

    /// Per-machine progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machines: Vec<MachineStatus>,

    /// Base64-encoded admin kubeconfig, set once Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,

    /// Base64-encoded talosconfig, set once Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talosconfig: Option<String>,

    /// Console URL or port-forward hint
    #[serde(default, rename = "consoleURL", skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,

    /// Machine-readable failure reason, set when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Human-readable failure message, set when Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ClusterBootstrapStatus {
    /// Addresses of control plane machines that have one, in status order
    pub fn control_plane_addresses(&self) -> Vec<String> {
        self.machines
            .iter()
            .filter(|m| m.is_control_plane())
            .filter_map(|m| m.ip_address.as_deref())
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Decode a raw `status` object field by field
    ///
    /// A malformed field is dropped rather than failing the whole status, so
    /// a terminal `phase` and the failure details stay readable even when a
    /// newer controller writes something this version does not understand.
    pub fn from_value_lenient(raw: &serde_json::Value) -> Self {
        let machines = match raw.get("machines") {
            Some(serde_json::Value::Array(entries)) => entries
                .iter()
                .filter(|m| m.is_object())
                .map(MachineStatus::from_value_lenient)
                .collect(),
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(other) => {
                tracing::debug!(value = %other, "Ignoring non-list status.machines");
                Vec::new()
            }
        };

        Self {
            phase: string_field(raw, "phase").map(BootstrapPhase::from),
            machines,
            kubeconfig: string_field(raw, "kubeconfig"),
            talosconfig: string_field(raw, "talosconfig"),
            console_url: string_field(raw, "consoleURL"),
            failure_reason: string_field(raw, "failureReason"),
            failure_message: string_field(raw, "failureMessage"),
        }
    }
}

fn string_field(raw: &serde_json::Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => {
            tracing::debug!(field = key, value = %other, "Ignoring non-string status field");
            None
        }
    }
}

/// Progress of a single machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Machine name
    #[serde(default)]
    pub name: String,
    /// "control-plane" or "worker"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Machine phase as reported by the provider controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Primary address once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Whether the node is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

/// Role value marking control plane machines
pub const ROLE_CONTROL_PLANE: &str = "control-plane";

impl MachineStatus {
    /// Returns true if this machine is part of the control plane
    pub fn is_control_plane(&self) -> bool {
        self.role.as_deref() == Some(ROLE_CONTROL_PLANE)
    }

    fn from_value_lenient(raw: &serde_json::Value) -> Self {
        let ready = match raw.get("ready") {
            Some(serde_json::Value::Bool(b)) => Some(*b),
            Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("true") => Some(true),
            Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        };
        Self {
            name: string_field(raw, "name").unwrap_or_default(),
            role: string_field(raw, "role"),
            phase: string_field(raw, "phase"),
            ip_address: string_field(raw, "ipAddress"),
            ready,
        }
    }
}

/// Bootstrap phase as reported in `status.phase`
///
/// Unrecognized values are preserved in [`BootstrapPhase::Other`] so they can
/// be logged and waited on rather than rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BootstrapPhase {
    /// Accepted, nothing started
    Pending,
    /// VMs being created
    ProvisioningMachines,
    /// Talos being configured on the machines
    ConfiguringOs,
    /// Kubernetes control plane being bootstrapped
    BootstrappingCluster,
    /// Addons being installed
    InstallingAddons,
    /// Terminal success
    Ready,
    /// Terminal failure
    Failed,
    /// Any other value
    Other(String),
}

impl BootstrapPhase {
    /// Returns true for Ready and Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl From<String> for BootstrapPhase {
    fn from(value: String) -> Self {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "pending" => Self::Pending,
            "provisioningmachines" => Self::ProvisioningMachines,
            "configuringos" | "configuringtalos" => Self::ConfiguringOs,
            "bootstrappingcluster" => Self::BootstrappingCluster,
            "installingaddons" => Self::InstallingAddons,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Other(value),
        }
    }
}

impl From<BootstrapPhase> for String {
    fn from(phase: BootstrapPhase) -> Self {
        phase.to_string()
    }
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::ProvisioningMachines => write!(f, "ProvisioningMachines"),
            Self::ConfiguringOs => write!(f, "ConfiguringOS"),
            Self::BootstrappingCluster => write!(f, "BootstrappingCluster"),
            Self::InstallingAddons => write!(f, "InstallingAddons"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_parsing_accepts_spelling_variants() {
        assert_eq!(
            BootstrapPhase::from("Provisioning-Machines".to_string()),
            BootstrapPhase::ProvisioningMachines
        );
        assert_eq!(
            BootstrapPhase::from("ProvisioningMachines".to_string()),
            BootstrapPhase::ProvisioningMachines
        );
        assert_eq!(
            BootstrapPhase::from("ConfiguringTalos".to_string()),
            BootstrapPhase::ConfiguringOs
        );
        assert_eq!(
            BootstrapPhase::from("Pivoting".to_string()),
            BootstrapPhase::Other("Pivoting".to_string())
        );
        assert!(BootstrapPhase::Ready.is_terminal());
        assert!(BootstrapPhase::Failed.is_terminal());
        assert!(!BootstrapPhase::InstallingAddons.is_terminal());
    }

    #[test]
    fn test_status_decodes_with_presence() {
        let status: ClusterBootstrapStatus = serde_json::from_value(json!({
            "phase": "Ready",
            "machines": [
                {"name": "m-cp-0", "role": "control-plane", "ipAddress": "10.0.0.10", "ready": true},
                {"name": "m-worker-0", "role": "worker", "ipAddress": "10.0.0.20"},
                {"name": "m-cp-1", "role": "control-plane", "ipAddress": ""},
                {"name": "m-cp-2", "role": "control-plane", "ipAddress": "10.0.0.12"}
            ],
            "consoleURL": "https://console.example.com"
        }))
        .unwrap();

        assert_eq!(status.phase, Some(BootstrapPhase::Ready));
        assert_eq!(status.kubeconfig, None);
        assert_eq!(
            status.console_url.as_deref(),
            Some("https://console.example.com")
        );
        assert_eq!(
            status.control_plane_addresses(),
            vec!["10.0.0.10".to_string(), "10.0.0.12".to_string()]
        );
    }

    #[test]
    fn test_empty_status_has_no_phase() {
        let status: ClusterBootstrapStatus = serde_json::from_value(json!({})).unwrap();
        assert_eq!(status.phase, None);
        assert!(status.machines.is_empty());
    }

    #[test]
    fn test_lenient_status_keeps_failure_despite_bad_fields() {
        let raw = json!({
            "phase": "Failed",
            "failureReason": "QuotaExceeded",
            "failureMessage": "cpu quota exhausted",
            "kubeconfig": 42,
            "machines": [
                {"name": "mgmt-cp-0", "role": "control-plane", "ready": "True", "ipAddress": 7},
                "garbage"
            ]
        });
        // strict decoding gives up on the whole status
        assert!(serde_json::from_value::<ClusterBootstrapStatus>(raw.clone()).is_err());

        let status = ClusterBootstrapStatus::from_value_lenient(&raw);
        assert_eq!(status.phase, Some(BootstrapPhase::Failed));
        assert_eq!(status.failure_reason.as_deref(), Some("QuotaExceeded"));
        assert_eq!(status.failure_message.as_deref(), Some("cpu quota exhausted"));
        assert_eq!(status.kubeconfig, None);
        assert_eq!(status.machines.len(), 1);
        assert_eq!(status.machines[0].name, "mgmt-cp-0");
        assert_eq!(status.machines[0].ready, Some(true));
        assert_eq!(status.machines[0].ip_address, None);
    }

    #[test]
    fn test_lenient_status_matches_strict_on_valid_input() {
        let raw = json!({
            "phase": "Ready",
            "machines": [{"name": "m-cp-0", "role": "control-plane", "ipAddress": "10.0.0.10", "ready": true}],
            "kubeconfig": "a3ViZQ==",
            "consoleURL": "https://console.example.com"
        });
        let strict: ClusterBootstrapStatus = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(ClusterBootstrapStatus::from_value_lenient(&raw), strict);
    }
}
