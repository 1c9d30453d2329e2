//! ProviderConfig Custom Resource Definition
//!
//! Tells the provider controller how to reach the infrastructure API. Credentials
//! are never inlined: the spec only points at a Secret.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ProviderType, SecretReference};

/// Specification for a ProviderConfig
///
/// Exactly one of the provider blocks is set, matching `provider`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "butler.butlerlabs.dev",
    version = "v1alpha1",
    kind = "ProviderConfig",
    plural = "providerconfigs",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Infrastructure provider
    pub provider: ProviderType,

    /// Secret holding the provider credentials
    pub credentials_ref: SecretReference,

    /// Harvester settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvester: Option<HarvesterSettings>,

    /// Nutanix settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutanix: Option<NutanixSettings>,

    /// Proxmox settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox: Option<ProxmoxSettings>,
}

/// Harvester placement settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterSettings {
    /// Namespace for VMs
    pub namespace: String,
    /// VM network in namespace/name form
    pub network_name: String,
    /// Talos image in namespace/name form
    pub image_name: String,
}

/// Nutanix Prism Central settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NutanixSettings {
    /// Prism Central URL
    pub endpoint: String,
    /// Prism Central API port
    pub port: u16,
    /// Skip TLS verification
    pub insecure: bool,
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
    #[serde(
        default,
        rename = "storageContainerUUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_container_uuid: Option<String>,
}

/// Proxmox VE settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxSettings {
    /// Proxmox API URL
    pub endpoint: String,
    /// Skip TLS verification
    pub insecure: bool,
    /// Nodes available for VM placement
    pub nodes: Vec<String>,
    /// Storage for VM disks
    pub storage: String,
    /// Template VM to clone
    #[serde(default, rename = "templateID", skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i32>,
    /// First VM ID the controller may allocate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid_start: Option<i32>,
    /// Last VM ID the controller may allocate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid_end: Option<i32>,
}
