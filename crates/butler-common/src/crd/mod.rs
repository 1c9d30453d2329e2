//! Custom Resource Definitions consumed by the Butler controllers

mod cluster_bootstrap;
mod provider_config;
mod types;

pub use cluster_bootstrap::{
    AddonsSpec, BootstrapPhase, ClusterBootstrap, ClusterBootstrapSpec, ClusterBootstrapStatus,
    ClusterShape, MachineStatus, ROLE_CONTROL_PLANE,
};
pub use provider_config::{
    HarvesterSettings, NutanixSettings, ProviderConfig, ProviderConfigSpec, ProxmoxSettings,
};
pub use types::{
    AddonType, ButlerControllerSpec, ComponentSpec, ConsoleIngressSpec, ConsoleSpec, DiskSpec,
    LoadBalancerSpec, NetworkSpec, NodePoolSpec, ObjectReference, ProviderType, SecretReference,
    TalosSpec, Topology,
};

/// API group of all Butler resources
pub const BUTLER_API_GROUP: &str = "butler.butlerlabs.dev";

/// API version of the Butler resources managed here
pub const BUTLER_API_VERSION: &str = "v1alpha1";
