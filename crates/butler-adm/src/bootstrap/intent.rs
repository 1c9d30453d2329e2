//! Bootstrap intent
//!
//! Translates a validated [`Config`] into the objects the controllers act on:
//! the namespace, the provider credentials Secret, the ProviderConfig and the
//! ClusterBootstrap. Builders are pure; only [`submit`] and
//! [`build_credentials_secret`] touch the outside world.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::info;

use butler_common::crd::{
    AddonsSpec, ClusterBootstrap, ClusterBootstrapSpec, ClusterShape, ConsoleSpec,
    HarvesterSettings, NutanixSettings, ObjectReference, ProviderConfig, ProviderConfigSpec,
    ProxmoxSettings, SecretReference,
};
use butler_common::kube_utils::ResourceStore;
use butler_common::{Error, Result, RunContext, BUTLER_NAMESPACE};

use super::config::{AddonsConfig, Config, ProviderSettings};

/// Secret key holding the Harvester kubeconfig
pub const HARVESTER_KUBECONFIG_KEY: &str = "kubeconfig";

/// Name of the ProviderConfig for `cluster`
pub fn provider_config_name(cluster: &str) -> String {
    format!("{cluster}-provider")
}

/// Name of the provider credentials Secret
pub fn credentials_secret_name(cfg: &Config) -> String {
    format!("{}-{}-credentials", cfg.cluster.name, cfg.provider)
}

/// The namespace everything is created in
pub fn build_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(BUTLER_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Provider credentials Secret. For Harvester this reads the configured
/// kubeconfig file.
pub fn build_credentials_secret(cfg: &Config) -> Result<Secret> {
    let data: BTreeMap<String, String> = match &cfg.provider_settings {
        ProviderSettings::Harvester(h) => {
            let kubeconfig = std::fs::read_to_string(&h.kubeconfig_path).map_err(|e| {
                Error::validation(
                    "providerConfig.harvester.kubeconfigPath",
                    format!("failed to read {}: {}", h.kubeconfig_path, e),
                )
            })?;
            BTreeMap::from([(HARVESTER_KUBECONFIG_KEY.to_string(), kubeconfig)])
        }
        ProviderSettings::Nutanix(n) => BTreeMap::from([
            ("username".to_string(), n.username.clone()),
            ("password".to_string(), n.password.clone()),
        ]),
        ProviderSettings::Proxmox(p) if p.uses_token() => BTreeMap::from([
            ("token".to_string(), p.token_id.clone()),
            ("tokenSecret".to_string(), p.token_secret.clone()),
        ]),
        ProviderSettings::Proxmox(p) => BTreeMap::from([
            ("username".to_string(), p.username.clone()),
            ("password".to_string(), p.password.clone()),
        ]),
    };

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(cfg)),
            namespace: Some(BUTLER_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([
                ("app.kubernetes.io/part-of".to_string(), "butler".to_string()),
                ("butler.butlerlabs.dev/cluster".to_string(), cfg.cluster.name.clone()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    })
}

/// ProviderConfig pointing at the credentials Secret
pub fn build_provider_config(cfg: &Config) -> ProviderConfig {
    let mut spec = ProviderConfigSpec {
        provider: cfg.provider,
        credentials_ref: SecretReference {
            name: credentials_secret_name(cfg),
            namespace: BUTLER_NAMESPACE.to_string(),
            key: None,
        },
        harvester: None,
        nutanix: None,
        proxmox: None,
    };

    match &cfg.provider_settings {
        ProviderSettings::Harvester(h) => {
            spec.credentials_ref.key = Some(HARVESTER_KUBECONFIG_KEY.to_string());
            spec.harvester = Some(HarvesterSettings {
                namespace: h.namespace.clone(),
                network_name: h.network_name.clone(),
                image_name: h.image_name.clone(),
            });
        }
        ProviderSettings::Nutanix(n) => {
            spec.nutanix = Some(NutanixSettings {
                endpoint: n.endpoint.clone(),
                port: n.port,
                insecure: n.insecure,
                cluster_uuid: n.cluster_uuid.clone(),
                subnet_uuid: n.subnet_uuid.clone(),
                image_uuid: n.image_uuid.clone(),
                storage_container_uuid: n.storage_container_uuid.clone(),
            });
        }
        ProviderSettings::Proxmox(p) => {
            spec.proxmox = Some(ProxmoxSettings {
                endpoint: p.endpoint.clone(),
                insecure: p.insecure,
                nodes: p.nodes.clone(),
                storage: p.storage.clone(),
                template_id: p.template_id,
                vmid_start: p.vmid_start,
                vmid_end: p.vmid_end,
            });
        }
    }

    let mut pc = ProviderConfig::new(&provider_config_name(&cfg.cluster.name), spec);
    pc.meta_mut().namespace = Some(BUTLER_NAMESPACE.to_string());
    pc
}

/// ClusterBootstrap describing the cluster to build
pub fn build_cluster_bootstrap(cfg: &Config) -> ClusterBootstrap {
    let mut control_plane = cfg.cluster.control_plane.clone();
    let workers = if cfg.is_single_node() {
        control_plane.replicas = 1;
        None
    } else {
        Some(cfg.cluster.workers.clone())
    };

    let spec = ClusterBootstrapSpec {
        provider: cfg.provider,
        provider_ref: ObjectReference {
            name: provider_config_name(&cfg.cluster.name),
            namespace: BUTLER_NAMESPACE.to_string(),
        },
        cluster: ClusterShape {
            name: cfg.cluster.name.clone(),
            topology: cfg.cluster.topology,
            control_plane,
            workers,
        },
        network: cfg.network.clone(),
        talos: cfg.talos.clone(),
        addons: addons_spec(&cfg.addons),
    };

    let mut cb = ClusterBootstrap::new(&cfg.cluster.name, spec);
    cb.meta_mut().namespace = Some(BUTLER_NAMESPACE.to_string());
    cb
}

fn addons_spec(addons: &AddonsConfig) -> AddonsSpec {
    let console = &addons.console;
    AddonsSpec {
        cni: addons.cni.clone(),
        storage: addons.storage.clone(),
        load_balancer: addons.load_balancer.clone(),
        git_ops: addons.git_ops.clone(),
        capi: addons.capi.clone(),
        butler_controller: addons.butler_controller.clone(),
        console: ConsoleSpec {
            enabled: console.enabled,
            version: console.version.clone(),
            ingress: console.ingress.enabled.then(|| console.ingress.clone()),
        },
    }
}

/// A machine the controllers are expected to request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachinePreview {
    /// Machine name
    pub name: String,
    /// "control-plane" or "worker"
    pub role: &'static str,
    /// vCPUs
    pub cpu: i32,
    /// Memory in MB
    pub memory_mb: i32,
}

/// Machines implied by the cluster shape, control plane first
pub fn machine_previews(cfg: &Config) -> Vec<MachinePreview> {
    let name = &cfg.cluster.name;
    let cp = &cfg.cluster.control_plane;
    let cp_replicas = if cfg.is_single_node() { 1 } else { cp.replicas };

    let mut machines: Vec<MachinePreview> = (0..cp_replicas)
        .map(|i| MachinePreview {
            name: format!("{name}-cp-{i}"),
            role: "control-plane",
            cpu: cp.cpu,
            memory_mb: cp.memory_mb,
        })
        .collect();

    if !cfg.is_single_node() {
        let w = &cfg.cluster.workers;
        machines.extend((0..w.replicas).map(|i| MachinePreview {
            name: format!("{name}-worker-{i}"),
            role: "worker",
            cpu: w.cpu,
            memory_mb: w.memory_mb,
        }));
    }
    machines
}

/// Create `object` once. An existing object with the same name is an error,
/// never silently overwritten.
pub async fn submit<K>(ctx: &RunContext, store: &dyn ResourceStore, object: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let resource = kube::discovery::ApiResource::erase::<K>(&());
    let value = serde_json::to_value(object)?;
    let name = object.name_any();
    ctx.run(
        &format!("creating {} {}", resource.kind, name),
        store.create(&resource, object.namespace().as_deref(), &value),
    )
    .await?;
    info!("{} {} created", resource.kind, name);
    Ok(())
}
