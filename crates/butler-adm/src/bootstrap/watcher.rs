//! Waits for the ClusterBootstrap to reach a terminal phase
//!
//! Transient read failures are logged and retried; only a Failed phase, the
//! run deadline or cancellation end the watch early.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::discovery::ApiResource;
use tracing::{debug, info, warn};

use butler_common::crd::{BootstrapPhase, ClusterBootstrap, ClusterBootstrapStatus};
use butler_common::kube_utils::ResourceStore;
use butler_common::{poll_until, Error, Result, RunContext, BUTLER_NAMESPACE};

/// Pause between status reads
pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// What a Ready ClusterBootstrap hands back
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterCredentials {
    /// Decoded admin kubeconfig
    pub kubeconfig: Vec<u8>,
    /// Decoded talosconfig; empty if the controller did not publish one
    pub talosconfig: Vec<u8>,
    /// Control plane machine addresses, in status order
    pub control_plane_addresses: Vec<String>,
    /// Console URL or access hint
    pub console_url: Option<String>,
}

/// Watches one ClusterBootstrap
pub struct BootstrapWatcher {
    store: Arc<dyn ResourceStore>,
    name: String,
    interval: Duration,
}

impl BootstrapWatcher {
    /// Watch the ClusterBootstrap `name` in the Butler namespace
    pub fn new(store: Arc<dyn ResourceStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            interval: WATCH_INTERVAL,
        }
    }

    /// Pause between status reads
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until Ready (credentials returned) or Failed (reason and message
    /// returned verbatim as [`Error::ProvisioningFailed`])
    pub async fn watch(&self, ctx: &RunContext) -> Result<ClusterCredentials> {
        let resource = ApiResource::erase::<ClusterBootstrap>(&());
        let last_phase: Mutex<Option<BootstrapPhase>> = Mutex::new(None);
        let operation = format!("ClusterBootstrap {} to become Ready", self.name);

        poll_until(ctx, &operation, self.interval, || async {
            let object = match self.store.get(&resource, Some(BUTLER_NAMESPACE), &self.name).await {
                Ok(Some(object)) => object,
                Ok(None) => {
                    debug!(name = %self.name, "ClusterBootstrap not found yet");
                    return Ok(None);
                }
                Err(e) if e.is_cancelled() || e.is_timeout() => return Err(e),
                Err(e) => {
                    debug!(error = %e, "Failed to read ClusterBootstrap, retrying");
                    return Ok(None);
                }
            };

            let status = match object.get("status") {
                None | Some(serde_json::Value::Null) => {
                    debug!("ClusterBootstrap has no status yet");
                    return Ok(None);
                }
                // field by field, so an odd machine entry cannot mask a Failed phase
                Some(raw) => ClusterBootstrapStatus::from_value_lenient(raw),
            };

            self.observe(&status, &last_phase);

            match status.phase {
                Some(BootstrapPhase::Ready) => extract_credentials(&status).map(Some),
                Some(BootstrapPhase::Failed) => Err(Error::provisioning_failed(
                    status.failure_reason.unwrap_or_else(|| "Unknown".to_string()),
                    status.failure_message.unwrap_or_default(),
                )),
                _ => Ok(None),
            }
        })
        .await
    }

    fn observe(&self, status: &ClusterBootstrapStatus, last_phase: &Mutex<Option<BootstrapPhase>>) {
        let Ok(mut last) = last_phase.lock() else {
            return;
        };
        if status.phase != *last {
            if let Some(phase) = &status.phase {
                info!("Bootstrap phase: {}", phase);
            }
            *last = status.phase.clone();
        }
        for machine in &status.machines {
            debug!(
                machine = %machine.name,
                role = machine.role.as_deref().unwrap_or("-"),
                phase = machine.phase.as_deref().unwrap_or("-"),
                ip = machine.ip_address.as_deref().unwrap_or("-"),
                ready = machine.ready.unwrap_or(false),
                "machine status"
            );
        }
    }
}

/// Decode the credentials published on a Ready status
pub fn extract_credentials(status: &ClusterBootstrapStatus) -> Result<ClusterCredentials> {
    let kubeconfig = match status.kubeconfig.as_deref() {
        Some(encoded) if !encoded.is_empty() => decode("kubeconfig", encoded)?,
        _ => return Err(Error::persist("Ready status carries no kubeconfig")),
    };
    let talosconfig = match status.talosconfig.as_deref() {
        Some(encoded) if !encoded.is_empty() => decode("talosconfig", encoded)?,
        _ => {
            warn!("Ready status carries no talosconfig");
            Vec::new()
        }
    };

    Ok(ClusterCredentials {
        kubeconfig,
        talosconfig,
        control_plane_addresses: status.control_plane_addresses(),
        console_url: status.console_url.clone().filter(|u| !u.is_empty()),
    })
}

fn decode(field: &str, encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::persist(format!("decoding status.{field}: {e}")))
}
