//! Credential persistence
//!
//! The kubeconfig and talosconfig of the new cluster are written under the
//! per-user Butler directory, readable only by the owner.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use butler_common::{Error, Result};

use super::config::BUTLER_DIR_NAME;
use super::watcher::ClusterCredentials;

/// Where credentials for bootstrapped clusters are written
#[derive(Clone, Debug)]
pub struct CredentialStore {
    dir: PathBuf,
}

/// Paths written by [`CredentialStore::persist`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedCredentials {
    /// Admin kubeconfig
    pub kubeconfig_path: PathBuf,
    /// Talos client config
    pub talosconfig_path: PathBuf,
}

impl CredentialStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `~/.butler`
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::persist("could not determine home directory"))?;
        Ok(Self::new(home.join(BUTLER_DIR_NAME)))
    }

    /// Directory credentials are written to
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Kubeconfig path for `cluster`
    pub fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{cluster}-kubeconfig"))
    }

    /// Talosconfig path for `cluster`
    pub fn talosconfig_path(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{cluster}-talosconfig"))
    }

    /// Write both credentials, repairing the talosconfig endpoints first
    pub fn persist(&self, cluster: &str, creds: &ClusterCredentials) -> Result<PersistedCredentials> {
        ensure_private_dir(&self.dir)
            .map_err(|e| Error::persist(format!("creating {}: {}", self.dir.display(), e)))?;

        let kubeconfig_path = self.kubeconfig_path(cluster);
        write_private_file(&kubeconfig_path, &creds.kubeconfig).map_err(|e| {
            Error::persist(format!("writing {}: {}", kubeconfig_path.display(), e))
        })?;
        info!("Kubeconfig saved to {}", kubeconfig_path.display());

        let talosconfig_path = self.talosconfig_path(cluster);
        let talosconfig =
            repair_talosconfig(&creds.talosconfig, cluster, &creds.control_plane_addresses);
        write_private_file(&talosconfig_path, &talosconfig).map_err(|e| {
            Error::persist(format!("writing {}: {}", talosconfig_path.display(), e))
        })?;
        info!("Talosconfig saved to {}", talosconfig_path.display());

        Ok(PersistedCredentials {
            kubeconfig_path,
            talosconfig_path,
        })
    }
}

/// Create `dir` (and parents) and restrict it to the owner
pub(crate) fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write `data` to `path`, readable and writable only by the owner
pub(crate) fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // mode() only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()
}

#[derive(Debug, Deserialize, Serialize)]
struct TalosConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    #[serde(default)]
    contexts: BTreeMap<String, TalosContext>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TalosContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<Vec<String>>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

/// Fill in empty endpoints of the cluster's talosconfig context, and its nodes
/// too if those are empty.
///
/// The context named after the cluster is used, falling back to the active
/// context. Anything that cannot be parsed, or needs no change, is returned
/// byte-for-byte.
pub fn repair_talosconfig(raw: &[u8], cluster: &str, addresses: &[String]) -> Vec<u8> {
    if raw.is_empty() || addresses.is_empty() {
        return raw.to_vec();
    }

    let mut config: TalosConfigFile = match serde_yaml::from_slice(raw) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Could not parse talosconfig, writing it unchanged");
            return raw.to_vec();
        }
    };

    let key = if config.contexts.contains_key(cluster) {
        Some(cluster.to_string())
    } else {
        config.context.clone().filter(|c| config.contexts.contains_key(c))
    };
    let context = match key {
        Some(k) => config.contexts.get_mut(&k),
        None => None,
    };
    let Some(context) = context else {
        debug!("talosconfig has no matching context, writing it unchanged");
        return raw.to_vec();
    };

    let is_empty = |list: &Option<Vec<String>>| list.as_ref().map_or(true, Vec::is_empty);
    if !is_empty(&context.endpoints) {
        return raw.to_vec();
    }
    context.endpoints = Some(addresses.to_vec());
    if is_empty(&context.nodes) {
        context.nodes = Some(addresses.to_vec());
    }

    match serde_yaml::to_string(&config) {
        Ok(repaired) => {
            info!(endpoints = ?addresses, "Filled talosconfig endpoints");
            repaired.into_bytes()
        }
        Err(e) => {
            warn!(error = %e, "Could not re-encode talosconfig, writing it unchanged");
            raw.to_vec()
        }
    }
}
