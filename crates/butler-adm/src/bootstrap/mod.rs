//! Management cluster bootstrap
//!
//! Everything `butleradm bootstrap` needs: configuration, the local kind
//! substrate, manifest deployment, intent submission, watching, credential
//! persistence and the orchestrator sequencing them.

pub mod config;
pub mod credentials;
pub mod deployer;
pub mod images;
pub mod intent;
pub mod orchestrator;
pub mod runner;
pub mod substrate;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{load, resolve_config_path, Config, CredentialFallbacks};
pub use credentials::{CredentialStore, PersistedCredentials};
pub use orchestrator::{BootstrapOptions, BootstrapSummary, Orchestrator, Outcome, Phase};
pub use runner::{CommandRunner, SystemRunner};
pub use substrate::{KindSubstrate, SubstrateManager};
