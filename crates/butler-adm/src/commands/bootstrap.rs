//! Bootstrap command - create a Butler management cluster
//!
//! Loads and validates the configuration, then hands off to the
//! [`Orchestrator`]. Nothing outside the process is touched until the
//! configuration is valid and matches the requested provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use butler_common::crd::ProviderType;

use crate::bootstrap::{
    load, resolve_config_path, BootstrapOptions, CommandRunner, CredentialFallbacks,
    CredentialStore, KindSubstrate, Orchestrator, Outcome, SubstrateManager, SystemRunner,
};
use crate::{Error, Result};

/// Where `--local` looks for checkouts when `--repo-root` is not given,
/// relative to the home directory
const DEFAULT_REPO_ROOT: &str = "code/github.com/butlerdotdev";

/// Bootstrap a management cluster on the given provider
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// Infrastructure provider (harvester, nutanix or proxmox)
    pub provider: ProviderType,

    /// Path to the bootstrap config file
    #[arg(short = 'c', long = "config", env = "BUTLER_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Show what would be created without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Never delete the kind cluster
    #[arg(long)]
    pub skip_cleanup: bool,

    /// Keep the kind cluster if the bootstrap fails (for debugging)
    #[arg(long)]
    pub keep_on_failure: bool,

    /// Build and load controller images from local checkouts
    #[arg(long)]
    pub local: bool,

    /// Directory holding the butler-bootstrap and butler-provider-* checkouts
    /// (default: ~/code/github.com/butlerdotdev)
    #[arg(long, requires = "local")]
    pub repo_root: Option<PathBuf>,

    /// Timeout for the entire bootstrap in seconds
    #[arg(long = "timeout", default_value = "1800")]
    pub timeout_secs: u64,

    /// Point cluster DNS at public resolvers even without CAs or host aliases
    #[arg(long)]
    pub patch_dns: bool,
}

impl BootstrapArgs {
    /// Gather the flags into orchestrator options
    pub fn options(&self) -> Result<BootstrapOptions> {
        let local_repo_root = match (self.local, &self.repo_root) {
            (false, _) => None,
            (true, Some(root)) => Some(root.clone()),
            (true, None) => Some(
                dirs::home_dir()
                    .ok_or_else(|| Error::environment("cannot determine home directory, pass --repo-root"))?
                    .join(DEFAULT_REPO_ROOT),
            ),
        };

        Ok(BootstrapOptions {
            dry_run: self.dry_run,
            skip_cleanup: self.skip_cleanup,
            keep_on_failure: self.keep_on_failure,
            timeout: Duration::from_secs(self.timeout_secs),
            local_repo_root,
            force_dns_patch: self.patch_dns,
            ..Default::default()
        })
    }
}

/// Run the bootstrap command
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config_path = resolve_config_path(args.config_file.as_deref())?;
    let options = args.options()?;
    let credentials = CredentialStore::default_location()?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let substrate: Arc<dyn SubstrateManager> = Arc::new(KindSubstrate::new(runner.clone()));

    let token = CancellationToken::new();
    spawn_signal_listener(token.clone());

    let output = execute(
        &config_path,
        args.provider,
        options,
        substrate,
        runner,
        credentials,
        token,
    )
    .await?;
    println!("{output}");
    Ok(())
}

/// Load the config at `path`, check it is for `provider`, and run the
/// orchestrator. Returns the text to print.
pub async fn execute(
    path: &Path,
    provider: ProviderType,
    options: BootstrapOptions,
    substrate: Arc<dyn SubstrateManager>,
    runner: Arc<dyn CommandRunner>,
    credentials: CredentialStore,
    token: CancellationToken,
) -> Result<String> {
    let cfg = load(path, &CredentialFallbacks::default())?;
    if cfg.provider != provider {
        return Err(Error::validation(
            "provider",
            format!("config is for {}, but bootstrap {} was requested", cfg.provider, provider),
        ));
    }

    let orchestrator = Orchestrator::new(options, substrate, runner, credentials);
    match orchestrator.run(&cfg, token).await? {
        Outcome::DryRun(plan) => Ok(plan),
        Outcome::Completed(summary) => Ok(summary.render()),
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupted() => {
                warn!("Received interrupt, cleaning up...");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

#[cfg(unix)]
async fn interrupted() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, handling Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}
