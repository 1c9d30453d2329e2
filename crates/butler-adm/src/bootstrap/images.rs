//! Locally built controller images for development runs

use std::path::{Path, PathBuf};

use tracing::info;

use butler_common::crd::ProviderType;
use butler_common::{Error, Result, RunContext};

use super::runner::{run_checked, CommandRunner, CommandSpec};
use super::substrate::{SubstrateHandle, SubstrateManager};

/// Registry the bundled manifests pull controller images from
pub const IMAGE_REGISTRY: &str = "ghcr.io/butlerdotdev";

/// An image built from a checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalImage {
    /// Full image reference
    pub image: String,
    /// Docker build context
    pub context_dir: PathBuf,
}

/// The bootstrap controller and provider controller images, built from
/// sibling repositories under `repo_root`
pub fn local_images(repo_root: &Path, provider: ProviderType) -> Vec<LocalImage> {
    ["butler-bootstrap".to_string(), format!("butler-provider-{provider}")]
        .into_iter()
        .map(|name| LocalImage {
            image: format!("{IMAGE_REGISTRY}/{name}:latest"),
            context_dir: repo_root.join(&name),
        })
        .collect()
}

/// Build each image with docker and load it into the substrate
pub async fn build_and_load(
    ctx: &RunContext,
    runner: &dyn CommandRunner,
    substrate: &dyn SubstrateManager,
    handle: &SubstrateHandle,
    repo_root: &Path,
    provider: ProviderType,
) -> Result<()> {
    for local in local_images(repo_root, provider) {
        if !local.context_dir.is_dir() {
            return Err(Error::environment(format!(
                "repository not found at {}",
                local.context_dir.display()
            )));
        }

        info!("Building {} from {}", local.image, local.context_dir.display());
        let build = CommandSpec::new("docker")
            .args(["build", "-t", local.image.as_str(), "."])
            .current_dir(&local.context_dir);
        run_checked(runner, ctx, &build).await?;

        info!("Loading {} into {}", local.image, handle.name);
        substrate.load_image(ctx, handle, &local.image).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::runner::{CommandOutput, MockCommandRunner};
    use crate::bootstrap::substrate::MockSubstrateManager;
    use tokio_util::sync::CancellationToken;

    fn handle() -> SubstrateHandle {
        SubstrateHandle {
            name: "butler-bootstrap".to_string(),
            kubeconfig: PathBuf::from("/tmp/kubeconfig"),
            reused: false,
        }
    }

    #[test]
    fn test_local_image_names() {
        let images = local_images(Path::new("/src"), ProviderType::Proxmox);
        assert_eq!(images[0].image, "ghcr.io/butlerdotdev/butler-bootstrap:latest");
        assert_eq!(images[0].context_dir, PathBuf::from("/src/butler-bootstrap"));
        assert_eq!(images[1].image, "ghcr.io/butlerdotdev/butler-provider-proxmox:latest");
    }

    #[tokio::test]
    async fn test_builds_then_loads_each_image() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("butler-bootstrap")).unwrap();
        std::fs::create_dir(root.path().join("butler-provider-nutanix")).unwrap();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|c| c.program == "docker" && c.args[0] == "build" && c.cwd.is_some())
            .times(2)
            .returning(|_| Ok(CommandOutput::ok("")));
        let mut substrate = MockSubstrateManager::new();
        substrate
            .expect_load_image()
            .withf(|_, _, image| image.starts_with("ghcr.io/butlerdotdev/butler-"))
            .times(2)
            .returning(|_, _, _| Ok(()));

        let ctx = RunContext::new(CancellationToken::new());
        build_and_load(&ctx, &runner, &substrate, &handle(), root.path(), ProviderType::Nutanix)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_repository_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let runner = MockCommandRunner::new();
        let substrate = MockSubstrateManager::new();

        let ctx = RunContext::new(CancellationToken::new());
        let err = build_and_load(&ctx, &runner, &substrate, &handle(), root.path(), ProviderType::Harvester)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("butler-bootstrap"));
    }
}
