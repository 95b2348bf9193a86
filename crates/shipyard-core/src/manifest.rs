//! Multi-architecture manifest list publishing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shipyard_tools::{CommandRunner, Invocation, ToolError};
use tracing::debug;

use crate::builder::ImageBuilder;
use crate::error::{Result, ShipyardError};
use crate::obs;
use crate::platform::Platform;

/// A manifest list and the per-architecture tags it amends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestReference {
    pub repository: String,
    pub tag: String,
    /// Per-architecture tags (`<tag>-<arch>`), in amend order.
    pub amend_tags: Vec<String>,
}

impl ManifestReference {
    /// Manifest for `repository:tag` over `<tag>-<arch>` for each platform.
    pub fn for_platforms(repository: &str, tag: &str, platforms: &[Platform]) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            amend_tags: platforms
                .iter()
                .map(|p| arch_tag(tag, p))
                .collect(),
        }
    }

    /// `repository:tag`.
    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// `repository:<amend tag>` for every amended tag.
    pub fn amend_refs(&self) -> Vec<String> {
        self.amend_tags
            .iter()
            .map(|t| format!("{}:{}", self.repository, t))
            .collect()
    }
}

/// Tag of the `platform` image under a multi-arch `tag`.
pub fn arch_tag(tag: &str, platform: &Platform) -> String {
    format!("{tag}-{}", platform.arch())
}

/// Creates and pushes manifest lists with `docker manifest`.
pub struct ManifestPublisher {
    runner: Arc<dyn CommandRunner>,
    builder: Arc<dyn ImageBuilder>,
}

impl ManifestPublisher {
    pub fn new(runner: Arc<dyn CommandRunner>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self { runner, builder }
    }

    /// Replace any manifest named `manifest_ref` with one amending its tags.
    ///
    /// Every amended tag must already exist. Removal of a previous manifest
    /// is best-effort; create and push failures are `Manifest` errors. No
    /// retry and no rollback of the already pushed per-arch images.
    pub async fn publish(&self, manifest_ref: &ManifestReference) -> Result<()> {
        let name = manifest_ref.name();
        let manifest_error = |detail: String| ShipyardError::Manifest {
            manifest: name.clone(),
            detail,
        };

        if manifest_ref.amend_tags.is_empty() {
            return Err(manifest_error("no per-architecture tags to amend".to_string()));
        }
        for amend in manifest_ref.amend_refs() {
            let present = self
                .builder
                .check_exists(&amend)
                .await
                .map_err(|e| manifest_error(format!("cannot look up {amend}: {e}")))?;
            if !present {
                return Err(manifest_error(format!("per-architecture image {amend} is missing")));
            }
        }

        let rm = Invocation::new("docker").args(["manifest", "rm", name.as_str()]);
        match self.runner.run(&rm).await {
            Ok(out) if !out.passed() => debug!(manifest = %name, "no previous manifest to remove"),
            Ok(_) => debug!(manifest = %name, "removed previous local manifest"),
            Err(e) => debug!(manifest = %name, error = %e, "manifest rm failed, continuing"),
        }

        let mut create =
            Invocation::new("docker").args(["manifest", "create", name.as_str()]);
        for amend in manifest_ref.amend_refs() {
            create = create.args(["--amend".to_string(), amend]);
        }
        self.runner
            .run_checked(&create)
            .await
            .map_err(|e| manifest_error(tool_detail(e)))?;

        let push = Invocation::new("docker").args(["manifest", "push", name.as_str()]);
        self.runner
            .run_checked(&push)
            .await
            .map_err(|e| manifest_error(tool_detail(e)))?;

        obs::emit_manifest_published(&name, manifest_ref.amend_tags.len());
        Ok(())
    }
}

fn tool_detail(err: ToolError) -> String {
    match err {
        ToolError::Failed { stderr, .. } => stderr,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildxBuilder;
    use shipyard_tools::fakes::ScriptedRunner;
    use shipyard_tools::CommandOutput;

    fn platforms() -> Vec<Platform> {
        vec![Platform::primary(), Platform::from_arch("arm64").unwrap()]
    }

    fn publisher(runner: Arc<ScriptedRunner>) -> ManifestPublisher {
        let builder = Arc::new(BuildxBuilder::new(runner.clone()));
        ManifestPublisher::new(runner, builder)
    }

    #[test]
    fn reference_for_platforms() {
        let m = ManifestReference::for_platforms("quay.io/mongodb/agent", "1.0.0", &platforms());
        assert_eq!(m.name(), "quay.io/mongodb/agent:1.0.0");
        assert_eq!(m.amend_tags, vec!["1.0.0-amd64", "1.0.0-arm64"]);
    }

    #[tokio::test]
    async fn publish_runs_rm_create_push_in_order() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("manifest inspect", CommandOutput::ok("{}"));
        runner.on("manifest rm", CommandOutput::failed(1, "No such manifest"));
        let m = ManifestReference::for_platforms("quay.io/mongodb/agent", "1.0.0", &platforms());

        publisher(runner.clone()).publish(&m).await.unwrap();

        let mutating: Vec<String> = runner
            .command_lines()
            .into_iter()
            .filter(|l| !l.contains("manifest inspect"))
            .collect();
        assert_eq!(
            mutating,
            vec![
                "docker manifest rm quay.io/mongodb/agent:1.0.0".to_string(),
                "docker manifest create quay.io/mongodb/agent:1.0.0 \
                 --amend quay.io/mongodb/agent:1.0.0-amd64 \
                 --amend quay.io/mongodb/agent:1.0.0-arm64"
                    .to_string(),
                "docker manifest push quay.io/mongodb/agent:1.0.0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_arch_image_blocks_publish() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("1.0.0-arm64", CommandOutput::failed(1, "no such manifest"));
        runner.on("manifest inspect", CommandOutput::ok("{}"));
        let m = ManifestReference::for_platforms("quay.io/mongodb/agent", "1.0.0", &platforms());

        let err = publisher(runner.clone()).publish(&m).await.unwrap_err();
        assert!(matches!(err, ShipyardError::Manifest { .. }));
        assert_eq!(runner.count_matching("manifest create"), 0);
        assert_eq!(runner.count_matching("manifest push"), 0);
    }

    #[tokio::test]
    async fn failed_arch_lookup_is_manifest_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("1.0.0-arm64", CommandOutput::failed(1, "received unexpected HTTP status: 503"));
        runner.on("manifest inspect", CommandOutput::ok("{}"));
        let m = ManifestReference::for_platforms("quay.io/mongodb/agent", "1.0.0", &platforms());

        match publisher(runner.clone()).publish(&m).await {
            Err(ShipyardError::Manifest { manifest, detail }) => {
                assert_eq!(manifest, "quay.io/mongodb/agent:1.0.0");
                assert!(detail.contains("quay.io/mongodb/agent:1.0.0-arm64"));
                assert!(detail.contains("503"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(runner.count_matching("manifest create"), 0);
    }

    #[tokio::test]
    async fn push_failure_is_manifest_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("manifest inspect", CommandOutput::ok("{}"));
        runner.on("manifest push", CommandOutput::failed(1, "denied: requested access"));
        let m = ManifestReference::for_platforms("quay.io/mongodb/agent", "1.0.0", &platforms());

        match publisher(runner.clone()).publish(&m).await {
            Err(ShipyardError::Manifest { manifest, detail }) => {
                assert_eq!(manifest, "quay.io/mongodb/agent:1.0.0");
                assert!(detail.contains("denied"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Not retried.
        assert_eq!(runner.count_matching("manifest push"), 1);
    }
}
