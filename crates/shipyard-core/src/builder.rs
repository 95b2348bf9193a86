//! Image builders and registry queries.
//!
//! Two backends sit behind [`ImageBuilder`]: `docker buildx` (any number of
//! platforms in one invocation) and plain `docker build` + `docker push`
//! (exactly one platform). Which one is used is decided once, through
//! [`BuilderKind`], when the configuration is built.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_tools::{CommandRunner, Invocation, ToolError};
use tracing::debug;

use crate::error::{Result, ShipyardError};
use crate::obs;
use crate::platform::Platform;

/// Everything the backend needs to build and push one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Fully qualified image references to tag and push.
    pub tags: Vec<String>,
    pub dockerfile: String,
    pub context: String,
    pub args: BTreeMap<String, String>,
    pub platforms: Vec<Platform>,
}

impl BuildRequest {
    pub fn primary_tag(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or_default()
    }

    fn platform_list(&self) -> String {
        self.platforms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Which backend builds images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuilderKind {
    /// `docker buildx build --push`.
    #[default]
    MultiPlatform,
    /// `docker build` then `docker push`.
    SinglePlatform,
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderKind::MultiPlatform => f.write_str("buildx"),
            BuilderKind::SinglePlatform => f.write_str("docker"),
        }
    }
}

impl FromStr for BuilderKind {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buildx" | "multi-platform" => Ok(BuilderKind::MultiPlatform),
            "docker" | "single-platform" => Ok(BuilderKind::SinglePlatform),
            other => Err(ShipyardError::Configuration(format!(
                "unknown builder '{other}', expected buildx or docker"
            ))),
        }
    }
}

/// Capability interface over the container build backend and registry.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and push every tag. Fails with `Build` on non-zero exit.
    async fn build_and_push(&self, request: &BuildRequest) -> Result<()>;

    /// Whether `image_ref` resolves in the registry.
    async fn check_exists(&self, image_ref: &str) -> Result<bool>;

    /// Digest of the top-level manifest (or manifest list) behind `image_ref`.
    async fn get_manifest_digest(&self, image_ref: &str) -> Result<String>;

    /// Digest of the `platform` image behind `image_ref`.
    async fn get_platform_digest(&self, image_ref: &str, platform: &Platform) -> Result<String>;

    /// Supported platforms advertised by `image_ref`; empty for single-manifest images.
    async fn platforms_of(&self, image_ref: &str) -> Result<Vec<Platform>>;
}

/// Construct the backend for `kind`.
pub fn builder_for(kind: BuilderKind, runner: Arc<dyn CommandRunner>) -> Arc<dyn ImageBuilder> {
    match kind {
        BuilderKind::MultiPlatform => Arc::new(BuildxBuilder::new(runner)),
        BuilderKind::SinglePlatform => Arc::new(DockerBuilder::new(runner)),
    }
}

/// What happened to one build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    /// The target tag already existed and skip-if-exists was set.
    Skipped,
}

/// Build `request`, or skip it if its primary tag exists and `skip_if_exists`.
pub async fn build_unless_exists(
    builder: &dyn ImageBuilder,
    request: &BuildRequest,
    skip_if_exists: bool,
) -> Result<BuildOutcome> {
    let tag = request.primary_tag();
    if skip_if_exists && builder.check_exists(tag).await? {
        obs::emit_build_finished(tag, 0, true);
        return Ok(BuildOutcome::Skipped);
    }
    let start = Instant::now();
    obs::emit_build_started(tag, &request.platform_list());
    builder.build_and_push(request).await?;
    obs::emit_build_finished(tag, start.elapsed().as_millis() as u64, false);
    Ok(BuildOutcome::Built)
}

// ---------------------------------------------------------------------------
// Registry queries shared by both backends
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    manifests: Vec<ManifestDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<DescriptorPlatform>,
}

#[derive(Debug, Deserialize)]
struct DescriptorPlatform {
    os: String,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct ImagetoolsManifest {
    digest: String,
}

/// `docker manifest` / `docker buildx imagetools` queries.
#[derive(Clone)]
pub struct DockerRegistry {
    runner: Arc<dyn CommandRunner>,
}

impl DockerRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn inspect(&self, image_ref: &str) -> Result<Option<ManifestDocument>> {
        let inv = Invocation::new("docker").args(["manifest", "inspect", image_ref]);
        let out = self.runner.run(&inv).await?;
        if !out.passed() {
            // Registry hiccups must not read as "absent".
            if shipyard_tools::is_retryable(&out.stderr) {
                return Err(ToolError::Failed {
                    command: inv.command_line(),
                    exit_code: out.exit_code,
                    stderr: out.stderr,
                }
                .into());
            }
            debug!(image_ref, stderr = %out.stderr.trim(), "manifest not found");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&out.stdout)?))
    }

    pub async fn exists(&self, image_ref: &str) -> Result<bool> {
        Ok(self.inspect(image_ref).await?.is_some())
    }

    /// `docker buildx imagetools inspect` printing the top-level descriptor.
    pub fn digest_invocation(image_ref: &str) -> Invocation {
        Invocation::new("docker").args([
            "buildx",
            "imagetools",
            "inspect",
            image_ref,
            "--format",
            "{{json .Manifest}}",
        ])
    }

    /// Digest out of [`Self::digest_invocation`] stdout.
    pub fn parse_digest(stdout: &str) -> Result<String> {
        let manifest: ImagetoolsManifest = serde_json::from_str(stdout.trim())?;
        Ok(manifest.digest)
    }

    pub async fn manifest_digest(&self, image_ref: &str) -> Result<String> {
        let out = self
            .runner
            .run_checked(&Self::digest_invocation(image_ref))
            .await?;
        Self::parse_digest(&out.stdout)
    }

    pub async fn platform_digest(&self, image_ref: &str, platform: &Platform) -> Result<String> {
        let doc = self.inspect(image_ref).await?.ok_or_else(|| ShipyardError::NotFound {
            image: image_ref.to_string(),
            pin: platform.to_string(),
        })?;
        if doc.manifests.is_empty() {
            // Single-platform image: the top-level digest is the platform digest.
            return self.manifest_digest(image_ref).await;
        }
        doc.manifests
            .into_iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == platform.os() && p.architecture == platform.arch())
            })
            .map(|m| m.digest)
            .ok_or_else(|| ShipyardError::NotFound {
                image: image_ref.to_string(),
                pin: platform.to_string(),
            })
    }

    pub async fn platforms(&self, image_ref: &str) -> Result<Vec<Platform>> {
        let Some(doc) = self.inspect(image_ref).await? else {
            return Ok(Vec::new());
        };
        let mut platforms: Vec<Platform> = doc
            .manifests
            .iter()
            .filter_map(|m| m.platform.as_ref())
            .filter_map(|p| Platform::parse(&format!("{}/{}", p.os, p.architecture)).ok())
            .collect();
        platforms.sort();
        platforms.dedup();
        Ok(platforms)
    }
}

fn build_error(request: &BuildRequest, err: ToolError) -> ShipyardError {
    match err {
        ToolError::Failed { stderr, .. } => ShipyardError::Build {
            tag: request.primary_tag().to_string(),
            stderr,
        },
        other => other.into(),
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Multi-platform builds through `docker buildx`.
pub struct BuildxBuilder {
    runner: Arc<dyn CommandRunner>,
    registry: DockerRegistry,
}

impl BuildxBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            registry: DockerRegistry::new(Arc::clone(&runner)),
            runner,
        }
    }

    pub fn invocation(request: &BuildRequest) -> Invocation {
        let mut inv = Invocation::new("docker").args([
            "buildx",
            "build",
            "--push",
            "--progress",
            "plain",
            request.context.as_str(),
            "-f",
            request.dockerfile.as_str(),
        ]);
        for tag in &request.tags {
            inv = inv.args(["-t", tag.as_str()]);
        }
        for (key, value) in &request.args {
            inv = inv.args(["--build-arg".to_string(), format!("{key}={value}")]);
        }
        inv.args(["--platform".to_string(), request.platform_list()])
    }
}

#[async_trait]
impl ImageBuilder for BuildxBuilder {
    async fn build_and_push(&self, request: &BuildRequest) -> Result<()> {
        if request.tags.is_empty() || request.platforms.is_empty() {
            return Err(ShipyardError::Configuration(
                "build request needs at least one tag and one platform".to_string(),
            ));
        }
        self.runner
            .run_checked(&Self::invocation(request))
            .await
            .map_err(|e| build_error(request, e))?;
        Ok(())
    }

    async fn check_exists(&self, image_ref: &str) -> Result<bool> {
        self.registry.exists(image_ref).await
    }

    async fn get_manifest_digest(&self, image_ref: &str) -> Result<String> {
        self.registry.manifest_digest(image_ref).await
    }

    async fn get_platform_digest(&self, image_ref: &str, platform: &Platform) -> Result<String> {
        self.registry.platform_digest(image_ref, platform).await
    }

    async fn platforms_of(&self, image_ref: &str) -> Result<Vec<Platform>> {
        self.registry.platforms(image_ref).await
    }
}

/// Single-platform builds through `docker build` and `docker push`.
pub struct DockerBuilder {
    runner: Arc<dyn CommandRunner>,
    registry: DockerRegistry,
}

impl DockerBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            registry: DockerRegistry::new(Arc::clone(&runner)),
            runner,
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    async fn build_and_push(&self, request: &BuildRequest) -> Result<()> {
        let platform = match request.platforms.as_slice() {
            [single] => single,
            _ => {
                return Err(ShipyardError::Configuration(format!(
                    "docker builder needs exactly one platform, got {}",
                    request.platforms.len()
                )))
            }
        };
        if request.tags.is_empty() {
            return Err(ShipyardError::Configuration(
                "build request needs at least one tag".to_string(),
            ));
        }

        let mut build = Invocation::new("docker").args([
            "build".to_string(),
            "--platform".to_string(),
            platform.to_string(),
            "-f".to_string(),
            request.dockerfile.clone(),
        ]);
        for tag in &request.tags {
            build = build.args(["-t", tag.as_str()]);
        }
        for (key, value) in &request.args {
            build = build.args(["--build-arg".to_string(), format!("{key}={value}")]);
        }
        build = build.arg(request.context.as_str());
        self.runner
            .run_checked(&build)
            .await
            .map_err(|e| build_error(request, e))?;

        for tag in &request.tags {
            let push = Invocation::new("docker").args(["push", tag.as_str()]);
            self.runner
                .run_checked(&push)
                .await
                .map_err(|e| build_error(request, e))?;
        }
        Ok(())
    }

    async fn check_exists(&self, image_ref: &str) -> Result<bool> {
        self.registry.exists(image_ref).await
    }

    async fn get_manifest_digest(&self, image_ref: &str) -> Result<String> {
        self.registry.manifest_digest(image_ref).await
    }

    async fn get_platform_digest(&self, image_ref: &str, platform: &Platform) -> Result<String> {
        self.registry.platform_digest(image_ref, platform).await
    }

    async fn platforms_of(&self, image_ref: &str) -> Result<Vec<Platform>> {
        self.registry.platforms(image_ref).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_tools::fakes::ScriptedRunner;
    use shipyard_tools::CommandOutput;

    const MANIFEST_LIST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            { "digest": "sha256:aaa", "platform": { "architecture": "amd64", "os": "linux" } },
            { "digest": "sha256:bbb", "platform": { "architecture": "arm64", "os": "linux" } },
            { "digest": "sha256:ccc", "platform": { "architecture": "unknown", "os": "unknown" } }
        ]
    }"#;

    fn request(platforms: &[&str]) -> BuildRequest {
        BuildRequest {
            tags: vec!["quay.io/mongodb/operator:1.2.0".to_string()],
            dockerfile: "docker/operator/Dockerfile".to_string(),
            context: ".".to_string(),
            args: BTreeMap::from([("version".to_string(), "1.2.0".to_string())]),
            platforms: platforms.iter().map(|p| Platform::parse(p).unwrap()).collect(),
        }
    }

    #[test]
    fn builder_kind_parsing() {
        assert_eq!("buildx".parse::<BuilderKind>().unwrap(), BuilderKind::MultiPlatform);
        assert_eq!("docker".parse::<BuilderKind>().unwrap(), BuilderKind::SinglePlatform);
        assert!("kaniko".parse::<BuilderKind>().is_err());
    }

    #[test]
    fn buildx_command_shape() {
        let line = BuildxBuilder::invocation(&request(&["linux/amd64", "linux/arm64"])).command_line();
        assert_eq!(
            line,
            "docker buildx build --push --progress plain . -f docker/operator/Dockerfile \
             -t quay.io/mongodb/operator:1.2.0 --build-arg version=1.2.0 \
             --platform linux/amd64,linux/arm64"
        );
    }

    #[tokio::test]
    async fn build_failure_carries_stderr() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("buildx build", CommandOutput::failed(1, "failed to solve: exit code 2"));
        let builder = BuildxBuilder::new(runner);

        match builder.build_and_push(&request(&["linux/amd64"])).await {
            Err(ShipyardError::Build { tag, stderr }) => {
                assert_eq!(tag, "quay.io/mongodb/operator:1.2.0");
                assert!(stderr.contains("failed to solve"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn docker_builder_builds_then_pushes() {
        let runner = Arc::new(ScriptedRunner::new());
        let builder = DockerBuilder::new(runner.clone());
        builder.build_and_push(&request(&["linux/arm64"])).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("docker build --platform linux/arm64"));
        assert!(lines[0].ends_with(" ."));
        assert_eq!(lines[1], "docker push quay.io/mongodb/operator:1.2.0");
    }

    #[tokio::test]
    async fn docker_builder_rejects_multiple_platforms() {
        let builder = DockerBuilder::new(Arc::new(ScriptedRunner::new()));
        let err = builder
            .build_and_push(&request(&["linux/amd64", "linux/arm64"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::Configuration(_)));
    }

    #[tokio::test]
    async fn platforms_and_digests_from_manifest_list() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("manifest inspect", CommandOutput::ok(MANIFEST_LIST));
        let builder = builder_for(BuilderKind::MultiPlatform, runner);

        let platforms = builder.platforms_of("quay.io/mongodb/agent:1.0.0").await.unwrap();
        assert_eq!(platforms.len(), 2);

        let arm = Platform::from_arch("arm64").unwrap();
        let digest = builder
            .get_platform_digest("quay.io/mongodb/agent:1.0.0", &arm)
            .await
            .unwrap();
        assert_eq!(digest, "sha256:bbb");
    }

    #[tokio::test]
    async fn missing_manifest_is_absent_but_registry_errors_propagate() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("agent:missing", CommandOutput::failed(1, "no such manifest"));
        runner.on("agent:flaky", CommandOutput::failed(1, "received 503"));
        let registry = DockerRegistry::new(runner);

        assert!(!registry.exists("quay.io/mongodb/agent:missing").await.unwrap());
        assert!(registry.platforms("quay.io/mongodb/agent:missing").await.unwrap().is_empty());
        assert!(registry.exists("quay.io/mongodb/agent:flaky").await.is_err());
    }

    #[tokio::test]
    async fn manifest_digest_from_imagetools() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "imagetools inspect",
            CommandOutput::ok(r#"{"mediaType":"application/vnd.oci.image.index.v1+json","digest":"sha256:feed","size":1609}"#),
        );
        let registry = DockerRegistry::new(runner);
        assert_eq!(
            registry.manifest_digest("quay.io/mongodb/agent:1.0.0").await.unwrap(),
            "sha256:feed"
        );
    }

    #[tokio::test]
    async fn skip_if_exists_short_circuits() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("manifest inspect", CommandOutput::ok(MANIFEST_LIST));
        let builder = BuildxBuilder::new(runner.clone());

        let outcome = build_unless_exists(&builder, &request(&["linux/amd64"]), true)
            .await
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped);
        assert_eq!(runner.count_matching("buildx build"), 0);

        let outcome = build_unless_exists(&builder, &request(&["linux/amd64"]), false)
            .await
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Built);
        assert_eq!(runner.count_matching("buildx build"), 1);
    }
}
