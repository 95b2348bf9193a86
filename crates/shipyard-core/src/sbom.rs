//! SBOM lifecycle: Lite and Augmented documents, Daily and Release scopes.
//!
//! Every storage key is computed from the artifact fields alone. The only
//! state is whether a key exists:
//!
//! * Daily/Lite is rewritten on every rebuild.
//! * Daily/Augmented is fetched once a Daily/Lite for the same digest exists.
//! * Release/Lite and Release/Augmented are written at most once per
//!   (image, tag, platform), gated on their tag prefix being absent.
//! * The released CLI binary gets Release SBOMs under its own product path,
//!   written together once per (version, platform).
//!
//! Concurrent invocations may both see a prefix as absent and both write.
//! Keys embed the image digest, so such duplicates land on distinct or
//! identical keys and are harmless.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_store::ObjectStore;
use shipyard_tools::{CommandRunner, Invocation};
use tracing::{debug, info, warn};

use crate::builder::ImageBuilder;
use crate::error::{Result, ShipyardError};
use crate::obs;
use crate::platform::Platform;

/// Scanning-service project every asset group belongs to.
pub const DEFAULT_SCANNING_REPO: &str = "mongodb/mongodb-kubernetes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SbomScope {
    Daily,
    Release,
}

impl SbomScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SbomScope::Daily => "daily",
            SbomScope::Release => "release",
        }
    }
}

impl fmt::Display for SbomScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SbomPhase {
    /// Component inventory generated from the image.
    Lite,
    /// Lite enriched with scan results by the scanning service.
    Augmented,
}

impl SbomPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SbomPhase::Lite => "lite",
            SbomPhase::Augmented => "augmented",
        }
    }
}

impl fmt::Display for SbomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `registry/organization/image:tag` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCoordinates {
    pub registry: String,
    /// Everything between registry and image name; may contain `/`.
    pub organization: String,
    pub image: String,
    pub tag: String,
}

impl ImageCoordinates {
    pub fn parse(image_ref: &str) -> Result<Self> {
        let invalid = || {
            ShipyardError::Configuration(format!(
                "image reference '{image_ref}' is not registry/organization/image:tag"
            ))
        };
        let (path, tag) = image_ref.rsplit_once(':').ok_or_else(invalid)?;
        if tag.is_empty() || tag.contains('/') {
            return Err(invalid());
        }
        let (registry, rest) = path.split_once('/').ok_or_else(invalid)?;
        let (organization, image) = rest.rsplit_once('/').ok_or_else(invalid)?;
        if registry.is_empty() || organization.is_empty() || image.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            registry: registry.to_string(),
            organization: organization.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn image_ref(&self) -> String {
        format!("{}/{}/{}:{}", self.registry, self.organization, self.image, self.tag)
    }
}

/// One SBOM document's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomArtifact {
    pub coordinates: ImageCoordinates,
    pub digest: String,
    pub platform: Platform,
    pub phase: SbomPhase,
    pub scope: SbomScope,
}

impl SbomArtifact {
    pub fn new(
        coordinates: &ImageCoordinates,
        digest: &str,
        platform: &Platform,
        phase: SbomPhase,
        scope: SbomScope,
    ) -> Self {
        Self {
            coordinates: coordinates.clone(),
            digest: digest.to_string(),
            platform: platform.clone(),
            phase,
            scope,
        }
    }

    /// `sboms/<scope>/<phase>/<registry>/<org>/<image>/<tag>/<os-arch>/`.
    ///
    /// The trailing slash keeps `1.0.0` from matching `1.0.0-context`.
    pub fn tag_prefix(&self) -> String {
        tag_prefix(&self.coordinates, &self.platform, self.phase, self.scope)
    }

    /// [`Self::tag_prefix`] followed by the digest.
    pub fn storage_path(&self) -> String {
        format!("{}{}", self.tag_prefix(), self.digest)
    }
}

fn tag_prefix(
    coordinates: &ImageCoordinates,
    platform: &Platform,
    phase: SbomPhase,
    scope: SbomScope,
) -> String {
    format!(
        "sboms/{scope}/{phase}/{}/{}/{}/{}/{}/",
        coordinates.registry,
        coordinates.organization,
        coordinates.image,
        coordinates.tag,
        platform.path_segment()
    )
}

/// Scanning-service collection name: `<image>-<scope>-<tag>-<os-arch>`.
pub fn asset_group(image: &str, tag: &str, platform: &Platform, scope: SbomScope) -> String {
    format!("{image}-{scope}-{tag}-{}", platform.path_segment())
}

/// The vulnerability scanning service.
#[async_trait]
pub trait ScanningService: Send + Sync {
    /// Create `group` unless it exists already.
    async fn ensure_asset_group(&self, group: &str) -> Result<()>;

    /// Submit a Lite SBOM for scanning under `group`.
    async fn upload(&self, group: &str, sbom: &[u8]) -> Result<()>;

    /// Augmented SBOM for `group`; `Ok(None)` while the scan has not finished.
    async fn download_augmented(&self, group: &str) -> Result<Option<Vec<u8>>>;
}

/// Produces a Lite SBOM for one platform of an image.
#[async_trait]
pub trait LiteSbomGenerator: Send + Sync {
    async fn generate(&self, image_ref: &str, platform: &Platform) -> Result<Vec<u8>>;
}

/// SBOM settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SbomConfig {
    /// Container image shipping the silkbomb CLI
    pub silkbomb_image: String,
    /// Credentials env-file passed to silkbomb
    pub silkbomb_env_file: Option<String>,
    /// Scanning-service project
    pub scanning_repo: String,
}

impl Default for SbomConfig {
    fn default() -> Self {
        SbomConfig {
            silkbomb_image: std::env::var("SILKBOMB_IMAGE").unwrap_or_else(|_| {
                "artifactory.corp.mongodb.com/release-tools-container-registry-public-local/silkbomb:2.0"
                    .to_string()
            }),
            silkbomb_env_file: std::env::var("SILKBOMB_ENV_FILE").ok().or_else(|| {
                std::env::var("workdir")
                    .ok()
                    .map(|dir| format!("{dir}/silkbomb.env"))
            }),
            scanning_repo: std::env::var("SBOM_SCANNING_REPO")
                .unwrap_or_else(|_| DEFAULT_SCANNING_REPO.to_string()),
        }
    }
}

impl SbomConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_env_file(mut self, path: impl Into<String>) -> Self {
        self.silkbomb_env_file = Some(path.into());
        self
    }
}

/// Scanning service reached through the silkbomb container.
pub struct SilkbombScanner {
    runner: Arc<dyn CommandRunner>,
    config: SbomConfig,
}

impl SilkbombScanner {
    pub fn new(runner: Arc<dyn CommandRunner>, config: SbomConfig) -> Self {
        Self { runner, config }
    }

    fn silkbomb(&self, workdir: &Path, command: &str) -> Result<Invocation> {
        let env_file = self.config.silkbomb_env_file.as_deref().ok_or_else(|| {
            ShipyardError::Configuration(
                "silkbomb needs SILKBOMB_ENV_FILE or workdir to be set".to_string(),
            )
        })?;
        Ok(silkbomb_run(
            &self.config.silkbomb_image,
            workdir,
            Some(env_file),
            command,
        ))
    }

    fn group_args(&self, group: &str) -> [String; 4] {
        [
            "--repo".to_string(),
            self.config.scanning_repo.clone(),
            "--branch".to_string(),
            group.to_string(),
        ]
    }
}

/// `docker run` of silkbomb with `workdir` mounted at `/sboms`.
fn silkbomb_run(image: &str, workdir: &Path, env_file: Option<&str>, command: &str) -> Invocation {
    let mut inv = Invocation::new("docker")
        .args(["run", "--platform", "linux/amd64", "--rm", "-v"])
        .arg(format!("{}:/sboms", workdir.display()));
    if let Some(env_file) = env_file {
        inv = inv.args(["--env-file", env_file]);
    }
    inv.arg(image.to_string()).arg(command)
}

fn not_yet_available(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["not found", "404", "no scan", "not ready"]
        .iter()
        .any(|m| lower.contains(m))
}

#[async_trait]
impl ScanningService for SilkbombScanner {
    async fn ensure_asset_group(&self, group: &str) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let inv = self
            .silkbomb(dir.path(), "create-branch")?
            .args(self.group_args(group));
        let out = self.runner.run(&inv).await?;
        if out.passed() || out.stderr.to_ascii_lowercase().contains("already exists") {
            debug!(group, "asset group ready");
            return Ok(());
        }
        Err(ShipyardError::SbomFetch(format!(
            "asset group {group}: {}",
            out.stderr.trim()
        )))
    }

    async fn upload(&self, group: &str, sbom: &[u8]) -> Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("lite.json"), sbom).await?;
        let inv = self
            .silkbomb(dir.path(), "upload")?
            .args(["--sbom-in", "/sboms/lite.json"])
            .args(self.group_args(group));
        self.runner.run_checked(&inv).await?;
        Ok(())
    }

    async fn download_augmented(&self, group: &str) -> Result<Option<Vec<u8>>> {
        let dir = tempfile::tempdir()?;
        let inv = self
            .silkbomb(dir.path(), "download")?
            .args(["--sbom-out", "/sboms/augmented.json"])
            .args(self.group_args(group));
        let out = self.runner.run(&inv).await?;
        if !out.passed() {
            if not_yet_available(&out.stderr) {
                return Ok(None);
            }
            return Err(ShipyardError::SbomFetch(format!(
                "{group}: {}",
                out.stderr.trim()
            )));
        }
        match tokio::fs::read(dir.path().join("augmented.json")).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// `docker sbom` in CycloneDX JSON.
pub struct DockerSbomGenerator {
    runner: Arc<dyn CommandRunner>,
}

impl DockerSbomGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl LiteSbomGenerator for DockerSbomGenerator {
    async fn generate(&self, image_ref: &str, platform: &Platform) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let out_path = dir.path().join("lite.json");
        let inv = Invocation::new("docker")
            .args(["sbom", "--platform"])
            .arg(platform.to_string())
            .arg("-o")
            .arg(out_path.display().to_string())
            .args(["--format", "cyclonedx-json", image_ref]);
        self.runner.run_checked(&inv).await?;
        Ok(tokio::fs::read(&out_path).await?)
    }
}

/// Product the CLI binary's SBOMs are filed under.
pub const CLI_PRODUCT: &str = "mongodb-kubernetes-cli";

/// Executable inside the CLI release archive.
pub const CLI_BINARY: &str = "kubectl-mongodb";

/// Where CLI release archives are published.
pub const CLI_RELEASE_URL: &str = "https://github.com/mongodb/mongodb-kubernetes/releases/download";

/// `sboms/release/<phase>/mongodb-kubernetes-cli/<version>/<os-arch>`.
pub fn cli_release_path(version: &str, platform: &Platform, phase: SbomPhase) -> String {
    format!(
        "sboms/release/{phase}/{CLI_PRODUCT}/{version}/{}",
        platform.path_segment()
    )
}

/// Produces a Lite SBOM for one platform of a released CLI binary.
#[async_trait]
pub trait BinarySbomGenerator: Send + Sync {
    async fn generate(&self, version: &str, platform: &Platform) -> Result<Vec<u8>>;
}

/// Package URLs of the Go modules listed by `go version -m`.
pub fn purls_from_build_info(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some("dep"), Some(module), Some(version)) => {
                    Some(format!("pkg:golang/{module}@{version}"))
                }
                _ => None,
            }
        })
        .collect()
}

/// Downloads the CLI release archive, unpacks the binary, derives purls
/// from its module information and lets silkbomb turn them into a Lite SBOM.
pub struct ReleaseBinarySbomGenerator {
    runner: Arc<dyn CommandRunner>,
    config: SbomConfig,
    client: reqwest::Client,
    base_url: String,
}

impl ReleaseBinarySbomGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: SbomConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shipyard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            runner,
            config,
            client,
            base_url: CLI_RELEASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// `kubectl-mongodb_<version>_<os>_<arch>.tar.gz`
    pub fn archive_name(version: &str, platform: &Platform) -> String {
        format!(
            "{CLI_BINARY}_{version}_{}_{}.tar.gz",
            platform.os(),
            platform.arch()
        )
    }

    pub fn download_url(&self, version: &str, platform: &Platform) -> String {
        format!(
            "{}/{version}/{}",
            self.base_url.trim_end_matches('/'),
            Self::archive_name(version, platform)
        )
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        debug!(url, "downloading CLI release archive");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ShipyardError::Http(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl BinarySbomGenerator for ReleaseBinarySbomGenerator {
    async fn generate(&self, version: &str, platform: &Platform) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join(Self::archive_name(version, platform));
        self.download(&self.download_url(version, platform), &archive)
            .await?;

        let unpack = Invocation::new("tar")
            .arg("-xzf")
            .arg(archive.display().to_string())
            .arg("-C")
            .arg(dir.path().display().to_string())
            .arg(CLI_BINARY);
        self.runner.run_checked(&unpack).await?;

        let inspect = Invocation::new("go")
            .args(["version", "-m"])
            .arg(dir.path().join(CLI_BINARY).display().to_string());
        let purls = purls_from_build_info(&self.runner.run_checked(&inspect).await?.stdout);
        if purls.is_empty() {
            return Err(ShipyardError::SbomFetch(format!(
                "{CLI_BINARY} {version} carries no module information"
            )));
        }
        tokio::fs::write(dir.path().join("binary.purl"), purls.join("\n")).await?;

        let update = silkbomb_run(&self.config.silkbomb_image, dir.path(), None, "update")
            .args(["--purls", "/sboms/binary.purl", "--sbom_out", "/sboms/lite.json"]);
        self.runner.run_checked(&update).await?;
        Ok(tokio::fs::read(dir.path().join("lite.json")).await?)
    }
}

/// Release SBOM keys written for the CLI binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliSbomOutcome {
    pub release_lite: Option<String>,
    pub release_augmented: Option<String>,
    /// An earlier run already stored them.
    pub already_released: bool,
}

/// What one lifecycle pass wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbomOutcome {
    pub daily_lite: String,
    pub daily_augmented: Option<String>,
    pub release_lite: Option<String>,
    pub release_augmented: Option<String>,
}

/// Drives the lifecycle for one (image, tag, platform) at a time.
pub struct SbomManager {
    store: Arc<dyn ObjectStore>,
    scanner: Arc<dyn ScanningService>,
    generator: Arc<dyn LiteSbomGenerator>,
    registry: Arc<dyn ImageBuilder>,
    binary: Option<Arc<dyn BinarySbomGenerator>>,
}

impl SbomManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scanner: Arc<dyn ScanningService>,
        generator: Arc<dyn LiteSbomGenerator>,
        registry: Arc<dyn ImageBuilder>,
    ) -> Self {
        Self {
            store,
            scanner,
            generator,
            registry,
            binary: None,
        }
    }

    pub fn with_binary_generator(mut self, binary: Arc<dyn BinarySbomGenerator>) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Run the full lifecycle for `image_ref` on `platform`.
    pub async fn process(&self, image_ref: &str, platform: &Platform) -> Result<SbomOutcome> {
        let coords = ImageCoordinates::parse(image_ref)?;
        let daily_group = asset_group(&coords.image, &coords.tag, platform, SbomScope::Daily);
        let release_group = asset_group(&coords.image, &coords.tag, platform, SbomScope::Release);

        futures::try_join!(
            self.scanner.ensure_asset_group(&daily_group),
            self.scanner.ensure_asset_group(&release_group),
        )?;

        let digest = self.registry.get_platform_digest(image_ref, platform).await?;
        let artifact =
            |phase, scope| SbomArtifact::new(&coords, &digest, platform, phase, scope);
        let mut outcome = SbomOutcome::default();

        // An earlier run submitted this exact digest, so its scan may be done.
        let daily_lite = artifact(SbomPhase::Lite, SbomScope::Daily);
        if self.store.exists(&daily_lite.storage_path()).await? {
            let target = artifact(SbomPhase::Augmented, SbomScope::Daily);
            outcome.daily_augmented = self.fetch_augmented(&daily_group, &target).await?;
        }

        let lite = self.generator.generate(image_ref, platform).await?;

        let key = daily_lite.storage_path();
        self.store.put(&key, &lite).await?;
        self.scanner.upload(&daily_group, &lite).await?;
        obs::emit_sbom_uploaded(&key, &daily_group);
        outcome.daily_lite = key;

        let release_lite = artifact(SbomPhase::Lite, SbomScope::Release);
        if !self.store.exists(&release_lite.tag_prefix()).await? {
            let key = release_lite.storage_path();
            info!(key = %key, "first release build, storing release SBOM");
            self.store.put(&key, &lite).await?;
            self.scanner.upload(&release_group, &lite).await?;
            obs::emit_sbom_uploaded(&key, &release_group);
            outcome.release_lite = Some(key);
        }

        let release_augmented = artifact(SbomPhase::Augmented, SbomScope::Release);
        if !self.store.exists(&release_augmented.tag_prefix()).await? {
            outcome.release_augmented =
                self.fetch_augmented(&release_group, &release_augmented).await?;
        }

        Ok(outcome)
    }

    /// [`Self::process`], logging and discarding any failure.
    pub async fn process_best_effort(
        &self,
        image_ref: &str,
        platform: &Platform,
    ) -> Option<SbomOutcome> {
        match self.process(image_ref, platform).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                obs::emit_sbom_failed(image_ref, &platform.to_string(), &e);
                None
            }
        }
    }

    /// Release SBOMs for the CLI binary `version` on `platform`.
    ///
    /// Skipped once a Release/Augmented document exists for that version and
    /// platform. Lite and Augmented are stored together, and only when the
    /// scan result is available; otherwise the next run tries again.
    pub async fn process_cli_binary(
        &self,
        version: &str,
        platform: &Platform,
    ) -> Result<CliSbomOutcome> {
        let generator = self.binary.as_ref().ok_or_else(|| {
            ShipyardError::Configuration("no CLI binary SBOM generator configured".to_string())
        })?;
        let augmented_key = cli_release_path(version, platform, SbomPhase::Augmented);
        if self.store.exists(&augmented_key).await? {
            debug!(key = %augmented_key, "CLI release SBOM already stored");
            return Ok(CliSbomOutcome {
                already_released: true,
                ..CliSbomOutcome::default()
            });
        }

        let group = asset_group(CLI_PRODUCT, version, platform, SbomScope::Release);
        self.scanner.ensure_asset_group(&group).await?;
        let lite = generator.generate(version, platform).await?;
        self.scanner.upload(&group, &lite).await?;

        let mut outcome = CliSbomOutcome::default();
        match self.scanner.download_augmented(&group).await {
            Ok(Some(augmented)) => {
                let lite_key = cli_release_path(version, platform, SbomPhase::Lite);
                self.store.put(&lite_key, &lite).await?;
                self.store.put(&augmented_key, &augmented).await?;
                obs::emit_sbom_uploaded(&augmented_key, &group);
                outcome.release_lite = Some(lite_key);
                outcome.release_augmented = Some(augmented_key);
            }
            Ok(None) => info!(group = %group, "CLI augmented SBOM not available yet"),
            Err(e) => warn!(group = %group, error = %e, "CLI augmented SBOM download failed"),
        }
        Ok(outcome)
    }

    /// [`Self::process_cli_binary`], logging and discarding any failure.
    pub async fn process_cli_binary_best_effort(
        &self,
        version: &str,
        platform: &Platform,
    ) -> Option<CliSbomOutcome> {
        match self.process_cli_binary(version, platform).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                obs::emit_sbom_failed(&format!("{CLI_PRODUCT}:{version}"), &platform.to_string(), &e);
                None
            }
        }
    }

    /// Download the augmented SBOM from `group` and store it as `target`.
    ///
    /// Scanning lags the upload, so an unfinished scan and a failed download
    /// both leave the key unwritten; only storage errors propagate.
    async fn fetch_augmented(
        &self,
        group: &str,
        target: &SbomArtifact,
    ) -> Result<Option<String>> {
        match self.scanner.download_augmented(group).await {
            Ok(Some(bytes)) => {
                let key = target.storage_path();
                self.store.put(&key, &bytes).await?;
                obs::emit_sbom_uploaded(&key, group);
                Ok(Some(key))
            }
            Ok(None) => {
                info!(group, "augmented SBOM not available yet");
                Ok(None)
            }
            Err(e) => {
                warn!(group, error = %e, "augmented SBOM download failed");
                Ok(None)
            }
        }
    }
}
