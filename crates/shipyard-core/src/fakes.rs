//! In-memory fakes for the external collaborators (testing only)
//!
//! `FakeImageBuilder` stands in for the build backend and registry,
//! `MemoryScanningService` for the scanning service, and
//! `StaticSbomGenerator` for `docker sbom` and the CLI binary SBOM.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::builder::{BuildRequest, ImageBuilder};
use crate::error::{Result, ShipyardError};
use crate::platform::Platform;
use crate::sbom::{BinarySbomGenerator, LiteSbomGenerator, ScanningService};

fn sha256_digest(input: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(input.as_bytes())))
}

#[derive(Debug, Default)]
struct BuilderState {
    builds: Vec<BuildRequest>,
    existing: BTreeSet<String>,
    digests: HashMap<(String, Platform), String>,
    platforms: HashMap<String, Vec<Platform>>,
    failing: Vec<String>,
    build_delay: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Image backend that records builds and keeps pushed tags in memory.
///
/// Digests are derived from the reference unless pinned with
/// [`FakeImageBuilder::set_digest`].
#[derive(Debug, Default)]
pub struct FakeImageBuilder {
    state: Mutex<BuilderState>,
}

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds whose primary tag contains `pattern` fail with `Build`.
    pub fn fail_builds_matching(&self, pattern: &str) {
        self.lock().failing.push(pattern.to_string());
    }

    /// Every build sleeps for `delay` before finishing.
    pub fn with_build_delay(self, delay: Duration) -> Self {
        self.lock().build_delay = Some(delay);
        self
    }

    /// Most builds seen running at the same time.
    pub fn peak_concurrent_builds(&self) -> usize {
        self.lock().peak_in_flight
    }

    /// Pretend `image_ref` was pushed earlier.
    pub fn mark_existing(&self, image_ref: &str) {
        self.lock().existing.insert(image_ref.to_string());
    }

    /// Platforms advertised by `image_ref`.
    pub fn set_platforms(&self, image_ref: &str, platforms: Vec<Platform>) {
        self.lock()
            .platforms
            .insert(image_ref.to_string(), platforms);
    }

    pub fn set_digest(&self, image_ref: &str, platform: &Platform, digest: &str) {
        self.lock()
            .digests
            .insert((image_ref.to_string(), platform.clone()), digest.to_string());
    }

    /// Every request seen, in call order.
    pub fn builds(&self) -> Vec<BuildRequest> {
        self.lock().builds.clone()
    }

    /// Primary tags of every request seen, sorted.
    pub fn built_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .lock()
            .builds
            .iter()
            .map(|r| r.primary_tag().to_string())
            .collect();
        tags.sort();
        tags
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build_and_push(&self, request: &BuildRequest) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.builds.push(request.clone());
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.build_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.in_flight -= 1;
        let tag = request.primary_tag().to_string();
        if state.failing.iter().any(|p| tag.contains(p.as_str())) {
            return Err(ShipyardError::Build {
                tag,
                stderr: "scripted build failure".to_string(),
            });
        }
        state.existing.extend(request.tags.iter().cloned());
        Ok(())
    }

    async fn check_exists(&self, image_ref: &str) -> Result<bool> {
        Ok(self.lock().existing.contains(image_ref))
    }

    async fn get_manifest_digest(&self, image_ref: &str) -> Result<String> {
        Ok(sha256_digest(image_ref))
    }

    async fn get_platform_digest(&self, image_ref: &str, platform: &Platform) -> Result<String> {
        let pinned = self
            .lock()
            .digests
            .get(&(image_ref.to_string(), platform.clone()))
            .cloned();
        Ok(pinned.unwrap_or_else(|| sha256_digest(&format!("{image_ref}@{platform}"))))
    }

    async fn platforms_of(&self, image_ref: &str) -> Result<Vec<Platform>> {
        Ok(self
            .lock()
            .platforms
            .get(image_ref)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct ScanningState {
    groups: BTreeSet<String>,
    uploads: Vec<(String, Vec<u8>)>,
    augmented: BTreeMap<String, Vec<u8>>,
    download_error: Option<String>,
    fail_groups: bool,
}

/// Scanning service keeping asset groups and SBOMs in memory.
#[derive(Debug, Default)]
pub struct MemoryScanningService {
    state: Mutex<ScanningState>,
}

impl MemoryScanningService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScanningState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the augmented SBOM for `group` available.
    pub fn set_augmented(&self, group: &str, sbom: &[u8]) {
        self.lock().augmented.insert(group.to_string(), sbom.to_vec());
    }

    /// Every download fails with `SbomFetch(message)`.
    pub fn fail_downloads(&self, message: &str) {
        self.lock().download_error = Some(message.to_string());
    }

    /// Asset-group creation fails.
    pub fn fail_asset_groups(&self) {
        self.lock().fail_groups = true;
    }

    /// Created asset groups, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.lock().groups.iter().cloned().collect()
    }

    pub fn upload_count(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Groups uploaded to, in call order.
    pub fn uploaded_groups(&self) -> Vec<String> {
        self.lock().uploads.iter().map(|(g, _)| g.clone()).collect()
    }
}

#[async_trait]
impl ScanningService for MemoryScanningService {
    async fn ensure_asset_group(&self, group: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_groups {
            return Err(ShipyardError::SbomFetch(format!("cannot create {group}")));
        }
        state.groups.insert(group.to_string());
        Ok(())
    }

    async fn upload(&self, group: &str, sbom: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.groups.contains(group) {
            return Err(ShipyardError::SbomFetch(format!("unknown asset group {group}")));
        }
        state.uploads.push((group.to_string(), sbom.to_vec()));
        Ok(())
    }

    async fn download_augmented(&self, group: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        if let Some(message) = &state.download_error {
            return Err(ShipyardError::SbomFetch(message.clone()));
        }
        Ok(state.augmented.get(group).cloned())
    }
}

/// Returns the same document for every image.
#[derive(Debug, Clone)]
pub struct StaticSbomGenerator {
    document: Vec<u8>,
}

impl StaticSbomGenerator {
    pub fn new(document: &[u8]) -> Self {
        Self {
            document: document.to_vec(),
        }
    }
}

#[async_trait]
impl LiteSbomGenerator for StaticSbomGenerator {
    async fn generate(&self, _image_ref: &str, _platform: &Platform) -> Result<Vec<u8>> {
        Ok(self.document.clone())
    }
}


#[async_trait]
impl BinarySbomGenerator for StaticSbomGenerator {
    async fn generate(&self, _version: &str, _platform: &Platform) -> Result<Vec<u8>> {
        Ok(self.document.clone())
    }
}
