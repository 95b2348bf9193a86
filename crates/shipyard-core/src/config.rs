//! Per-invocation build configuration.
//!
//! An [`ImageBuildConfiguration`] is assembled once from scenario defaults,
//! `build_info.json` and CLI overrides, validated, and then only read.
//! Per-architecture and per-version sub-builds work on clones.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::builder::BuilderKind;
use crate::error::{Result, ShipyardError};
use crate::platform::Platform;
use crate::scenario::{BuildScenario, ScenarioDefaults};

/// Per-scenario settings for one image, as stored in `build_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Full repository path, e.g. `quay.io/mongodb/mongodb-kubernetes`.
    pub repository: String,
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub sign: bool,
    #[serde(default)]
    pub skip_if_exists: bool,
}

/// `build_info.json`: `images.<name>.<scenario>` -> [`ImageInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub images: BTreeMap<String, BTreeMap<BuildScenario, ImageInfo>>,
}

impl BuildInfo {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShipyardError::Configuration(format!("cannot read build info {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn image_info(&self, image: &str, scenario: BuildScenario) -> Option<&ImageInfo> {
        self.images.get(image).and_then(|by_scenario| by_scenario.get(&scenario))
    }
}

/// Everything one top-level invocation needs to know about what to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildConfiguration {
    pub scenario: BuildScenario,
    pub image: String,
    /// Image version. Empty only for agent-matrix runs, where each pair carries its own.
    pub version: String,
    /// Full repository path images are pushed to.
    pub repository: String,
    pub platforms: Vec<Platform>,
    /// Platforms came from an explicit override rather than defaults.
    pub platforms_overridden: bool,
    pub sign: bool,
    /// Build pool size; 0 means all available workers.
    pub parallelism: usize,
    /// Sign/SBOM pool size; 0 means all available workers.
    pub io_parallelism: usize,
    pub all_artifacts: bool,
    pub dockerfile_path: String,
    pub context_path: String,
    pub skip_if_exists: bool,
    pub builder: BuilderKind,
}

impl ImageBuildConfiguration {
    /// Start from scenario defaults: `<registry>/<image>`, primary platform only.
    pub fn new(scenario: BuildScenario, image: &str, defaults: &ScenarioDefaults) -> Self {
        Self {
            scenario,
            image: image.to_string(),
            version: defaults.version.clone().unwrap_or_default(),
            repository: format!("{}/{}", defaults.registry.trim_end_matches('/'), image),
            platforms: vec![Platform::primary()],
            platforms_overridden: false,
            sign: defaults.sign,
            parallelism: 1,
            io_parallelism: 0,
            all_artifacts: false,
            dockerfile_path: "Dockerfile".to_string(),
            context_path: ".".to_string(),
            skip_if_exists: false,
            builder: BuilderKind::MultiPlatform,
        }
    }

    /// Layer `build_info.json` settings over the scenario defaults.
    pub fn with_image_info(mut self, info: &ImageInfo) -> Self {
        self.repository = info.repository.clone();
        if !info.platforms.is_empty() {
            self.platforms = info.platforms.clone();
        }
        if let Some(dockerfile) = &info.dockerfile_path {
            self.dockerfile_path = dockerfile.clone();
        }
        self.sign = self.sign || info.sign;
        self.skip_if_exists = info.skip_if_exists;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    /// Explicit platform override.
    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self.platforms_overridden = true;
        self
    }

    pub fn with_sign(mut self, sign: bool) -> Self {
        self.sign = sign;
        self
    }

    pub fn with_parallelism(mut self, build: usize, io: usize) -> Self {
        self.parallelism = build;
        self.io_parallelism = io;
        self
    }

    pub fn with_all_artifacts(mut self, all: bool) -> Self {
        self.all_artifacts = all;
        self
    }

    pub fn with_paths(mut self, dockerfile: impl Into<String>, context: impl Into<String>) -> Self {
        self.dockerfile_path = dockerfile.into();
        self.context_path = context.into();
        self
    }

    pub fn with_skip_if_exists(mut self, skip: bool) -> Self {
        self.skip_if_exists = skip;
        self
    }

    pub fn with_builder(mut self, builder: BuilderKind) -> Self {
        self.builder = builder;
        self
    }

    /// Check invariants. `allow_empty_version` is for agent-matrix runs.
    pub fn validate(self, allow_empty_version: bool) -> Result<Self> {
        if self.image.trim().is_empty() {
            return Err(ShipyardError::Configuration("image name is required".to_string()));
        }
        if self.repository.trim().is_empty() {
            return Err(ShipyardError::Configuration("repository is required".to_string()));
        }
        if self.version.trim().is_empty() && !allow_empty_version {
            return Err(ShipyardError::Configuration(format!(
                "no version for {} in scenario {}",
                self.image, self.scenario
            )));
        }
        if self.platforms.is_empty() {
            return Err(ShipyardError::Configuration(
                "at least one platform is required".to_string(),
            ));
        }
        if self.builder == BuilderKind::SinglePlatform && self.platforms.len() > 1 {
            return Err(ShipyardError::Configuration(format!(
                "single-platform builder cannot build {} platforms",
                self.platforms.len()
            )));
        }
        Ok(self)
    }

    /// `<repository>:<tag>`.
    pub fn image_ref(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }

    /// Registry host plus organization path, e.g. `quay.io/mongodb`.
    pub fn registry(&self) -> &str {
        match self.repository.rsplit_once('/') {
            Some((registry, _)) => registry,
            None => "",
        }
    }

    pub fn is_multi_platform(&self) -> bool {
        self.platforms.len() > 1
    }
}
