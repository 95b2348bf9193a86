//! Build scenario resolution.
//!
//! A run is exactly one of release, patch, staging or development. The
//! scenario is inferred once from environment signals and then fixed; it
//! picks the registry, whether images are signed, and where the version
//! string comes from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipyardError};

/// Set by the pipeline when the run was triggered by a git tag; holds the tag.
pub const ENV_RELEASE_TAG: &str = "triggered_by_git_tag";
/// `"true"` for patch (pull request) pipeline runs.
pub const ENV_IS_PATCH: &str = "is_patch";
/// `"true"` whenever the run happens inside the CI pipeline.
pub const ENV_RUNNING_IN_CI: &str = "RUNNING_IN_EVG";
/// Patch or pipeline version id.
pub const ENV_VERSION_ID: &str = "version_id";
/// Commit being built by a pipeline run.
pub const ENV_COMMIT: &str = "github_commit";

pub const RELEASE_REGISTRY: &str = "quay.io/mongodb";
pub const PATCH_REGISTRY: &str = "268558157000.dkr.ecr.us-east-1.amazonaws.com/dev";
pub const STAGING_REGISTRY: &str = "268558157000.dkr.ecr.us-east-1.amazonaws.com/staging";

/// Immutable view of the environment signals the resolver looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `key`, treating empty strings as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Whether `key` is set to `true` (case-insensitive).
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Whether this is a patch run inside the CI pipeline.
    pub fn is_ci_patch(&self) -> bool {
        self.flag(ENV_RUNNING_IN_CI) && self.flag(ENV_IS_PATCH)
    }
}

/// Which kind of run this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildScenario {
    Release,
    Patch,
    Staging,
    Development,
}

impl BuildScenario {
    /// Infer the scenario from environment signals.
    ///
    /// Precedence: release tag, then patch, then CI pipeline, then development.
    pub fn resolve(env: &EnvSnapshot) -> Self {
        if env.get(ENV_RELEASE_TAG).is_some() {
            BuildScenario::Release
        } else if env.flag(ENV_IS_PATCH) {
            BuildScenario::Patch
        } else if env.flag(ENV_RUNNING_IN_CI) {
            BuildScenario::Staging
        } else {
            BuildScenario::Development
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildScenario::Release => "release",
            BuildScenario::Patch => "patch",
            BuildScenario::Staging => "staging",
            BuildScenario::Development => "development",
        }
    }

    /// Registry, signing policy and version for this scenario.
    pub fn defaults(&self, env: &EnvSnapshot) -> ScenarioDefaults {
        let override_registry = env.get("REGISTRY").map(str::to_string);
        match self {
            BuildScenario::Release => ScenarioDefaults {
                registry: env
                    .get("QUAY_REGISTRY")
                    .unwrap_or(RELEASE_REGISTRY)
                    .to_string(),
                sign: true,
                version: env.get(ENV_RELEASE_TAG).map(str::to_string),
            },
            BuildScenario::Patch => ScenarioDefaults {
                registry: override_registry.unwrap_or_else(|| PATCH_REGISTRY.to_string()),
                sign: false,
                version: env.get(ENV_VERSION_ID).map(str::to_string),
            },
            BuildScenario::Staging => ScenarioDefaults {
                registry: override_registry.unwrap_or_else(|| STAGING_REGISTRY.to_string()),
                sign: false,
                version: env
                    .get(ENV_COMMIT)
                    .or_else(|| env.get(ENV_VERSION_ID))
                    .map(str::to_string),
            },
            BuildScenario::Development => ScenarioDefaults {
                registry: override_registry.unwrap_or_else(|| PATCH_REGISTRY.to_string()),
                sign: false,
                version: Some(env.get(ENV_VERSION_ID).unwrap_or("latest").to_string()),
            },
        }
    }
}

impl fmt::Display for BuildScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildScenario {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "release" => Ok(BuildScenario::Release),
            "patch" => Ok(BuildScenario::Patch),
            "staging" | "master" => Ok(BuildScenario::Staging),
            "development" | "dev" => Ok(BuildScenario::Development),
            other => Err(ShipyardError::Configuration(format!(
                "unknown build scenario '{other}'"
            ))),
        }
    }
}

/// Settings derived from the scenario before CLI overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDefaults {
    pub registry: String,
    pub sign: bool,
    /// `None` when the scenario's version source is missing from the environment.
    pub version: Option<String>,
}
