//! Build tasks for a version matrix.
//!
//! A [`BuildTask`] is one (version, architecture) image. Tasks for several
//! architectures of one version get `<version>-<arch>` tags so a manifest
//! list can amend them afterwards; a lone architecture builds `<version>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builder::{build_unless_exists, BuildOutcome, BuildRequest, ImageBuilder};
use crate::config::ImageBuildConfiguration;
use crate::manifest::arch_tag;
use crate::platform::Platform;
use crate::scheduler::{BatchResult, WorkerPool};
use crate::versions::{compare_versions, VersionPair};

pub const AGENT_DOWNLOAD_URL: &str =
    "https://mciuploads.s3.amazonaws.com/mms-automation/mongodb-mms-build-agent/builds/automation-agent/prod";
pub const TOOLS_DOWNLOAD_URL: &str = "https://fastdl.mongodb.org/tools/db";

/// First tools release packaged for RHEL 9.3.
const RHEL93_TOOLS_VERSION: &str = "100.10.0";

/// Agent package distribution for `platform`.
pub fn agent_distro(platform: &Platform) -> &'static str {
    match platform.arch() {
        "arm64" => "amzn2_aarch64",
        _ => "rhel9_x86_64",
    }
}

/// Tools package distribution for `tools_version` on `platform`.
pub fn tools_distro(tools_version: &str, platform: &Platform) -> String {
    let rhel = if compare_versions(tools_version, RHEL93_TOOLS_VERSION).is_ge() {
        "rhel93"
    } else {
        "rhel90"
    };
    let arch = match platform.arch() {
        "arm64" => "aarch64",
        _ => "x86_64",
    };
    format!("{rhel}-{arch}")
}

/// Build arguments for one version on one platform.
///
/// Pairs with a tooling version get the agent download coordinates as well.
pub fn build_args(pair: &VersionPair, platform: &Platform) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    args.insert("version".to_string(), pair.version.clone());
    if let Some(tools) = &pair.tooling_version {
        args.insert("agent_version".to_string(), pair.version.clone());
        args.insert("tools_version".to_string(), tools.clone());
        args.insert("agent_distro".to_string(), agent_distro(platform).to_string());
        args.insert("tools_distro".to_string(), tools_distro(tools, platform));
        args.insert("mongodb_agent_url".to_string(), AGENT_DOWNLOAD_URL.to_string());
        args.insert("mongodb_tools_url".to_string(), TOOLS_DOWNLOAD_URL.to_string());
    }
    args.insert("architecture".to_string(), platform.arch().to_string());
    args
}

/// One image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub image_name: String,
    pub architecture: Platform,
    pub args: BTreeMap<String, String>,
    pub target_tag: String,
}

impl BuildTask {
    /// Scheduler label, e.g. `build mongodb-agent:1.0.0-arm64`.
    pub fn label(&self) -> String {
        format!("build {}:{}", self.image_name, self.target_tag)
    }

    pub fn request(&self, config: &ImageBuildConfiguration) -> BuildRequest {
        BuildRequest {
            tags: vec![config.image_ref(&self.target_tag)],
            dockerfile: config.dockerfile_path.clone(),
            context: config.context_path.clone(),
            args: self.args.clone(),
            platforms: vec![self.architecture.clone()],
        }
    }
}

/// Tasks for `pair` on each of `platforms`.
pub fn plan_version(
    config: &ImageBuildConfiguration,
    pair: &VersionPair,
    platforms: &[Platform],
) -> Vec<BuildTask> {
    let multi = platforms.len() > 1;
    platforms
        .iter()
        .map(|platform| BuildTask {
            image_name: config.image.clone(),
            architecture: platform.clone(),
            args: build_args(pair, platform),
            target_tag: if multi {
                arch_tag(&pair.version, platform)
            } else {
                pair.version.clone()
            },
        })
        .collect()
}

/// Build every task on `pool`. Results come back in task order.
pub async fn run_build_tasks(
    pool: &WorkerPool,
    builder: Arc<dyn ImageBuilder>,
    config: &ImageBuildConfiguration,
    tasks: &[BuildTask],
) -> BatchResult<BuildOutcome> {
    let skip = config.skip_if_exists;
    let jobs: Vec<_> = tasks
        .iter()
        .map(|task| {
            let builder = Arc::clone(&builder);
            let request = task.request(config);
            let job = async move { build_unless_exists(builder.as_ref(), &request, skip).await };
            (task.label(), job)
        })
        .collect();
    pool.run(jobs).await
}
