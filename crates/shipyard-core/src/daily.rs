//! Rebuild driver: builds, manifests, signatures and SBOMs for a version list.
//!
//! Every version's builds share one build pool, so different versions build
//! side by side. A version's manifest is published once its own builds are
//! joined. Signing and SBOM work then goes onto the I/O pool and is drained
//! at the end.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::builder::{BuildOutcome, ImageBuilder};
use crate::config::ImageBuildConfiguration;
use crate::error::{Result, ShipyardError, TaskFailure};
use crate::manifest::{ManifestPublisher, ManifestReference};
use crate::matrix::{plan_version, run_build_tasks, BuildTask};
use crate::platform::Platform;
use crate::sbom::SbomManager;
use crate::scenario::EnvSnapshot;
use crate::scheduler::{BatchResult, TaskBatch, WorkerPool};
use crate::signing::Signer;
use crate::versions::VersionPair;

/// Versions already handled by this invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedVersions {
    versions: BTreeSet<String>,
}

impl CompletedVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, version: &str) -> bool {
        self.versions.contains(version)
    }

    /// Returns `false` if `version` was already marked.
    pub fn mark(&mut self, version: &str) -> bool {
        self.versions.insert(version.to_string())
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// What a rebuild did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    /// Versions whose builds all succeeded.
    pub versions_built: Vec<String>,
    /// Manifest lists pushed.
    pub manifests_published: Vec<String>,
    /// Signed `repository@digest` references.
    pub signatures: Vec<String>,
    /// Daily/Lite keys written.
    pub sboms: Vec<String>,
    /// Build, manifest and signing failures. SBOM failures never land here.
    pub failures: Vec<TaskFailure>,
    /// Units of work attempted.
    pub total_tasks: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RebuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// `Ok(self)`, or `AggregateBuildFailure` when anything failed.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        match ShipyardError::aggregate(self.total_tasks, self.failures) {
            Some(err) => Err(err),
            None => Err(ShipyardError::Configuration("empty failure set".to_string())),
        }
    }
}

enum IoOutcome {
    Signed(String),
    Sbom(Option<String>),
}

/// One version's builds, plus its manifest when every build succeeded.
struct VersionRun {
    version: String,
    tasks: Vec<BuildTask>,
    builds: BatchResult<BuildOutcome>,
    manifest: Option<(String, Result<()>)>,
}

/// Rebuilds every version of one image.
pub struct DailyRebuildDriver {
    config: ImageBuildConfiguration,
    env: EnvSnapshot,
    builder: Arc<dyn ImageBuilder>,
    publisher: Arc<ManifestPublisher>,
    signer: Option<Arc<Signer>>,
    sbom: Option<Arc<SbomManager>>,
    build_pool: WorkerPool,
    io_pool: WorkerPool,
}

impl DailyRebuildDriver {
    pub fn new(
        config: ImageBuildConfiguration,
        env: EnvSnapshot,
        builder: Arc<dyn ImageBuilder>,
        publisher: Arc<ManifestPublisher>,
    ) -> Self {
        let build_pool = WorkerPool::new("build", config.parallelism);
        let io_pool = WorkerPool::new("io", config.io_parallelism);
        Self {
            config,
            env,
            builder,
            publisher,
            signer: None,
            sbom: None,
            build_pool,
            io_pool,
        }
    }

    pub fn with_signer(mut self, signer: Arc<Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_sbom(mut self, sbom: Arc<SbomManager>) -> Self {
        self.sbom = Some(sbom);
        self
    }

    pub fn config(&self) -> &ImageBuildConfiguration {
        &self.config
    }

    /// Architectures to build `version` for.
    ///
    /// Explicit override, else primary only for CI patches, else the
    /// platforms of the context image (or the image itself) when it
    /// advertises more than one, else primary only.
    pub async fn architectures(&self, version: &str) -> Vec<Platform> {
        if self.config.platforms_overridden {
            return self.config.platforms.clone();
        }
        if self.env.is_ci_patch() {
            debug!(version, "CI patch run, building primary architecture only");
            return vec![Platform::primary()];
        }
        let probes = [
            self.config.image_ref(&format!("{version}-context")),
            self.config.image_ref(version),
        ];
        for probe in &probes {
            match self.builder.platforms_of(probe).await {
                Ok(platforms) if platforms.len() > 1 => {
                    debug!(probe = %probe, count = platforms.len(), "detected architectures");
                    return platforms;
                }
                Ok(_) => {}
                Err(e) => warn!(probe = %probe, error = %e, "architecture probe failed"),
            }
        }
        vec![Platform::primary()]
    }

    fn signing(&self) -> Option<Arc<Signer>> {
        if self.config.sign {
            self.signer.clone()
        } else {
            None
        }
    }

    fn queue_sign(&self, io: &mut TaskBatch<IoOutcome>, tag: &str) {
        let Some(signer) = self.signing() else {
            return;
        };
        let repository = self.config.repository.clone();
        let tag = tag.to_string();
        io.submit(format!("sign {repository}:{tag}"), async move {
            signer
                .sign_and_verify(&repository, &tag)
                .await
                .map(IoOutcome::Signed)
        });
    }

    fn queue_sbom(&self, io: &mut TaskBatch<IoOutcome>, tag: &str, platform: &Platform) {
        let Some(sbom) = self.sbom.clone() else {
            return;
        };
        let image_ref = self.config.image_ref(tag);
        let platform = platform.clone();
        io.submit(format!("sbom {image_ref} {platform}"), async move {
            let outcome = sbom.process_best_effort(&image_ref, &platform).await;
            Ok(IoOutcome::Sbom(outcome.map(|o| o.daily_lite)))
        });
    }

    /// Build `pair` on the shared build pool and publish its manifest list
    /// when it spans several architectures and every build succeeded.
    async fn build_version(&self, pair: &VersionPair) -> VersionRun {
        let arches = self.architectures(&pair.version).await;
        let tasks = plan_version(&self.config, pair, &arches);
        info!(version = %pair, architectures = arches.len(), "building");

        let builds =
            run_build_tasks(&self.build_pool, Arc::clone(&self.builder), &self.config, &tasks).await;
        let manifest = if builds.is_success() && arches.len() > 1 {
            let reference =
                ManifestReference::for_platforms(&self.config.repository, &pair.version, &arches);
            let published = self.publisher.publish(&reference).await;
            Some((reference.name(), published))
        } else {
            None
        };
        VersionRun {
            version: pair.version.clone(),
            tasks,
            builds,
            manifest,
        }
    }

    /// Rebuild `versions`, skipping any already in `completed`.
    ///
    /// Failures are collected in the report; use
    /// [`RebuildReport::into_result`] to turn them into an error.
    pub async fn run(
        &self,
        versions: &[VersionPair],
        completed: &mut CompletedVersions,
    ) -> Result<RebuildReport> {
        if self.config.sign && self.signer.is_none() {
            return Err(ShipyardError::Configuration(
                "signing requested but no signer configured".to_string(),
            ));
        }

        let mut report = RebuildReport {
            started_at: Some(Utc::now()),
            ..RebuildReport::default()
        };

        let mut pending = Vec::new();
        for pair in versions {
            if completed.mark(&pair.version) {
                pending.push(pair);
            } else {
                debug!(version = %pair.version, "already handled in this run");
            }
        }
        let runs = join_all(pending.into_iter().map(|pair| self.build_version(pair))).await;

        let mut io = self.io_pool.batch::<IoOutcome>();
        for run in runs {
            report.total_tasks += run.builds.total;
            if !run.builds.is_success() {
                warn!(
                    version = %run.version,
                    failed = run.builds.failures.len(),
                    "builds failed, skipping manifest"
                );
                report.failures.extend(run.builds.failures);
                continue;
            }
            report.versions_built.push(run.version.clone());
            for task in &run.tasks {
                self.queue_sbom(&mut io, &task.target_tag, &task.architecture);
            }
            match run.manifest {
                Some((name, Ok(()))) => {
                    report.total_tasks += 1;
                    report.manifests_published.push(name);
                    self.queue_sign(&mut io, &run.version);
                }
                Some((name, Err(e))) => {
                    report.total_tasks += 1;
                    warn!(manifest = %name, error = %e, "manifest publish failed");
                    report.failures.push(TaskFailure::new(format!("manifest {name}"), &e));
                }
                None => self.queue_sign(&mut io, &run.version),
            }
        }

        let drained = io.join().await;
        report.total_tasks += drained.total;
        for outcome in drained.successes {
            match outcome {
                IoOutcome::Signed(reference) => report.signatures.push(reference),
                IoOutcome::Sbom(Some(key)) => report.sboms.push(key),
                IoOutcome::Sbom(None) => {}
            }
        }
        report.failures.extend(drained.failures);
        report.finished_at = Some(Utc::now());
        Ok(report)
    }
}
