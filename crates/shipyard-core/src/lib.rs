//! Shipyard Core
//!
//! Build orchestration and artifact lifecycle engine for container image
//! release trains.
//!
//! # Features
//!
//! - **Scenario resolution**: release, patch, staging or development from environment signals
//! - **Version matrix**: pinned, latest-per-major-line, or every supported version
//! - **Bounded scheduling**: semaphore-limited worker pools that never short-circuit
//! - **Builders**: `docker buildx` and `docker build` behind one trait
//! - **Manifests**: multi-architecture manifest lists over per-arch tags
//! - **Signing**: cosign sign/verify with classified retries
//! - **SBOM lifecycle**: Lite and Augmented documents, Daily and Release scopes
//! - **Rebuild driver**: the whole chain per version, with failure aggregation

pub mod builder;
pub mod config;
pub mod daily;
pub mod error;
pub mod fakes;
pub mod manifest;
pub mod matrix;
pub mod obs;
pub mod platform;
pub mod release_manifest;
pub mod sbom;
pub mod scenario;
pub mod scheduler;
pub mod signing;
pub mod telemetry;
pub mod versions;

pub use builder::{
    build_unless_exists, builder_for, BuildOutcome, BuildRequest, BuilderKind, BuildxBuilder,
    DockerBuilder, DockerRegistry, ImageBuilder,
};
pub use config::{BuildInfo, ImageBuildConfiguration, ImageInfo};
pub use daily::{CompletedVersions, DailyRebuildDriver, RebuildReport};
pub use error::{Result, ShipyardError, TaskFailure};
pub use manifest::{arch_tag, ManifestPublisher, ManifestReference};
pub use matrix::{plan_version, run_build_tasks, BuildTask};
pub use obs::RunSpan;
pub use platform::{Platform, SUPPORTED_PLATFORMS};
pub use release_manifest::ReleaseManifest;
pub use sbom::{
    asset_group, cli_release_path, BinarySbomGenerator, CliSbomOutcome, DockerSbomGenerator,
    ImageCoordinates, LiteSbomGenerator, ReleaseBinarySbomGenerator, SbomArtifact, SbomConfig,
    SbomManager, SbomOutcome, SbomPhase, SbomScope, ScanningService, SilkbombScanner,
};
pub use scenario::{BuildScenario, EnvSnapshot, ScenarioDefaults};
pub use scheduler::{BatchResult, TaskBatch, WorkerPool};
pub use signing::{HttpPublicKey, PublicKeySource, Signer, SigningConfig, StaticPublicKey};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use versions::{resolve_versions, RebuildFilter, VersionPair, ONLY_AGENTS};
