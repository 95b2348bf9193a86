//! Shipyard - container image release train
//!
//! The `shipyard` command builds, signs and publishes multi-architecture
//! images and keeps their SBOMs in durable storage.
//!
//! ## Commands
//!
//! - `scenario`: Show the resolved build scenario and its defaults
//! - `versions`: Resolve the version matrix for an image
//! - `build`: Build explicit versions (or the scenario default version)
//! - `daily`: Rebuild every version the scenario selects
//! - `sign` / `verify`: Sign or verify one image
//! - `sbom`: Run the SBOM lifecycle for one image and platform
//! - `cli-sbom`: Store release SBOMs for the kubectl-mongodb binary

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use shipyard_core::obs;
use shipyard_core::{
    builder_for, init_tracing, resolve_versions, BuildInfo, BuildScenario, BuilderKind,
    CompletedVersions, DailyRebuildDriver, DockerSbomGenerator, EnvSnapshot,
    ImageBuildConfiguration, ManifestPublisher, Platform, RebuildFilter, RebuildReport,
    ReleaseBinarySbomGenerator, ReleaseManifest, RunSpan, SbomConfig, SbomManager, Signer,
    SigningConfig, SilkbombScanner, TelemetryConfig, VersionPair,
};
use shipyard_store::{FsObjectStore, ObjectStore, S3CliStore, S3Config};
use shipyard_tools::{CommandRunner, TokioCommandRunner};

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Container image release train", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    /// Force a scenario (release, patch, staging/master, development/dev)
    #[arg(long, global = true, env = "SHIPYARD_SCENARIO")]
    scenario: Option<String>,

    /// Release manifest
    #[arg(long, global = true, env = "RELEASE_FILE", default_value = "release.json")]
    release_file: PathBuf,

    /// Per-scenario image settings
    #[arg(long, global = true, env = "BUILD_INFO_FILE", default_value = "build_info.json")]
    build_info: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved build scenario
    Scenario,

    /// Resolve the versions to build for an image
    Versions {
        /// Image name as listed in the release manifest
        image: String,

        /// Only this version (or ops-manager line)
        #[arg(long)]
        pin: Option<String>,

        /// Every supported version regardless of scenario
        #[arg(long)]
        all_artifacts: bool,
    },

    /// Build explicit versions of an image
    Build {
        image: String,

        /// Version to build; repeatable. Defaults to the scenario version.
        #[arg(long = "version")]
        versions: Vec<String>,

        #[command(flatten)]
        opts: BuildOpts,
    },

    /// Rebuild every version the scenario selects
    Daily {
        image: String,

        /// Only this version (or ops-manager line)
        #[arg(long)]
        pin: Option<String>,

        /// Lowest version to rebuild (inclusive); needs --max-version
        #[arg(long, requires = "max_version")]
        min_version: Option<String>,

        /// Upper bound (exclusive); equal to --min-version selects that version
        #[arg(long, requires = "min_version")]
        max_version: Option<String>,

        /// Only versions for this operator release, or `onlyAgents`
        #[arg(long)]
        operator_version: Option<String>,

        #[command(flatten)]
        opts: BuildOpts,
    },

    /// Sign an image by digest, then verify the signature
    Sign {
        /// Repository, e.g. quay.io/mongodb/mongodb-kubernetes
        repository: String,
        tag: String,
    },

    /// Verify an image signature
    Verify { repository: String, tag: String },

    /// Generate, store and submit SBOMs for one image
    Sbom {
        /// registry/organization/image:tag
        image_ref: String,

        #[arg(long, default_value = "linux/amd64")]
        platform: String,

        /// Store SBOMs under this directory instead of S3
        #[arg(long)]
        sbom_dir: Option<PathBuf>,
    },

    /// Store release SBOMs for the kubectl-mongodb binary
    CliSbom {
        /// Released CLI version
        #[arg(long = "cli-version", default_value = "1.25.0")]
        version: String,

        /// Comma-separated os/arch list
        #[arg(long, default_value = "linux/amd64")]
        platform: String,

        /// Store SBOMs under this directory instead of S3
        #[arg(long)]
        sbom_dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct BuildOpts {
    /// Comma-separated os/arch list; disables architecture detection
    #[arg(long)]
    platform: Option<String>,

    /// Push to this repository instead of the scenario default
    #[arg(long)]
    repository: Option<String>,

    /// Build versions concurrently
    #[arg(long)]
    parallel: bool,

    /// Build workers when --parallel is set (0 = all CPUs)
    #[arg(long, env = "PARALLEL_FACTOR", default_value_t = 0)]
    parallel_factor: usize,

    /// Signing and SBOM workers (0 = all CPUs)
    #[arg(long, default_value_t = 0)]
    io_workers: usize,

    /// Sign even if the scenario does not
    #[arg(long)]
    sign: bool,

    /// Skip SBOM generation
    #[arg(long)]
    no_sbom: bool,

    /// Every supported version regardless of scenario
    #[arg(long)]
    all_artifacts: bool,

    /// buildx (multi-platform) or docker (single-platform)
    #[arg(long, default_value = "buildx")]
    builder: String,

    #[arg(long)]
    dockerfile: Option<String>,

    #[arg(long, default_value = ".")]
    context: String,

    /// Do not rebuild tags that already exist
    #[arg(long)]
    skip_if_exists: bool,

    /// Store SBOMs under this directory instead of S3
    #[arg(long)]
    sbom_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = command_name(&cli.command);
    init_tracing(&TelemetryConfig::for_command(command, cli.json, cli.verbose));

    let run_id = uuid::Uuid::new_v4().to_string();
    let _span = RunSpan::enter(&run_id, command);

    let env = EnvSnapshot::from_process();
    let scenario = resolve_scenario(cli.scenario.as_deref(), &env)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());

    match cli.command {
        Commands::Scenario => cmd_scenario(scenario, &env, cli.json),
        Commands::Versions {
            image,
            pin,
            all_artifacts,
        } => cmd_versions(
            scenario,
            &cli.release_file,
            &image,
            pin.as_deref(),
            all_artifacts,
            cli.json,
        ),
        Commands::Build {
            image,
            versions,
            opts,
        } => {
            let config = load_configuration(scenario, &env, &cli.build_info, &image, &opts)?;
            let pairs = explicit_versions(&config, &cli.release_file, &versions)?;
            run_driver(&run_id, config, env, runner, &opts, &pairs, cli.json).await
        }
        Commands::Daily {
            image,
            pin,
            min_version,
            max_version,
            operator_version,
            opts,
        } => {
            let config = load_configuration(scenario, &env, &cli.build_info, &image, &opts)?;
            let manifest = ReleaseManifest::load(&cli.release_file)?;
            let filter = RebuildFilter {
                min_version,
                max_version,
                operator_version,
            };
            let pairs = daily_versions(&config, &manifest, pin.as_deref(), &filter)?;
            run_driver(&run_id, config, env, runner, &opts, &pairs, cli.json).await
        }
        Commands::Sign { repository, tag } => cmd_sign(runner, &repository, &tag).await,
        Commands::Verify { repository, tag } => cmd_verify(runner, &repository, &tag).await,
        Commands::Sbom {
            image_ref,
            platform,
            sbom_dir,
        } => cmd_sbom(runner, &image_ref, &platform, sbom_dir.as_deref(), cli.json).await,
        Commands::CliSbom {
            version,
            platform,
            sbom_dir,
        } => cmd_cli_sbom(runner, &version, &platform, sbom_dir.as_deref(), cli.json).await,
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Scenario => "scenario",
        Commands::Versions { .. } => "versions",
        Commands::Build { .. } => "build",
        Commands::Daily { .. } => "daily",
        Commands::Sign { .. } => "sign",
        Commands::Verify { .. } => "verify",
        Commands::Sbom { .. } => "sbom",
        Commands::CliSbom { .. } => "cli-sbom",
    }
}

fn resolve_scenario(forced: Option<&str>, env: &EnvSnapshot) -> Result<BuildScenario> {
    match forced {
        Some(name) => Ok(name.parse()?),
        None => Ok(BuildScenario::resolve(env)),
    }
}

/// Scenario defaults, then `build_info.json` (if present), then flags.
fn load_configuration(
    scenario: BuildScenario,
    env: &EnvSnapshot,
    build_info: &Path,
    image: &str,
    opts: &BuildOpts,
) -> Result<ImageBuildConfiguration> {
    let mut config = ImageBuildConfiguration::new(scenario, image, &scenario.defaults(env));

    if build_info.exists() {
        let info = BuildInfo::load(build_info)?;
        if let Some(image_info) = info.image_info(image, scenario) {
            config = config.with_image_info(image_info);
        }
    }

    if let Some(platforms) = &opts.platform {
        config = config.with_platforms(Platform::parse_list(platforms)?);
    }
    if let Some(repository) = &opts.repository {
        config = config.with_repository(repository.clone());
    }
    if let Some(dockerfile) = &opts.dockerfile {
        config = config.with_paths(dockerfile.clone(), opts.context.clone());
    } else {
        let dockerfile = config.dockerfile_path.clone();
        config = config.with_paths(dockerfile, opts.context.clone());
    }
    let build_workers = if opts.parallel { opts.parallel_factor } else { 1 };
    let builder: BuilderKind = opts.builder.parse()?;
    let sign = config.sign || opts.sign;
    let skip = config.skip_if_exists || opts.skip_if_exists;

    Ok(config
        .with_parallelism(build_workers, opts.io_workers)
        .with_sign(sign)
        .with_skip_if_exists(skip)
        .with_all_artifacts(opts.all_artifacts)
        .with_builder(builder)
        .validate(true)?)
}

/// Pairs for explicitly requested versions, with tooling from the release
/// manifest when it knows the version.
fn explicit_versions(
    config: &ImageBuildConfiguration,
    release_file: &Path,
    requested: &[String],
) -> Result<Vec<VersionPair>> {
    let requested: Vec<String> = if requested.is_empty() {
        if config.version.trim().is_empty() {
            bail!(
                "no version given and scenario {} provides none for {}",
                config.scenario,
                config.image
            );
        }
        vec![config.version.clone()]
    } else {
        requested.to_vec()
    };

    let manifest = if release_file.exists() {
        Some(ReleaseManifest::load(release_file)?)
    } else {
        None
    };

    let mut pairs = Vec::with_capacity(requested.len());
    for version in requested {
        let known = manifest.as_ref().and_then(|m| {
            resolve_versions(config.scenario, m, &config.image, Some(version.as_str()), false).ok()
        });
        match known.and_then(|mut found| found.pop()) {
            Some(pair) if pair.version == version => pairs.push(pair),
            _ => pairs.push(VersionPair::new(version)),
        }
    }
    Ok(pairs)
}

/// Versions the scenario selects, narrowed by the rebuild filter.
fn daily_versions(
    config: &ImageBuildConfiguration,
    manifest: &ReleaseManifest,
    pin: Option<&str>,
    filter: &RebuildFilter,
) -> Result<Vec<VersionPair>> {
    let pairs = resolve_versions(
        config.scenario,
        manifest,
        &config.image,
        pin,
        config.all_artifacts,
    )?;
    if filter.is_empty() {
        return Ok(pairs);
    }
    let narrowed = filter.apply(pairs);
    info!(image = %config.image, versions = narrowed.len(), "narrowed rebuild versions");
    Ok(narrowed)
}

fn object_store(
    sbom_dir: Option<&Path>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn ObjectStore>> {
    Ok(match sbom_dir {
        Some(dir) => Arc::new(FsObjectStore::new(dir)?),
        None => Arc::new(S3CliStore::new(S3Config::from_env(), runner)),
    })
}

fn sbom_manager(
    runner: Arc<dyn CommandRunner>,
    sbom_dir: Option<&Path>,
) -> Result<SbomManager> {
    let store = object_store(sbom_dir, runner.clone())?;
    Ok(SbomManager::new(
        store,
        Arc::new(SilkbombScanner::new(runner.clone(), SbomConfig::from_env())),
        Arc::new(DockerSbomGenerator::new(runner.clone())),
        builder_for(BuilderKind::MultiPlatform, runner),
    ))
}

async fn run_driver(
    run_id: &str,
    config: ImageBuildConfiguration,
    env: EnvSnapshot,
    runner: Arc<dyn CommandRunner>,
    opts: &BuildOpts,
    pairs: &[VersionPair],
    json: bool,
) -> Result<()> {
    obs::emit_run_started(run_id, config.scenario.as_str(), &config.image, pairs.len());
    let start = Instant::now();

    let builder = builder_for(config.builder, runner.clone());
    let publisher = Arc::new(ManifestPublisher::new(runner.clone(), builder.clone()));
    let sign = config.sign;
    let mut driver = DailyRebuildDriver::new(config, env, builder, publisher);
    if sign {
        let signer = Signer::from_config(runner.clone(), SigningConfig::from_env())?;
        driver = driver.with_signer(Arc::new(signer));
    }
    if !opts.no_sbom {
        driver = driver.with_sbom(Arc::new(sbom_manager(runner, opts.sbom_dir.as_deref())?));
    }

    let report = driver.run(pairs, &mut CompletedVersions::new()).await?;
    obs::emit_run_finished(
        run_id,
        start.elapsed().as_millis() as u64,
        report.failures.len(),
        report.is_success(),
    );
    print_report(&report, json)?;
    report
        .into_result()
        .map(|_| ())
        .context("release train finished with failures")
}

fn print_report(report: &RebuildReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Versions built:      {}", report.versions_built.join(", "));
    println!("Manifests published: {}", report.manifests_published.len());
    println!("Signatures:          {}", report.signatures.len());
    println!("SBOMs stored:        {}", report.sboms.len());
    println!("Duration:            {} ms", report.duration_ms());
    if !report.failures.is_empty() {
        println!();
        println!("Failures ({} of {}):", report.failures.len(), report.total_tasks);
        for failure in &report.failures {
            println!("  {failure}");
        }
    }
    Ok(())
}

fn cmd_scenario(scenario: BuildScenario, env: &EnvSnapshot, json: bool) -> Result<()> {
    let defaults = scenario.defaults(env);
    if json {
        let value = serde_json::json!({
            "scenario": scenario,
            "registry": defaults.registry,
            "sign": defaults.sign,
            "version": defaults.version,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Scenario: {scenario}");
        println!("Registry: {}", defaults.registry);
        println!("Sign:     {}", defaults.sign);
        println!("Version:  {}", defaults.version.as_deref().unwrap_or("-"));
    }
    Ok(())
}

fn cmd_versions(
    scenario: BuildScenario,
    release_file: &Path,
    image: &str,
    pin: Option<&str>,
    all_artifacts: bool,
    json: bool,
) -> Result<()> {
    let manifest = ReleaseManifest::load(release_file)?;
    let pairs = resolve_versions(scenario, &manifest, image, pin, all_artifacts)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&pairs)?);
    } else {
        for pair in &pairs {
            println!("{pair}");
        }
    }
    Ok(())
}

async fn cmd_sign(runner: Arc<dyn CommandRunner>, repository: &str, tag: &str) -> Result<()> {
    let signer = Signer::from_config(runner, SigningConfig::from_env())?;
    let signed = signer
        .sign_and_verify(repository, tag)
        .await
        .with_context(|| format!("signing {repository}:{tag}"))?;
    println!("Signed {signed}");
    Ok(())
}

async fn cmd_verify(runner: Arc<dyn CommandRunner>, repository: &str, tag: &str) -> Result<()> {
    let signer = Signer::from_config(runner, SigningConfig::from_env())?;
    if !signer.verify(repository, tag).await? {
        bail!("signature verification failed for {repository}:{tag}");
    }
    println!("Verified {repository}:{tag}");
    Ok(())
}

async fn cmd_sbom(
    runner: Arc<dyn CommandRunner>,
    image_ref: &str,
    platform: &str,
    sbom_dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let platform = Platform::parse(platform)?;
    let manager = sbom_manager(runner, sbom_dir)?;
    let outcome = manager.process(image_ref, &platform).await?;
    info!(image_ref, platform = %platform, "SBOM lifecycle complete");
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("Daily lite:        {}", outcome.daily_lite);
        for (label, key) in [
            ("Daily augmented:  ", &outcome.daily_augmented),
            ("Release lite:     ", &outcome.release_lite),
            ("Release augmented:", &outcome.release_augmented),
        ] {
            println!("{label} {}", key.as_deref().unwrap_or("-"));
        }
    }
    Ok(())
}

/// Best effort per platform: a failure is logged and the next platform runs.
async fn cmd_cli_sbom(
    runner: Arc<dyn CommandRunner>,
    version: &str,
    platforms: &str,
    sbom_dir: Option<&Path>,
    json: bool,
) -> Result<()> {
    let platforms = Platform::parse_list(platforms)?;
    let binary = ReleaseBinarySbomGenerator::new(runner.clone(), SbomConfig::from_env())?;
    let manager = sbom_manager(runner, sbom_dir)?.with_binary_generator(Arc::new(binary));

    let mut results = Vec::with_capacity(platforms.len());
    for platform in &platforms {
        let outcome = manager.process_cli_binary_best_effort(version, platform).await;
        results.push(serde_json::json!({
            "platform": platform.to_string(),
            "outcome": outcome,
        }));
        if json {
            continue;
        }
        let status = match &outcome {
            None => "failed, see log".to_string(),
            Some(o) if o.already_released => "already stored".to_string(),
            Some(o) => o
                .release_augmented
                .clone()
                .unwrap_or_else(|| "scan pending".to_string()),
        };
        println!("{platform}: {status}");
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use shipyard_core::scenario::{ENV_IS_PATCH, ENV_RELEASE_TAG};
    use shipyard_core::ONLY_AGENTS;

    const RELEASE_JSON: &str = r#"{
        "supportedImages": {
            "mongodb-agent": {
                "opsManagerMapping": {
                    "cloud_manager": "13.36.0.9555-1",
                    "cloud_manager_tools": "100.12.0",
                    "ops_manager": {
                        "8.0.7": { "agent_version": "108.0.7.8810-1", "tools_version": "100.12.0" }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_daily_with_build_flags() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "--json",
            "daily",
            "mongodb-agent",
            "--platform",
            "linux/amd64,linux/arm64",
            "--parallel",
            "--parallel-factor",
            "4",
            "--io-workers",
            "8",
            "--no-sbom",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Daily { image, pin, opts, .. } => {
                assert_eq!(image, "mongodb-agent");
                assert!(pin.is_none());
                assert!(opts.parallel);
                assert_eq!(opts.parallel_factor, 4);
                assert_eq!(opts.io_workers, 8);
                assert!(opts.no_sbom);
            }
            _ => panic!("expected daily"),
        }
    }

    #[test]
    fn range_bounds_come_in_pairs() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "daily",
            "mongodb-agent",
            "--min-version",
            "108.0.0.8694-1",
            "--max-version",
            "108.0.0.8694-1",
            "--operator-version",
            "onlyAgents",
        ])
        .unwrap();
        match cli.command {
            Commands::Daily {
                min_version,
                max_version,
                operator_version,
                ..
            } => {
                assert_eq!(min_version, max_version);
                assert_eq!(operator_version.as_deref(), Some(ONLY_AGENTS));
            }
            _ => panic!("expected daily"),
        }

        let lone = Cli::try_parse_from(["shipyard", "daily", "mongodb-agent", "--min-version", "1.0.0"]);
        assert!(lone.is_err());
    }

    #[test]
    fn daily_versions_apply_the_rebuild_filter() {
        let manifest = ReleaseManifest::from_json(RELEASE_JSON).unwrap();
        let env = EnvSnapshot::default();
        let opts = BuildOpts {
            builder: "buildx".to_string(),
            context: ".".to_string(),
            all_artifacts: true,
            ..BuildOpts::default()
        };
        let missing = PathBuf::from("/nonexistent/build_info.json");
        let config =
            load_configuration(BuildScenario::Development, &env, &missing, "mongodb-agent", &opts)
                .unwrap();

        let everything = daily_versions(&config, &manifest, None, &RebuildFilter::default()).unwrap();
        assert_eq!(everything.len(), 2);

        let single = RebuildFilter {
            min_version: Some("108.0.7.8810-1".to_string()),
            max_version: Some("108.0.7.8810-1".to_string()),
            operator_version: None,
        };
        let pairs = daily_versions(&config, &manifest, None, &single).unwrap();
        assert_eq!(pairs, vec![VersionPair::with_tooling("108.0.7.8810-1", "100.12.0")]);
    }

    #[test]
    fn parses_cli_sbom() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "cli-sbom",
            "--cli-version",
            "1.26.0",
            "--platform",
            "linux/amd64,linux/arm64",
        ])
        .unwrap();
        assert_eq!(command_name(&cli.command), "cli-sbom");
        match cli.command {
            Commands::CliSbom { version, platform, .. } => {
                assert_eq!(version, "1.26.0");
                assert_eq!(Platform::parse_list(&platform).unwrap().len(), 2);
            }
            _ => panic!("expected cli-sbom"),
        }
    }

    #[test]
    fn forced_scenario_wins() {
        let env = EnvSnapshot::from_pairs([(ENV_RELEASE_TAG, "1.2.0")]);
        assert_eq!(resolve_scenario(None, &env).unwrap(), BuildScenario::Release);
        assert_eq!(
            resolve_scenario(Some("master"), &env).unwrap(),
            BuildScenario::Staging
        );
        assert!(resolve_scenario(Some("nightly"), &env).is_err());
    }

    #[test]
    fn configuration_layers_build_info_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_info.json");
        std::fs::write(
            &path,
            r#"{ "images": { "mongodb-agent": { "patch": {
                "repository": "ecr.example/dev/mongodb-agent-ubi",
                "platforms": ["linux/amd64", "linux/arm64"],
                "sign": false,
                "skip_if_exists": true
            } } } }"#,
        )
        .unwrap();
        let env = EnvSnapshot::from_pairs([(ENV_IS_PATCH, "true")]);

        let opts = BuildOpts {
            builder: "buildx".to_string(),
            context: ".".to_string(),
            sign: true,
            ..BuildOpts::default()
        };
        let config =
            load_configuration(BuildScenario::Patch, &env, &path, "mongodb-agent", &opts).unwrap();
        assert_eq!(config.repository, "ecr.example/dev/mongodb-agent-ubi");
        assert_eq!(config.platforms.len(), 2);
        assert!(!config.platforms_overridden);
        assert!(config.sign);
        assert!(config.skip_if_exists);
        assert_eq!(config.parallelism, 1);

        let opts = BuildOpts {
            platform: Some("linux/arm64".to_string()),
            builder: "docker".to_string(),
            context: ".".to_string(),
            ..BuildOpts::default()
        };
        let config =
            load_configuration(BuildScenario::Patch, &env, &path, "mongodb-agent", &opts).unwrap();
        assert!(config.platforms_overridden);
        assert_eq!(config.builder, BuilderKind::SinglePlatform);
    }

    #[test]
    fn explicit_versions_pick_up_tooling() {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join("release.json");
        std::fs::write(&release, RELEASE_JSON).unwrap();
        let env = EnvSnapshot::default();
        let opts = BuildOpts {
            builder: "buildx".to_string(),
            context: ".".to_string(),
            ..BuildOpts::default()
        };
        let config = load_configuration(
            BuildScenario::Development,
            &env,
            &dir.path().join("missing.json"),
            "mongodb-agent",
            &opts,
        )
        .unwrap();

        let pairs = explicit_versions(
            &config,
            &release,
            &["108.0.7.8810-1".to_string(), "999.0.0".to_string()],
        )
        .unwrap();
        assert_eq!(
            pairs,
            vec![
                VersionPair::with_tooling("108.0.7.8810-1", "100.12.0"),
                VersionPair::new("999.0.0"),
            ]
        );
    }

    #[test]
    fn build_without_any_version_fails() {
        let env = EnvSnapshot::from_pairs([(ENV_IS_PATCH, "true")]);
        let opts = BuildOpts {
            builder: "buildx".to_string(),
            context: ".".to_string(),
            ..BuildOpts::default()
        };
        let missing = PathBuf::from("/nonexistent/build_info.json");
        let config =
            load_configuration(BuildScenario::Patch, &env, &missing, "operator", &opts).unwrap();
        assert!(explicit_versions(&config, &missing, &[]).is_err());
    }
}
