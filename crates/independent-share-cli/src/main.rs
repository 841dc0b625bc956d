//! Independent Share CLI
//!
//! The `independent-share` command builds tree-shaken shared dependencies of
//! a module federation host in isolation, one build per discovered version.
//!
//! ## Commands
//!
//! - `run`: discovery plus every isolated build through an external bundler
//! - `plan`: show the jobs a discovery artifact would produce
//! - `names`: print the derived container identity for one key and version

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use independent_share::{
    parse_discovery_artifact, plan_jobs, BuildConfig, CommandEngine, ContainerDescriptor,
    FallbackManifest, IndependentShareOrchestrator, JobPlan, LogFormat, SchedulingContext,
    ShareConfig, ShareError,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "independent-share")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Isolated per-version builds of shared dependencies", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines on stderr
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover shared requests and build each one in isolation
    Run {
        /// Share configuration (TOML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        #[command(flatten)]
        host: HostArgs,

        /// Bundler executable receiving each build config on stdin
        #[arg(long, env = "INDEPENDENT_SHARE_BUNDLER")]
        program: String,

        /// Extra arguments passed to the bundler
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Kill a bundler run after this many seconds (0 = no limit)
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,

        /// Also write the fallback manifest to this file
        #[arg(long)]
        manifest_out: Option<PathBuf>,

        /// Build the host afterwards, emitting the manifest into it
        #[arg(long)]
        build_host: bool,
    },

    /// Show the jobs a discovery artifact would schedule
    Plan {
        /// Share configuration (TOML, or JSON by extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Discovery artifact written by a previous discovery build
        #[arg(short, long)]
        discovery: PathBuf,

        #[command(flatten)]
        host: HostArgs,
    },

    /// Print container name, global name and file name for one version
    Names {
        /// Host federation name
        #[arg(long)]
        host_name: String,

        /// Share key
        #[arg(long)]
        key: String,

        /// Resolved version
        #[arg(long, default_value = "")]
        version: String,
    },
}

/// Where the host build lives.
#[derive(Args, Debug, Clone)]
struct HostArgs {
    /// Host build configuration (JSON); overrides the flags below
    #[arg(long)]
    host_config: Option<PathBuf>,

    /// Host project directory
    #[arg(long, default_value = ".")]
    context: PathBuf,

    /// Host output directory
    #[arg(long, default_value = "dist")]
    output: PathBuf,

    /// Build mode
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    independent_share::init_tracing(format, level);

    match cli.command {
        Commands::Run {
            config,
            host,
            program,
            args,
            timeout_secs,
            manifest_out,
            build_host,
        } => {
            let mut engine = CommandEngine::new(program).with_args(args);
            if timeout_secs > 0 {
                engine = engine.with_timeout(Duration::from_secs(timeout_secs));
            }
            let manifest = cmd_run(
                &config,
                &host,
                engine,
                manifest_out.as_deref(),
                build_host,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(())
        }
        Commands::Plan {
            config,
            discovery,
            host,
        } => {
            let plans = cmd_plan(&config, &discovery, &host)?;
            println!("{}", serde_json::to_string_pretty(&plans)?);
            Ok(())
        }
        Commands::Names {
            host_name,
            key,
            version,
        } => {
            println!("{}", serde_json::to_string_pretty(&cmd_names(&host_name, &key, &version))?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<ShareConfig> {
    ShareConfig::from_path(path)
        .with_context(|| format!("Failed to load share configuration {}", path.display()))
}

fn load_host(args: &HostArgs) -> Result<BuildConfig> {
    if let Some(path) = &args.host_config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read host configuration {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("Invalid host configuration {}", path.display()));
    }

    let mut host = BuildConfig::new(&args.context);
    host.output.path = args.output.clone();
    host.mode = args.mode.clone();
    Ok(host)
}

async fn cmd_run(
    config_path: &Path,
    host_args: &HostArgs,
    engine: CommandEngine,
    manifest_out: Option<&Path>,
    build_host: bool,
) -> Result<FallbackManifest> {
    let config = load_config(config_path)?;
    let host = load_host(host_args)?;
    let program = engine.program().to_string();
    let orchestrator = IndependentShareOrchestrator::new(Arc::new(engine), config)
        .context("Invalid share configuration")?;

    let ctx = SchedulingContext::new();
    let outcome = if build_host {
        orchestrator.build_host(&ctx, host).await.map(|(manifest, _)| manifest)
    } else {
        orchestrator.run(&ctx, &host).await
    };
    let closed = ctx.shutdown().await;
    info!(program = %program, jobs = ctx.jobs().len(), closed, "orchestration settled");

    let manifest = match outcome {
        Ok(manifest) => manifest,
        Err(ShareError::OrchestrationFailed { first, succeeded }) => {
            warn!(
                succeeded = succeeded.entry_count(),
                "keeping outputs of successful builds"
            );
            if let Some(path) = manifest_out {
                write_manifest(path, &succeeded)?;
            }
            return Err(anyhow::Error::new(*first).context("Independent share builds failed"));
        }
        Err(e) => return Err(anyhow::Error::new(e).context("Independent share builds failed")),
    };

    if let Some(path) = manifest_out {
        write_manifest(path, &manifest)?;
    }
    Ok(manifest)
}

fn write_manifest(path: &Path, manifest: &FallbackManifest) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, manifest.to_json()?)
        .with_context(|| format!("Failed to write manifest {}", path.display()))
}

fn cmd_plan(config_path: &Path, discovery: &Path, host_args: &HostArgs) -> Result<Vec<JobPlan>> {
    let config = load_config(config_path)?;
    let specs = config
        .shared_specs()
        .context("Invalid share configuration")?;
    let host = load_host(host_args)?;

    let raw = std::fs::read_to_string(discovery)
        .with_context(|| format!("Failed to read discovery artifact {}", discovery.display()))?;
    let filename = discovery
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let requests = parse_discovery_artifact(&filename, &raw)?;

    Ok(plan_jobs(&config, &specs, &host, &requests)?)
}

fn cmd_names(host_name: &str, key: &str, version: &str) -> Value {
    let descriptor = ContainerDescriptor::new(host_name, key, version, key);
    json!({
        "containerName": descriptor.container_name(),
        "globalName": descriptor.global_name(),
        "fileName": descriptor.file_name(),
        "version": descriptor.version(),
    })
}
