use std::collections::BTreeSet;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geo_harvest::app::{Harvester, RunPlan};
use geo_harvest::catalog::FemaCatalog;
use geo_harvest::config::{ConfigLoader, ConfigOverrides, HarvestConfig};
use geo_harvest::domain::Stage;
use geo_harvest::enumerator::Scope;
use geo_harvest::error::{ErrorClass, HarvestError};
use geo_harvest::output::{HumanOutput, JsonOutput, OutputMode, StderrProgress};
use geo_harvest::pool::ShutdownFlag;
use geo_harvest::stage_log::StageLog;
use geo_harvest::store::{FsRelocator, Store};
use geo_harvest::tool::{Ogr2Ogr, SystemToolRunner};
use geo_harvest::transport::HttpTransport;

type LiveHarvester = Harvester<FemaCatalog, HttpTransport, SystemToolRunner, FsRelocator>;

#[derive(Parser)]
#[command(name = "geo-harvest")]
#[command(about = "Resumable discover/fetch/unpack/convert/merge pipeline for remote geospatial archives")]
#[command(version, author)]
struct Cli {
    /// Path to a JSON config file (default: ./geo-harvest.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit machine-readable JSON instead of a text summary
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run pipeline stages; completed items are skipped")]
    Run(RunArgs),
    #[command(about = "Per-stage completion counts")]
    Status,
    #[command(about = "Latest outstanding failures with diagnostics")]
    Failures(FailuresArgs),
    #[command(about = "Merge groups and their membership")]
    Groups,
}

#[derive(Args)]
struct RunArgs {
    /// Stages to run (default: all)
    #[arg(long, value_delimiter = ',')]
    stages: Vec<Stage>,

    #[arg(long, value_delimiter = ',')]
    regions: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    products: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    groups: Vec<String>,

    /// Clear these stages (and everything downstream) before running
    #[arg(long, value_delimiter = ',')]
    force_rebuild: Vec<Stage>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    workers: Option<usize>,

    /// Fast local storage for converter temp files and merge workspaces
    #[arg(long)]
    scratch_dir: Option<Utf8PathBuf>,

    /// Source attribute encoding, e.g. LATIN1
    #[arg(long)]
    encoding: Option<String>,

    /// Fail conversions on any warning instead of skipping bad features
    #[arg(long)]
    strict: bool,

    /// Also write the JSON run report to this file
    #[arg(long)]
    report: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct FailuresArgs {
    #[arg(long)]
    stage: Option<Stage>,

    #[arg(long, default_value_t = 50)]
    limit: usize,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::ConfigInvalid(_)
        | HarvestError::InvalidStage(_) => 2,
        other if matches!(other.class(), ErrorClass::TransientExternal | ErrorClass::Tool) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(cli.config.as_deref(), args, output_mode),
        Commands::Status => {
            let harvester = build_harvester(load_config(cli.config.as_deref(), None)?)?;
            let report = harvester.status()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&report).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print(&HumanOutput::render_status(&report)).into_diagnostic()
                }
            }
        }
        Commands::Failures(args) => {
            let harvester = build_harvester(load_config(cli.config.as_deref(), None)?)?;
            let report = harvester.failures(args.stage, args.limit)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&report).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print(&HumanOutput::render_failures(&report)).into_diagnostic()
                }
            }
        }
        Commands::Groups => {
            let harvester = build_harvester(load_config(cli.config.as_deref(), None)?)?;
            let report = harvester.groups()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&report).into_diagnostic(),
                OutputMode::Human => {
                    HumanOutput::print(&HumanOutput::render_groups(&report)).into_diagnostic()
                }
            }
        }
    }
}

fn run_pipeline(config_path: Option<&str>, args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let overrides = ConfigOverrides {
        workers: args.workers,
        regions: (!args.regions.is_empty()).then(|| args.regions.clone()),
        scratch_root: args.scratch_dir.clone(),
        encoding: args.encoding.clone(),
        strict: args.strict,
    };
    let config = load_config(config_path, Some(&overrides))?;
    let args_report = args.report.clone();

    let shutdown = ShutdownFlag::new();
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received; finishing in-flight items");
        handler_flag.request();
    })
    .into_diagnostic()?;

    let harvester = build_harvester(config)?.with_shutdown(shutdown);

    let plan = RunPlan {
        stages: if args.stages.is_empty() {
            Stage::ALL.to_vec()
        } else {
            args.stages
        },
        scope: Scope {
            regions: args.regions.into_iter().collect(),
            products: args.products.into_iter().collect(),
            groups: args
                .groups
                .into_iter()
                .map(|group| group.trim().to_lowercase())
                .collect::<BTreeSet<_>>(),
        },
        force_rebuild: args.force_rebuild.into_iter().collect(),
        dry_run: args.dry_run,
    };

    let report = match output_mode {
        OutputMode::Json => harvester.run(&plan, &JsonOutput)?,
        OutputMode::Human => harvester.run(&plan, &StderrProgress)?,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print(&report).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print(&HumanOutput::render_run(&report)).into_diagnostic()?,
    }
    if let Some(path) = &args_report {
        let json = serde_json::to_vec_pretty(&report).into_diagnostic()?;
        Store::write_bytes_atomic(path, &json)?;
        tracing::info!(path = %path, "run report written");
    }
    if report.total_failed() > 0 {
        tracing::warn!(
            failed = report.total_failed(),
            "some items failed; rerun to retry them"
        );
    }
    Ok(())
}

fn load_config(
    path: Option<&str>,
    overrides: Option<&ConfigOverrides>,
) -> Result<HarvestConfig, HarvestError> {
    let defaults = ConfigOverrides::default();
    ConfigLoader::resolve(path, overrides.unwrap_or(&defaults))
}

fn build_harvester(config: HarvestConfig) -> Result<LiveHarvester, HarvestError> {
    let store = Store::new(&config);
    store.ensure_roots()?;
    let log = StageLog::open(config.paths.state_db.as_std_path())?;
    let catalog = FemaCatalog::new(&config.network, &config.catalog)?;
    let transport = HttpTransport::new(&config.network)?;
    let tool = Ogr2Ogr::new(SystemToolRunner, config.tool.clone(), store.tool_temp_dir())?;
    Ok(Harvester::new(
        config,
        log,
        catalog,
        transport,
        tool,
        FsRelocator,
    ))
}
