//! cellpipe - headless pipeline runner and batch tooling

use anyhow::{bail, Context};
use cellpipe::batch::{self, CommandTemplate, PathMapping};
use cellpipe::config::{Preferences, RunConfig};
use cellpipe::measurements::file::looks_like_measurements;
use cellpipe::pipeline::{add_message_for_user, ErrorPolicy, ImageNumber, RunOptions, RunStatus};
use cellpipe::{GroupKey, Measurements, Pipeline};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cellpipe")]
#[command(about = "Run image-analysis pipelines headlessly and across a cluster")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `debug` or `warn,cellpipe=info` (RUST_LOG wins)
    #[arg(short = 'L', long, global = true)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline or batch file.
    Run(RunArgs),

    /// Print the measurement columns a pipeline would write.
    Measurements {
        #[arg(short, long)]
        pipeline: PathBuf,
    },

    /// Print the groups of a measurements or batch file as JSON.
    PrintGroups { file: PathBuf },

    /// Print one worker command per group of a batch file.
    BatchCommands(BatchCommandsArgs),

    /// Attach a message that is shown when the pipeline is loaded.
    AddMessage {
        caption: String,
        message: String,
        path: PathBuf,
    },

    /// Prepare a pipeline for cluster execution.
    CreateBatch(CreateBatchArgs),

    /// Merge worker outputs into one measurements file.
    Merge {
        output: PathBuf,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// List the available modules.
    Modules,

    /// Show or change the saved defaults for `run`.
    Preferences {
        /// Directory `run` writes `<pipeline>_out.json` to without `-o`
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Default error policy: abort or skip
        #[arg(long)]
        on_error: Option<ErrorPolicy>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Pipeline file, or a batch/measurements file holding one
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Where to write the measurements; defaults to `<pipeline>_out.json` in
    /// the configured output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// First image set to process
    #[arg(short, long)]
    first: Option<u32>,

    /// Last image set to process
    #[arg(short, long)]
    last: Option<u32>,

    /// Only run groups matching key=value[,key=value...]
    #[arg(short, long)]
    group: Option<String>,

    /// Write Success or Failure here when the run ends
    #[arg(short, long)]
    done_file: Option<PathBuf>,

    /// abort or skip
    #[arg(long)]
    on_error: Option<ErrorPolicy>,

    /// Run configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    show_displays: bool,
}

#[derive(Debug, Args)]
struct BatchCommandsArgs {
    file: PathBuf,

    #[arg(long, default_value = batch::DEFAULT_PROGRAM)]
    program: String,

    /// Chunk size for runs that are not grouped
    #[arg(long)]
    images_per_batch: Option<usize>,

    /// Directory each worker writes its output to
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CreateBatchArgs {
    #[arg(short, long)]
    pipeline: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    /// LOCAL=REMOTE path prefix mapping, may be repeated
    #[arg(long = "map")]
    mappings: Vec<String>,

    /// Run configuration (TOML) supplying further path mappings
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let run_config = match run_config(&cli.command) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| run_config.log_filter().to_string());
    let log_file = cli.log_file.clone().or_else(|| run_config.log_file.clone());
    let _guard = match init_logging(&filter, log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let done_file = match &cli.command {
        Commands::Run(args) => args.done_file.clone().or_else(|| run_config.done_file.clone()),
        _ => None,
    };

    match dispatch(cli.command, run_config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            if let Some(path) = done_file {
                if let Err(e) = batch::write_done_file(&path, None) {
                    tracing::error!("Failed to write done file {}: {}", path.display(), e);
                }
            }
            ExitCode::FAILURE
        }
    }
}

/// The run configuration named on the command line, or one seeded from
/// the user's preferences.
fn run_config(command: &Commands) -> anyhow::Result<RunConfig> {
    let path = match command {
        Commands::Run(args) => args.config.as_ref(),
        Commands::CreateBatch(args) => args.config.as_ref(),
        _ => None,
    };
    match path {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("Failed to load run config {}", path.display())),
        None => Ok(Preferences::load_or_default().run_config()),
    }
}

fn init_logging(filter: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file {} has no file name", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Returns whether the command succeeded.
fn dispatch(command: Commands, config: RunConfig) -> anyhow::Result<bool> {
    match command {
        Commands::Run(args) => run(args, config),
        Commands::Measurements { pipeline } => {
            let (pipeline, _) = load_pipeline(&pipeline)?;
            batch::print_measurements(&pipeline, &mut std::io::stdout().lock())?;
            Ok(true)
        }
        Commands::PrintGroups { file } => {
            let measurements = Measurements::load(&file, None)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            batch::print_groups(&measurements, &mut std::io::stdout().lock())?;
            Ok(true)
        }
        Commands::BatchCommands(args) => {
            let measurements = Measurements::load(&args.file, None)
                .with_context(|| format!("Failed to read {}", args.file.display()))?;
            let template = CommandTemplate {
                program: args.program,
                output_dir: args.output_dir,
                images_per_batch: args.images_per_batch,
            };
            let groups = batch::recorded_groups(&measurements);
            for command in batch::batch_commands(&args.file, &groups, &template) {
                println!("{}", command);
            }
            Ok(true)
        }
        Commands::AddMessage {
            caption,
            message,
            path,
        } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            std::fs::write(&path, add_message_for_user(&text, &caption, &message)?)?;
            tracing::info!("Added message to {}", path.display());
            Ok(true)
        }
        Commands::CreateBatch(args) => {
            let mut mapper = config.path_mapper();
            for spec in &args.mappings {
                mapper.add(PathMapping::parse(spec)?);
            }
            let (mut pipeline, _) = load_pipeline(&args.pipeline)?;
            let groups = batch::create_batch_file(&mut pipeline, &mapper, &args.output)?;
            println!("Wrote {} ({} groups)", args.output.display(), groups.len());
            Ok(true)
        }
        Commands::Merge { output, inputs } => {
            let mut merged = Measurements::new();
            for input in &inputs {
                let m = Measurements::load(input, None)
                    .with_context(|| format!("Failed to read {}", input.display()))?;
                merged
                    .merge(m)
                    .with_context(|| format!("Failed to merge {}", input.display()))?;
            }
            merged.save(&output)?;
            tracing::info!("Merged {} files into {}", inputs.len(), output.display());
            Ok(true)
        }
        Commands::Preferences {
            output_dir,
            on_error,
        } => {
            let mut prefs = Preferences::load()?;
            if output_dir.is_some() || on_error.is_some() {
                if output_dir.is_some() {
                    prefs.default_output_dir = output_dir;
                }
                if let Some(policy) = on_error {
                    prefs.error_policy = policy;
                }
                prefs.save()?;
                tracing::info!("Saved preferences");
            }
            println!("{}", serde_json::to_string_pretty(&prefs)?);
            Ok(true)
        }
        Commands::Modules => {
            let pipeline = Pipeline::default();
            let mut names: Vec<&str> = pipeline.registry().names().collect();
            names.sort_unstable();
            for name in names {
                println!("{}", name);
            }
            Ok(true)
        }
    }
}

/// Load a pipeline file, or the pipeline stored in a measurements file
/// together with its measurements.
fn load_pipeline(path: &Path) -> anyhow::Result<(Pipeline, Option<Measurements>)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut pipeline = Pipeline::default();
    pipeline
        .load_text(&text)
        .with_context(|| format!("Failed to load pipeline {}", path.display()))?;

    // The batch file is only read; workers write to their own output.
    let measurements = if looks_like_measurements(&text) {
        Some(Measurements::from_json(&text, None)?)
    } else {
        None
    };
    if let Some((caption, message)) = pipeline.message_for_user() {
        tracing::info!("{}: {}", caption, message);
    }
    Ok((pipeline, measurements))
}

fn run(args: RunArgs, config: RunConfig) -> anyhow::Result<bool> {
    if let (Some(first), Some(last)) = (args.first, args.last) {
        if first > last {
            bail!("First image set {} is after last image set {}", first, last);
        }
    }

    let (mut pipeline, initial) = load_pipeline(&args.pipeline)?;
    let mut options = RunOptions::new()
        .with_range(args.first.map(ImageNumber), args.last.map(ImageNumber))
        .with_error_policy(args.on_error.unwrap_or(config.error_policy))
        .with_displays(args.show_displays || config.show_displays);
    if let Some(spec) = &args.group {
        options = options.with_group(GroupKey::parse(spec)?);
    }

    let mut outcome = pipeline.run(&options, initial)?;
    let output = args
        .output
        .clone()
        .or_else(|| config.output_path(&args.pipeline));
    if let Some(output) = &output {
        outcome.measurements.set_filename(output);
        outcome
            .measurements
            .save(output)
            .with_context(|| format!("Failed to write measurements to {}", output.display()))?;
    }

    for exception in &outcome.exceptions {
        eprintln!("{}", exception);
    }
    tracing::info!(
        "Run finished: {} ({} image sets)",
        outcome.status.as_str(),
        outcome.image_sets_run.len()
    );

    if let Some(path) = args.done_file.or(config.done_file) {
        batch::write_done_file(&path, Some(outcome.status))?;
    }
    Ok(outcome.status == RunStatus::Success)
}
