use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use esrgan_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use esrgan_core::discovery::InputSet;
use esrgan_core::logging::{self, LogFilters, DEFAULT_LOG_FILTER};
use esrgan_core::model_inspect::inspect_onnx;
use esrgan_core::network::{verify_parameters, verify_signature};
use esrgan_core::{
    driver, runtime, Device, Driver, FailurePolicy, NetworkModel, RrdbNetConfig, RunOptions,
    UpscaleError,
};

#[derive(Parser)]
#[command(
    name = "esrgan",
    version,
    about = "Upscale a folder of images x4 with an RRDBNet ONNX export",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print an ONNX export's signature and check it against RRDBNet x4.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct InspectArgs {
    model: PathBuf,
}

#[derive(Args, Default)]
struct RunArgs {
    #[arg(help = "RRDBNet x4 ONNX export (falls back to model.path in config.toml)")]
    model: Option<PathBuf>,

    #[arg(long, help = "cpu, gpu, cuda[:N] or tensorrt[:N]")]
    device: Option<Device>,

    #[arg(long, value_name = "DIR")]
    input_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    #[arg(short = 'j', long, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: Option<u16>,

    #[arg(long, help = "Abort on the first file that fails")]
    fail_fast: bool,

    #[arg(long, help = "Create missing directories under the output root")]
    create_dirs: bool,

    #[arg(long, help = "Process files in name order")]
    sort: bool,

    #[arg(
        long = "ext",
        value_name = "EXT",
        value_delimiter = ',',
        help = "Only process these extensions, e.g. --ext png,jpg"
    )]
    extensions: Vec<String>,

    #[arg(long, help = "Warn instead of failing when the parameter set differs")]
    no_strict: bool,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: Option<u8>,

    #[arg(long, value_name = "DIR")]
    trt_cache_dir: Option<PathBuf>,
}

/// Command-line values merged over `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSettings {
    model: PathBuf,
    device: Device,
    strict: bool,
    input_dir: PathBuf,
    output_dir: PathBuf,
    trt_cache_dir: PathBuf,
    extensions: Vec<String>,
    sort: bool,
    options: RunOptions,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Some(Commands::Inspect(args)) => inspect_model(&args.model),
        None => run_batch(&cli.run, &resolved_data_dir),
    }
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    AppConfig::load_from_path(&cfg_path)
        .map_err(|e| anyhow::Error::from(UpscaleError::Config(format!("{e:#}"))))
}

fn resolve_settings(args: &RunArgs, config: &AppConfig, data_dir: &Path) -> Result<RunSettings> {
    let model = args
        .model
        .clone()
        .or_else(|| config.model.path.clone())
        .ok_or_else(|| {
            UpscaleError::Argument(
                "no model given: pass MODEL or set model.path in config.toml".to_string(),
            )
        })?;

    let failure_policy = if args.fail_fast {
        FailurePolicy::FailFast
    } else {
        config.inference.failure_policy
    };
    let extensions = if args.extensions.is_empty() {
        config.inference.extensions.clone()
    } else {
        args.extensions.clone()
    };

    Ok(RunSettings {
        model,
        device: args.device.unwrap_or(config.inference.device),
        strict: config.model.strict && !args.no_strict,
        input_dir: args
            .input_dir
            .clone()
            .unwrap_or_else(|| config.paths.input_dir.clone()),
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| config.paths.output_dir.clone()),
        trt_cache_dir: args
            .trt_cache_dir
            .clone()
            .unwrap_or_else(|| resolve_relative_to(data_dir, &config.paths.trt_cache_dir)),
        extensions,
        sort: args.sort || config.inference.sort_inputs,
        options: RunOptions {
            failure_policy,
            jobs: args.jobs.map_or(config.inference.jobs, usize::from),
            jpeg_quality: args.jpeg_quality.unwrap_or(config.output.jpeg_quality),
            create_output_dirs: args.create_dirs || config.output.create_dirs,
        },
    })
}

fn run_batch(args: &RunArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let settings = resolve_settings(args, &config, data_dir)?;
    logging::set_crash_context(&settings.model, settings.device);

    runtime::setup_runtime_libs(settings.device.is_accelerator()).log();
    info!(
        model = %settings.model.display(),
        device = %settings.device,
        input_dir = %settings.input_dir.display(),
        output_dir = %settings.output_dir.display(),
        jobs = settings.options.jobs,
        failure_policy = ?settings.options.failure_policy,
        "Starting batch"
    );

    let network = driver::initialize(
        &settings.model,
        settings.device,
        settings.strict,
        Some(settings.trt_cache_dir.as_path()),
    )?;
    println!("Model path {}.", settings.model.display());
    println!("Testing...");

    let mut stdout = std::io::stdout();
    process_inputs(network, &settings, &mut stdout)
}

/// Upscale every discovered input, writing `<idx> <name>` per item to `out`.
/// A missing input root is an empty run.
fn process_inputs<M, W>(network: M, settings: &RunSettings, out: &mut W) -> Result<()>
where
    M: NetworkModel,
    W: Write + Send,
{
    if !settings.input_dir.is_dir() {
        warn!(
            input_dir = %settings.input_dir.display(),
            "Input directory does not exist; nothing to upscale"
        );
        return Ok(());
    }

    let inputs = InputSet::new(&settings.input_dir)
        .with_extensions(&settings.extensions)
        .sorted(settings.sort);
    let driver = Driver::new(
        network,
        &settings.input_dir,
        &settings.output_dir,
        settings.options.clone(),
    );
    let summary = driver
        .run(inputs.iter(), |item| {
            if let Err(error) = writeln!(out, "{} {}", item.index, item.relative.display()) {
                warn!(%error, "Failed to write progress line");
            }
        })
        .context("batch aborted")?;

    if !summary.is_success() {
        for (path, reason) in &summary.failed {
            warn!(input = %path.display(), %reason, "Not upscaled");
        }
        bail!(
            "{} of {} file(s) failed",
            summary.failed.len(),
            summary.failed.len() + summary.processed
        );
    }
    Ok(())
}

fn inspect_model(model: &Path) -> Result<()> {
    let info = inspect_onnx(model)?;

    println!("Model:     {}", model.display());
    println!(
        "Producer:  {} {}",
        info.producer_name, info.producer_version
    );
    println!("IR:        {}  opset {}", info.ir_version, info.opset_version);
    for input in info.feed_inputs() {
        println!(
            "Input:     {} {} {:?}",
            input.name, input.data_type, input.shape
        );
    }
    for output in &info.outputs {
        println!(
            "Output:    {} {} {:?}",
            output.name, output.data_type, output.shape
        );
    }
    println!(
        "Params:    {} in {} initializers, {} ops",
        info.param_count,
        info.initializers.len(),
        info.op_count
    );

    let signature = match verify_signature(&info) {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("{e:#}"),
    };
    println!("Signature: {signature}");
    println!(
        "RRDBNet:   {}",
        verify_parameters(&info, &RrdbNetConfig::default()).summary()
    );
    Ok(())
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (file_layer, file_sink_error) = match logging::open_log_sink(data_dir) {
        Ok(sink) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(sink.appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            (Some(layer), None)
        }
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_sink_error {
        warn!(
            log_dir = %data_dir.join(logging::LOG_DIR_NAME).display(),
            %error,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let Err(error) = crash_hook {
        warn!(%error, "Crash reports disabled; panics will only reach stderr");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}
