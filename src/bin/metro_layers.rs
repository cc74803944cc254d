use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use metro_layers::config::ConfigLoader;
use metro_layers::domain::DatasetKind;
use metro_layers::error::LayerError;
use metro_layers::fetch::HttpSourceClient;
use metro_layers::geometry::GeographicPoint;
use metro_layers::layers::{BuildMode, LayerPipeline, SourcesResult};
use metro_layers::output::{JsonOutput, LogSink, ProgressSink};

#[derive(Parser)]
#[command(name = "metro-layers")]
#[command(about = "Join transit stops and census demographics onto region layers")]
#[command(version, author)]
struct Cli {
    /// Suppress progress logging.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch sources and print aggregated layers as JSON")]
    Build(BuildArgs),
    #[command(about = "Resolve one point to the region containing it")]
    Resolve(ResolveArgs),
    #[command(about = "List configured sources")]
    Sources(SourcesArgs),
}

#[derive(Args, Clone)]
struct BuildArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    refresh: bool,

    #[arg(long)]
    save: bool,

    #[arg(long)]
    snapshot: Option<Utf8PathBuf>,

    #[arg(long)]
    layer: Option<String>,
}

#[derive(Args, Clone)]
struct ResolveArgs {
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,

    #[arg(long, allow_hyphen_values = true)]
    lat: f64,

    #[arg(long)]
    layer: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    snapshot: Option<Utf8PathBuf>,
}

#[derive(Args, Clone)]
struct SourcesArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long, value_enum)]
    kind: Option<DatasetKind>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<LayerError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &LayerError) -> u8 {
    match error {
        LayerError::MissingConfig | LayerError::SnapshotMissing(_) => 2,
        LayerError::SourceUnavailable { .. }
        | LayerError::SourceStatus { .. }
        | LayerError::DecodeFailure { .. }
        | LayerError::Cancelled(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sink: &dyn ProgressSink = if cli.quiet { &JsonOutput } else { &LogSink };

    match cli.command {
        Commands::Build(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let pipeline = LayerPipeline::new(HttpSourceClient::new()?);
            let mode = BuildMode {
                refresh: args.refresh,
                save: args.save,
                snapshot: args.snapshot,
                layer: args.layer,
            };
            let layers = pipeline.build(&config, &mode, sink)?;
            JsonOutput::print_layers(&layers).into_diagnostic()?;
        }
        Commands::Resolve(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let pipeline = LayerPipeline::new(HttpSourceClient::new()?);
            let mode = BuildMode {
                snapshot: args.snapshot,
                layer: args.layer,
                ..BuildMode::default()
            };
            let point = GeographicPoint::new(args.lon, args.lat);
            let result = pipeline.resolve(&config, &mode, point, sink)?;
            JsonOutput::print_resolve(&result).into_diagnostic()?;
        }
        Commands::Sources(args) => {
            let config = ConfigLoader::resolve(args.config.as_deref())?;
            let sources = SourcesResult::from_config(&config, args.kind);
            JsonOutput::print_sources(&sources).into_diagnostic()?;
        }
    }
    Ok(())
}
