use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use agroclim::calendar::DateRange;
use agroclim::catalog::WmsCatalogClient;
use agroclim::config::ConfigLoader;
use agroclim::domain::{Variable, VariableTable};
use agroclim::error::PipelineError;
use agroclim::fetch::HttpSourceClient;
use agroclim::output::{JsonOutput, OutputMode, TextOutput};
use agroclim::pipeline::{Pipeline, RunOptions};
use agroclim::store::FsStore;

#[derive(Parser)]
#[command(name = "agroclim")]
#[command(about = "Incremental daily climate rasters: fetch, normalize, clip to a country and reconcile with a published catalog")]
#[command(version, author)]
struct Cli {
    /// Root of the per-variable output directories
    #[arg(short, long)]
    outputs: Utf8PathBuf,

    /// First month, YYYY-MM
    #[arg(short, long)]
    start_date: String,

    /// Last month, YYYY-MM
    #[arg(short, long)]
    end_date: String,

    /// Country identifier used to find the boundary file
    #[arg(short, long)]
    country: String,

    /// Staging directory for downloads and intermediates (defaults to the user cache)
    #[arg(short, long)]
    download: Option<Utf8PathBuf>,

    /// Catalog workspace; enables reconciliation against published dates
    #[arg(short, long)]
    workspace: Option<String>,

    /// CSV of points (id,lat,long) to sample into per-point daily series
    #[arg(short, long)]
    points: Option<PathBuf>,

    /// Restrict the run to these variables
    #[arg(long = "variable", value_enum)]
    variables: Vec<Variable>,

    #[arg(long)]
    config: Option<String>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::InvalidRange(_)
        | PipelineError::Config(_)
        | PipelineError::ConfigRead(_) => 2,
        PipelineError::Fetch { .. }
        | PipelineError::FetchStatus { .. }
        | PipelineError::CatalogUnavailable(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    // validated before anything touches the disk or network
    let range = DateRange::parse(&cli.start_date, &cli.end_date)?;
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let table = VariableTable::standard();
    let store = match cli.download {
        Some(staging) => FsStore::new_with_paths(staging, cli.outputs, table),
        None => FsStore::new(cli.outputs, table)?,
    }
    .with_min_bytes(config.min_artifact_bytes);

    let source = HttpSourceClient::new(&config.bundle_endpoint, config.bundle_api_key.clone())?
        .with_max_wait(config.bundle_max_wait);
    let catalog = config
        .catalog_url
        .as_deref()
        .map(|url| WmsCatalogClient::new(url, config.catalog_credentials.clone()))
        .transpose()?;

    #[cfg(feature = "netcdf")]
    let grids = agroclim::normalize::NetcdfGridReader;
    #[cfg(not(feature = "netcdf"))]
    let grids = agroclim::normalize::UnsupportedGridReader;

    let mut pipeline = Pipeline::new(store, config, source, grids);
    if let Some(catalog) = catalog {
        pipeline = pipeline.with_catalog(catalog);
    }

    let mut options = RunOptions::new(range, cli.country);
    options.workspace = cli.workspace;
    options.points = cli.points;
    if !cli.variables.is_empty() {
        options.variables = cli.variables;
    }

    let report = pipeline.run(&options)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_report(&report).into_diagnostic()?,
    }
    Ok(())
}
