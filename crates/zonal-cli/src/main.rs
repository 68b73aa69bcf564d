//! Command-line interface for `zonal`, a zonal statistics tool.
//!
//! This binary wraps the [`zonal_core`] library: it summarizes raster cells
//! under vector features and prints the results or writes them to a file.
//!
//! # Architecture
//!
//! The CLI is built using [`clap`] for argument parsing and [`tracing`] for structured logging.
//! Library log records are bridged into the subscriber with [`tracing_log`]. The CLI parses
//! arguments, configures logging, and delegates to command handlers.
//!
//! # Available Commands
//!
//! - `extract` - Compute statistics of rasters over polygons
//! - `stats` - List the built-in statistics
//! - `info` - Display raster band information

mod display;

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{Level, debug, info};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

use zonal_core::processor::{DEFAULT_GRID_TOLERANCE, DEFAULT_MAX_CELLS};
use zonal_core::source::{RasterInput, Record, resolve_rasters};
use zonal_core::stats::get_stats;
use zonal_core::writer::records_to_batch;
use zonal_core::{
    DatasetFormat, ExtractOptions, ExtractOutput, OutputTarget, StatRequest, Strategy, extract,
};
use zonal_csv::{CsvWriterOptions, write_csv};
use zonal_geojson::{GeoJsonWriterOptions, write_feature_collection};

use crate::display::{bands_table, records_table, stats_table};

#[derive(Parser)]
#[command(
    name = "zonal",
    version,
    about = "Zonal statistics for rasters and vector features",
    long_about = "zonal summarizes the raster cells covered by each polygon, weighting\n\
                  each cell by the fraction of it the polygon covers."
)]
/// Command-line arguments and options for the `zonal` CLI.
struct Cli {
    /// Enable verbose (INFO level) logging output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug (DEBUG level) logging output with detailed diagnostics.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the `zonal` CLI.
#[derive(Subcommand)]
enum Commands {
    /// Computes statistics of rasters over polygon features.
    Extract(ExtractArgs),

    /// Lists the built-in statistics and their arguments.
    Stats,

    /// Displays the bands of one or more rasters.
    Info {
        /// Raster files, optionally as `name=path`.
        #[arg(value_name = "RASTER", required = true)]
        rasters: Vec<String>,
    },
}

/// How results are printed when no output file is given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Geojson,
    Csv,
}

#[derive(Args)]
struct ExtractArgs {
    /// Value rasters, optionally as `name=path`.
    #[arg(short, long = "raster", value_name = "RASTER", required = true)]
    rasters: Vec<String>,

    /// Polygon dataset, optionally as `path[layer]`.
    #[arg(short, long, value_name = "POLYGONS")]
    polygons: String,

    /// Weighting rasters, paired with the value rasters.
    #[arg(short, long = "weights", value_name = "RASTER")]
    weights: Vec<String>,

    /// Statistics, e.g. `mean`, `quantile(q=0.9)` or `dem_max=max`.
    #[arg(short, long = "stat", value_name = "STAT", required = true)]
    stats: Vec<String>,

    /// Feature properties to copy into each result.
    #[arg(long = "include-col", value_name = "COLUMN")]
    include_cols: Vec<String>,

    /// Copy each feature's geometry into its result.
    #[arg(long)]
    include_geom: bool,

    /// Processing order: feature-sequential, raster-sequential or raster-parallel.
    #[arg(long, default_value = "feature-sequential")]
    strategy: String,

    /// Largest number of cells read at once.
    #[arg(long, default_value_t = DEFAULT_MAX_CELLS)]
    max_cells: usize,

    /// Worker threads for raster-parallel; 0 uses one per core.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Tolerance when comparing value and weighting grids.
    #[arg(long, default_value_t = DEFAULT_GRID_TOLERANCE)]
    grid_tolerance: f64,

    /// Combine `frac` and `weighted_frac` results into maps keyed by class.
    #[arg(long)]
    frac_as_map: bool,

    /// Output file; the format follows the extension unless `--format` is set.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,
}

/// Entry point for the `zonal` command-line interface.
///
/// # Errors
///
/// Returns an error if command execution fails or if the logging system cannot be initialized.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    // Bridge logs from the `log` crate to the `tracing` ecosystem.
    LogTracer::init()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Extract(args) => {
            info!("Extracting statistics for {}", args.polygons);
            let output = tokio::task::spawn_blocking(move || handle_extract(&args)).await??;
            print!("{output}");
        },
        Commands::Stats => {
            println!("{}", stats_table(&get_stats()));
        },
        Commands::Info { rasters } => {
            println!("{}", handle_info(&rasters)?);
        },
    }

    Ok(())
}

/// Runs an extraction and returns whatever should be printed.
fn handle_extract(args: &ExtractArgs) -> Result<String> {
    let strategy = Strategy::parse(&args.strategy, args.threads)?;
    let rasters: Vec<RasterInput> = args
        .rasters
        .iter()
        .map(|raster| RasterInput::parse_argument(raster))
        .collect();
    let stats: Vec<StatRequest> = args
        .stats
        .iter()
        .map(|stat| StatRequest::from(stat.as_str()))
        .collect();

    let mut options = ExtractOptions::new()
        .with_include_columns(args.include_cols.iter().cloned())
        .with_include_geometry(args.include_geom)
        .with_strategy(strategy)
        .with_max_cells_in_memory(args.max_cells)
        .with_grid_tolerance(args.grid_tolerance)
        .with_frac_as_map(args.frac_as_map)
        .with_progress(|fraction, message| debug!("{:5.1}% {message}", fraction * 100.0));
    if !args.weights.is_empty() {
        let weights: Vec<RasterInput> = args
            .weights
            .iter()
            .map(|raster| RasterInput::parse_argument(raster))
            .collect();
        options = options.with_weights(weights);
    }
    if let Some(path) = &args.output {
        let format = match args.format {
            None => None,
            Some(OutputFormat::Geojson) => Some(DatasetFormat::GeoJson),
            Some(OutputFormat::Csv) => Some(DatasetFormat::Csv),
            Some(OutputFormat::Table) => {
                return Err(anyhow!("Format 'table' cannot be written to a file."));
            },
        };
        options = options.with_output(OutputTarget::Dataset {
            path: path.clone(),
            format,
        });
    }

    match extract(rasters, args.polygons.as_str(), &stats, options)? {
        ExtractOutput::Features(records) => {
            render_records(&records, args.format.unwrap_or(OutputFormat::Table))
        },
        ExtractOutput::Dataset(path) => {
            info!("Wrote {}", path.display());
            Ok(String::new())
        },
        ExtractOutput::Frame(_) => Err(anyhow!("Unexpected frame output.")),
    }
}

fn render_records(records: &[Record], format: OutputFormat) -> Result<String> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Table => writeln!(out, "{}", records_table(records))?,
        OutputFormat::Geojson => {
            let features = records.iter().map(Record::to_geojson).collect();
            write_feature_collection(&mut out, features, &GeoJsonWriterOptions::default())?;
            writeln!(out)?;
        },
        OutputFormat::Csv => {
            let Some(first) = records.first() else {
                return Ok(String::new());
            };
            let fields: Vec<String> = first.properties.keys().cloned().collect();
            let geometry = records.iter().any(|record| record.geometry.is_some());
            let batch = records_to_batch(&fields, records, geometry, &HashMap::new())?;
            write_csv(&mut out, &[batch], &CsvWriterOptions::default())?;
        },
    }
    Ok(String::from_utf8(out)?)
}

fn handle_info(rasters: &[String]) -> Result<String> {
    let mut bands = Vec::new();
    for raster in rasters {
        debug!("Opening {raster}");
        bands.extend(resolve_rasters(RasterInput::parse_argument(raster))?);
    }
    Ok(format!(
        "\nRasters: {} ({} band(s))\n\n{}",
        rasters.len(),
        bands.len(),
        bands_table(&bands)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GRID: &str = "ncols 3\nnrows 3\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n4 5 6\n7 8 9\n";
    const ZONES: &str = r#"{"type": "FeatureCollection", "features": [{"type": "Feature",
        "properties": {"name": "center"}, "geometry": {"type": "Polygon",
        "coordinates": [[[0.5, 0.5], [2.5, 0.5], [2.5, 2.5], [0.5, 2.5], [0.5, 0.5]]]}}]}"#;

    fn fixtures(dir: &TempDir) -> (String, String) {
        let grid = dir.path().join("dem.asc");
        let zones = dir.path().join("zones.geojson");
        std::fs::write(&grid, GRID).unwrap();
        std::fs::write(&zones, ZONES).unwrap();
        (grid.display().to_string(), zones.display().to_string())
    }

    fn args(raster: String, polygons: String, stats: &[&str]) -> ExtractArgs {
        ExtractArgs {
            rasters: vec![raster],
            polygons,
            weights: Vec::new(),
            stats: stats.iter().map(ToString::to_string).collect(),
            include_cols: vec!["name".to_string()],
            include_geom: false,
            strategy: "feature-sequential".to_string(),
            max_cells: DEFAULT_MAX_CELLS,
            threads: 0,
            grid_tolerance: DEFAULT_GRID_TOLERANCE,
            frac_as_map: false,
            output: None,
            format: None,
        }
    }

    #[test]
    fn test_handle_extract_table() -> Result<()> {
        let dir = TempDir::new()?;
        let (grid, zones) = fixtures(&dir);
        let output = handle_extract(&args(grid, zones, &["count", "mean"]))?;
        assert!(output.contains("name"));
        assert!(output.contains("center"));
        assert!(output.contains("mean"));
        Ok(())
    }

    #[test]
    fn test_handle_extract_csv() -> Result<()> {
        let dir = TempDir::new()?;
        let (grid, zones) = fixtures(&dir);
        let mut args = args(grid, zones, &["max"]);
        args.format = Some(OutputFormat::Csv);
        let output = handle_extract(&args)?;
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("name,max"));
        assert!(lines.next().is_some_and(|line| line.starts_with("center,9")));
        Ok(())
    }

    #[test]
    fn test_handle_extract_invalid_strategy() -> Result<()> {
        let dir = TempDir::new()?;
        let (grid, zones) = fixtures(&dir);
        let mut args = args(grid, zones, &["mean"]);
        args.strategy = "sideways".to_string();
        let result = handle_extract(&args);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("sideways"));
        Ok(())
    }

    #[test]
    fn test_handle_extract_table_file_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (grid, zones) = fixtures(&dir);
        let mut args = args(grid, zones, &["mean"]);
        args.output = Some(dir.path().join("out.txt"));
        args.format = Some(OutputFormat::Table);
        let result = handle_extract(&args);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Format 'table' cannot be written to a file."
        );
        Ok(())
    }

    #[test]
    fn test_handle_info() -> Result<()> {
        let dir = TempDir::new()?;
        let (grid, _) = fixtures(&dir);
        let table = handle_info(&[format!("dem={grid}")])?;
        assert!(table.contains("dem"));
        assert!(table.contains("3 x 3"));
        Ok(())
    }
}
