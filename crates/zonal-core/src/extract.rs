//! High-level extraction entry point.
//!
//! [`extract`] resolves the inputs, builds the operations, checks spatial
//! references, picks a writer and runs the processor:
//!
//! ```no_run
//! use zonal_core::{ExtractOptions, ExtractOutput, StatRequest, extract};
//!
//! # fn main() -> zonal_core::Result<()> {
//! let stats = [StatRequest::from("mean"), StatRequest::from("max")];
//! let output = extract("dem.tif", "zones.geojson", &stats, ExtractOptions::new())?;
//! if let ExtractOutput::Features(records) = output {
//!     println!("{} records", records.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::crs::{self, CrsCache, CrsWarning};
use crate::error::Result;
use crate::operation::{OperationBuilder, StatRequest};
use crate::processor::{
    DEFAULT_GRID_TOLERANCE, DEFAULT_MAX_CELLS, Processor, ProcessorOptions, Strategy,
};
use crate::source::{RasterInput, VectorInput, resolve_rasters, resolve_vector};
use crate::writer::{
    ArrayType, DatasetFormat, DatasetWriter, FrameWriter, JsonWriter, Writer, WriterOutput,
};

/// Result of an extraction.
pub type ExtractOutput = WriterOutput;

/// Where results go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputTarget {
    /// In-memory records
    #[default]
    Features,
    /// An Arrow record batch
    Frame,
    /// A file; the format defaults to the one implied by the extension
    Dataset {
        path: PathBuf,
        format: Option<DatasetFormat>,
    },
}

type ProgressCallback = Box<dyn FnMut(f64, &str) + Send>;
type CrsWarningCallback = Box<dyn FnMut(&CrsWarning) + Send>;

/// Options for [`extract`].
pub struct ExtractOptions {
    pub weights: Option<RasterInput>,
    pub include_columns: Vec<String>,
    pub include_geometry: bool,
    pub strategy: Strategy,
    pub max_cells_in_memory: usize,
    pub grid_tolerance: f64,
    pub output: OutputTarget,
    pub frac_as_map: bool,
    pub array_type: ArrayType,
    pub crs_cache: Arc<CrsCache>,
    progress: Option<ProgressCallback>,
    on_crs_warning: Option<CrsWarningCallback>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            weights: None,
            include_columns: Vec::new(),
            include_geometry: false,
            strategy: Strategy::default(),
            max_cells_in_memory: DEFAULT_MAX_CELLS,
            grid_tolerance: DEFAULT_GRID_TOLERANCE,
            output: OutputTarget::default(),
            frac_as_map: false,
            array_type: ArrayType::default(),
            crs_cache: Arc::new(CrsCache::new()),
            progress: None,
            on_crs_warning: None,
        }
    }
}

impl fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("weights", &self.weights)
            .field("include_columns", &self.include_columns)
            .field("include_geometry", &self.include_geometry)
            .field("strategy", &self.strategy)
            .field("max_cells_in_memory", &self.max_cells_in_memory)
            .field("grid_tolerance", &self.grid_tolerance)
            .field("output", &self.output)
            .field("frac_as_map", &self.frac_as_map)
            .field("array_type", &self.array_type)
            .field("progress", &self.progress.is_some())
            .field("on_crs_warning", &self.on_crs_warning.is_some())
            .finish_non_exhaustive()
    }
}

impl ExtractOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Weighting rasters, paired with the value rasters.
    #[must_use]
    pub fn with_weights(mut self, weights: impl Into<RasterInput>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    /// Feature properties copied into each record.
    #[must_use]
    pub fn with_include_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_include_geometry(mut self, include_geometry: bool) -> Self {
        self.include_geometry = include_geometry;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_max_cells_in_memory(mut self, max_cells: usize) -> Self {
        self.max_cells_in_memory = max_cells;
        self
    }

    #[must_use]
    pub fn with_grid_tolerance(mut self, tolerance: f64) -> Self {
        self.grid_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    /// Fold `frac`/`weighted_frac` results into maps keyed by class value.
    #[must_use]
    pub fn with_frac_as_map(mut self, frac_as_map: bool) -> Self {
        self.frac_as_map = frac_as_map;
        self
    }

    #[must_use]
    pub fn with_array_type(mut self, array_type: ArrayType) -> Self {
        self.array_type = array_type;
        self
    }

    /// Share a spatial-reference memo with other extractions.
    #[must_use]
    pub fn with_crs_cache(mut self, cache: Arc<CrsCache>) -> Self {
        self.crs_cache = cache;
        self
    }

    #[must_use]
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(f64, &str) + Send + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Receive each spatial-reference mismatch found before processing.
    #[must_use]
    pub fn with_crs_warning_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&CrsWarning) + Send + 'static,
    {
        self.on_crs_warning = Some(Box::new(handler));
        self
    }

    fn writer(&self) -> Result<Box<dyn Writer>> {
        Ok(match &self.output {
            OutputTarget::Features => Box::new(JsonWriter::new().with_array_type(self.array_type)),
            OutputTarget::Frame => Box::new(FrameWriter::new().with_array_type(self.array_type)),
            OutputTarget::Dataset { path, format } => {
                let format = match format {
                    Some(format) => *format,
                    None => DatasetFormat::from_path(path)?,
                };
                Box::new(DatasetWriter::new(path.clone(), format))
            },
        })
    }
}

/// Compute zonal statistics of `rasters` over the features of `vector`.
///
/// # Errors
///
/// Returns an error if an input cannot be resolved, a stat request is
/// invalid, the grids cannot be aligned, or processing or writing fails.
/// Spatial-reference mismatches are logged as warnings and handed to the
/// handler set with [`ExtractOptions::with_crs_warning_handler`]; they never
/// fail the extraction.
pub fn extract(
    rasters: impl Into<RasterInput>,
    vector: impl Into<VectorInput>,
    stats: &[StatRequest],
    mut options: ExtractOptions,
) -> Result<ExtractOutput> {
    let values = resolve_rasters(rasters.into())?;
    let weights = match options.weights.take() {
        Some(weights) => resolve_rasters(weights)?,
        None => Vec::new(),
    };
    let features = resolve_vector(vector.into())?;
    info!(
        "Starting extraction: {} value raster(s), {} weighting raster(s), {} stat request(s)",
        values.len(),
        weights.len(),
        stats.len()
    );

    let ops = OperationBuilder::new()
        .with_frac_as_map(options.frac_as_map)
        .build(stats, &values, &weights)?;
    let warnings = crs::check(features.as_ref(), &ops, &options.crs_cache);
    if !warnings.is_empty() {
        info!("{} spatial reference mismatch(es) found", warnings.len());
    }
    if let Some(handler) = options.on_crs_warning.as_mut() {
        for warning in &warnings {
            handler(warning);
        }
    }

    let mut writer = options.writer()?;
    let processor = Processor::new(
        features.as_ref(),
        &ops,
        options.include_columns.clone(),
        ProcessorOptions {
            strategy: options.strategy,
            max_cells_in_memory: options.max_cells_in_memory,
            grid_tolerance: options.grid_tolerance,
            include_geometry: options.include_geometry,
        },
    )?;
    match options.progress.as_mut() {
        Some(progress) => processor.process(writer.as_mut(), progress.as_mut())?,
        None => processor.process(writer.as_mut(), &mut |_: f64, _: &str| {})?,
    }

    let output = writer.into_output()?;
    info!("Extraction finished: {} field(s) per record", ops.len());
    Ok(output)
}
