//! Error types for zonal extraction.
//!
//! Errors are grouped by when they can occur: input-shape problems are found
//! while resolving sources, configuration problems while building operations
//! or starting the processor, and writer problems while streaming records.
//! Spatial-reference mismatches are never errors; see [`crate::crs`].

use std::path::PathBuf;
use thiserror::Error;

/// Boxed error type returned by custom statistic callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for zonal operations.
///
/// This is the root error type that encompasses all domain-specific errors.
/// It uses `#[error(transparent)]` to delegate display formatting to the
/// underlying error variants.
#[derive(Debug, Error)]
pub enum ZonalError {
    /// Input shape errors (unrecognized sources, ambiguous layers, rotated grids)
    #[error(transparent)]
    Input(#[from] InputError),

    /// Semantic configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Output writer errors
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// I/O errors (file read/write, path issues)
    #[error(transparent)]
    Io(#[from] IoError),

    /// Format parsing and serialization errors
    #[error(transparent)]
    Format(#[from] zonal_shared::FormatError),

    /// Arrow compute or layout errors
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),

    /// `DataFusion` errors when exposing results as a data frame
    #[error(transparent)]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// An error raised by a custom statistic, passed through unchanged
    #[error("{source}")]
    Callback {
        /// Name of the custom statistic that failed
        name: String,
        /// The error raised by the callback
        #[source]
        source: BoxError,
    },

    /// Generic errors from dependencies
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Input shape errors.
///
/// Raised while resolving raster and vector inputs, before any processing.
#[derive(Debug, Error)]
pub enum InputError {
    /// No adapter recognized the input
    #[error("Unrecognized {kind} input: {value}")]
    UnrecognizedInput {
        /// "raster" or "vector"
        kind: &'static str,
        /// Description of the offending value
        value: String,
    },

    /// A dataset with several layers was given without a layer selection
    #[error(
        "Dataset '{dataset}' contains {} layers ({}); select one with {}[layer]",
        layers.len(),
        layers.join(", "),
        dataset.display()
    )]
    AmbiguousLayer {
        /// The dataset path
        dataset: PathBuf,
        /// Available layer names
        layers: Vec<String>,
    },

    /// The selected layer does not exist
    #[error("Layer '{layer}' not found in '{dataset}'. Available layers: {}", available.join(", "))]
    LayerNotFound {
        /// The dataset path
        dataset: PathBuf,
        /// The requested layer
        layer: String,
        /// Available layer names
        available: Vec<String>,
    },

    /// The raster transform has rotation or shear terms
    #[error("Rotated raster '{name}' is not supported")]
    RotatedRaster {
        /// Raster name or path
        name: String,
    },

    /// Raster metadata is inconsistent
    #[error("Invalid raster '{name}': {message}")]
    InvalidRaster {
        /// Raster name or path
        name: String,
        /// Description of the problem
        message: String,
    },

    /// Value and weight lists cannot be paired
    #[error(
        "Cannot pair {values} value rasters with {weights} weighting rasters; \
         counts must match or one side must contain a single raster"
    )]
    MismatchedSourceCounts {
        /// Number of value rasters
        values: usize,
        /// Number of weighting rasters
        weights: usize,
    },

    /// Geometry type the coverage engine cannot process
    #[error("Unsupported geometry type: {geometry_type}")]
    UnsupportedGeometry {
        /// The geometry type name
        geometry_type: String,
    },

    /// A feature carries no geometry
    #[error("Feature {index} has no geometry")]
    MissingGeometry {
        /// Position of the feature in its source
        index: usize,
    },
}

/// Configuration errors.
///
/// These errors occur when options, stat requests or strategies are invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid option value
    #[error("Invalid {option} option: {message}")]
    InvalidOption {
        /// The option name
        option: String,
        /// Why it's invalid
        message: String,
    },

    /// Stat name not known to the engine
    #[error("Unknown stat '{name}'. Available stats: {available}")]
    UnknownStat {
        /// The requested stat
        name: String,
        /// Comma-separated list of stat names
        available: String,
    },

    /// Required option is missing
    #[error("Missing required option: {option}")]
    MissingRequired {
        /// The missing option name
        option: String,
    },

    /// A weighted operation was requested without weighting rasters
    #[error("No weights provided for weighted operation '{stat}'")]
    NoWeightsProvided {
        /// The stat or function name
        stat: String,
    },

    /// A custom statistic declared an unsupported number of arguments
    #[error("Custom statistic '{function}' must take 2 or 3 arguments, but declares {arity}")]
    InvalidArity {
        /// The function name
        function: String,
        /// The declared argument count
        arity: usize,
    },

    /// An operation cannot run under the selected strategy
    #[error("{kind} operations are not supported with strategy='{strategy}'")]
    StrategyIncompatible {
        /// "Weighted" or "Variance"
        kind: &'static str,
        /// Strategy name
        strategy: &'static str,
    },

    /// Value and weighting grids do not align
    #[error(
        "Incompatible extents: value raster '{value}' and weighting raster '{weight}' \
         are not aligned within grid tolerance {tolerance}"
    )]
    IncompatibleExtents {
        /// Value raster name
        value: String,
        /// Weighting raster name
        weight: String,
        /// Tolerance as a fraction of the smaller cell dimension
        tolerance: f64,
    },

    /// A substitute value cannot be represented in the raster type
    #[error("default_value {value} is out of range for raster data type {data_type}")]
    DefaultValueOutOfRange {
        /// The requested value
        value: f64,
        /// The raster element type
        data_type: String,
    },

    /// Two operations produce the same output field
    #[error("Duplicate output field '{name}'; use alias=stat(...) to rename one of them")]
    DuplicateField {
        /// The colliding field name
        name: String,
    },

    /// Options conflict with each other
    #[error("Conflicting options: {options}")]
    ConflictingOptions {
        /// Description of the conflicting options
        options: String,
    },
}

/// Writer errors.
#[derive(Debug, Error)]
pub enum WriterError {
    /// A record carried a field the writer was not told about
    #[error("Unexpected field '{field}' in record; declared fields: {declared}")]
    UnexpectedField {
        /// The unexpected field
        field: String,
        /// Comma-separated declared fields
        declared: String,
    },

    /// A declaration arrived after the first record
    #[error("Cannot declare field '{field}' after records have been written")]
    SchemaLocked {
        /// The field being declared
        field: String,
    },

    /// A write arrived after `finish`
    #[error("Writer is already finished")]
    Finished,

    /// Output was requested before `finish`
    #[error("Writer has not been finished")]
    NotFinished,

    /// A value cannot be stored in the column's type
    #[error("Field '{field}' cannot hold {found}: column type is {expected}")]
    TypeMismatch {
        /// The field name
        field: String,
        /// Column type
        expected: String,
        /// Offending value kind
        found: String,
    },
}

/// I/O related errors.
#[derive(Debug, Error)]
pub enum IoError {
    /// Failed to read from a file
    #[error("Failed to read {format} file '{path}': {source}")]
    Read {
        /// The format being read (e.g., "GeoTIFF", "GeoJSON")
        format: String,
        /// The file path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: BoxError,
    },

    /// Failed to write to a file
    #[error("Failed to write {format} file '{path}': {source}")]
    Write {
        /// The format being written
        format: String,
        /// The file path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: BoxError,
    },

    /// File was not found
    #[error("File not found: '{path}'")]
    FileNotFound {
        /// The missing file path
        path: PathBuf,
    },
}

/// Type alias for Results using `ZonalError`.
pub type Result<T> = std::result::Result<T, ZonalError>;

impl ZonalError {
    /// Get a user-friendly error message.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Input(e) => format!("Input error: {e}"),
            Self::Config(e) => format!("Configuration error: {e}"),
            Self::Writer(e) => format!("Output error: {e}"),
            Self::Io(e) => e.user_message(),
            Self::Format(e) => format!("Format error: {e}"),
            Self::Arrow(e) => format!("Arrow error: {e}"),
            Self::DataFusion(e) => format!("Query error: {e}"),
            Self::Callback { name, source } => format!("Custom statistic '{name}' failed: {source}"),
            Self::Other(e) => format!("Error: {e}"),
        }
    }

    /// Get recovery suggestions if available.
    #[must_use]
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Input(e) => e.recovery_suggestion(),
            Self::Config(e) => e.recovery_suggestion(),
            Self::Io(e) => e.recovery_suggestion(),
            _ => None,
        }
    }

    /// Check if this error is potentially recoverable by changing options.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Input(InputError::AmbiguousLayer { .. })
        )
    }
}

impl InputError {
    fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::AmbiguousLayer { .. } | Self::LayerNotFound { .. } => {
                Some("Append the layer name in brackets, e.g. 'dataset[layer]'.".to_string())
            },
            Self::RotatedRaster { .. } => {
                Some("Warp the raster to a north-up grid before extracting.".to_string())
            },
            Self::MismatchedSourceCounts { .. } => Some(
                "Pass one weighting raster per value raster, or a single raster for either side."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

impl ConfigError {
    fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownStat { .. } => {
                Some("Run 'zonal stats' to see all available stats.".to_string())
            },
            Self::StrategyIncompatible { .. } => {
                Some("Use strategy 'feature-sequential' or 'raster-sequential'.".to_string())
            },
            Self::NoWeightsProvided { .. } => {
                Some("Pass a weighting raster with --weights.".to_string())
            },
            _ => None,
        }
    }
}

impl IoError {
    fn user_message(&self) -> String {
        match self {
            Self::Read { format, path, .. } => {
                format!("Failed to read {} file: {}", format, path.display())
            },
            Self::Write { format, path, .. } => {
                format!("Failed to write {} file: {}", format, path.display())
            },
            Self::FileNotFound { path } => format!("File not found: {}", path.display()),
        }
    }

    fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::FileNotFound { .. } => {
                Some("Check that the file path is correct and the file exists.".to_string())
            },
            _ => None,
        }
    }
}

/// Extension trait for adding I/O context to errors.
pub trait IoErrorExt<T> {
    /// Add read context to an error.
    ///
    /// # Errors
    ///
    /// Returns an [`IoError::Read`] if the underlying operation fails.
    fn with_read_context(self, format: &str, path: impl Into<PathBuf>) -> Result<T>;

    /// Add write context to an error.
    ///
    /// # Errors
    ///
    /// Returns an [`IoError::Write`] if the underlying operation fails.
    fn with_write_context(self, format: &str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T, E> IoErrorExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_read_context(self, format: &str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| {
            ZonalError::Io(IoError::Read {
                format: format.to_string(),
                path: path.into(),
                source: Box::new(e),
            })
        })
    }

    fn with_write_context(self, format: &str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| {
            ZonalError::Io(IoError::Write {
                format: format.to_string(),
                path: path.into(),
                source: Box::new(e),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_weights_message() {
        let err: ZonalError = ConfigError::NoWeightsProvided {
            stat: "weighted_mean".to_string(),
        }
        .into();
        assert!(err.to_string().to_lowercase().contains("no weights provided"));
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_callback_error_is_verbatim() {
        let err = ZonalError::Callback {
            name: "my_stat".to_string(),
            source: "boom".into(),
        };
        assert_eq!(err.to_string(), "boom");
        assert!(err.user_message().contains("my_stat"));
    }

    #[test]
    fn test_ambiguous_layer_message() {
        let err = InputError::AmbiguousLayer {
            dataset: PathBuf::from("zones"),
            layers: vec!["a".to_string(), "b".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("2 layers"));
        assert!(message.contains("zones[layer]"));
    }

    #[test]
    fn test_strategy_message() {
        let err = ConfigError::StrategyIncompatible {
            kind: "Weighted",
            strategy: "raster-parallel",
        };
        assert_eq!(
            err.to_string(),
            "Weighted operations are not supported with strategy='raster-parallel'"
        );
    }

    #[test]
    fn test_read_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = result.with_read_context("GeoTIFF", "dem.tif").unwrap_err();
        assert!(err.to_string().contains("dem.tif"));
        assert!(err.user_message().starts_with("Failed to read GeoTIFF"));
    }
}
