//! `zonal-core` computes zonal statistics: summaries of raster cells that
//! fall under vector features, weighted by how much of each cell the
//! feature covers.
//!
//! This crate includes:
//! - **Source adapters** (`source`): resolve paths, arrays and inline
//!   features into [`RasterSource`] and [`FeatureSource`] values.
//! - **Operation builder** (`operation`): expand stat requests across value
//!   and weighting rasters into uniquely named operations.
//! - **Statistic registry** (`stats`): the built-in statistics and their
//!   arguments.
//! - **CRS checker** (`crs`): warn when features and rasters disagree.
//! - **Engine** (`engine`): coverage fractions, cell accumulation and
//!   statistic evaluation.
//! - **Processor** (`processor`): feature- or raster-ordered traversal.
//! - **Writers** (`writer`): in-memory records, Arrow batches and files.
//!
//! [`extract`] ties these together.

pub mod crs;
pub mod engine;
pub mod error;
pub mod extract;
pub mod grid;
pub mod operation;
pub mod processor;
pub mod source;
pub mod stats;
pub mod value;
pub mod writer;

pub use crs::{CrsCache, CrsWarning};
pub use error::{Result, ZonalError};
pub use extract::{ExtractOptions, ExtractOutput, OutputTarget, extract};
pub use operation::{CustomStat, Operation, StatInputs, StatRequest};
pub use processor::{Strategy, process};
pub use source::{FeatureSource, RasterInput, RasterSource, Record, VectorInput};
pub use value::FieldValue;
pub use writer::{ArrayType, DatasetFormat, Writer, WriterOutput};
