//! CSV output for zonal result tables.

pub mod writer;

pub use writer::{CsvWriterOptions, flatten_batch, write_csv, write_csv_to_bytes};
