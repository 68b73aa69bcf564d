//! File output: GeoJSON feature collections and CSV tables.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};

use log::debug;
use zonal_csv::{CsvWriterOptions, write_csv};
use zonal_geojson::{GeoJsonWriterOptions, write_feature_collection};

use super::frame::records_to_batch;
use super::{RecordSchema, Writer, WriterOutput, fold_maps};
use crate::error::{ConfigError, IoErrorExt, Result, WriterError};
use crate::operation::Operation;
use crate::source::Record;
use crate::value::FieldValue;

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    GeoJson,
    Csv,
}

impl DatasetFormat {
    /// Parse a format name.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "geojson" | "json" => Ok(Self::GeoJson),
            "csv" => Ok(Self::Csv),
            other => Err(ConfigError::InvalidOption {
                option: "format".to_string(),
                message: format!("'{other}' is not one of geojson, csv"),
            }
            .into()),
        }
    }

    /// Format implied by a file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the extension is missing or unknown.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|ext| ext.to_str()).ok_or_else(|| {
            ConfigError::InvalidOption {
                option: "output".to_string(),
                message: format!("cannot infer a format from '{}'", path.display()),
            }
        })?;
        Self::parse(extension)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeoJson => "GeoJSON",
            Self::Csv => "CSV",
        }
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes records to a GeoJSON or CSV file.
///
/// Without declarations the columns are fixed by the first record. Records
/// are buffered and the file is written on [`Writer::finish`].
#[derive(Debug)]
pub struct DatasetWriter {
    path: PathBuf,
    format: DatasetFormat,
    schema: RecordSchema,
    records: Vec<Record>,
    csv_options: CsvWriterOptions,
    geojson_options: GeoJsonWriterOptions,
}

impl DatasetWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, format: DatasetFormat) -> Self {
        Self {
            path: path.into(),
            format,
            schema: RecordSchema::new(),
            records: Vec::new(),
            csv_options: CsvWriterOptions::default(),
            geojson_options: GeoJsonWriterOptions::default(),
        }
    }

    /// Writer whose format follows the file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the extension is not a known format.
    pub fn for_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = DatasetFormat::from_path(&path)?;
        Ok(Self::new(path, format))
    }

    #[must_use]
    pub fn with_csv_options(mut self, options: CsvWriterOptions) -> Self {
        self.csv_options = options;
        self
    }

    #[must_use]
    pub fn with_geojson_options(mut self, options: GeoJsonWriterOptions) -> Self {
        self.geojson_options = options;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self) -> Result<()> {
        let format = self.format.as_str();
        let file = File::create(&self.path).with_write_context(format, &self.path)?;
        let mut out = BufWriter::new(file);

        match self.format {
            DatasetFormat::GeoJson => {
                let features = self.records.iter().map(Record::to_geojson).collect();
                write_feature_collection(&mut out, features, &self.geojson_options)?;
            },
            DatasetFormat::Csv => {
                let geometry = self.schema.has_geometry()
                    || self.records.iter().any(|record| record.geometry.is_some());
                let batch =
                    records_to_batch(self.schema.fields(), &self.records, geometry, &HashMap::new())?;
                write_csv(&mut out, &[batch], &self.csv_options)?;
            },
        }
        out.flush().with_write_context(format, &self.path)?;
        Ok(())
    }
}

impl Writer for DatasetWriter {
    fn add_column(&mut self, name: &str) -> Result<()> {
        self.schema.declare(name)
    }

    fn add_geometry(&mut self) -> Result<()> {
        self.schema.declare_geometry()
    }

    fn add_operation(&mut self, op: &Operation) -> Result<()> {
        self.schema.declare_operation(op)
    }

    fn write(&mut self, mut record: Record) -> Result<()> {
        if self.schema.is_finished() {
            return Err(WriterError::Finished.into());
        }
        fold_maps(&mut record)?;
        self.schema.fix_from(&record)?;
        self.schema.accept(&mut record)?;
        for value in record.properties.values_mut() {
            if value.is_absent() {
                *value = FieldValue::Null;
            }
        }
        self.records.push(record);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.schema.is_finished() {
            return Ok(());
        }
        self.write_file()?;
        debug!(
            "Wrote {} records to {} file '{}'",
            self.records.len(),
            self.format,
            self.path.display()
        );
        self.records.clear();
        self.schema.set_finished();
        Ok(())
    }

    fn into_output(self: Box<Self>) -> Result<WriterOutput> {
        if !self.schema.is_finished() {
            return Err(WriterError::NotFinished.into());
        }
        Ok(WriterOutput::Dataset(self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Feature;
    use geo_types::{Geometry, point};
    use tempfile::TempDir;

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            DatasetFormat::from_path(Path::new("out.geojson")).unwrap(),
            DatasetFormat::GeoJson
        );
        assert_eq!(DatasetFormat::from_path(Path::new("OUT.CSV")).unwrap(), DatasetFormat::Csv);
        assert!(DatasetFormat::from_path(Path::new("out.shp")).is_err());
        assert!(DatasetFormat::from_path(Path::new("out")).is_err());
    }

    #[test]
    fn test_schema_fixed_by_first_record() {
        let dir = TempDir::new().unwrap();
        let mut writer = DatasetWriter::new(dir.path().join("out.csv"), DatasetFormat::Csv);
        writer
            .write(Record::new().with_property("id", 1i64).with_property("mean", 2.0))
            .unwrap();
        writer.write(Record::new().with_property("id", 2i64)).unwrap();
        let err = writer
            .write(Record::new().with_property("extra", 1i64))
            .unwrap_err();
        assert!(err.to_string().contains("Unexpected field 'extra'"));
        assert_eq!(writer.records[1].get("mean"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_write_csv_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = DatasetWriter::for_path(&path).unwrap();
        writer.add_column("id").unwrap();
        writer.add_geometry().unwrap();
        writer
            .write(
                Record::new()
                    .with_geometry(Geometry::Point(point!(x: 1.0, y: 2.0)))
                    .with_property("id", 7i64),
            )
            .unwrap();
        writer.finish().unwrap();
        writer.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("id,geometry\n"));
        assert!(content.lines().nth(1).unwrap().starts_with("7,POINT"));
        let output = Box::new(writer).into_output().unwrap();
        assert!(matches!(output, WriterOutput::Dataset(p) if p == path));
    }

    #[test]
    fn test_write_geojson_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.geojson");
        let mut writer = DatasetWriter::for_path(&path).unwrap();
        writer
            .write(Record::new().with_id(1i64).with_property("count", 4.0))
            .unwrap();
        writer.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["features"][0]["properties"]["count"], 4.0);
    }
}
