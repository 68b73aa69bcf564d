//! Output writers.
//!
//! A writer receives one [`Record`] per feature and accumulates it in its
//! backend. Every writer shares the same schema discipline:
//!
//! - **eager**: a column or operation was declared before the first write.
//!   Records may only carry declared fields; missing ones are padded with
//!   [`FieldValue::Absent`].
//! - **lazy**: nothing was declared. A field seen for the first time becomes
//!   a new column, back-filled with `Absent` for rows already written.
//!
//! Before the schema check, fields marked with [`KEY_MARKER`] are folded
//! into the map field they describe.

mod dataset;
mod frame;
mod json;

use std::path::PathBuf;

use arrow_array::RecordBatch;

pub use dataset::{DatasetFormat, DatasetWriter};
pub use frame::{FrameWriter, records_to_batch, to_dataframe};
pub use json::JsonWriter;

use crate::error::{ConfigError, Result, WriterError};
use crate::operation::{KEY_MARKER, Operation};
use crate::source::Record;
use crate::value::{FieldValue, MapValue};

/// Accumulated result of a finished writer.
#[derive(Debug, Clone)]
pub enum WriterOutput {
    /// In-memory records
    Features(Vec<Record>),
    /// Tabular frame
    Frame(RecordBatch),
    /// Path of the written dataset
    Dataset(PathBuf),
}

/// Destination for result records.
pub trait Writer {
    /// Declare an include column.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::SchemaLocked`] after the first write.
    fn add_column(&mut self, name: &str) -> Result<()>;

    /// Declare that records carry a geometry.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::SchemaLocked`] after the first write.
    fn add_geometry(&mut self) -> Result<()>;

    /// Declare the field produced by an operation.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::SchemaLocked`] after the first write.
    fn add_operation(&mut self, op: &Operation) -> Result<()>;

    /// Add one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not fit the schema or the writer
    /// is finished.
    fn write(&mut self, record: Record) -> Result<()>;

    /// Flush buffered output. Calling it again has no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn finish(&mut self) -> Result<()>;

    /// Take the accumulated output.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::NotFinished`] before [`Writer::finish`].
    fn into_output(self: Box<Self>) -> Result<WriterOutput>;
}

/// How array-valued fields are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayType {
    /// Typed arrays, element type preserved
    #[default]
    Typed,
    /// Plain sequences
    List,
    /// Sorted sequences of distinct values
    Set,
}

impl ArrayType {
    /// Parse an option value.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "typed" | "array" => Ok(Self::Typed),
            "list" => Ok(Self::List),
            "set" => Ok(Self::Set),
            other => Err(ConfigError::InvalidOption {
                option: "array_type".to_string(),
                message: format!("'{other}' is not one of typed, list, set"),
            }
            .into()),
        }
    }

    /// Convert an array value. Other values pass through.
    #[must_use]
    pub fn apply(self, value: FieldValue) -> FieldValue {
        match (self, value) {
            (Self::List, value @ FieldValue::Array(_)) => value.into_list(),
            (Self::Set, value @ (FieldValue::Array(_) | FieldValue::List(_))) => value.into_set(),
            (_, value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaMode {
    Undecided,
    Eager,
    Lazy,
}

/// Field bookkeeping shared by the writers.
#[derive(Debug, Clone)]
pub(crate) struct RecordSchema {
    mode: SchemaMode,
    fields: Vec<String>,
    geometry: bool,
    rows: usize,
    finished: bool,
}

impl RecordSchema {
    pub(crate) fn new() -> Self {
        Self {
            mode: SchemaMode::Undecided,
            fields: Vec::new(),
            geometry: false,
            rows: 0,
            finished: false,
        }
    }

    pub(crate) fn fields(&self) -> &[String] {
        &self.fields
    }

    pub(crate) fn has_geometry(&self) -> bool {
        self.geometry
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn set_finished(&mut self) {
        self.finished = true;
    }

    fn check_open(&self, field: &str) -> Result<()> {
        if self.finished {
            return Err(WriterError::Finished.into());
        }
        if self.rows > 0 || self.mode == SchemaMode::Lazy {
            return Err(WriterError::SchemaLocked {
                field: field.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn declare(&mut self, name: &str) -> Result<()> {
        self.check_open(name)?;
        self.mode = SchemaMode::Eager;
        if !self.fields.iter().any(|field| field == name) {
            self.fields.push(name.to_string());
        }
        Ok(())
    }

    pub(crate) fn declare_geometry(&mut self) -> Result<()> {
        self.check_open("geometry")?;
        self.geometry = true;
        Ok(())
    }

    /// Declare an operation's output field. Key fields are folded away
    /// before records reach the schema, so they are not declared.
    pub(crate) fn declare_operation(&mut self, op: &Operation) -> Result<()> {
        if op.is_key() {
            return self.check_open(&op.field_name);
        }
        self.declare(&op.field_name)
    }

    /// Fix the columns from `record` when nothing was declared. Has no
    /// effect once the schema is decided.
    pub(crate) fn fix_from(&mut self, record: &Record) -> Result<()> {
        if self.mode != SchemaMode::Undecided {
            return Ok(());
        }
        for name in record.properties.keys() {
            self.declare(name)?;
        }
        self.mode = SchemaMode::Eager;
        Ok(())
    }

    /// Fold maps, check the record against the schema and reorder its
    /// properties to the column order. Returns the columns discovered by
    /// this record, which earlier rows must be back-filled with.
    pub(crate) fn accept(&mut self, record: &mut Record) -> Result<Vec<String>> {
        if self.finished {
            return Err(WriterError::Finished.into());
        }
        fold_maps(record)?;
        if self.mode == SchemaMode::Undecided {
            self.mode = SchemaMode::Lazy;
        }

        let mut discovered = Vec::new();
        for name in record.properties.keys() {
            if self.fields.iter().any(|field| field == name) {
                continue;
            }
            if self.mode == SchemaMode::Eager {
                return Err(WriterError::UnexpectedField {
                    field: name.clone(),
                    declared: self.fields.join(", "),
                }
                .into());
            }
            discovered.push(name.clone());
        }
        self.fields.extend(discovered.iter().cloned());

        let mut properties = std::mem::take(&mut record.properties);
        record.properties = self
            .fields
            .iter()
            .map(|name| {
                let value = properties.shift_remove(name).unwrap_or(FieldValue::Absent);
                (name.clone(), value)
            })
            .collect();
        self.rows += 1;
        Ok(discovered)
    }
}

/// Fold every `__key__F` field into field `F` as a map.
///
/// Records without key fields are left untouched, so folding an already
/// folded record has no effect.
///
/// # Errors
///
/// Returns [`WriterError::TypeMismatch`] if the key and value fields are
/// not arrays of the same length.
pub fn fold_maps(record: &mut Record) -> Result<()> {
    let keys: Vec<String> = record
        .properties
        .keys()
        .filter(|name| name.starts_with(KEY_MARKER))
        .cloned()
        .collect();

    for key_field in keys {
        let target = key_field[KEY_MARKER.len()..].to_string();
        let key_value = record.remove(&key_field).unwrap_or(FieldValue::Absent);
        let folded = match (key_value, record.properties.get(&target)) {
            (FieldValue::Array(keys), Some(FieldValue::Array(values))) => {
                if keys.len() != values.len() {
                    return Err(WriterError::TypeMismatch {
                        field: target,
                        expected: format!("{} map values", keys.len()),
                        found: format!("{} values", values.len()),
                    }
                    .into());
                }
                FieldValue::Map(MapValue {
                    keys,
                    values: values.clone(),
                })
            },
            (_, None | Some(FieldValue::Map(_))) | (FieldValue::Absent | FieldValue::Null, _) => {
                continue;
            },
            (keys, Some(values)) => {
                return Err(WriterError::TypeMismatch {
                    field: target,
                    expected: "array".to_string(),
                    found: format!("{} keys and {} values", keys.kind(), values.kind()),
                }
                .into());
            },
        };
        record.properties.insert(target, folded);
    }
    Ok(())
}
