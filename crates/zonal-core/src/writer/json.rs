//! In-memory feature output.

use geojson::FeatureCollection;

use super::{ArrayType, RecordSchema, Writer, WriterOutput};
use crate::error::{Result, WriterError};
use crate::operation::Operation;
use crate::source::Record;
use crate::value::FieldValue;

/// Collects result records in memory.
///
/// Records keep their geometry and ordered properties. Array-valued fields
/// are converted according to the writer's [`ArrayType`].
#[derive(Debug, Clone)]
pub struct JsonWriter {
    schema: RecordSchema,
    array_type: ArrayType,
    records: Vec<Record>,
}

impl Default for JsonWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema: RecordSchema::new(),
            array_type: ArrayType::Typed,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_array_type(mut self, array_type: ArrayType) -> Self {
        self.array_type = array_type;
        self
    }

    /// Records written so far.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Column names in output order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        self.schema.fields()
    }

    /// Render the records written so far as a GeoJSON feature collection.
    #[must_use]
    pub fn to_geojson(&self) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: self.records.iter().map(Record::to_geojson).collect(),
            foreign_members: None,
        }
    }
}

impl Writer for JsonWriter {
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
        let discovered = self.schema.accept(&mut record)?;
        if !discovered.is_empty() {
            for earlier in &mut self.records {
                for name in &discovered {
                    earlier.properties.insert(name.clone(), FieldValue::Absent);
                }
            }
        }

        for value in record.properties.values_mut() {
            let taken = std::mem::replace(value, FieldValue::Absent);
            *value = self.array_type.apply(taken);
        }
        self.records.push(record);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.schema.set_finished();
        Ok(())
    }

    fn into_output(self: Box<Self>) -> Result<WriterOutput> {
        if !self.schema.is_finished() {
            return Err(WriterError::NotFinished.into());
        }
        Ok(WriterOutput::Features(self.records))
    }
}
