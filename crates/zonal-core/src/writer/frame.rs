//! Tabular output as an Arrow record batch.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::compute::{cast, concat};
use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, ListArray, MapArray,
    RecordBatch, StringArray, StructArray, new_empty_array, new_null_array,
};
use arrow_schema::{DataType, Field, Fields, Schema};
use datafusion::dataframe::DataFrame;
use datafusion::prelude::SessionContext;
use geozero::{CoordDimensions, ToWkb};
use zonal_shared::FormatError;

use super::{ArrayType, RecordSchema, Writer, WriterOutput};
use crate::error::{Result, WriterError};
use crate::operation::Operation;
use crate::source::Record;
use crate::stats::StatKind;
use crate::value::{FieldValue, MapValue};

static ABSENT: FieldValue = FieldValue::Absent;

/// Name of the WKB geometry column.
pub const GEOMETRY_COLUMN: &str = "geometry";

/// Collects records and assembles them into one [`RecordBatch`] on finish.
///
/// Typed arrays become `List` columns of the raster element type and folded
/// maps become `Map` columns. Geometry is stored as WKB in a `geometry`
/// column.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    schema: RecordSchema,
    array_type: ArrayType,
    hints: HashMap<String, DataType>,
    records: Vec<Record>,
    batch: Option<RecordBatch>,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema: RecordSchema::new(),
            array_type: ArrayType::Typed,
            hints: HashMap::new(),
            records: Vec::new(),
            batch: None,
        }
    }

    #[must_use]
    pub fn with_array_type(mut self, array_type: ArrayType) -> Self {
        self.array_type = array_type;
        self
    }

    /// The assembled batch, once finished.
    #[must_use]
    pub fn batch(&self) -> Option<&RecordBatch> {
        self.batch.as_ref()
    }
}

/// Column type an operation produces, used when every row is null.
fn operation_hint(op: &Operation) -> Option<DataType> {
    let crate::operation::OperationKind::Builtin(def) = &op.kind else {
        return None;
    };
    let values = op.values.data_type();
    let integer = matches!(def.name, "variety" | "cell_id");
    let element = if integer || (def.preserves_type && values.is_integer()) {
        DataType::Int64
    } else {
        DataType::Float64
    };
    Some(match def.kind {
        StatKind::Scalar => element,
        StatKind::Array if def.preserves_type => list_type(values),
        StatKind::Array => list_type(element),
    })
}

fn list_type(element: DataType) -> DataType {
    DataType::List(Arc::new(Field::new("item", element, true)))
}

impl Writer for FrameWriter {
    fn add_column(&mut self, name: &str) -> Result<()> {
        self.schema.declare(name)
    }

    fn add_geometry(&mut self) -> Result<()> {
        self.schema.declare_geometry()
    }

    fn add_operation(&mut self, op: &Operation) -> Result<()> {
        self.schema.declare_operation(op)?;
        if let Some(hint) = operation_hint(op) {
            self.hints.insert(op.field_name.clone(), hint);
        }
        Ok(())
    }

    fn write(&mut self, mut record: Record) -> Result<()> {
        self.schema.accept(&mut record)?;
        for value in record.properties.values_mut() {
            let taken = std::mem::replace(value, FieldValue::Absent);
            *value = self.array_type.apply(taken);
        }
        self.records.push(record);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.schema.is_finished() {
            return Ok(());
        }
        let geometry = self.schema.has_geometry()
            || self.records.iter().any(|record| record.geometry.is_some());
        let batch = records_to_batch(self.schema.fields(), &self.records, geometry, &self.hints)?;
        self.batch = Some(batch);
        self.records.clear();
        self.schema.set_finished();
        Ok(())
    }

    fn into_output(self: Box<Self>) -> Result<WriterOutput> {
        match self.batch {
            Some(batch) => Ok(WriterOutput::Frame(batch)),
            None => Err(WriterError::NotFinished.into()),
        }
    }
}

/// Build a record batch from records whose properties follow `fields`.
///
/// Column types are inferred from the values: integers stay `Int64`, a mix
/// of integers and floats becomes `Float64`, typed arrays become `List`
/// columns of their element type and maps become `Map` columns. Absent and
/// null values are nulls. A column without any value takes its type from
/// `hints`, or `Utf8`.
///
/// # Errors
///
/// Returns [`WriterError::TypeMismatch`] for columns mixing incompatible
/// values, or an error if a geometry cannot be encoded.
pub fn records_to_batch(
    fields: &[String],
    records: &[Record],
    geometry: bool,
    hints: &HashMap<String, DataType>,
) -> Result<RecordBatch> {
    let mut schema_fields = Vec::with_capacity(fields.len() + 1);
    let mut columns = Vec::with_capacity(fields.len() + 1);

    for name in fields {
        let values: Vec<&FieldValue> = records
            .iter()
            .map(|record| record.properties.get(name).unwrap_or(&ABSENT))
            .collect();
        let column = build_column(name, &values, hints.get(name))?;
        schema_fields.push(Field::new(name, column.data_type().clone(), true));
        columns.push(column);
    }

    if geometry {
        let wkb = records
            .iter()
            .map(|record| {
                record
                    .geometry
                    .as_ref()
                    .map(|geometry| {
                        geometry
                            .to_wkb(CoordDimensions::xy())
                            .map_err(|e| FormatError::write(e.to_string(), "WKB geometry"))
                    })
                    .transpose()
            })
            .collect::<std::result::Result<Vec<Option<Vec<u8>>>, FormatError>>()?;
        let array: BinaryArray = wkb.iter().map(Option::as_deref).collect();
        schema_fields.push(Field::new(GEOMETRY_COLUMN, DataType::Binary, true));
        columns.push(Arc::new(array));
    }

    let schema = Arc::new(Schema::new(schema_fields));
    if columns.is_empty() {
        let options = arrow_array::RecordBatchOptions::new().with_row_count(Some(records.len()));
        return Ok(RecordBatch::try_new_with_options(schema, columns, &options)?);
    }
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Expose a batch as a `DataFusion` data frame.
///
/// # Errors
///
/// Returns an error if the batch cannot be registered.
pub fn to_dataframe(batch: RecordBatch) -> Result<DataFrame> {
    let ctx = SessionContext::new();
    Ok(ctx.read_batch(batch)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
    Array,
    Sequence,
    Map,
}

fn kind_of(value: &FieldValue) -> Option<ColumnKind> {
    match value {
        FieldValue::Absent | FieldValue::Null => None,
        FieldValue::Int(_) => Some(ColumnKind::Int),
        FieldValue::Float(_) => Some(ColumnKind::Float),
        FieldValue::Bool(_) => Some(ColumnKind::Bool),
        FieldValue::Text(_) => Some(ColumnKind::Text),
        FieldValue::Array(_) => Some(ColumnKind::Array),
        FieldValue::List(_) | FieldValue::Set(_) => Some(ColumnKind::Sequence),
        FieldValue::Map(_) => Some(ColumnKind::Map),
    }
}

fn mismatch(name: &str, expected: ColumnKind, found: &FieldValue) -> crate::error::ZonalError {
    WriterError::TypeMismatch {
        field: name.to_string(),
        expected: format!("{expected:?}").to_lowercase(),
        found: found.kind().to_string(),
    }
    .into()
}

fn build_column(name: &str, values: &[&FieldValue], hint: Option<&DataType>) -> Result<ArrayRef> {
    let mut kind: Option<ColumnKind> = None;
    for value in values {
        let Some(found) = kind_of(value) else {
            continue;
        };
        kind = match (kind, found) {
            (None, found) => Some(found),
            (Some(current), found) if current == found => Some(current),
            (Some(ColumnKind::Int | ColumnKind::Float), ColumnKind::Int | ColumnKind::Float) => {
                Some(ColumnKind::Float)
            },
            (Some(current), _) => return Err(mismatch(name, current, value)),
        };
    }

    let Some(kind) = kind else {
        let data_type = hint.cloned().unwrap_or(DataType::Utf8);
        return Ok(new_null_array(&data_type, values.len()));
    };

    let column: ArrayRef = match kind {
        ColumnKind::Int => Arc::new(values.iter().map(|v| v.as_i64()).collect::<Int64Array>()),
        ColumnKind::Float => Arc::new(values.iter().map(|v| v.as_f64()).collect::<Float64Array>()),
        ColumnKind::Bool => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    FieldValue::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        ColumnKind::Text => Arc::new(values.iter().map(|v| v.as_str()).collect::<StringArray>()),
        ColumnKind::Array => {
            let arrays: Vec<Option<&ArrayRef>> = values.iter().map(|v| v.as_array()).collect();
            list_column(name, &arrays)?
        },
        ColumnKind::Sequence => sequence_column(name, values)?,
        ColumnKind::Map => {
            let maps: Vec<Option<&MapValue>> = values
                .iter()
                .map(|v| match v {
                    FieldValue::Map(map) => Some(map),
                    _ => None,
                })
                .collect();
            map_column(name, &maps)?
        },
    };
    Ok(column)
}

/// Concatenate arrays of one element type. All-null arrays are cast to it;
/// any other type difference is a mismatch.
fn concat_as(name: &str, arrays: &[&ArrayRef], data_type: &DataType) -> Result<ArrayRef> {
    if arrays.is_empty() {
        return Ok(new_empty_array(data_type));
    }
    let mut aligned = Vec::with_capacity(arrays.len());
    for array in arrays {
        let array: &ArrayRef = array;
        if array.data_type() == data_type {
            aligned.push(Arc::clone(array));
        } else if array.data_type() == &DataType::Null {
            aligned.push(cast(array, data_type)?);
        } else {
            return Err(WriterError::TypeMismatch {
                field: name.to_string(),
                expected: format!("array of {data_type}"),
                found: format!("array of {}", array.data_type()),
            }
            .into());
        }
    }
    let refs: Vec<&dyn Array> = aligned.iter().map(AsRef::as_ref).collect();
    Ok(concat(&refs)?)
}

fn offsets_and_nulls<T>(
    items: &[Option<T>],
    len: impl Fn(&T) -> usize,
) -> (OffsetBuffer<i32>, NullBuffer) {
    let lengths = items.iter().map(|item| item.as_ref().map_or(0, &len));
    let validity: Vec<bool> = items.iter().map(Option::is_some).collect();
    (OffsetBuffer::from_lengths(lengths), NullBuffer::from(validity))
}

fn list_column(name: &str, arrays: &[Option<&ArrayRef>]) -> Result<ArrayRef> {
    let present: Vec<&ArrayRef> = arrays.iter().filter_map(|array| *array).collect();
    let element = present
        .iter()
        .map(|array| array.data_type())
        .find(|data_type| **data_type != DataType::Null)
        .map_or(DataType::Float64, Clone::clone);
    let values = concat_as(name, &present, &element)?;
    let (offsets, nulls) = offsets_and_nulls(arrays, |array| array.len());
    let field = Arc::new(Field::new("item", element, true));
    Ok(Arc::new(ListArray::try_new(field, offsets, values, Some(nulls))?))
}

/// Lists and sets of scalars become a `List` column of the inferred
/// element type.
fn sequence_column(name: &str, values: &[&FieldValue]) -> Result<ArrayRef> {
    let items: Vec<Option<&Vec<FieldValue>>> = values
        .iter()
        .map(|v| match v {
            FieldValue::List(items) | FieldValue::Set(items) => Some(items),
            _ => None,
        })
        .collect();
    let flat: Vec<&FieldValue> = items.iter().flatten().flat_map(|items| items.iter()).collect();
    let element_values = build_column(name, &flat, Some(&DataType::Float64))?;
    let element = element_values.data_type().clone();
    let (offsets, nulls) = offsets_and_nulls(&items, |items| items.len());
    let field = Arc::new(Field::new("item", element, true));
    Ok(Arc::new(ListArray::try_new(field, offsets, element_values, Some(nulls))?))
}

fn map_column(name: &str, maps: &[Option<&MapValue>]) -> Result<ArrayRef> {
    let present: Vec<&MapValue> = maps.iter().filter_map(|map| *map).collect();
    let (key_type, value_type) = present.first().map_or(
        (DataType::Float64, DataType::Float64),
        |map| (map.keys.data_type().clone(), map.values.data_type().clone()),
    );
    let keys = concat_as(name, &present.iter().map(|map| &map.keys).collect::<Vec<_>>(), &key_type)?;
    let values = concat_as(name, &present.iter().map(|map| &map.values).collect::<Vec<_>>(), &value_type)?;
    if keys.null_count() > 0 {
        return Err(WriterError::TypeMismatch {
            field: name.to_string(),
            expected: "map with non-null keys".to_string(),
            found: "null key".to_string(),
        }
        .into());
    }

    let entry_fields = Fields::from(vec![
        Field::new("keys", key_type, false),
        Field::new("values", value_type, true),
    ]);
    let entries = StructArray::try_new(entry_fields.clone(), vec![keys, values], None)?;
    let (offsets, nulls) = offsets_and_nulls(maps, |map| map.len());
    let field = Arc::new(Field::new("entries", DataType::Struct(entry_fields), false));
    Ok(Arc::new(MapArray::try_new(field, offsets, entries, Some(nulls), false)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Float64Type, Int32Type, Int64Type};
    use arrow_array::Int32Array;
    use geo_types::{Geometry, point};

    fn int_array(values: Vec<i32>) -> FieldValue {
        FieldValue::Array(Arc::new(Int32Array::from(values)))
    }

    #[test]
    fn test_scalar_columns() {
        let records = vec![
            Record::new()
                .with_property("id", 1i64)
                .with_property("mean", 2i64)
                .with_property("name", "a"),
            Record::new()
                .with_property("id", 2i64)
                .with_property("mean", 2.5)
                .with_property("name", FieldValue::Absent),
        ];
        let fields = vec!["id".to_string(), "mean".to_string(), "name".to_string()];
        let batch = records_to_batch(&fields, &records, false, &HashMap::new()).unwrap();

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(0).data_type(), &DataType::Int64);
        let mean = batch.column(1).as_primitive::<Float64Type>();
        assert_eq!(mean.value(0), 2.0);
        assert_eq!(mean.value(1), 2.5);
        assert!(batch.column(2).is_null(1));
    }

    #[test]
    fn test_typed_list_column() {
        let records = vec![
            Record::new().with_property("values", int_array(vec![1, 2])),
            Record::new().with_property("values", FieldValue::Null),
            Record::new().with_property("values", int_array(vec![3])),
        ];
        let batch =
            records_to_batch(&["values".to_string()], &records, false, &HashMap::new()).unwrap();

        let list = batch.column(0).as_list::<i32>();
        assert_eq!(list.value_type(), DataType::Int32);
        assert!(list.is_null(1));
        let third = list.value(2);
        assert_eq!(third.as_primitive::<Int32Type>().value(0), 3);
    }

    #[test]
    fn test_list_column_rejects_mixed_element_types() {
        let floats: ArrayRef = Arc::new(Float64Array::from(vec![1.5]));
        let records = vec![
            Record::new().with_property("f", int_array(vec![1, 2])),
            Record::new().with_property("f", floats),
        ];
        let err = records_to_batch(&["f".to_string()], &records, false, &HashMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ZonalError::Writer(WriterError::TypeMismatch { ref field, .. }) if field == "f"
        ));
        assert!(err.to_string().contains("Float64"));
    }

    #[test]
    fn test_list_column_accepts_null_typed_rows() {
        let empty: ArrayRef = Arc::new(arrow_array::NullArray::new(0));
        let records = vec![
            Record::new().with_property("f", empty),
            Record::new().with_property("f", int_array(vec![4])),
        ];
        let batch =
            records_to_batch(&["f".to_string()], &records, false, &HashMap::new()).unwrap();
        let list = batch.column(0).as_list::<i32>();
        assert_eq!(list.value_type(), DataType::Int32);
        assert_eq!(list.value(0).len(), 0);
        assert_eq!(list.value(1).as_primitive::<Int32Type>().value(0), 4);
    }

    #[test]
    fn test_map_column() {
        let mut writer = FrameWriter::new();
        let keys: ArrayRef = Arc::new(Int32Array::from(vec![1, 2]));
        let fracs: ArrayRef = Arc::new(Float64Array::from(vec![0.4, 0.6]));
        writer
            .write(
                Record::new()
                    .with_property("__key__frac", keys)
                    .with_property("frac", fracs),
            )
            .unwrap();
        writer.finish().unwrap();

        let batch = writer.batch().unwrap();
        assert!(matches!(batch.column(0).data_type(), DataType::Map(_, _)));
        let map = batch.column(0).as_map();
        assert_eq!(map.value_length(0), 2);
    }

    #[test]
    fn test_all_null_column_uses_hint() {
        let records = vec![Record::new().with_property("min", FieldValue::Null)];
        let hints = HashMap::from([("min".to_string(), DataType::Int64)]);
        let batch = records_to_batch(&["min".to_string()], &records, false, &hints).unwrap();
        assert_eq!(batch.column(0).data_type(), &DataType::Int64);
        assert_eq!(batch.column(0).null_count(), 1);
    }

    #[test]
    fn test_mixed_column_is_rejected() {
        let records = vec![
            Record::new().with_property("x", 1i64),
            Record::new().with_property("x", "one"),
        ];
        let err = records_to_batch(&["x".to_string()], &records, false, &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("Field 'x'"));
    }

    #[test]
    fn test_geometry_column_is_wkb() {
        let records = vec![
            Record::new()
                .with_geometry(Geometry::Point(point!(x: 1.0, y: 2.0)))
                .with_property("id", 1i64),
        ];
        let batch = records_to_batch(&["id".to_string()], &records, true, &HashMap::new()).unwrap();
        let geometry = batch.column_by_name(GEOMETRY_COLUMN).unwrap();
        // byte order, type and two coordinates
        assert_eq!(geometry.as_binary::<i32>().value(0).len(), 21);
    }

    #[test]
    fn test_list_array_type() {
        let mut writer = FrameWriter::new().with_array_type(ArrayType::List);
        writer
            .write(Record::new().with_property(
                "cell_id",
                FieldValue::Array(Arc::new(Int64Array::from(vec![4, 5]))),
            ))
            .unwrap();
        writer.finish().unwrap();
        let batch = writer.batch().unwrap().clone();
        let list = batch.column(0).as_list::<i32>();
        assert_eq!(list.value(0).as_primitive::<Int64Type>().values().to_vec(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_to_dataframe() {
        let records = vec![
            Record::new().with_property("mean", 1.5),
            Record::new().with_property("mean", 2.5),
        ];
        let batch =
            records_to_batch(&["mean".to_string()], &records, false, &HashMap::new()).unwrap();
        let df = to_dataframe(batch).unwrap();
        assert_eq!(df.count().await.unwrap(), 2);
    }
}
