//! CSV writer for converting Arrow record batches to CSV format

use std::io::Write as IoWrite;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_csv::WriterBuilder;
use arrow_schema::{DataType, Field, Schema};
use geozero::ToWkt;
use geozero::wkb::Wkb;
use zonal_shared::{FormatError, FormatResult};

/// Options for CSV writing
#[derive(Debug, Clone)]
pub struct CsvWriterOptions {
    /// Column delimiter (default: b',')
    pub delimiter: u8,
    /// Whether to write header row (default: true)
    pub has_header: bool,
    /// Null value representation (default: empty string)
    pub null_value: String,
    /// Name of a WKB column rendered as WKT (default: "geometry")
    pub geometry_column: Option<String>,
}

impl Default for CsvWriterOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            null_value: String::new(),
            geometry_column: Some("geometry".to_string()),
        }
    }
}

impl CsvWriterOptions {
    /// Create new writer options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set column delimiter
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set whether to write header row
    #[must_use]
    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    /// Set null value representation
    #[must_use]
    pub fn with_null_value(mut self, null_value: impl Into<String>) -> Self {
        self.null_value = null_value.into();
        self
    }

    /// Set the WKB geometry column, or `None` to write binary columns as-is
    #[must_use]
    pub fn with_geometry_column(mut self, column: Option<String>) -> Self {
        self.geometry_column = column;
        self
    }
}

/// Write record batches to CSV format
///
/// Nested columns (lists, maps) are rendered as text and the geometry
/// column is rendered as WKT.
///
/// # Errors
///
/// Returns an error if writing to the output fails or if CSV serialization fails
pub fn write_csv<W: IoWrite>(
    writer: &mut W,
    batches: &[RecordBatch],
    options: &CsvWriterOptions,
) -> FormatResult<()> {
    if batches.is_empty() {
        return Ok(());
    }

    let mut builder = WriterBuilder::new()
        .with_delimiter(options.delimiter)
        .with_header(options.has_header);

    if !options.null_value.is_empty() {
        builder = builder.with_null(options.null_value.clone());
    }

    let mut csv_writer = builder.build(writer);

    for batch in batches {
        let flat = flatten_batch(batch, options)?;
        csv_writer
            .write(&flat)
            .map_err(|e| FormatError::write(e.to_string(), "CSV"))?;
    }

    Ok(())
}

/// Write record batches to CSV bytes
///
/// # Errors
///
/// Returns an error if CSV serialization fails
pub fn write_csv_to_bytes(
    batches: &[RecordBatch],
    options: &CsvWriterOptions,
) -> FormatResult<Vec<u8>> {
    let mut buffer = Vec::new();
    write_csv(&mut buffer, batches, options)?;
    Ok(buffer)
}

/// Replace columns the CSV encoder cannot represent with text columns.
///
/// # Errors
///
/// Returns an error if a geometry value is not valid WKB
pub fn flatten_batch(batch: &RecordBatch, options: &CsvWriterOptions) -> FormatResult<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(schema.fields().len());

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let is_geometry = options.geometry_column.as_deref() == Some(field.name().as_str());
        let converted = match field.data_type() {
            DataType::Binary if is_geometry => Some(wkb_to_wkt(column)?),
            DataType::List(_)
            | DataType::LargeList(_)
            | DataType::FixedSizeList(_, _)
            | DataType::Map(_, _)
            | DataType::Struct(_) => Some(display_column(column)?),
            _ => None,
        };

        match converted {
            Some(array) => {
                fields.push(Field::new(field.name(), DataType::Utf8, true));
                columns.push(array);
            },
            None => {
                fields.push(field.as_ref().clone());
                columns.push(Arc::clone(column));
            },
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| FormatError::write(e.to_string(), "CSV batch"))
}

fn display_column(column: &ArrayRef) -> FormatResult<ArrayRef> {
    let formatter = ArrayFormatter::try_new(column.as_ref(), &FormatOptions::default())
        .map_err(|e| FormatError::write(e.to_string(), "CSV nested column"))?;
    let values: StringArray = (0..column.len())
        .map(|idx| (!column.is_null(idx)).then(|| formatter.value(idx).to_string()))
        .collect();
    Ok(Arc::new(values))
}

fn wkb_to_wkt(column: &ArrayRef) -> FormatResult<ArrayRef> {
    let binary = column.as_binary::<i32>();
    let values = binary
        .iter()
        .map(|value| {
            value
                .map(|bytes| {
                    Wkb(bytes.to_vec())
                        .to_wkt()
                        .map_err(|e| FormatError::write(e.to_string(), "CSV geometry column"))
                })
                .transpose()
        })
        .collect::<FormatResult<Vec<Option<String>>>>()?;
    Ok(Arc::new(StringArray::from(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::builder::{Float64Builder, Int32Builder, ListBuilder, MapBuilder};
    use arrow_array::{BooleanArray, Float64Array, Int64Array};

    fn create_test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("mean", DataType::Float64, true),
            Field::new("active", DataType::Boolean, true),
        ]));

        let id_array: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let name_array: ArrayRef =
            Arc::new(StringArray::from(vec![Some("Alice"), Some("Bob"), None]));
        let mean_array: ArrayRef =
            Arc::new(Float64Array::from(vec![Some(10.5), None, Some(30.2)]));
        let active_array: ArrayRef = Arc::new(BooleanArray::from(vec![
            Some(true),
            Some(false),
            Some(true),
        ]));

        RecordBatch::try_new(schema, vec![id_array, name_array, mean_array, active_array])
            .unwrap()
    }

    #[test]
    fn test_write_csv_with_header() {
        let batch = create_test_batch();
        let options = CsvWriterOptions::default();

        let result = write_csv_to_bytes(&[batch], &options).unwrap();
        let csv_str = String::from_utf8(result).unwrap();

        assert!(csv_str.starts_with("id,name,mean,active\n"));
        assert!(csv_str.contains("1,Alice,10.5,true"));
        assert!(csv_str.contains("2,Bob,,false"));
        assert!(csv_str.contains("3,,30.2,true"));
    }

    #[test]
    fn test_write_csv_custom_delimiter_and_null() {
        let batch = create_test_batch();
        let options = CsvWriterOptions::default()
            .with_delimiter(b';')
            .with_null_value("NULL");

        let result = write_csv_to_bytes(&[batch], &options).unwrap();
        let csv_str = String::from_utf8(result).unwrap();

        assert!(csv_str.starts_with("id;name;mean;active\n"));
        assert!(csv_str.contains("2;Bob;NULL;false"));
    }

    #[test]
    fn test_write_empty_batches() {
        let result = write_csv_to_bytes(&[], &CsvWriterOptions::default()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_list_column_is_rendered_as_text() {
        let mut builder = ListBuilder::new(Int32Builder::new());
        builder.values().append_value(1);
        builder.values().append_value(2);
        builder.append(true);
        builder.append(false);
        let values: ArrayRef = Arc::new(builder.finish());

        let ids: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));

        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("values", values.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(schema, vec![ids, values]).unwrap();

        let result = write_csv_to_bytes(&[batch], &CsvWriterOptions::default()).unwrap();
        let csv_str = String::from_utf8(result).unwrap();
        let lines: Vec<&str> = csv_str.lines().collect();

        assert_eq!(lines[0], "id,values");
        assert_eq!(lines[1], "1,\"[1, 2]\"");
        assert_eq!(lines[2], "2,");
    }

    #[test]
    fn test_map_column_is_flattened() {
        let mut builder = MapBuilder::new(None, Int32Builder::new(), Float64Builder::new());
        builder.keys().append_value(1);
        builder.values().append_value(0.25);
        builder.append(true).unwrap();
        let frac: ArrayRef = Arc::new(builder.finish());

        let schema = Arc::new(Schema::new(vec![Field::new(
            "frac",
            frac.data_type().clone(),
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![frac]).unwrap();

        let flat = flatten_batch(&batch, &CsvWriterOptions::default()).unwrap();
        assert_eq!(flat.schema().field(0).data_type(), &DataType::Utf8);
        assert!(!flat.column(0).is_null(0));
    }
}
