//! Integration tests for CSV writer functionality

use std::fs;
use std::sync::Arc;

use arrow_array::{ArrayRef, BinaryArray, Float64Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use geozero::{CoordDimensions, ToWkb};
use tempfile::TempDir;
use zonal_csv::{CsvWriterOptions, write_csv};

fn point_wkb(x: f64, y: f64) -> Vec<u8> {
    geo_types::Geometry::Point(geo_types::Point::new(x, y))
        .to_wkb(CoordDimensions::xy())
        .unwrap()
}

#[test]
fn test_geometry_column_written_as_wkt() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("stats.csv");

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("mean", DataType::Float64, true),
        Field::new("geometry", DataType::Binary, true),
    ]));
    let wkb = [point_wkb(1.0, 2.0), point_wkb(3.0, 4.0)];
    let ids: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
    let means: ArrayRef = Arc::new(Float64Array::from(vec![5.5, 6.5]));
    let geoms: ArrayRef = Arc::new(BinaryArray::from_iter_values(wkb.iter()));
    let batch = RecordBatch::try_new(schema, vec![ids, means, geoms]).unwrap();

    let mut file = fs::File::create(&path).unwrap();
    write_csv(&mut file, &[batch], &CsvWriterOptions::default()).unwrap();
    drop(file);

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines[0], "id,mean,geometry");
    assert!(lines[1].starts_with("1,5.5,"));
    assert!(lines[1].contains("POINT(1 2)"));
    assert!(lines[2].contains("POINT(3 4)"));
}

#[test]
fn test_binary_column_kept_without_geometry_option() {
    let schema = Arc::new(Schema::new(vec![Field::new(
        "geometry",
        DataType::Binary,
        true,
    )]));
    let geoms: ArrayRef = Arc::new(BinaryArray::from_iter_values([point_wkb(0.0, 0.0)]));
    let batch = RecordBatch::try_new(schema, vec![geoms]).unwrap();

    let options = CsvWriterOptions::new().with_geometry_column(None);
    let flat = zonal_csv::flatten_batch(&batch, &options).unwrap();
    assert_eq!(flat.schema().field(0).data_type(), &DataType::Binary);
}
