use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use arrow_array::{ArrayRef, Float64Array, RecordBatch};
use datafusion::prelude::{col, lit};
use geo_types::{Geometry, Rect};
use tempfile::TempDir;
use tiff::encoder::TiffEncoder;
use tiff::encoder::colortype::Gray32Float;
use tiff::tags::Tag;
use zonal_core::crs::{self, CrsCategory, CrsCache};
use zonal_core::operation::build;
use zonal_core::source::{
    Feature, MemoryFeatureSource, MemoryRaster, RasterInput, RasterSource, Record,
};
use zonal_core::writer::to_dataframe;
use zonal_core::{
    CustomStat, DatasetFormat, ExtractOptions, ExtractOutput, FieldValue, OutputTarget,
    StatInputs, StatRequest, Strategy, extract,
};

fn nine() -> MemoryRaster {
    let values: ArrayRef =
        Arc::new(Float64Array::from((1..=9).map(f64::from).collect::<Vec<_>>()));
    MemoryRaster::new(values, 3, 3).unwrap()
}

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Geometry<f64> {
    Geometry::Rect(Rect::new((x0, y0), (x1, y1)))
}

fn zones() -> MemoryFeatureSource {
    MemoryFeatureSource::new(vec![
        Record::new()
            .with_id(1i64)
            .with_geometry(square(0.5, 0.5, 2.5, 2.5))
            .with_property("name", "center"),
        Record::new()
            .with_id(2i64)
            .with_geometry(square(0.0, 0.0, 3.0, 3.0))
            .with_property("name", "all"),
    ])
}

fn stats(names: &[&str]) -> Vec<StatRequest> {
    names.iter().map(|name| StatRequest::from(*name)).collect()
}

fn features(output: ExtractOutput) -> Vec<Record> {
    match output {
        ExtractOutput::Features(records) => records,
        other => panic!("expected features, got {other:?}"),
    }
}

const GEOJSON_ZONES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "properties": {"name": "center"},
      "geometry": {
        "type": "Polygon",
        "coordinates": [[[0.5, 0.5], [2.5, 0.5], [2.5, 2.5], [0.5, 2.5], [0.5, 0.5]]]
      }
    }
  ]
}"#;

fn write_geotiff(path: &Path) {
    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    let mut image = encoder.new_image::<Gray32Float>(3, 3).unwrap();
    image
        .encoder()
        .write_tag(Tag::Unknown(33550), &[1.0f64, 1.0, 0.0][..])
        .unwrap();
    image
        .encoder()
        .write_tag(Tag::Unknown(33922), &[0.0f64, 0.0, 0.0, 0.0, 3.0, 0.0][..])
        .unwrap();
    let values: Vec<f32> = (1..=9u8).map(f32::from).collect();
    image.write_data(&values).unwrap();
}

/// Test the partially covered square over a 3x3 grid
#[test]
fn test_extract_partial_coverage() {
    let output = extract(
        nine(),
        zones(),
        &stats(&["count", "mean", "min", "max", "sum"]),
        ExtractOptions::new().with_include_columns(["name"]),
    )
    .unwrap();
    let records = features(output);
    assert_eq!(records.len(), 2);

    let center = &records[0];
    assert_eq!(center.fields(), vec!["name", "count", "mean", "min", "max", "sum"]);
    assert_eq!(center.get("name"), Some(&FieldValue::Text("center".into())));
    assert_eq!(center.get("count"), Some(&FieldValue::Float(4.0)));
    assert_eq!(center.get("mean"), Some(&FieldValue::Float(5.0)));
    assert_eq!(center.get("min"), Some(&FieldValue::Float(1.0)));
    assert_eq!(center.get("max"), Some(&FieldValue::Float(9.0)));
    assert_eq!(center.get("sum"), Some(&FieldValue::Float(20.0)));

    let all = &records[1];
    assert_eq!(all.get("count"), Some(&FieldValue::Float(9.0)));
    assert_eq!(all.get("sum"), Some(&FieldValue::Float(45.0)));
}

/// Test that every strategy produces the same records
#[test]
fn test_strategies_match() {
    let requests = stats(&["count", "mean", "majority", "variety"]);
    let run = |strategy: Strategy| {
        features(
            extract(
                nine(),
                zones(),
                &requests,
                ExtractOptions::new()
                    .with_include_columns(["name"])
                    .with_strategy(strategy)
                    .with_max_cells_in_memory(4),
            )
            .unwrap(),
        )
    };

    let expected = run(Strategy::FeatureSequential);
    for strategy in [Strategy::RasterSequential, Strategy::RasterParallel { threads: 2 }] {
        let mut records = run(strategy);
        records.sort_by_key(|record| record.get("name").map(ToString::to_string));
        let mut sorted = expected.clone();
        sorted.sort_by_key(|record| record.get("name").map(ToString::to_string));
        for (got, want) in records.iter().zip(&sorted) {
            assert_eq!(got.properties, want.properties, "strategy {strategy}");
        }
    }
}

/// Test field naming with several named value rasters
#[test]
fn test_named_rasters_prefix_fields() {
    let rasters = vec![
        RasterInput::named("a", nine()),
        RasterInput::named("b", nine()),
    ];
    let records = features(
        extract(rasters, zones(), &stats(&["count", "mean"]), ExtractOptions::new()).unwrap(),
    );
    assert_eq!(records[0].fields(), vec!["a_count", "a_mean", "b_count", "b_mean"]);
    assert_eq!(records[0].get("b_mean"), Some(&FieldValue::Float(5.0)));
}

/// Test weighted statistics with and without a weighting raster
#[test]
fn test_weighted_stats() {
    let err = extract(nine(), zones(), &stats(&["weighted_mean"]), ExtractOptions::new())
        .unwrap_err();
    assert!(err.to_string().contains("No weights provided"));

    let ones: ArrayRef = Arc::new(Float64Array::from(vec![1.0; 9]));
    let weights = MemoryRaster::new(ones, 3, 3).unwrap();
    let records = features(
        extract(
            nine(),
            zones(),
            &stats(&["weighted_mean", "mean"]),
            ExtractOptions::new().with_weights(weights),
        )
        .unwrap(),
    );
    assert_eq!(records[0].get("weighted_mean"), Some(&FieldValue::Float(5.0)));
    assert_eq!(records[0].get("weighted_mean"), records[0].get("mean"));
}

/// Test that parallel processing refuses weighted statistics
#[test]
fn test_parallel_rejects_weighted() {
    let ones: ArrayRef = Arc::new(Float64Array::from(vec![1.0; 9]));
    let weights = MemoryRaster::new(ones, 3, 3).unwrap();
    let err = extract(
        nine(),
        zones(),
        &stats(&["weighted_mean"]),
        ExtractOptions::new()
            .with_weights(weights)
            .with_strategy(Strategy::RasterParallel { threads: 2 }),
    )
    .unwrap_err();
    assert!(err.to_string().contains("Weighted operations are not supported"));
}

/// Test map output of class fractions
#[test]
fn test_frac_as_map() {
    let classes: ArrayRef = Arc::new(Float64Array::from(vec![1.0, 1.0, 2.0, 2.0]));
    let raster = MemoryRaster::new(classes, 2, 2).unwrap();
    let zone = MemoryFeatureSource::new(vec![
        Record::new().with_geometry(square(0.0, 0.0, 2.0, 2.0)),
    ]);
    let records = features(
        extract(
            raster,
            zone,
            &stats(&["frac"]),
            ExtractOptions::new().with_frac_as_map(true),
        )
        .unwrap(),
    );
    assert_eq!(records[0].fields(), vec!["frac"]);
    let Some(FieldValue::Map(map)) = records[0].get("frac") else {
        panic!("expected a map");
    };
    let entries = map.entries();
    assert_eq!(entries.len(), 2);
    for (key, value) in entries {
        assert!(matches!(key.as_f64(), Some(k) if k == 1.0 || k == 2.0));
        assert_eq!(value, FieldValue::Float(0.5));
    }
}

/// Test that mismatched references warn once per raster category
#[test]
fn test_crs_warns_once_per_category() {
    let features = MemoryFeatureSource::new(Vec::new()).with_spatial_reference("EPSG:4326");
    let utm: Arc<dyn RasterSource> =
        Arc::new(nine().with_name("a").with_spatial_reference("EPSG:32633"));
    let other: Arc<dyn RasterSource> =
        Arc::new(nine().with_name("b").with_spatial_reference("EPSG:3857"));
    let geographic: Arc<dyn RasterSource> =
        Arc::new(nine().with_name("w").with_spatial_reference("OGC:CRS84"));

    let ops = build(
        &stats(&["mean", "weighted_mean"]),
        &[Arc::clone(&utm), other],
        &[geographic],
    )
    .unwrap();
    let warnings = crs::check(&features, &ops, &CrsCache::new());
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category, CrsCategory::ValueRaster);
    assert_eq!(warnings[0].raster, "a");
    assert!(warnings[0].to_string().contains("EPSG:32633"));
}

/// Test that extraction hands mismatches to the warning handler
#[test]
fn test_extract_reports_crs_mismatch() {
    let zones = zones().with_spatial_reference("EPSG:4326");
    let raster = nine().with_name("dem").with_spatial_reference("EPSG:32633");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let records = features(
        extract(
            raster,
            zones,
            &stats(&["count"]),
            ExtractOptions::new().with_crs_warning_handler(move |warning| {
                sink.lock().unwrap().push(warning.clone());
            }),
        )
        .unwrap(),
    );
    assert_eq!(records.len(), 2);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].category, CrsCategory::ValueRaster);
    assert_eq!(seen[0].raster, "dem");
    assert_eq!(seen[0].raster_crs, "EPSG:32633");
}

/// Test custom statistics over one value raster and two weighting rasters
#[test]
fn test_custom_stats_with_recycled_value() {
    let covered = CustomStat::unweighted("covered", |inputs: &StatInputs| {
        Ok(FieldValue::Float(inputs.coverage.iter().sum()))
    });
    let weighted = CustomStat::weighted("wcovered", |inputs: &StatInputs| {
        let weights = inputs.weights.as_deref().unwrap_or_default();
        Ok(FieldValue::Float(
            inputs.coverage.iter().zip(weights).map(|(c, w)| c * w).sum(),
        ))
    });
    let constant = |value: f64| {
        let cells: ArrayRef = Arc::new(Float64Array::from(vec![value; 9]));
        MemoryRaster::new(cells, 3, 3).unwrap()
    };

    let records = features(
        extract(
            RasterInput::named("a", nine()),
            zones(),
            &[covered.into(), weighted.into()],
            ExtractOptions::new().with_weights(vec![
                RasterInput::named("w1", constant(1.0)),
                RasterInput::named("w2", constant(2.0)),
            ]),
        )
        .unwrap(),
    );
    let center = &records[0];
    assert_eq!(center.fields(), vec!["a_covered", "a_w1_wcovered", "a_w2_wcovered"]);
    assert_eq!(center.get("a_covered"), Some(&FieldValue::Float(4.0)));
    assert_eq!(center.get("a_w1_wcovered"), Some(&FieldValue::Float(4.0)));
    assert_eq!(center.get("a_w2_wcovered"), Some(&FieldValue::Float(8.0)));
}

/// Test progress reporting through the options
#[test]
fn test_progress_reaches_done() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    extract(
        nine(),
        zones(),
        &stats(&["mean"]),
        ExtractOptions::new().with_progress(move |fraction, message| {
            sink.lock().unwrap().push((fraction, message.to_string()));
        }),
    )
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&(1.0, "Done".to_string())));
    assert!(seen.windows(2).all(|pair| pair[0].0 <= pair[1].0));
}

/// Test a GeoJSON file and an ASCII grid read from disk
#[test]
fn test_file_inputs() {
    let dir = TempDir::new().unwrap();
    let zones_path = dir.path().join("zones.geojson");
    std::fs::write(&zones_path, GEOJSON_ZONES).unwrap();
    let grid_path = dir.path().join("grid.asc");
    std::fs::write(
        &grid_path,
        "ncols 3\nnrows 3\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n4 5 6\n7 8 9\n",
    )
    .unwrap();

    let records = features(
        extract(
            grid_path.as_path(),
            zones_path.as_path(),
            &stats(&["count", "mean"]),
            ExtractOptions::new().with_include_columns(["name"]),
        )
        .unwrap(),
    );
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("name"), Some(&FieldValue::Text("center".into())));
    assert_eq!(records[0].get("count"), Some(&FieldValue::Float(4.0)));
    assert_eq!(records[0].get("mean"), Some(&FieldValue::Float(5.0)));
}

/// Test a GeoTIFF read from disk
#[test]
fn test_geotiff_input() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dem.tif");
    write_geotiff(&path);

    let records = features(
        extract(
            path.as_path(),
            zones(),
            &stats(&["count", "mean", "max"]),
            ExtractOptions::new(),
        )
        .unwrap(),
    );
    assert_eq!(records[0].get("count"), Some(&FieldValue::Float(4.0)));
    assert_eq!(records[0].get("mean"), Some(&FieldValue::Float(5.0)));
    assert_eq!(records[0].get("max").and_then(FieldValue::as_f64), Some(9.0));
}

/// Test a missing raster path
#[test]
fn test_missing_raster_path() {
    let err = extract(
        "does/not/exist.tif",
        zones(),
        &stats(&["mean"]),
        ExtractOptions::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("exist.tif"));
}

/// Test frame output queried through DataFusion
#[tokio::test]
async fn test_frame_output() -> anyhow::Result<()> {
    let output = extract(
        nine(),
        zones(),
        &stats(&["count", "mean", "values"]),
        ExtractOptions::new()
            .with_include_columns(["name"])
            .with_include_geometry(true)
            .with_output(OutputTarget::Frame),
    )?;
    let ExtractOutput::Frame(batch) = output else {
        panic!("expected a frame");
    };
    assert_eq!(batch.num_rows(), 2);
    let schema = batch.schema();
    assert!(schema.field_with_name("geometry").is_ok());
    assert!(schema.field_with_name("values").is_ok());

    let df = to_dataframe(batch)?.filter(col("count").gt(lit(5.0)))?;
    let rows: Vec<RecordBatch> = df.collect().await?;
    let total: usize = rows.iter().map(RecordBatch::num_rows).sum();
    assert_eq!(total, 1);
    Ok(())
}

/// Test CSV file output
#[test]
fn test_dataset_output() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stats.csv");
    let output = extract(
        nine(),
        zones(),
        &stats(&["count", "max"]),
        ExtractOptions::new()
            .with_include_columns(["name"])
            .with_output(OutputTarget::Dataset {
                path: path.clone(),
                format: None,
            }),
    )
    .unwrap();
    assert!(matches!(output, ExtractOutput::Dataset(ref p) if *p == path));

    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("name,count,max"));
    let center: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(center[0], "center");
    assert_eq!(center[1].parse::<f64>().unwrap(), 4.0);
    assert_eq!(center[2].parse::<f64>().unwrap(), 9.0);
    assert_eq!(lines.count(), 1);

    assert_eq!(DatasetFormat::from_path(&path).unwrap(), DatasetFormat::Csv);
}
