//! GeoJSON parsing helpers for feature inputs.
#![allow(clippy::result_large_err)]

use std::convert::TryInto;

use geo_types::Geometry;
use geojson::{
    Feature, FeatureCollection, GeoJson, Geometry as GeoJsonGeometry, JsonObject, JsonValue,
    feature::Id,
};
use zonal_shared::{FormatError, FormatResult, SourcePosition};

/// Parsed GeoJSON feature with materialized id, properties and geometry.
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    pub id: Option<JsonValue>,
    pub properties: JsonObject,
    pub geometry: Option<Geometry<f64>>,
}

/// Parse raw bytes into a vector of `FeatureRecord`s.
///
/// Accepts a FeatureCollection, a single Feature or Geometry, or a
/// newline-delimited GeoJSON sequence.
pub fn parse_geojson_bytes(
    bytes: &[u8],
    limit: Option<usize>,
    context: impl Into<String>,
) -> FormatResult<Vec<FeatureRecord>> {
    let context = context.into();
    let reader = std::io::Cursor::new(bytes);

    match GeoJson::from_reader(reader) {
        Ok(geojson) => geojson_to_records(geojson, limit, &context),
        Err(primary_err) => {
            let primary_err_message = primary_err.to_string();
            match parse_geojson_sequence(bytes, limit, &context) {
                Ok(records) => Ok(records),
                Err(sequence_err) => {
                    Err(combine_errors(&primary_err_message, &sequence_err, context))
                },
            }
        },
    }
}

/// Parse an in-memory JSON value into feature records.
///
/// Besides regular GeoJSON objects this accepts plain mappings carrying a
/// `geometry` key, and arrays of either. Properties of a plain mapping are
/// its `properties` object when present, otherwise every other key.
pub fn parse_geojson_value(
    value: JsonValue,
    context: impl Into<String>,
) -> FormatResult<Vec<FeatureRecord>> {
    let context = context.into();
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                JsonValue::Object(object) => mapping_to_record(object, &context),
                other => Err(FormatError::Parse {
                    message: format!("expected a feature mapping, found {}", describe_value(&other)),
                    position: Some(SourcePosition {
                        feature: Some(idx as u64),
                        ..SourcePosition::default()
                    }),
                    context: Some(context.clone()),
                }),
            })
            .collect(),
        JsonValue::Object(object) => {
            let is_geojson_type = object
                .get("type")
                .and_then(JsonValue::as_str)
                .is_some_and(|kind| kind == "FeatureCollection" || !object.contains_key("geometry"));
            if is_geojson_type {
                let geojson = GeoJson::from_json_object(object)
                    .map_err(|err| FormatError::parse(err.to_string(), context.clone()))?;
                geojson_to_records(geojson, None, &context)
            } else if object.contains_key("geometry") {
                Ok(vec![mapping_to_record(object, &context)?])
            } else {
                Err(FormatError::parse(
                    "mapping has no 'geometry' key",
                    context,
                ))
            }
        },
        other => Err(FormatError::parse(
            format!("cannot read features from a JSON {}", describe_value(&other)),
            context,
        )),
    }
}

fn mapping_to_record(object: JsonObject, context: &str) -> FormatResult<FeatureRecord> {
    if object.get("type").and_then(JsonValue::as_str) == Some("Feature") {
        let feature = Feature::from_json_object(object)
            .map_err(|err| FormatError::parse(err.to_string(), context))?;
        return feature_to_record(feature);
    }

    let mut object = object;
    let geometry = match object.remove("geometry") {
        None | Some(JsonValue::Null) => None,
        Some(value) => {
            let geometry = GeoJsonGeometry::from_json_value(value)
                .map_err(|err| FormatError::parse(err.to_string(), context))?;
            Some(convert_geometry(geometry, context)?)
        },
    };
    let id = object.remove("id");
    let properties = match object.remove("properties") {
        Some(JsonValue::Object(properties)) => properties,
        _ => {
            object.remove("type");
            object
        },
    };

    Ok(FeatureRecord {
        id,
        properties,
        geometry,
    })
}

fn geojson_to_records(
    geojson: GeoJson,
    limit: Option<usize>,
    context: &str,
) -> FormatResult<Vec<FeatureRecord>> {
    let mut records = match geojson {
        GeoJson::FeatureCollection(collection) => feature_collection_to_records(collection)?,
        GeoJson::Feature(feature) => vec![feature_to_record(feature)?],
        GeoJson::Geometry(geometry) => {
            let geometry = convert_geometry(geometry, context)?;
            vec![FeatureRecord {
                id: None,
                properties: JsonObject::new(),
                geometry: Some(geometry),
            }]
        },
    };

    if let Some(max) = limit
        && records.len() > max
    {
        records.truncate(max);
    }
    Ok(records)
}

fn feature_collection_to_records(collection: FeatureCollection) -> FormatResult<Vec<FeatureRecord>> {
    collection
        .features
        .into_iter()
        .map(feature_to_record)
        .collect()
}

fn feature_to_record(feature: Feature) -> FormatResult<FeatureRecord> {
    let geometry = match feature.geometry {
        Some(geometry) => Some(convert_geometry(geometry, "feature")?),
        None => None,
    };

    let id = feature.id.map(|id| match id {
        Id::String(s) => JsonValue::String(s),
        Id::Number(n) => JsonValue::Number(n),
    });

    Ok(FeatureRecord {
        id,
        properties: feature.properties.unwrap_or_default(),
        geometry,
    })
}

fn convert_geometry(geometry: GeoJsonGeometry, context: &str) -> FormatResult<Geometry<f64>> {
    geometry.try_into().map_err(|err| FormatError::Parse {
        message: format!("Failed to convert GeoJSON geometry: {err}"),
        position: None,
        context: Some(context.to_string()),
    })
}

fn parse_geojson_sequence(
    bytes: &[u8],
    limit: Option<usize>,
    context: &str,
) -> FormatResult<Vec<FeatureRecord>> {
    let line_error = |line: u64, message: String| FormatError::Parse {
        message,
        position: Some(SourcePosition::line(line)),
        context: Some(context.to_string()),
    };

    let mut records = Vec::new();
    let lines = bytes
        .split(|b| *b == b'\n')
        .zip(1_u64..)
        .map(|(raw, line)| (std::str::from_utf8(raw), line));

    for (text, line) in lines {
        let text = text
            .map_err(|err| line_error(line, format!("GeoJSON line is not valid UTF-8: {err}")))?
            .trim();
        if text.is_empty() {
            continue;
        }

        let geojson = text
            .parse::<GeoJson>()
            .map_err(|err| line_error(line, format!("Failed to parse GeoJSON feature: {err}")))?;
        records.extend(geojson_to_records(geojson, None, context)?);

        if limit.is_some_and(|max| records.len() >= max) {
            break;
        }
    }

    if let Some(max) = limit {
        records.truncate(max);
    }
    if records.is_empty() {
        return Err(FormatError::parse("No GeoJSON features found", context));
    }
    Ok(records)
}

fn combine_errors(collection_err: &str, sequence_err: &FormatError, context: String) -> FormatError {
    let message = format!(
        "Failed to parse GeoJSON as FeatureCollection ({collection_err}); \
         also failed to parse as GeoJSON sequence: {sequence_err}"
    );
    FormatError::Parse {
        message,
        position: None,
        context: Some(context),
    }
}

/// Describe a JSON value kind for error messages.
pub(crate) fn describe_value(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_feature_collection_keeps_ids() {
        let data = br#"{
  "type": "FeatureCollection",
  "features": [
    {"type":"Feature","id":7,"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{"name":"A"}},
    {"type":"Feature","id":"b","geometry":null,"properties":{"value":42}}
  ]
}"#;

        let records = parse_geojson_bytes(data, None, "test").expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(json!(7)));
        assert_eq!(records[1].id, Some(json!("b")));
        assert!(records[0].geometry.is_some());
        assert_eq!(records[0].properties.get("name").unwrap(), "A");
        assert!(records[1].geometry.is_none());
    }

    #[test]
    fn limit_truncates_zone_collection() {
        let data = br#"{
  "type": "FeatureCollection",
  "features": [
    {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{"zone":"a"}},
    {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[1,1],[2,1],[2,2],[1,1]]]},"properties":{"zone":"b"}},
    {"type":"Feature","geometry":{"type":"Polygon","coordinates":[[[2,2],[3,2],[3,3],[2,2]]]},"properties":{"zone":"c"}}
  ]
}"#;

        let records = parse_geojson_bytes(data, Some(2), "zones").expect("parse");
        let zones: Vec<_> = records
            .iter()
            .map(|record| record.properties["zone"].clone())
            .collect();
        assert_eq!(zones, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn bare_geometry_becomes_record_without_properties() {
        let data = br#"{"type":"Polygon","coordinates":[[[0,0],[4,0],[4,4],[0,4],[0,0]]]}"#;

        let records = parse_geojson_bytes(data, None, "zones").expect("parse");
        assert_eq!(records.len(), 1);
        assert!(records[0].id.is_none());
        assert!(records[0].properties.is_empty());
        assert!(matches!(records[0].geometry, Some(Geometry::Polygon(_))));
    }

    #[test]
    fn sequence_skips_blank_lines_and_honours_limit() {
        let data = br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]},"properties":{"zone":1}}

{"type":"Feature","geometry":{"type":"Point","coordinates":[1,1]},"properties":{"zone":2}}
{"type":"Feature","geometry":{"type":"Point","coordinates":[2,2]},"properties":{"zone":3}}
"#;

        assert_eq!(parse_geojson_bytes(data, None, "seq").expect("sequence").len(), 3);
        assert_eq!(parse_geojson_bytes(data, Some(2), "seq").expect("sequence").len(), 2);
    }

    #[test]
    fn sequence_reports_failing_line() {
        let data = b"{\"type\":\"Point\",\"coordinates\":[0,0]}\n{oops}\n";
        let err = parse_geojson_bytes(data, None, "seq").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn parse_empty_sequence_fails() {
        let err = parse_geojson_bytes(b"\n\n\n", None, "empty").unwrap_err();
        match err {
            FormatError::Parse { message, .. } => {
                assert!(message.contains("No GeoJSON features found"));
            },
            _ => panic!("Expected Parse error"),
        }
    }

    #[test]
    fn parse_invalid_json_combines_errors() {
        let err = parse_geojson_bytes(b"not valid json at all", None, "invalid").unwrap_err();
        match err {
            FormatError::Parse {
                message, context, ..
            } => {
                assert!(message.contains("Failed to parse GeoJSON as FeatureCollection"));
                assert!(message.contains("also failed to parse as GeoJSON sequence"));
                assert_eq!(context.as_deref(), Some("invalid"));
            },
            _ => panic!("Expected Parse error"),
        }
    }

    #[test]
    fn parse_value_list_of_plain_mappings() {
        let value = json!([
            {"id": 1, "geometry": {"type": "Point", "coordinates": [0, 0]}, "name": "x"},
            {"geometry": {"type": "Point", "coordinates": [1, 1]}, "properties": {"name": "y"}}
        ]);

        let records = parse_geojson_value(value, "inline").expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(json!(1)));
        assert_eq!(records[0].properties.get("name").unwrap(), "x");
        assert!(!records[0].properties.contains_key("geometry"));
        assert_eq!(records[1].properties.get("name").unwrap(), "y");
    }

    #[test]
    fn parse_value_feature_collection() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0, 0]}, "properties": {}}
            ]
        });

        let records = parse_geojson_value(value, "inline").expect("parse");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn parse_value_rejects_scalars() {
        let err = parse_geojson_value(json!(3), "inline").unwrap_err();
        assert!(err.to_string().contains("JSON number"));
    }

    #[test]
    fn parse_value_rejects_non_mapping_items() {
        let err = parse_geojson_value(json!([1]), "inline").unwrap_err();
        assert!(err.to_string().contains("feature 0"));
    }

    #[test]
    fn describe_value_kinds() {
        assert_eq!(describe_value(&JsonValue::Null), "null");
        assert_eq!(describe_value(&json!([])), "array");
        assert_eq!(describe_value(&json!({})), "object");
    }
}
