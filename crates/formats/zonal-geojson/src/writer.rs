//! GeoJSON writer for result features.

use std::io::Write as IoWrite;

use geojson::{Feature, FeatureCollection};
use zonal_shared::{FormatError, FormatResult};

/// Options for GeoJSON writing
#[derive(Debug, Clone, Default)]
pub struct GeoJsonWriterOptions {
    /// Pretty-print the FeatureCollection (default: false)
    pub pretty: bool,
    /// Write one feature per line instead of a FeatureCollection (default: false)
    pub newline_delimited: bool,
}

impl GeoJsonWriterOptions {
    /// Create new writer options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pretty printing
    #[must_use]
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Set newline-delimited output
    #[must_use]
    pub fn with_newline_delimited(mut self, newline_delimited: bool) -> Self {
        self.newline_delimited = newline_delimited;
        self
    }
}

/// Write features as GeoJSON.
///
/// # Errors
///
/// Returns an error if serialization or writing to the output fails
pub fn write_feature_collection<W: IoWrite>(
    writer: &mut W,
    features: Vec<Feature>,
    options: &GeoJsonWriterOptions,
) -> FormatResult<()> {
    if options.newline_delimited {
        for feature in features {
            serde_json::to_writer(&mut *writer, &feature)
                .map_err(|e| FormatError::write(e.to_string(), "GeoJSON feature"))?;
            writer.write_all(b"\n")?;
        }
        return Ok(());
    }

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    let result = if options.pretty {
        serde_json::to_writer_pretty(&mut *writer, &collection)
    } else {
        serde_json::to_writer(&mut *writer, &collection)
    };
    result.map_err(|e| FormatError::write(e.to_string(), "GeoJSON FeatureCollection"))?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Write features to GeoJSON bytes
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn write_feature_collection_to_bytes(
    features: Vec<Feature>,
    options: &GeoJsonWriterOptions,
) -> FormatResult<Vec<u8>> {
    let mut buffer = Vec::new();
    write_feature_collection(&mut buffer, features, options)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geojson::{Geometry, JsonObject, Value};
    use serde_json::json;

    fn feature(mean: f64) -> Feature {
        let mut properties = JsonObject::new();
        properties.insert("mean".to_string(), json!(mean));
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::Point(vec![1.0, 2.0]))),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }
    }

    #[test]
    fn test_write_collection() {
        let bytes =
            write_feature_collection_to_bytes(vec![feature(1.5), feature(2.5)], &GeoJsonWriterOptions::default())
                .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed["type"], "FeatureCollection");
        assert_eq!(parsed["features"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["features"][1]["properties"]["mean"], 2.5);
    }

    #[test]
    fn test_write_newline_delimited() {
        let options = GeoJsonWriterOptions::new().with_newline_delimited(true);
        let bytes = write_feature_collection_to_bytes(vec![feature(1.0), feature(2.0)], &options).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|line| line.contains("\"Feature\"")));
    }

    #[test]
    fn test_write_empty_collection() {
        let bytes = write_feature_collection_to_bytes(Vec::new(), &GeoJsonWriterOptions::default()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed["features"].as_array().unwrap().is_empty());
    }
}
