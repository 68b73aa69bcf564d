//! GeoJSON reading and writing for zonal feature inputs and result datasets.

pub mod parser;
pub mod writer;

pub use parser::{FeatureRecord, parse_geojson_bytes, parse_geojson_value};
pub use writer::{GeoJsonWriterOptions, write_feature_collection, write_feature_collection_to_bytes};
