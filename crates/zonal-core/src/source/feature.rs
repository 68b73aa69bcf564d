//! Features and result records.

use geo_types::Geometry;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use zonal_geojson::FeatureRecord;

use crate::value::FieldValue;

/// Read/write access to a single feature.
pub trait Feature {
    /// Value of a property, if present.
    fn get(&self, name: &str) -> Option<&FieldValue>;

    /// Set a property, appending it when new.
    fn set(&mut self, name: &str, value: FieldValue);

    /// Geometry, if the feature has one.
    fn geometry(&self) -> Option<&Geometry<f64>>;

    /// Property names in order.
    fn fields(&self) -> Vec<&str>;

    /// Feature identifier, if any.
    fn id(&self) -> Option<&FieldValue>;
}

/// A feature with ordered properties. Used both for input features and for
/// the records written by the processor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub id: Option<FieldValue>,
    pub geometry: Option<Geometry<f64>>,
    pub properties: IndexMap<String, FieldValue>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry<f64>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<FieldValue>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Remove a property, keeping the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.properties.shift_remove(name)
    }

    /// Render as a GeoJSON feature. Absent values are dropped.
    #[must_use]
    pub fn to_geojson(&self) -> geojson::Feature {
        let properties: serde_json::Map<String, JsonValue> = self
            .properties
            .iter()
            .filter(|(_, value)| !value.is_absent())
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        let id = self.id.as_ref().and_then(|id| match id {
            FieldValue::Int(v) => Some(geojson::feature::Id::Number((*v).into())),
            FieldValue::Text(v) => Some(geojson::feature::Id::String(v.clone())),
            _ => None,
        });
        geojson::Feature {
            bbox: None,
            geometry: self.geometry.as_ref().map(geojson::Geometry::from),
            id,
            properties: Some(properties),
            foreign_members: None,
        }
    }
}

impl Feature for Record {
    fn get(&self, name: &str) -> Option<&FieldValue> {
        self.properties.get(name)
    }

    fn set(&mut self, name: &str, value: FieldValue) {
        self.properties.insert(name.to_string(), value);
    }

    fn geometry(&self) -> Option<&Geometry<f64>> {
        self.geometry.as_ref()
    }

    fn fields(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    fn id(&self) -> Option<&FieldValue> {
        self.id.as_ref()
    }
}

impl From<FeatureRecord> for Record {
    fn from(feature: FeatureRecord) -> Self {
        Self {
            id: feature.id.as_ref().map(FieldValue::from_json),
            geometry: feature.geometry,
            properties: feature
                .properties
                .iter()
                .map(|(name, value)| (name.clone(), FieldValue::from_json(value)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::point;

    #[test]
    fn test_set_keeps_order() {
        let mut record = Record::new().with_property("b", 1i64).with_property("a", 2i64);
        record.set("c", FieldValue::Null);
        record.set("b", FieldValue::Int(5));
        assert_eq!(record.fields(), vec!["b", "a", "c"]);
        assert_eq!(record.get("b"), Some(&FieldValue::Int(5)));
    }

    #[test]
    fn test_to_geojson_drops_absent() {
        let record = Record::new()
            .with_id(7i64)
            .with_geometry(Geometry::Point(point!(x: 1.0, y: 2.0)))
            .with_property("name", "a")
            .with_property("late", FieldValue::Absent);
        let feature = record.to_geojson();
        let properties = feature.properties.unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties["name"], JsonValue::from("a"));
        assert!(feature.geometry.is_some());
        assert_eq!(feature.id, Some(geojson::feature::Id::Number(7.into())));
    }

    #[test]
    fn test_from_feature_record() {
        let mut properties = serde_json::Map::new();
        properties.insert("zone".to_string(), JsonValue::from(3));
        let record = Record::from(FeatureRecord {
            id: Some(JsonValue::from("z1")),
            properties,
            geometry: None,
        });
        assert_eq!(record.get("zone"), Some(&FieldValue::Int(3)));
        assert_eq!(record.id, Some(FieldValue::Text("z1".to_string())));
    }
}
