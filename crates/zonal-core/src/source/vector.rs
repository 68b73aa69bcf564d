//! Feature sources.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use serde_json::Value as JsonValue;
use zonal_geojson::{parse_geojson_bytes, parse_geojson_value};

use super::feature::Record;
use crate::error::{InputError, IoError, IoErrorExt, Result};

/// Boxed iterator over the features of a source.
pub type FeatureIter<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

/// An ordered, restartable sequence of features.
///
/// Each call to [`FeatureSource::features`] starts a fresh pass from the
/// first feature.
pub trait FeatureSource: Send + Sync + fmt::Debug {
    /// Iterate over all features.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying data cannot be opened.
    fn features(&self) -> Result<FeatureIter<'_>>;

    /// Spatial reference as WKT or `AUTH:CODE`, if known.
    fn spatial_reference(&self) -> Option<&str>;

    /// Number of features.
    ///
    /// # Errors
    ///
    /// Returns an error if a pass over the features fails.
    fn count(&self) -> Result<usize> {
        let mut count = 0;
        for feature in self.features()? {
            feature?;
            count += 1;
        }
        Ok(count)
    }
}

/// Features held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeatureSource {
    records: Vec<Record>,
    spatial_reference: Option<String>,
}

impl MemoryFeatureSource {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            spatial_reference: None,
        }
    }

    /// Features from inline JSON: a FeatureCollection, a Feature, or an
    /// array of mappings with a `geometry` key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value holds no readable features.
    pub fn from_json(value: JsonValue) -> Result<Self> {
        let spatial_reference = crs_member(&value);
        let records = parse_geojson_value(value, "inline features")?;
        Ok(Self {
            records: records.into_iter().map(Record::from).collect(),
            spatial_reference,
        })
    }

    /// Features from parsed GeoJSON features.
    ///
    /// # Errors
    ///
    /// Returns an error if a geometry cannot be converted.
    pub fn from_geojson(features: Vec<geojson::Feature>) -> Result<Self> {
        let collection = geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        Self::from_json(JsonValue::Object(serde_json::Map::from(&collection)))
    }

    #[must_use]
    pub fn with_spatial_reference(mut self, srs: impl Into<String>) -> Self {
        self.spatial_reference = Some(srs.into());
        self
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

impl FeatureSource for MemoryFeatureSource {
    fn features(&self) -> Result<FeatureIter<'_>> {
        Ok(Box::new(self.records.iter().cloned().map(Ok)))
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.spatial_reference.as_deref()
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}

/// A GeoJSON file, re-read on every pass.
#[derive(Debug, Clone)]
pub struct GeoJsonFileSource {
    path: PathBuf,
    spatial_reference: Option<String>,
}

impl GeoJsonFileSource {
    /// Open a GeoJSON (or newline-delimited GeoJSON) file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(IoError::FileNotFound { path }.into());
        }
        let bytes = fs::read(&path).with_read_context("GeoJSON", &path)?;
        let spatial_reference = serde_json::from_slice::<JsonValue>(&bytes)
            .ok()
            .and_then(|value| crs_member(&value));
        debug!(
            "Opened GeoJSON file {} (srs={spatial_reference:?})",
            path.display()
        );
        Ok(Self {
            path,
            spatial_reference,
        })
    }

    /// Whether `path` looks like a GeoJSON file.
    pub(crate) fn sniff(path: &Path) -> bool {
        path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(is_geojson_extension)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FeatureSource for GeoJsonFileSource {
    fn features(&self) -> Result<FeatureIter<'_>> {
        let bytes = fs::read(&self.path).with_read_context("GeoJSON", &self.path)?;
        let records = parse_geojson_bytes(&bytes, None, self.path.display().to_string())?;
        Ok(Box::new(records.into_iter().map(|record| Ok(Record::from(record)))))
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.spatial_reference.as_deref()
    }
}

/// A directory whose GeoJSON files are the layers of one dataset.
#[derive(Debug)]
pub struct GeoJsonDataset {
    path: PathBuf,
    layers: Vec<(String, PathBuf)>,
}

impl GeoJsonDataset {
    /// List the layers of a directory dataset, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let mut layers = Vec::new();
        for entry in fs::read_dir(&path).with_read_context("GeoJSON dataset", &path)? {
            let file = entry.with_read_context("GeoJSON dataset", &path)?.path();
            if !GeoJsonFileSource::sniff(&file) {
                continue;
            }
            if let Some(stem) = file.file_stem().and_then(|stem| stem.to_str()) {
                layers.push((stem.to_string(), file.clone()));
            }
        }
        layers.sort();
        debug!("Opened GeoJSON dataset {} with {} layer(s)", path.display(), layers.len());
        Ok(Arc::new(Self { path, layers }))
    }

    /// Whether `path` is a directory holding at least one GeoJSON file.
    pub(crate) fn sniff(path: &Path) -> bool {
        path.is_dir()
            && fs::read_dir(path).is_ok_and(|mut entries| {
                entries.any(|entry| entry.is_ok_and(|e| GeoJsonFileSource::sniff(&e.path())))
            })
    }

    #[must_use]
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Open a layer. With no name the dataset must have exactly one layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection is missing, ambiguous or unknown.
    pub fn layer(self: &Arc<Self>, name: Option<&str>) -> Result<DatasetLayerSource> {
        let (layer, file) = match name {
            Some(name) => self.layers.iter().find(|(layer, _)| layer == name).ok_or_else(|| {
                InputError::LayerNotFound {
                    dataset: self.path.clone(),
                    layer: name.to_string(),
                    available: self.layer_names(),
                }
            })?,
            None if self.layers.len() == 1 => &self.layers[0],
            None => {
                return Err(InputError::AmbiguousLayer {
                    dataset: self.path.clone(),
                    layers: self.layer_names(),
                }
                .into());
            },
        };
        Ok(DatasetLayerSource {
            dataset: Arc::clone(self),
            layer: layer.clone(),
            inner: GeoJsonFileSource::open(file)?,
        })
    }
}

/// One layer of a [`GeoJsonDataset`]. Keeps the dataset alive.
#[derive(Debug)]
pub struct DatasetLayerSource {
    dataset: Arc<GeoJsonDataset>,
    layer: String,
    inner: GeoJsonFileSource,
}

impl DatasetLayerSource {
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }

    #[must_use]
    pub fn dataset(&self) -> &Arc<GeoJsonDataset> {
        &self.dataset
    }
}

impl FeatureSource for DatasetLayerSource {
    fn features(&self) -> Result<FeatureIter<'_>> {
        self.inner.features()
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.inner.spatial_reference()
    }
}

fn is_geojson_extension(ext: &str) -> bool {
    ["geojson", "json", "geojsonl", "geojsons"]
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
}

/// Spatial reference named by a legacy GeoJSON `crs` member.
fn crs_member(value: &JsonValue) -> Option<String> {
    let crs = value.get("crs")?;
    let properties = crs.get("properties")?;
    match crs.get("type").and_then(JsonValue::as_str) {
        Some("name") => properties.get("name")?.as_str().map(str::to_string),
        Some("EPSG") => properties.get("code").map(|code| format!("EPSG:{code}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn square(id: i64) -> JsonValue {
        json!({
            "type": "Feature",
            "id": id,
            "properties": {"zone": id},
            "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]]}
        })
    }

    #[test]
    fn test_memory_source_from_mappings() {
        let value = json!([
            {"geometry": {"type": "Point", "coordinates": [1, 2]}, "name": "a"},
            {"geometry": {"type": "Point", "coordinates": [3, 4]}, "name": "b"},
        ]);
        let source = MemoryFeatureSource::from_json(value).unwrap();
        assert_eq!(source.count().unwrap(), 2);
        assert_eq!(source.features().unwrap().count(), 2);
    }

    #[test]
    fn test_file_source_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zones.geojson");
        let collection = json!({
            "type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::4326"}},
            "features": [square(1), square(2)]
        });
        fs::write(&path, collection.to_string()).unwrap();

        let source = GeoJsonFileSource::open(&path).unwrap();
        assert_eq!(source.spatial_reference(), Some("urn:ogc:def:crs:EPSG::4326"));
        assert_eq!(source.count().unwrap(), 2);
        let ids: Vec<_> = source
            .features()
            .unwrap()
            .map(|record| record.unwrap().id)
            .collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_dataset_layers() {
        let dir = TempDir::new().unwrap();
        for name in ["roads", "parcels"] {
            let collection = json!({"type": "FeatureCollection", "features": [square(1)]});
            fs::write(dir.path().join(format!("{name}.geojson")), collection.to_string()).unwrap();
        }
        fs::write(dir.path().join("README.txt"), "ignored").unwrap();

        assert!(GeoJsonDataset::sniff(dir.path()));
        let dataset = GeoJsonDataset::open(dir.path()).unwrap();
        assert_eq!(dataset.layer_names(), vec!["parcels", "roads"]);

        let err = dataset.layer(None).unwrap_err();
        assert!(err.to_string().contains("2 layers"));

        let layer = dataset.layer(Some("roads")).unwrap();
        drop(dataset);
        assert_eq!(layer.count().unwrap(), 1);
        assert_eq!(layer.dataset().layer_names().len(), 2);

        let dataset = GeoJsonDataset::open(dir.path()).unwrap();
        assert!(dataset.layer(Some("rivers")).unwrap_err().to_string().contains("rivers"));
    }
}
