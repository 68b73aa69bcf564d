//! Source adapters.
//!
//! Caller inputs come in many shapes: open sources, in-memory arrays, inline
//! JSON features, file paths and named collections of any of these. This
//! module resolves them into the two canonical interfaces,
//! [`RasterSource`] and [`FeatureSource`].
//!
//! Resolution order:
//! 1. canonical sources pass through unchanged;
//! 2. inline feature data becomes a [`MemoryFeatureSource`];
//! 3. paths are offered to each adapter in priority order. An adapter whose
//!    backend is compiled out is skipped; the first adapter that claims the
//!    path opens it, and its errors are returned as-is.
//!
//! # Band naming
//!
//! ```
//! use zonal_core::source::band_names;
//!
//! assert_eq!(band_names(Some("dem"), 1), vec!["dem"]);
//! assert_eq!(band_names(Some("rgb"), 2), vec!["rgb_band_1", "rgb_band_2"]);
//! assert_eq!(band_names(None, 2), vec!["band_1", "band_2"]);
//! assert_eq!(band_names(None, 1), vec![""]);
//! ```

pub mod ascii;
pub mod feature;
#[cfg(feature = "geotiff")]
pub mod geotiff;
pub mod memory;
pub mod raster;
pub mod vector;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use serde_json::Value as JsonValue;

pub use feature::{Feature, Record};
pub use memory::{MemoryRaster, RasterArray};
pub use raster::{NamedRaster, RasterSource};
pub use vector::{
    DatasetLayerSource, FeatureIter, FeatureSource, GeoJsonDataset, GeoJsonFileSource,
    MemoryFeatureSource,
};

use crate::error::{InputError, IoError, Result};

/// A raster input in any accepted shape.
#[derive(Debug, Clone)]
pub enum RasterInput {
    /// An already-open source
    Source(Arc<dyn RasterSource>),
    /// A canonical in-memory band
    Memory(MemoryRaster),
    /// Raw in-memory bands
    Array(RasterArray),
    /// A file on disk
    Path(PathBuf),
    /// An input with a root name for its bands
    Named(String, Box<RasterInput>),
    /// Named sub-variables; names are joined onto the parent's with `_`
    Collection(Vec<(String, RasterInput)>),
    /// Several inputs. Paths in a list of more than one entry are named after
    /// their file stem.
    List(Vec<RasterInput>),
}

impl RasterInput {
    /// Give `input` a root name.
    #[must_use]
    pub fn named(name: impl Into<String>, input: impl Into<RasterInput>) -> Self {
        Self::Named(name.into(), Box::new(input.into()))
    }

    /// Parse a command-line style `name=path` or `path` argument.
    #[must_use]
    pub fn parse_argument(argument: &str) -> Self {
        match argument.split_once('=') {
            Some((name, path)) if !name.is_empty() && !Path::new(argument).exists() => {
                Self::named(name, PathBuf::from(path))
            },
            _ => Self::Path(PathBuf::from(argument)),
        }
    }
}

impl From<Arc<dyn RasterSource>> for RasterInput {
    fn from(source: Arc<dyn RasterSource>) -> Self {
        Self::Source(source)
    }
}

impl From<MemoryRaster> for RasterInput {
    fn from(raster: MemoryRaster) -> Self {
        Self::Memory(raster)
    }
}

impl From<RasterArray> for RasterInput {
    fn from(array: RasterArray) -> Self {
        Self::Array(array)
    }
}

impl From<PathBuf> for RasterInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for RasterInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for RasterInput {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl<T: Into<RasterInput>> From<Vec<T>> for RasterInput {
    fn from(inputs: Vec<T>) -> Self {
        Self::List(inputs.into_iter().map(Into::into).collect())
    }
}

/// A vector input in any accepted shape.
#[derive(Debug, Clone)]
pub enum VectorInput {
    /// An already-open source
    Source(Arc<dyn FeatureSource>),
    /// Inline JSON features
    Json(JsonValue),
    /// Parsed GeoJSON features
    Features(Vec<geojson::Feature>),
    /// A file or directory dataset, optionally suffixed with `[layer]`
    Path(String),
}

impl From<Arc<dyn FeatureSource>> for VectorInput {
    fn from(source: Arc<dyn FeatureSource>) -> Self {
        Self::Source(source)
    }
}

impl From<MemoryFeatureSource> for VectorInput {
    fn from(source: MemoryFeatureSource) -> Self {
        Self::Source(Arc::new(source))
    }
}

impl From<JsonValue> for VectorInput {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<geojson::Feature>> for VectorInput {
    fn from(features: Vec<geojson::Feature>) -> Self {
        Self::Features(features)
    }
}

impl From<&str> for VectorInput {
    fn from(descriptor: &str) -> Self {
        Self::Path(descriptor.to_string())
    }
}

impl From<String> for VectorInput {
    fn from(descriptor: String) -> Self {
        Self::Path(descriptor)
    }
}

impl From<PathBuf> for VectorInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path.display().to_string())
    }
}

impl From<&Path> for VectorInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.display().to_string())
    }
}

/// Outcome of offering an input to an adapter.
#[derive(Debug)]
pub enum Probe<T> {
    /// The adapter claimed and opened the input
    Matched(T),
    /// The adapter does not handle this input
    Unmatched,
}

/// Opens raster files of one format.
pub trait RasterAdapter: Sync {
    /// Short name used in logs and listings.
    fn name(&self) -> &'static str;

    /// Whether the backend is compiled in.
    fn is_available(&self) -> bool;

    /// Claim and open `path`, one source per band.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter claims the path but cannot open it.
    fn probe(&self, path: &Path) -> Result<Probe<Vec<Arc<dyn RasterSource>>>>;
}

/// Opens vector datasets of one format.
pub trait VectorAdapter: Sync {
    /// Short name used in logs and listings.
    fn name(&self) -> &'static str;

    /// Whether the backend is compiled in.
    fn is_available(&self) -> bool;

    /// Claim and open `path`, selecting `layer` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter claims the path but cannot open it or
    /// the layer selection is ambiguous.
    fn probe(&self, path: &Path, layer: Option<&str>) -> Result<Probe<Arc<dyn FeatureSource>>>;
}

struct GeoTiffAdapter;

impl RasterAdapter for GeoTiffAdapter {
    fn name(&self) -> &'static str {
        "GeoTIFF"
    }

    fn is_available(&self) -> bool {
        cfg!(feature = "geotiff")
    }

    #[cfg(feature = "geotiff")]
    fn probe(&self, path: &Path) -> Result<Probe<Vec<Arc<dyn RasterSource>>>> {
        if !geotiff::GeoTiffFile::sniff(path) {
            return Ok(Probe::Unmatched);
        }
        Ok(Probe::Matched(geotiff::open(path)?))
    }

    #[cfg(not(feature = "geotiff"))]
    fn probe(&self, _path: &Path) -> Result<Probe<Vec<Arc<dyn RasterSource>>>> {
        Ok(Probe::Unmatched)
    }
}

struct AsciiGridAdapter;

impl RasterAdapter for AsciiGridAdapter {
    fn name(&self) -> &'static str {
        "ASCII grid"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn probe(&self, path: &Path) -> Result<Probe<Vec<Arc<dyn RasterSource>>>> {
        if !ascii::AsciiGrid::sniff(path) {
            return Ok(Probe::Unmatched);
        }
        Ok(Probe::Matched(ascii::open(path)?))
    }
}

struct GeoJsonFileAdapter;

impl VectorAdapter for GeoJsonFileAdapter {
    fn name(&self) -> &'static str {
        "GeoJSON"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn probe(&self, path: &Path, layer: Option<&str>) -> Result<Probe<Arc<dyn FeatureSource>>> {
        if !GeoJsonFileSource::sniff(path) {
            return Ok(Probe::Unmatched);
        }
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        if let Some(layer) = layer.filter(|layer| *layer != stem) {
            return Err(InputError::LayerNotFound {
                dataset: path.to_path_buf(),
                layer: layer.to_string(),
                available: vec![stem.to_string()],
            }
            .into());
        }
        Ok(Probe::Matched(Arc::new(GeoJsonFileSource::open(path)?)))
    }
}

struct GeoJsonDirectoryAdapter;

impl VectorAdapter for GeoJsonDirectoryAdapter {
    fn name(&self) -> &'static str {
        "GeoJSON directory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn probe(&self, path: &Path, layer: Option<&str>) -> Result<Probe<Arc<dyn FeatureSource>>> {
        if !GeoJsonDataset::sniff(path) {
            return Ok(Probe::Unmatched);
        }
        let dataset = GeoJsonDataset::open(path)?;
        Ok(Probe::Matched(Arc::new(dataset.layer(layer)?)))
    }
}

static RASTER_ADAPTERS: &[&dyn RasterAdapter] = &[&GeoTiffAdapter, &AsciiGridAdapter];

static VECTOR_ADAPTERS: &[&dyn VectorAdapter] = &[&GeoJsonFileAdapter, &GeoJsonDirectoryAdapter];

/// Raster adapters in probing order.
#[must_use]
pub fn raster_adapters() -> &'static [&'static dyn RasterAdapter] {
    RASTER_ADAPTERS
}

/// Vector adapters in probing order.
#[must_use]
pub fn vector_adapters() -> &'static [&'static dyn VectorAdapter] {
    VECTOR_ADAPTERS
}

/// Names for `count` bands under an optional root name.
#[must_use]
pub fn band_names(root: Option<&str>, count: usize) -> Vec<String> {
    let root = root.filter(|root| !root.is_empty());
    match (root, count) {
        (Some(root), 1) => vec![root.to_string()],
        (Some(root), _) => (1..=count).map(|i| format!("{root}_band_{i}")).collect(),
        (None, 1) => vec![String::new()],
        (None, _) => (1..=count).map(|i| format!("band_{i}")).collect(),
    }
}

/// Split a `path[layer]` descriptor. A path that exists as written is never
/// split.
#[must_use]
pub fn parse_descriptor(descriptor: &str) -> (PathBuf, Option<String>) {
    if Path::new(descriptor).exists() {
        return (PathBuf::from(descriptor), None);
    }
    match descriptor.strip_suffix(']').and_then(|rest| rest.rsplit_once('[')) {
        Some((path, layer)) if !path.is_empty() && !layer.is_empty() => {
            (PathBuf::from(path), Some(layer.to_string()))
        },
        _ => (PathBuf::from(descriptor), None),
    }
}

/// Resolve a raster input into one source per band, named by the band
/// naming rule.
///
/// # Errors
///
/// Returns an error if a path is missing or unrecognized, or a source
/// cannot be opened.
pub fn resolve_rasters(input: RasterInput) -> Result<Vec<Arc<dyn RasterSource>>> {
    resolve_raster(input, None)
}

fn resolve_raster(input: RasterInput, root: Option<String>) -> Result<Vec<Arc<dyn RasterSource>>> {
    match input {
        RasterInput::Source(source) => Ok(vec![rename(source, root.as_deref())]),
        RasterInput::Memory(raster) => Ok(vec![rename(Arc::new(raster), root.as_deref())]),
        RasterInput::Array(array) => {
            let names = band_names(root.as_deref(), array.band_count());
            array.into_sources(names)
        },
        RasterInput::Path(path) => {
            let bands = open_raster_path(&path)?;
            let names = band_names(root.as_deref(), bands.len());
            Ok(bands
                .into_iter()
                .zip(names)
                .map(|(band, name)| rename(band, Some(&name)))
                .collect())
        },
        RasterInput::Named(name, inner) => resolve_raster(*inner, Some(join_names(root.as_deref(), &name))),
        RasterInput::Collection(variables) => {
            let mut sources = Vec::new();
            for (variable, inner) in variables {
                sources.extend(resolve_raster(inner, Some(join_names(root.as_deref(), &variable)))?);
            }
            Ok(sources)
        },
        RasterInput::List(inputs) => {
            let several = inputs.len() > 1;
            let mut sources = Vec::new();
            for inner in inputs {
                let inner_root = match (&inner, several) {
                    (RasterInput::Path(path), true) => path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .map(|stem| join_names(root.as_deref(), stem)),
                    _ => root.clone(),
                };
                sources.extend(resolve_raster(inner, inner_root)?);
            }
            Ok(sources)
        },
    }
}

fn rename(source: Arc<dyn RasterSource>, name: Option<&str>) -> Arc<dyn RasterSource> {
    match name {
        Some(name) if !name.is_empty() && name != source.name() => {
            Arc::new(NamedRaster::new(source, name))
        },
        _ => source,
    }
}

fn join_names(root: Option<&str>, name: &str) -> String {
    match root.filter(|root| !root.is_empty()) {
        Some(root) if !name.is_empty() => format!("{root}_{name}"),
        Some(root) => root.to_string(),
        None => name.to_string(),
    }
}

fn open_raster_path(path: &Path) -> Result<Vec<Arc<dyn RasterSource>>> {
    if !path.exists() {
        return Err(IoError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    for adapter in RASTER_ADAPTERS {
        if !adapter.is_available() {
            debug!("Raster adapter {} is not available, skipping", adapter.name());
            continue;
        }
        match adapter.probe(path)? {
            Probe::Matched(bands) => {
                debug!(
                    "Raster adapter {} opened {} ({} band(s))",
                    adapter.name(),
                    path.display(),
                    bands.len()
                );
                return Ok(bands);
            },
            Probe::Unmatched => debug!("Raster adapter {} declined {}", adapter.name(), path.display()),
        }
    }
    Err(InputError::UnrecognizedInput {
        kind: "raster",
        value: path.display().to_string(),
    }
    .into())
}

/// Resolve a vector input into a feature source.
///
/// # Errors
///
/// Returns an error if the input is unrecognized, a path is missing, or a
/// multi-layer dataset is given without a layer.
pub fn resolve_vector(input: VectorInput) -> Result<Arc<dyn FeatureSource>> {
    match input {
        VectorInput::Source(source) => Ok(source),
        VectorInput::Json(JsonValue::String(descriptor)) => resolve_vector(VectorInput::Path(descriptor)),
        VectorInput::Json(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
            Ok(Arc::new(MemoryFeatureSource::from_json(value)?))
        },
        VectorInput::Json(other) => Err(InputError::UnrecognizedInput {
            kind: "vector",
            value: other.to_string(),
        }
        .into()),
        VectorInput::Features(features) => Ok(Arc::new(MemoryFeatureSource::from_geojson(features)?)),
        VectorInput::Path(descriptor) => {
            let (path, layer) = parse_descriptor(&descriptor);
            if !path.exists() {
                return Err(IoError::FileNotFound { path }.into());
            }
            for adapter in VECTOR_ADAPTERS {
                if !adapter.is_available() {
                    debug!("Vector adapter {} is not available, skipping", adapter.name());
                    continue;
                }
                if let Probe::Matched(source) = adapter.probe(&path, layer.as_deref())? {
                    debug!("Vector adapter {} opened {descriptor}", adapter.name());
                    return Ok(source);
                }
            }
            Err(InputError::UnrecognizedInput {
                kind: "vector",
                value: descriptor,
            }
            .into())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{ArrayRef, Float64Array};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn band(value: f64) -> ArrayRef {
        Arc::new(Float64Array::from(vec![value; 4]))
    }

    fn names(sources: &[Arc<dyn RasterSource>]) -> Vec<&str> {
        sources.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_array_band_naming() {
        let array = RasterArray::new(vec![band(1.0), band(2.0)], 2, 2);
        let sources = resolve_rasters(RasterInput::named("rgb", array.clone())).unwrap();
        assert_eq!(names(&sources), vec!["rgb_band_1", "rgb_band_2"]);

        let sources = resolve_rasters(array.into()).unwrap();
        assert_eq!(names(&sources), vec!["band_1", "band_2"]);
    }

    #[test]
    fn test_nested_collection_naming() {
        let inner = RasterInput::Collection(vec![
            ("temp".to_string(), RasterArray::new(vec![band(1.0)], 2, 2).into()),
            ("rain".to_string(), RasterArray::new(vec![band(1.0), band(2.0)], 2, 2).into()),
        ]);
        let input = RasterInput::Collection(vec![("climate".to_string(), inner)]);
        let sources = resolve_rasters(input).unwrap();
        assert_eq!(
            names(&sources),
            vec!["climate_temp", "climate_rain_band_1", "climate_rain_band_2"]
        );
    }

    #[test]
    fn test_list_of_paths_uses_stems() {
        let dir = TempDir::new().unwrap();
        let grid = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2\n3 4\n";
        let a = dir.path().join("a.asc");
        let b = dir.path().join("b.asc");
        fs::write(&a, grid).unwrap();
        fs::write(&b, grid).unwrap();

        let sources = resolve_rasters(vec![a.clone(), b].into()).unwrap();
        assert_eq!(names(&sources), vec!["a", "b"]);

        let single = resolve_rasters(vec![a].into()).unwrap();
        assert_eq!(names(&single), vec![""]);
    }

    #[test]
    fn test_unrecognized_raster_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello").unwrap();
        let err = resolve_rasters(path.clone().into()).unwrap_err();
        assert!(err.to_string().contains("Unrecognized raster input"));
        assert!(err.to_string().contains("notes.txt"));
    }

    #[test]
    fn test_missing_raster_path() {
        let err = resolve_rasters("/definitely/not/here.tif".into()).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(
            parse_descriptor("zones[parcels]"),
            (PathBuf::from("zones"), Some("parcels".to_string()))
        );
        assert_eq!(parse_descriptor("zones.geojson"), (PathBuf::from("zones.geojson"), None));
    }

    #[test]
    fn test_parse_argument() {
        match RasterInput::parse_argument("dem=data/dem.tif") {
            RasterInput::Named(name, inner) => {
                assert_eq!(name, "dem");
                assert!(matches!(*inner, RasterInput::Path(_)));
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(RasterInput::parse_argument("dem.tif"), RasterInput::Path(_)));
    }

    #[test]
    fn test_inline_vector_json() {
        let source = resolve_vector(json!({
            "geometry": {"type": "Point", "coordinates": [0, 0]},
            "properties": {"id": 1}
        }).into())
        .unwrap();
        assert_eq!(source.count().unwrap(), 1);

        let err = resolve_vector(json!(42).into()).unwrap_err();
        assert!(err.to_string().contains("Unrecognized vector input: 42"));
    }

    #[test]
    fn test_vector_directory_requires_layer() {
        let dir = TempDir::new().unwrap();
        let collection = json!({"type": "FeatureCollection", "features": []}).to_string();
        fs::write(dir.path().join("a.geojson"), &collection).unwrap();
        fs::write(dir.path().join("b.geojson"), &collection).unwrap();

        let descriptor = dir.path().display().to_string();
        let err = resolve_vector(descriptor.clone().into()).unwrap_err();
        assert!(err.to_string().contains("contains 2 layers"));

        let source = resolve_vector(format!("{descriptor}[b]").into()).unwrap();
        assert_eq!(source.count().unwrap(), 0);
    }

    #[test]
    fn test_adapter_order() {
        let names: Vec<_> = raster_adapters().iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["GeoTIFF", "ASCII grid"]);
    }
}
