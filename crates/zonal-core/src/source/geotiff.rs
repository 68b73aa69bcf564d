//! GeoTIFF rasters read through the `tiff` crate.
//!
//! Georeferencing comes from the ModelPixelScale/ModelTiepoint pair or from
//! ModelTransformation. Pixels are decoded on first read and shared by every
//! band of the file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arrow_array::{
    ArrayRef, Float32Array, Float64Array, Int8Array, Int16Array, Int32Array, Int64Array,
    UInt8Array, UInt16Array, UInt32Array, UInt64Array,
};
use arrow_schema::DataType;
use log::debug;
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use super::raster::{RasterSource, mask_nodata, slice_window};
use crate::error::{InputError, IoErrorExt, Result};
use crate::grid::{Extent, Grid};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const GEOGRAPHIC_TYPE_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_KEY: u32 = 3072;
const USER_DEFINED: u32 = 32767;

/// An open GeoTIFF file. Shared by the band sources expanded from it.
#[derive(Debug)]
pub struct GeoTiffFile {
    path: PathBuf,
    rows: usize,
    cols: usize,
    samples: usize,
    grid: Grid,
    nodata: Option<f64>,
    spatial_reference: Option<String>,
    data_type: DataType,
    bands: OnceLock<Vec<ArrayRef>>,
}

impl GeoTiffFile {
    /// Read the header and georeferencing tags of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is not a readable TIFF, uses a planar
    /// layout, or has a rotated transform.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        let file = File::open(&path).with_read_context("GeoTIFF", &path)?;
        let mut decoder = Decoder::new(BufReader::new(file)).with_read_context("GeoTIFF", &path)?;

        let (width, height) = decoder.dimensions().with_read_context("GeoTIFF", &path)?;
        let cols = width as usize;
        let rows = height as usize;

        let samples = decoder
            .get_tag_u32(Tag::SamplesPerPixel)
            .map_or(1, |n| n as usize)
            .max(1);
        let planar = decoder.get_tag_u32(Tag::PlanarConfiguration).unwrap_or(1);
        if planar != 1 && samples > 1 {
            return Err(InputError::InvalidRaster {
                name,
                message: "planar (band-sequential) layouts are not supported".to_string(),
            }
            .into());
        }

        let bits = tag_values(&mut decoder, Tag::BitsPerSample)
            .first()
            .copied()
            .unwrap_or(8);
        let format = tag_values(&mut decoder, Tag::SampleFormat)
            .first()
            .copied()
            .unwrap_or(1);
        let data_type = sample_data_type(format, bits).ok_or_else(|| InputError::InvalidRaster {
            name: name.clone(),
            message: format!("unsupported sample format {format} with {bits} bits"),
        })?;

        let grid = read_grid(&mut decoder, rows, cols, &name)?;
        let nodata = decoder
            .get_tag_ascii_string(Tag::Unknown(GDAL_NODATA))
            .ok()
            .and_then(|text| text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok());
        let spatial_reference =
            epsg_from_geokeys(&tag_values(&mut decoder, Tag::Unknown(GEO_KEY_DIRECTORY)))
                .map(|code| format!("EPSG:{code}"));

        debug!(
            "Opened GeoTIFF {} ({cols}x{rows}, {samples} band(s), {data_type:?}, srs={spatial_reference:?})",
            path.display()
        );

        Ok(Self {
            path,
            rows,
            cols,
            samples,
            grid,
            nodata,
            spatial_reference,
            data_type,
            bands: OnceLock::new(),
        })
    }

    /// Whether `path` starts with a TIFF or BigTIFF signature.
    pub(crate) fn sniff(path: &Path) -> bool {
        let mut magic = [0u8; 4];
        File::open(path)
            .and_then(|mut file| file.read_exact(&mut magic))
            .is_ok()
            && matches!(&magic, b"II*\0" | b"MM\0*" | b"II+\0" | b"MM\0+")
    }

    #[must_use]
    pub fn band_count(&self) -> usize {
        self.samples
    }

    fn bands(&self) -> Result<&[ArrayRef]> {
        if let Some(bands) = self.bands.get() {
            return Ok(bands);
        }
        let file = File::open(&self.path).with_read_context("GeoTIFF", &self.path)?;
        let mut decoder =
            Decoder::new(BufReader::new(file)).with_read_context("GeoTIFF", &self.path)?;
        let image = decoder.read_image().with_read_context("GeoTIFF", &self.path)?;
        let bands = split_bands(image, self.samples);

        let expected = self.rows * self.cols;
        if bands.iter().any(|band| band.len() != expected) {
            return Err(InputError::InvalidRaster {
                name: self.path.display().to_string(),
                message: format!("decoded pixel count does not match {}x{}", self.cols, self.rows),
            }
            .into());
        }
        Ok(self.bands.get_or_init(|| bands))
    }
}

/// One band of a [`GeoTiffFile`].
#[derive(Debug)]
pub struct GeoTiffBand {
    file: Arc<GeoTiffFile>,
    band: usize,
}

impl RasterSource for GeoTiffBand {
    fn name(&self) -> &str {
        ""
    }

    fn grid(&self) -> Grid {
        self.file.grid
    }

    fn nodata(&self) -> Option<f64> {
        self.file.nodata
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.file.spatial_reference.as_deref()
    }

    fn data_type(&self) -> DataType {
        self.file.data_type.clone()
    }

    fn read_window(
        &self,
        col_offset: usize,
        row_offset: usize,
        width: usize,
        height: usize,
    ) -> Result<ArrayRef> {
        let bands = self.file.bands()?;
        let window = slice_window(
            &bands[self.band],
            self.file.cols,
            self.file.rows,
            (col_offset, row_offset, width, height),
            &self.file.path.display().to_string(),
        )?;
        mask_nodata(window, self.file.nodata)
    }
}

/// Open `path` and expand it into one source per band.
pub(crate) fn open(path: &Path) -> Result<Vec<Arc<dyn RasterSource>>> {
    let file = Arc::new(GeoTiffFile::open(path)?);
    Ok((0..file.band_count())
        .map(|band| {
            Arc::new(GeoTiffBand {
                file: Arc::clone(&file),
                band,
            }) as Arc<dyn RasterSource>
        })
        .collect())
}

/// Integer values of a tag, empty when the tag is missing.
fn tag_values<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Vec<u32> {
    match decoder.find_tag(tag) {
        Ok(Some(Value::List(items))) => items
            .into_iter()
            .filter_map(|item| item.into_u32().ok())
            .collect(),
        Ok(Some(value)) => value.into_u32().ok().into_iter().collect(),
        _ => Vec::new(),
    }
}

fn sample_data_type(format: u32, bits: u32) -> Option<DataType> {
    Some(match (format, bits) {
        (1, 8) => DataType::UInt8,
        (1, 16) => DataType::UInt16,
        (1, 32) => DataType::UInt32,
        (1, 64) => DataType::UInt64,
        (2, 8) => DataType::Int8,
        (2, 16) => DataType::Int16,
        (2, 32) => DataType::Int32,
        (2, 64) => DataType::Int64,
        (3, 32) => DataType::Float32,
        (3, 64) => DataType::Float64,
        _ => return None,
    })
}

#[allow(clippy::cast_precision_loss)]
fn read_grid<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    rows: usize,
    cols: usize,
    name: &str,
) -> Result<Grid> {
    let (x0, y0, dx, dy) = if let Ok(m) = decoder.get_tag_f64_vec(Tag::Unknown(MODEL_TRANSFORMATION))
    {
        if m.len() < 8 {
            return Err(InputError::InvalidRaster {
                name: name.to_string(),
                message: "ModelTransformation must have 16 values".to_string(),
            }
            .into());
        }
        if m[1] != 0.0 || m[4] != 0.0 {
            return Err(InputError::RotatedRaster {
                name: name.to_string(),
            }
            .into());
        }
        (m[3], m[7], m[0], -m[5])
    } else if let (Ok(scale), Ok(tiepoint)) = (
        decoder.get_tag_f64_vec(Tag::Unknown(MODEL_PIXEL_SCALE)),
        decoder.get_tag_f64_vec(Tag::Unknown(MODEL_TIEPOINT)),
    ) {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(InputError::InvalidRaster {
                name: name.to_string(),
                message: "incomplete pixel scale or tiepoint tags".to_string(),
            }
            .into());
        }
        (
            tiepoint[3] - tiepoint[0] * scale[0],
            tiepoint[4] + tiepoint[1] * scale[1],
            scale[0],
            scale[1],
        )
    } else {
        (0.0, rows as f64, 1.0, 1.0)
    };

    if dx <= 0.0 || dy <= 0.0 {
        return Err(InputError::InvalidRaster {
            name: name.to_string(),
            message: format!("non-positive cell size ({dx}, {dy})"),
        }
        .into());
    }
    Ok(Grid::new(
        Extent::new(x0, y0 - rows as f64 * dy, x0 + cols as f64 * dx, y0),
        dx,
        dy,
    ))
}

/// EPSG code from a GeoKeyDirectory: the projected CS when present, else the
/// geographic CS. User-defined codes are ignored.
fn epsg_from_geokeys(keys: &[u32]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let entries: Vec<&[u32]> = keys.get(4..4 + count * 4)?.chunks_exact(4).collect();
    let inline = |id: u32| {
        entries
            .iter()
            .find(|entry| entry[0] == id && entry[1] == 0)
            .map(|entry| entry[3])
            .filter(|code| *code != 0 && *code != USER_DEFINED)
    };
    inline(PROJECTED_CS_TYPE_KEY).or_else(|| inline(GEOGRAPHIC_TYPE_KEY))
}

macro_rules! deinterleave {
    ($buf:expr, $array:ty, $samples:expr) => {
        (0..$samples)
            .map(|band| {
                Arc::new(<$array>::from_iter_values(
                    $buf.iter().skip(band).step_by($samples).copied(),
                )) as ArrayRef
            })
            .collect()
    };
}

fn split_bands(image: DecodingResult, samples: usize) -> Vec<ArrayRef> {
    match image {
        DecodingResult::U8(buf) => deinterleave!(buf, UInt8Array, samples),
        DecodingResult::U16(buf) => deinterleave!(buf, UInt16Array, samples),
        DecodingResult::U32(buf) => deinterleave!(buf, UInt32Array, samples),
        DecodingResult::U64(buf) => deinterleave!(buf, UInt64Array, samples),
        DecodingResult::I8(buf) => deinterleave!(buf, Int8Array, samples),
        DecodingResult::I16(buf) => deinterleave!(buf, Int16Array, samples),
        DecodingResult::I32(buf) => deinterleave!(buf, Int32Array, samples),
        DecodingResult::I64(buf) => deinterleave!(buf, Int64Array, samples),
        DecodingResult::F32(buf) => deinterleave!(buf, Float32Array, samples),
        DecodingResult::F64(buf) => deinterleave!(buf, Float64Array, samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use tiff::encoder::TiffEncoder;
    use tiff::encoder::colortype::Gray32Float;
    use tempfile::TempDir;

    fn write_fixture(path: &Path, nodata: Option<&str>) {
        let file = File::create(path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        let mut image = encoder.new_image::<Gray32Float>(3, 2).unwrap();
        image
            .encoder()
            .write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &[10.0f64, 10.0, 0.0][..])
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::Unknown(MODEL_TIEPOINT),
                &[0.0f64, 0.0, 0.0, 100.0, 500.0, 0.0][..],
            )
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::Unknown(GEO_KEY_DIRECTORY),
                &[1u16, 1, 0, 1, 3072, 0, 1, 32633][..],
            )
            .unwrap();
        if let Some(nodata) = nodata {
            image
                .encoder()
                .write_tag(Tag::Unknown(GDAL_NODATA), nodata)
                .unwrap();
        }
        image
            .write_data(&[1.0f32, 2.0, 3.0, 4.0, -1.0, 6.0])
            .unwrap();
    }

    #[test]
    fn test_open_reads_georeferencing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dem.tif");
        write_fixture(&path, Some("-1"));

        assert!(GeoTiffFile::sniff(&path));
        let sources = open(&path).unwrap();
        assert_eq!(sources.len(), 1);
        let band = &sources[0];
        assert_eq!(band.extent(), Extent::new(100.0, 480.0, 130.0, 500.0));
        assert_eq!(band.resolution(), (10.0, 10.0));
        assert_eq!(band.nodata(), Some(-1.0));
        assert_eq!(band.spatial_reference(), Some("EPSG:32633"));
        assert_eq!(band.data_type(), DataType::Float32);

        let window = band.read_window(0, 1, 3, 1).unwrap();
        assert_eq!(window.null_count(), 1);
    }

    #[test]
    fn test_sniff_rejects_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.tif");
        std::fs::write(&path, "not a tiff").unwrap();
        assert!(!GeoTiffFile::sniff(&path));
    }

    #[test]
    fn test_geokeys_fallback_and_user_defined() {
        assert_eq!(epsg_from_geokeys(&[1, 1, 0, 1, 2048, 0, 1, 4326]), Some(4326));
        assert_eq!(
            epsg_from_geokeys(&[1, 1, 0, 2, 2048, 0, 1, 4326, 3072, 0, 1, 32767]),
            Some(4326)
        );
        assert_eq!(epsg_from_geokeys(&[1, 1, 0]), None);
    }

    #[test]
    fn test_sample_data_type() {
        assert_eq!(sample_data_type(2, 16), Some(DataType::Int16));
        assert_eq!(sample_data_type(3, 16), None);
    }
}
