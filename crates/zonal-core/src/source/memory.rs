//! In-memory raster bands.

use std::sync::Arc;

use arrow_array::ArrayRef;
use arrow_schema::DataType;

use super::raster::{RasterSource, mask_nodata, slice_window};
use crate::error::{InputError, Result};
use crate::grid::{Extent, Grid};

/// A single band held in memory as a row-major Arrow array.
///
/// Without an explicit extent the band covers `(0, 0)` to `(cols, rows)`
/// with unit cells.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    name: String,
    values: ArrayRef,
    rows: usize,
    cols: usize,
    grid: Grid,
    nodata: Option<f64>,
    spatial_reference: Option<String>,
}

impl MemoryRaster {
    /// Create a band from `rows * cols` row-major values.
    ///
    /// # Errors
    ///
    /// Returns an error if the array length does not match the shape.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(values: ArrayRef, rows: usize, cols: usize) -> Result<Self> {
        if values.len() != rows * cols || rows == 0 || cols == 0 {
            return Err(InputError::InvalidRaster {
                name: String::new(),
                message: format!(
                    "expected {rows}x{cols} = {} values, found {}",
                    rows * cols,
                    values.len()
                ),
            }
            .into());
        }
        Ok(Self {
            name: String::new(),
            values,
            rows,
            cols,
            grid: Grid::new(Extent::new(0.0, 0.0, cols as f64, rows as f64), 1.0, 1.0),
            nodata: None,
            spatial_reference: None,
        })
    }

    /// Create a band from a GDAL-style affine transform
    /// `(x_origin, dx, row_rotation, y_origin, col_rotation, -dy)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform has rotation terms or the array
    /// length does not match the shape.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_transform(
        values: ArrayRef,
        rows: usize,
        cols: usize,
        transform: [f64; 6],
    ) -> Result<Self> {
        let [x0, dx, rx, y0, ry, neg_dy] = transform;
        if rx != 0.0 || ry != 0.0 {
            return Err(InputError::RotatedRaster {
                name: "in-memory array".to_string(),
            }
            .into());
        }
        let dy = neg_dy.abs();
        let (ymin, ymax) = if neg_dy < 0.0 {
            (y0 - rows as f64 * dy, y0)
        } else {
            (y0, y0 + rows as f64 * dy)
        };
        let extent = Extent::new(x0, ymin, x0 + cols as f64 * dx, ymax);
        Ok(Self::new(values, rows, cols)?.with_extent(extent))
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.grid = Grid::new(
            extent,
            extent.width() / self.cols as f64,
            extent.height() / self.rows as f64,
        );
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    #[must_use]
    pub fn with_spatial_reference(mut self, srs: impl Into<String>) -> Self {
        self.spatial_reference = Some(srs.into());
        self
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }
}

impl RasterSource for MemoryRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.spatial_reference.as_deref()
    }

    fn data_type(&self) -> DataType {
        self.values.data_type().clone()
    }

    fn read_window(
        &self,
        col_offset: usize,
        row_offset: usize,
        width: usize,
        height: usize,
    ) -> Result<ArrayRef> {
        let window = slice_window(
            &self.values,
            self.cols,
            self.rows,
            (col_offset, row_offset, width, height),
            &self.name,
        )?;
        mask_nodata(window, self.nodata)
    }
}

/// Raw, possibly multi-band, in-memory raster input.
///
/// Expanded into one [`MemoryRaster`] per band when sources are resolved.
#[derive(Debug, Clone)]
pub struct RasterArray {
    bands: Vec<ArrayRef>,
    rows: usize,
    cols: usize,
    extent: Option<Extent>,
    nodata: Option<f64>,
    spatial_reference: Option<String>,
}

impl RasterArray {
    #[must_use]
    pub fn new(bands: Vec<ArrayRef>, rows: usize, cols: usize) -> Self {
        Self {
            bands,
            rows,
            cols,
            extent: None,
            nodata: None,
            spatial_reference: None,
        }
    }

    #[must_use]
    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.extent = Some(extent);
        self
    }

    #[must_use]
    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    #[must_use]
    pub fn with_spatial_reference(mut self, srs: impl Into<String>) -> Self {
        self.spatial_reference = Some(srs.into());
        self
    }

    #[must_use]
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// One source per band, named in order from `names`.
    pub(crate) fn into_sources(self, names: Vec<String>) -> Result<Vec<Arc<dyn RasterSource>>> {
        self.bands
            .into_iter()
            .zip(names)
            .map(|(values, name)| {
                let mut band = MemoryRaster::new(values, self.rows, self.cols)?.with_name(name);
                if let Some(extent) = self.extent {
                    band = band.with_extent(extent);
                }
                if let Some(nodata) = self.nodata {
                    band = band.with_nodata(nodata);
                }
                if let Some(srs) = &self.spatial_reference {
                    band = band.with_spatial_reference(srs.clone());
                }
                Ok(Arc::new(band) as Arc<dyn RasterSource>)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Array, Int32Array};

    fn values() -> ArrayRef {
        Arc::new(Int32Array::from((1..=9).collect::<Vec<_>>()))
    }

    #[test]
    fn test_default_grid() {
        let band = MemoryRaster::new(values(), 3, 3).unwrap();
        assert_eq!(band.extent(), Extent::new(0.0, 0.0, 3.0, 3.0));
        assert_eq!(band.resolution(), (1.0, 1.0));
        assert_eq!(band.data_type(), DataType::Int32);
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(MemoryRaster::new(values(), 2, 3).is_err());
    }

    #[test]
    fn test_from_transform() {
        let band =
            MemoryRaster::from_transform(values(), 3, 3, [10.0, 2.0, 0.0, 20.0, 0.0, -2.0]).unwrap();
        assert_eq!(band.extent(), Extent::new(10.0, 14.0, 16.0, 20.0));
        assert_eq!(band.resolution(), (2.0, 2.0));
    }

    #[test]
    fn test_rotated_transform_rejected() {
        let err = MemoryRaster::from_transform(values(), 3, 3, [0.0, 1.0, 0.5, 3.0, 0.0, -1.0])
            .unwrap_err();
        assert!(err.to_string().contains("Rotated raster"));
    }

    #[test]
    fn test_read_window_masks_nodata() {
        let band = MemoryRaster::new(values(), 3, 3).unwrap().with_nodata(5.0);
        let window = band.read_window(0, 1, 3, 1).unwrap();
        assert_eq!(window.len(), 3);
        assert!(window.is_null(1));
        assert_eq!(window.data_type(), &DataType::Int32);
    }
}
