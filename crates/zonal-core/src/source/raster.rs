//! The canonical raster band interface.

use std::fmt;
use std::sync::Arc;

use arrow::compute::cast;
use arrow_array::cast::AsArray;
use arrow_array::types::Float64Type;
use arrow_array::{Array, ArrayRef, make_array};
use arrow::buffer::NullBuffer;
use arrow_schema::DataType;

use crate::error::{InputError, Result};
use crate::grid::{Extent, Grid};

/// One band of gridded data on a north-up, non-rotated grid.
///
/// Implementations are immutable once constructed; file-backed bands may
/// decode their pixels on first read.
pub trait RasterSource: Send + Sync + fmt::Debug {
    /// Label used when deriving output field names. Empty when unnamed.
    fn name(&self) -> &str;

    /// Grid of the band.
    fn grid(&self) -> Grid;

    /// Nodata sentinel, if any.
    fn nodata(&self) -> Option<f64>;

    /// Spatial reference as WKT or `AUTH:CODE`, if known.
    fn spatial_reference(&self) -> Option<&str>;

    /// Element type of the values returned by [`RasterSource::read_window`].
    fn data_type(&self) -> DataType;

    /// Read a `width` x `height` window, row-major. Nodata and NaN cells are
    /// null in the returned array.
    ///
    /// # Errors
    ///
    /// Returns an error if the window falls outside the band or the
    /// underlying data cannot be read.
    fn read_window(
        &self,
        col_offset: usize,
        row_offset: usize,
        width: usize,
        height: usize,
    ) -> Result<ArrayRef>;

    /// Cell size as `(dx, dy)`.
    fn resolution(&self) -> (f64, f64) {
        let grid = self.grid();
        (grid.dx, grid.dy)
    }

    /// Bounds of the band.
    fn extent(&self) -> Extent {
        self.grid().extent
    }
}

/// A source exposed under a different name.
#[derive(Debug)]
pub struct NamedRaster {
    inner: Arc<dyn RasterSource>,
    name: String,
}

impl NamedRaster {
    #[must_use]
    pub fn new(inner: Arc<dyn RasterSource>, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

impl RasterSource for NamedRaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> Grid {
        self.inner.grid()
    }

    fn nodata(&self) -> Option<f64> {
        self.inner.nodata()
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.inner.spatial_reference()
    }

    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn read_window(
        &self,
        col_offset: usize,
        row_offset: usize,
        width: usize,
        height: usize,
    ) -> Result<ArrayRef> {
        self.inner.read_window(col_offset, row_offset, width, height)
    }
}

/// Copy a window out of a full row-major band.
pub(crate) fn slice_window(
    band: &ArrayRef,
    band_cols: usize,
    band_rows: usize,
    window: (usize, usize, usize, usize),
    name: &str,
) -> Result<ArrayRef> {
    let (col_offset, row_offset, width, height) = window;
    if col_offset + width > band_cols || row_offset + height > band_rows {
        return Err(InputError::InvalidRaster {
            name: name.to_string(),
            message: format!(
                "window ({col_offset}, {row_offset}, {width}, {height}) exceeds {band_cols}x{band_rows} band"
            ),
        }
        .into());
    }
    if width == band_cols {
        return Ok(band.slice(row_offset * band_cols, width * height));
    }

    let rows: Vec<ArrayRef> = (row_offset..row_offset + height)
        .map(|row| band.slice(row * band_cols + col_offset, width))
        .collect();
    let refs: Vec<&dyn Array> = rows.iter().map(AsRef::as_ref).collect();
    Ok(arrow::compute::concat(&refs)?)
}

/// Null out nodata and NaN cells, keeping existing nulls.
pub(crate) fn mask_nodata(values: ArrayRef, nodata: Option<f64>) -> Result<ArrayRef> {
    let as_f64 = cast(&values, &DataType::Float64)?;
    let as_f64 = as_f64.as_primitive::<Float64Type>();
    let is_valid = |idx: usize| {
        if values.is_null(idx) {
            return false;
        }
        let v = as_f64.value(idx);
        !v.is_nan() && nodata.is_none_or(|nd| v != nd)
    };

    if (0..values.len()).all(is_valid) {
        return Ok(values);
    }
    let nulls = NullBuffer::from_iter((0..values.len()).map(is_valid));
    let data = values.to_data().into_builder().nulls(Some(nulls)).build()?;
    Ok(make_array(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Float32Array, Int32Array};

    #[test]
    fn test_slice_window() {
        let band: ArrayRef = Arc::new(Int32Array::from((1..=9).collect::<Vec<_>>()));
        let window = slice_window(&band, 3, 3, (1, 1, 2, 2), "test").unwrap();
        let values: Vec<i32> = window.as_primitive::<arrow_array::types::Int32Type>().values().to_vec();
        assert_eq!(values, vec![5, 6, 8, 9]);
    }

    #[test]
    fn test_slice_window_out_of_bounds() {
        let band: ArrayRef = Arc::new(Int32Array::from((1..=9).collect::<Vec<_>>()));
        assert!(slice_window(&band, 3, 3, (2, 0, 2, 1), "test").is_err());
    }

    #[test]
    fn test_mask_nodata() {
        let band: ArrayRef = Arc::new(Float32Array::from(vec![1.0, -9999.0, f32::NAN, 4.0]));
        let masked = mask_nodata(band, Some(-9999.0)).unwrap();
        assert_eq!(masked.data_type(), &DataType::Float32);
        assert_eq!(masked.null_count(), 2);
        assert!(masked.is_valid(0));
        assert!(masked.is_null(1));
        assert!(masked.is_null(2));
    }
}
