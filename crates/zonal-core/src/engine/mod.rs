//! Zonal statistics engine.
//!
//! A feature is evaluated on the grid of its value raster, or on the common
//! grid of its value and weighting rasters when both are present. The part
//! of that grid under the feature's bounding box is split into blocks of at
//! most `max_cells` cells; each block gets a coverage fraction per cell and
//! the covered cells are accumulated before statistics are evaluated.

mod accumulator;
mod coverage;
mod evaluate;

use arrow::compute::take;
use arrow_array::{ArrayRef, UInt32Array, new_null_array};
use geo::{BoundingRect, Geometry};
use log::trace;

pub use accumulator::CellAccumulator;
pub use coverage::{coverage_fractions, is_linear};
pub use evaluate::evaluate;

use crate::error::{ConfigError, Result};
use crate::grid::{Extent, Grid};
use crate::source::RasterSource;

/// Grid on which a (value, weight) pair is evaluated.
///
/// # Errors
///
/// Returns [`ConfigError::IncompatibleExtents`] when the weighting grid
/// cannot be aligned with the value grid within `tolerance`.
pub fn evaluation_grid(
    values: &dyn RasterSource,
    weights: Option<&dyn RasterSource>,
    tolerance: f64,
) -> Result<Grid> {
    let value_grid = values.grid();
    let Some(weights) = weights else {
        return Ok(value_grid);
    };
    let weight_grid = weights.grid();
    if !value_grid.is_compatible(&weight_grid, tolerance) {
        return Err(ConfigError::IncompatibleExtents {
            value: values.name().to_string(),
            weight: weights.name().to_string(),
            tolerance,
        }
        .into());
    }
    Ok(value_grid.common_grid(&weight_grid))
}

/// Blocks of `grid` under the bounding box of `geometry`.
#[must_use]
pub fn feature_blocks(grid: &Grid, geometry: &Geometry<f64>, max_cells: usize) -> Vec<Grid> {
    geometry
        .bounding_rect()
        .and_then(|rect| grid.crop(&Extent::from(rect)))
        .map(|cropped| cropped.subdivide(max_cells))
        .unwrap_or_default()
}

/// Values of `source` at the center of every cell of `block`, row-major.
/// Cells outside the source are null.
///
/// # Errors
///
/// Returns an error if the source window cannot be read.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn sample(source: &dyn RasterSource, block: &Grid) -> Result<ArrayRef> {
    let grid = source.grid();
    let (rows, cols) = (grid.rows() as i64, grid.cols() as i64);

    let src_cols: Vec<Option<i64>> = (0..block.cols())
        .map(|col| {
            let src = grid.col_for_x(block.x_for_col(col));
            (0..cols).contains(&src).then_some(src)
        })
        .collect();
    let src_rows: Vec<Option<i64>> = (0..block.rows())
        .map(|row| {
            let src = grid.row_for_y(block.y_for_row(row));
            (0..rows).contains(&src).then_some(src)
        })
        .collect();

    let span = |indices: &[Option<i64>]| {
        let inside = indices.iter().flatten();
        Some((*inside.clone().min()?, *inside.max()?))
    };
    let (Some((col0, col1)), Some((row0, row1))) = (span(&src_cols), span(&src_rows)) else {
        return Ok(new_null_array(&source.data_type(), block.size()));
    };
    let width = (col1 - col0 + 1) as usize;
    let height = (row1 - row0 + 1) as usize;
    let window = source.read_window(col0 as usize, row0 as usize, width, height)?;

    let aligned = width == block.cols()
        && height == block.rows()
        && src_cols.iter().flatten().count() == width
        && src_rows.iter().flatten().count() == height;
    if aligned {
        return Ok(window);
    }

    trace!(
        "Resampling {}x{} window of '{}' onto {}x{} block",
        width,
        height,
        source.name(),
        block.cols(),
        block.rows()
    );
    let indices: UInt32Array = src_rows
        .iter()
        .flat_map(|row| {
            src_cols.iter().map(move |col| match (row, col) {
                (Some(row), Some(col)) => Some(((row - row0) as usize * width + (col - col0) as usize) as u32),
                _ => None,
            })
        })
        .collect();
    Ok(take(window.as_ref(), &indices, None)?)
}

/// Accumulate the cells of one block covered by `geometry`.
///
/// # Errors
///
/// Returns an error for unsupported geometries or unreadable sources.
pub fn accumulate_block(
    acc: &mut CellAccumulator,
    block: &Grid,
    geometry: &Geometry<f64>,
    values: &dyn RasterSource,
    weights: Option<&dyn RasterSource>,
) -> Result<()> {
    let coverage = coverage_fractions(block, geometry)?;
    if coverage.iter().all(|c| *c <= 0.0) {
        return Ok(());
    }
    let value_array = sample(values, block)?;
    let weight_array = weights.map(|weights| sample(weights, block)).transpose()?;
    acc.add(block, &coverage, &value_array, weight_array.as_ref(), &values.grid())
}
