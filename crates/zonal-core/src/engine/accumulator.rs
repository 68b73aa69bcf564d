//! Per-feature cell storage.

use std::iter;

use arrow::compute::{concat, take};
use arrow_array::{Array, ArrayRef, UInt32Array, new_empty_array};
use arrow_schema::DataType;

use crate::error::Result;
use crate::grid::Grid;
use crate::value::FieldValue;

/// Cells touched by one feature for one (value, weight) pair.
///
/// Only cells with coverage greater than zero are kept. Blocks of the same
/// feature can be accumulated separately and merged in block order.
#[derive(Debug, Clone)]
pub struct CellAccumulator {
    data_type: DataType,
    chunks: Vec<ArrayRef>,
    values: Vec<Option<f64>>,
    coverage: Vec<f64>,
    cell_area: Vec<f64>,
    weights: Option<Vec<Option<f64>>>,
    cell_id: Vec<i64>,
    center_x: Vec<f64>,
    center_y: Vec<f64>,
}

impl CellAccumulator {
    /// Empty accumulator for values of `data_type`.
    #[must_use]
    pub fn new(data_type: DataType, weighted: bool) -> Self {
        Self {
            data_type,
            chunks: Vec::new(),
            values: Vec::new(),
            coverage: Vec::new(),
            cell_area: Vec::new(),
            weights: weighted.then(Vec::new),
            cell_id: Vec::new(),
            center_x: Vec::new(),
            center_y: Vec::new(),
        }
    }

    /// Add the covered cells of one block.
    ///
    /// `values` and `weights` hold one element per cell of `block`, sampled
    /// onto it. Cell ids are row-major indices into `reference`, the value
    /// raster's own grid; cells outside it get `-1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the arrays cannot be gathered.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn add(
        &mut self,
        block: &Grid,
        coverage: &[f64],
        values: &ArrayRef,
        weights: Option<&ArrayRef>,
        reference: &Grid,
    ) -> Result<()> {
        let covered: Vec<u32> = coverage
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0.0)
            .map(|(idx, _)| idx as u32)
            .collect();
        if covered.is_empty() {
            return Ok(());
        }
        let indices = UInt32Array::from(covered.clone());

        let taken = take(values.as_ref(), &indices, None)?;
        self.values.extend(FieldValue::array_as_f64(&taken)?);
        self.chunks.push(taken);

        if let Some(store) = &mut self.weights {
            match weights {
                Some(weights) => {
                    let taken = take(weights.as_ref(), &indices, None)?;
                    store.extend(FieldValue::array_as_f64(&taken)?);
                },
                None => store.extend(iter::repeat_n(None, covered.len())),
            }
        }

        let cols = block.cols();
        let (ref_rows, ref_cols) = (reference.rows() as i64, reference.cols() as i64);
        for idx in covered {
            let idx = idx as usize;
            let (row, col) = (idx / cols, idx % cols);
            let x = block.x_for_col(col);
            let y = block.y_for_row(row);
            let (ref_row, ref_col) = (reference.row_for_y(y), reference.col_for_x(x));
            let inside = (0..ref_rows).contains(&ref_row) && (0..ref_cols).contains(&ref_col);

            self.coverage.push(coverage[idx]);
            self.cell_area.push(block.cell_area());
            self.center_x.push(x);
            self.center_y.push(y);
            self.cell_id
                .push(if inside { ref_row * ref_cols + ref_col } else { -1 });
        }
        Ok(())
    }

    /// Append the cells of `other`, which must come from later blocks.
    pub fn merge(&mut self, other: CellAccumulator) {
        self.chunks.extend(other.chunks);
        self.values.extend(other.values);
        self.coverage.extend(other.coverage);
        self.cell_area.extend(other.cell_area);
        if let (Some(store), Some(more)) = (&mut self.weights, other.weights) {
            store.extend(more);
        }
        self.cell_id.extend(other.cell_id);
        self.center_x.extend(other.center_x);
        self.center_y.extend(other.center_y);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.coverage.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.coverage.is_empty()
    }

    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Values in their original type; nodata cells are null.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored chunks cannot be concatenated.
    pub fn typed_values(&self) -> Result<ArrayRef> {
        match self.chunks.as_slice() {
            [] => Ok(new_empty_array(&self.data_type)),
            [single] => Ok(single.clone()),
            chunks => {
                let refs: Vec<&dyn Array> = chunks.iter().map(AsRef::as_ref).collect();
                Ok(concat(&refs)?)
            },
        }
    }

    /// Values as `f64`; nodata cells are `None`.
    #[must_use]
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Coverage fraction, or length for linear features.
    #[must_use]
    pub fn coverage(&self) -> &[f64] {
        &self.coverage
    }

    #[must_use]
    pub fn cell_area(&self) -> &[f64] {
        &self.cell_area
    }

    /// Weights, when accumulated for a weighted operation.
    #[must_use]
    pub fn weights(&self) -> Option<&[Option<f64>]> {
        self.weights.as_deref()
    }

    #[must_use]
    pub fn cell_id(&self) -> &[i64] {
        &self.cell_id
    }

    #[must_use]
    pub fn center_x(&self) -> &[f64] {
        &self.center_x
    }

    #[must_use]
    pub fn center_y(&self) -> &[f64] {
        &self.center_y
    }
}
