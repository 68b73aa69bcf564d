//! Axis-aligned extents and regular raster grids.

use geo::Rect;

/// Slack, in cell units, when snapping coordinates to cell boundaries.
const SNAP_EPSILON: f64 = 1e-9;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    #[must_use]
    pub const fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// Whether the two boxes share any point, boundaries included.
    #[must_use]
    pub fn intersects(&self, other: &Extent) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    /// Overlapping region, if any.
    #[must_use]
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        if !self.intersects(other) {
            return None;
        }
        Some(Extent::new(
            self.xmin.max(other.xmin),
            self.ymin.max(other.ymin),
            self.xmax.min(other.xmax),
            self.ymax.min(other.ymax),
        ))
    }

    #[must_use]
    pub fn union(&self, other: &Extent) -> Extent {
        Extent::new(
            self.xmin.min(other.xmin),
            self.ymin.min(other.ymin),
            self.xmax.max(other.xmax),
            self.ymax.max(other.ymax),
        )
    }
}

impl From<Rect<f64>> for Extent {
    fn from(rect: Rect<f64>) -> Self {
        Extent::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// A regular, north-up grid of cells.
///
/// Cells are indexed row-major with row 0 at `extent.ymax`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub extent: Extent,
    pub dx: f64,
    pub dy: f64,
}

impl Grid {
    #[must_use]
    pub const fn new(extent: Extent, dx: f64, dy: f64) -> Self {
        Self { extent, dx, dy }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rows(&self) -> usize {
        (self.extent.height() / self.dy).round().max(0.0) as usize
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn cols(&self) -> usize {
        (self.extent.width() / self.dx).round().max(0.0) as usize
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.rows() * self.cols()
    }

    #[must_use]
    pub fn cell_area(&self) -> f64 {
        self.dx * self.dy
    }

    /// X coordinate of the center of column `col`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn x_for_col(&self, col: usize) -> f64 {
        self.extent.xmin + (col as f64 + 0.5) * self.dx
    }

    /// Y coordinate of the center of row `row`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn y_for_row(&self, row: usize) -> f64 {
        self.extent.ymax - (row as f64 + 0.5) * self.dy
    }

    /// Column containing `x`, which may fall outside the grid.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn col_for_x(&self, x: f64) -> i64 {
        ((x - self.extent.xmin) / self.dx).floor() as i64
    }

    /// Row containing `y`, which may fall outside the grid.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn row_for_y(&self, y: f64) -> i64 {
        ((self.extent.ymax - y) / self.dy).floor() as i64
    }

    /// Bounds of a single cell.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_extent(&self, row: usize, col: usize) -> Extent {
        let xmin = self.extent.xmin + col as f64 * self.dx;
        let ymax = self.extent.ymax - row as f64 * self.dy;
        Extent::new(xmin, ymax - self.dy, xmin + self.dx, ymax)
    }

    /// Smallest sub-grid, aligned to this grid's cells, covering the part of
    /// `extent` inside this grid.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn crop(&self, extent: &Extent) -> Option<Grid> {
        let inter = self.extent.intersection(extent)?;
        let cols = self.cols();
        let rows = self.rows();
        if cols == 0 || rows == 0 {
            return None;
        }

        let col0 = (((inter.xmin - self.extent.xmin) / self.dx + SNAP_EPSILON).floor().max(0.0)
            as usize)
            .min(cols - 1);
        let col1 = (((inter.xmax - self.extent.xmin) / self.dx - SNAP_EPSILON).ceil() as usize)
            .clamp(col0 + 1, cols);
        let row0 = (((self.extent.ymax - inter.ymax) / self.dy + SNAP_EPSILON).floor().max(0.0)
            as usize)
            .min(rows - 1);
        let row1 = (((self.extent.ymax - inter.ymin) / self.dy - SNAP_EPSILON).ceil() as usize)
            .clamp(row0 + 1, rows);

        Some(Grid::new(
            Extent::new(
                self.extent.xmin + col0 as f64 * self.dx,
                self.extent.ymax - row1 as f64 * self.dy,
                self.extent.xmin + col1 as f64 * self.dx,
                self.extent.ymax - row0 as f64 * self.dy,
            ),
            self.dx,
            self.dy,
        ))
    }

    /// `(row, col)` of this grid's top-left cell within `parent`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn offset_in(&self, parent: &Grid) -> (i64, i64) {
        (
            ((parent.extent.ymax - self.extent.ymax) / parent.dy).round() as i64,
            ((self.extent.xmin - parent.extent.xmin) / parent.dx).round() as i64,
        )
    }

    /// Split into blocks of at most `max_cells` cells, row bands first.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn subdivide(&self, max_cells: usize) -> Vec<Grid> {
        let rows = self.rows();
        let cols = self.cols();
        let max_cells = max_cells.max(1);
        if rows * cols <= max_cells {
            return vec![*self];
        }

        let block_cols = cols.min(max_cells);
        let block_rows = (max_cells / block_cols).max(1);

        let mut blocks = Vec::new();
        for row0 in (0..rows).step_by(block_rows) {
            let row1 = (row0 + block_rows).min(rows);
            for col0 in (0..cols).step_by(block_cols) {
                let col1 = (col0 + block_cols).min(cols);
                blocks.push(Grid::new(
                    Extent::new(
                        self.extent.xmin + col0 as f64 * self.dx,
                        self.extent.ymax - row1 as f64 * self.dy,
                        self.extent.xmin + col1 as f64 * self.dx,
                        self.extent.ymax - row0 as f64 * self.dy,
                    ),
                    self.dx,
                    self.dy,
                ));
            }
        }
        blocks
    }

    /// Whether two grids can be evaluated on a common grid: the coarser
    /// resolution is an integer multiple of the finer one, and the origins
    /// are offset by whole fine cells. `tolerance` is a fraction of the
    /// smaller cell dimension.
    #[must_use]
    pub fn is_compatible(&self, other: &Grid, tolerance: f64) -> bool {
        let fine_dx = self.dx.min(other.dx);
        let fine_dy = self.dy.min(other.dy);
        let tol_x = tolerance * fine_dx;
        let tol_y = tolerance * fine_dy;

        let multiple = |coarse: f64, fine: f64, tol: f64| {
            let ratio = (coarse / fine).round();
            ratio >= 1.0 && (coarse - ratio * fine).abs() <= tol
        };
        let aligned = |offset: f64, fine: f64, tol: f64| {
            let cells = (offset / fine).round();
            (offset - cells * fine).abs() <= tol
        };

        multiple(self.dx.max(other.dx), fine_dx, tol_x)
            && multiple(self.dy.max(other.dy), fine_dy, tol_y)
            && aligned(self.extent.xmin - other.extent.xmin, fine_dx, tol_x)
            && aligned(self.extent.ymax - other.extent.ymax, fine_dy, tol_y)
    }

    /// Grid at the finer resolution of the two, covering both extents and
    /// aligned to the finer grid's origin.
    #[must_use]
    pub fn common_grid(&self, other: &Grid) -> Grid {
        let base = if self.dx <= other.dx { self } else { other };
        let union = self.extent.union(&other.extent);
        let (dx, dy) = (base.dx, base.dy.min(self.dy.min(other.dy)));

        let snap_down = |value: f64, origin: f64, step: f64| {
            origin + ((value - origin) / step + SNAP_EPSILON).floor() * step
        };
        let snap_up = |value: f64, origin: f64, step: f64| {
            origin + ((value - origin) / step - SNAP_EPSILON).ceil() * step
        };

        Grid::new(
            Extent::new(
                snap_down(union.xmin, base.extent.xmin, dx),
                snap_down(union.ymin, base.extent.ymax, dy),
                snap_up(union.xmax, base.extent.xmin, dx),
                snap_up(union.ymax, base.extent.ymax, dy),
            ),
            dx,
            dy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn unit_grid(cols: usize, rows: usize) -> Grid {
        Grid::new(Extent::new(0.0, 0.0, cols as f64, rows as f64), 1.0, 1.0)
    }

    #[test]
    fn test_dimensions_and_centers() {
        let grid = unit_grid(3, 2);
        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.cols(), 3);
        assert!((grid.x_for_col(0) - 0.5).abs() < 1e-12);
        assert!((grid.y_for_row(0) - 1.5).abs() < 1e-12);
        assert_eq!(grid.row_for_y(1.5), 0);
        assert_eq!(grid.col_for_x(2.9), 2);
    }

    #[test]
    fn test_crop_snaps_outward() {
        let grid = unit_grid(3, 3);
        let cropped = grid.crop(&Extent::new(0.5, 0.5, 2.5, 2.5)).unwrap();
        assert_eq!(cropped.extent, Extent::new(0.0, 0.0, 3.0, 3.0));

        let inner = grid.crop(&Extent::new(1.0, 1.0, 2.0, 2.0)).unwrap();
        assert_eq!(inner.extent, Extent::new(1.0, 1.0, 2.0, 2.0));
        assert_eq!(inner.offset_in(&grid), (1, 1));
    }

    #[test]
    fn test_crop_outside_is_none() {
        let grid = unit_grid(3, 3);
        assert!(grid.crop(&Extent::new(10.0, 10.0, 11.0, 11.0)).is_none());
    }

    #[test]
    fn test_subdivide_respects_budget() {
        let grid = unit_grid(10, 10);
        let blocks = grid.subdivide(25);
        assert!(blocks.iter().all(|b| b.size() <= 25));
        assert_eq!(blocks.iter().map(Grid::size).sum::<usize>(), 100);
        assert_eq!(grid.subdivide(1000), vec![grid]);
    }

    #[test]
    fn test_compatibility() {
        let fine = Grid::new(Extent::new(0.0, 0.0, 4.0, 4.0), 0.5, 0.5);
        let coarse = unit_grid(4, 4);
        assert!(fine.is_compatible(&coarse, 1e-6));

        let shifted = Grid::new(Extent::new(0.25, 0.0, 4.25, 4.0), 1.0, 1.0);
        assert!(!shifted.is_compatible(&coarse, 1e-6));
        assert!(!shifted.is_compatible(&fine, 1e-6));

        let odd = Grid::new(Extent::new(0.0, 0.0, 4.2, 4.2), 0.7, 0.7);
        assert!(!odd.is_compatible(&coarse, 1e-6));
    }

    #[test]
    fn test_common_grid() {
        let fine = Grid::new(Extent::new(0.0, 0.0, 2.0, 2.0), 0.5, 0.5);
        let coarse = Grid::new(Extent::new(1.0, 1.0, 4.0, 4.0), 1.0, 1.0);
        let common = fine.common_grid(&coarse);
        assert_eq!(common.extent, Extent::new(0.0, 0.0, 4.0, 4.0));
        assert_eq!(common.cols(), 8);
        assert_eq!(common.rows(), 8);
    }
}
