//! Per-cell coverage of a geometry.
//!
//! Polygons are clipped to each row band and then to each cell with
//! Sutherland-Hodgman; the clipped area divided by the cell area is the
//! coverage fraction. Lines are clipped to each cell with Cohen-Sutherland
//! and report the length inside the cell.

use geo::{BoundingRect, Coord, Geometry, LineString, Polygon};

use crate::error::{InputError, Result};
use crate::grid::{Extent, Grid};

/// Side of a clipping rectangle.
#[derive(Debug, Clone, Copy)]
enum Edge {
    Left,
    Right,
    Bottom,
    Top,
}

impl Edge {
    fn is_inside(self, p: Coord<f64>, rect: &Extent) -> bool {
        match self {
            Edge::Left => p.x >= rect.xmin,
            Edge::Right => p.x <= rect.xmax,
            Edge::Bottom => p.y >= rect.ymin,
            Edge::Top => p.y <= rect.ymax,
        }
    }

    fn intersect(self, p: Coord<f64>, q: Coord<f64>, rect: &Extent) -> Coord<f64> {
        let dx = q.x - p.x;
        let dy = q.y - p.y;
        match self {
            Edge::Left => Coord {
                x: rect.xmin,
                y: p.y + (rect.xmin - p.x) / dx * dy,
            },
            Edge::Right => Coord {
                x: rect.xmax,
                y: p.y + (rect.xmax - p.x) / dx * dy,
            },
            Edge::Bottom => Coord {
                x: p.x + (rect.ymin - p.y) / dy * dx,
                y: rect.ymin,
            },
            Edge::Top => Coord {
                x: p.x + (rect.ymax - p.y) / dy * dx,
                y: rect.ymax,
            },
        }
    }
}

/// One Sutherland-Hodgman step. `ring` is open (no repeated closing vertex).
fn clip_ring_edge(ring: &[Coord<f64>], edge: Edge, rect: &Extent) -> Vec<Coord<f64>> {
    let n = ring.len();
    let mut output = Vec::with_capacity(n + 2);
    for i in 0..n {
        let current = ring[i];
        let next = ring[(i + 1) % n];
        match (edge.is_inside(current, rect), edge.is_inside(next, rect)) {
            (true, true) => output.push(next),
            (true, false) => output.push(edge.intersect(current, next, rect)),
            (false, true) => {
                output.push(edge.intersect(current, next, rect));
                output.push(next);
            },
            (false, false) => {},
        }
    }
    output
}

fn clip_ring(ring: &[Coord<f64>], edges: &[Edge], rect: &Extent) -> Vec<Coord<f64>> {
    let mut clipped = ring.to_vec();
    for edge in edges {
        if clipped.is_empty() {
            break;
        }
        clipped = clip_ring_edge(&clipped, *edge, rect);
    }
    clipped
}

/// Unsigned shoelace area of an open ring.
fn ring_area(ring: &[Coord<f64>]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|i| {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice.abs() / 2.0
}

fn open_ring(ring: &LineString<f64>) -> Vec<Coord<f64>> {
    let mut coords = ring.0.clone();
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    coords
}

/// Cohen-Sutherland region codes
const INSIDE: u8 = 0b0000;
const LEFT: u8 = 0b0001;
const RIGHT: u8 = 0b0010;
const BOTTOM: u8 = 0b0100;
const TOP: u8 = 0b1000;

fn outcode(p: Coord<f64>, rect: &Extent) -> u8 {
    let mut code = INSIDE;
    if p.x < rect.xmin {
        code |= LEFT;
    }
    if p.x > rect.xmax {
        code |= RIGHT;
    }
    if p.y < rect.ymin {
        code |= BOTTOM;
    }
    if p.y > rect.ymax {
        code |= TOP;
    }
    code
}

/// Part of the segment `p0`-`p1` inside `rect`.
fn clip_segment(
    mut p0: Coord<f64>,
    mut p1: Coord<f64>,
    rect: &Extent,
) -> Option<(Coord<f64>, Coord<f64>)> {
    let mut code0 = outcode(p0, rect);
    let mut code1 = outcode(p1, rect);

    loop {
        if code0 | code1 == INSIDE {
            return Some((p0, p1));
        }
        if code0 & code1 != INSIDE {
            return None;
        }

        let out = if code0 == INSIDE { code1 } else { code0 };
        let dx = p1.x - p0.x;
        let dy = p1.y - p0.y;
        let point = if out & TOP != 0 {
            Coord {
                x: p0.x + dx * (rect.ymax - p0.y) / dy,
                y: rect.ymax,
            }
        } else if out & BOTTOM != 0 {
            Coord {
                x: p0.x + dx * (rect.ymin - p0.y) / dy,
                y: rect.ymin,
            }
        } else if out & RIGHT != 0 {
            Coord {
                x: rect.xmax,
                y: p0.y + dy * (rect.xmax - p0.x) / dx,
            }
        } else {
            Coord {
                x: rect.xmin,
                y: p0.y + dy * (rect.xmin - p0.x) / dx,
            }
        };

        if out == code0 {
            p0 = point;
            code0 = outcode(p0, rect);
        } else {
            p1 = point;
            code1 = outcode(p1, rect);
        }
    }
}

/// Range of cell indices `[first, last)` touched by `[lo, hi]` along an axis
/// of `count` cells, or `None` when disjoint.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cell_range(lo: i64, hi: i64, count: usize) -> Option<(usize, usize)> {
    let count = count as i64;
    if hi < 0 || lo >= count {
        return None;
    }
    Some((lo.max(0) as usize, (hi.min(count - 1) + 1) as usize))
}

/// Whether coverage is measured as a length rather than an area fraction.
#[must_use]
pub fn is_linear(geometry: &Geometry<f64>) -> bool {
    match geometry {
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => true,
        Geometry::GeometryCollection(collection) => {
            !collection.0.is_empty() && collection.0.iter().all(is_linear)
        },
        _ => false,
    }
}

/// Name of a geometry type, as reported in errors.
fn geometry_type(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Coverage of every cell of `grid` by `geometry`, row-major.
///
/// Areal geometries give the covered fraction of each cell, clamped to
/// `[0, 1]`. Linear geometries give the length of line inside each cell.
///
/// # Errors
///
/// Returns [`InputError::UnsupportedGeometry`] for points.
pub fn coverage_fractions(grid: &Grid, geometry: &Geometry<f64>) -> Result<Vec<f64>> {
    let mut coverage = vec![0.0; grid.size()];
    accumulate(grid, geometry, &mut coverage)?;
    if !is_linear(geometry) {
        for value in &mut coverage {
            *value = value.clamp(0.0, 1.0);
        }
    }
    Ok(coverage)
}

fn accumulate(grid: &Grid, geometry: &Geometry<f64>, coverage: &mut [f64]) -> Result<()> {
    match geometry {
        Geometry::Polygon(polygon) => add_polygon(grid, polygon, coverage),
        Geometry::MultiPolygon(polygons) => {
            for polygon in polygons {
                add_polygon(grid, polygon, coverage);
            }
        },
        Geometry::Rect(rect) => add_polygon(grid, &rect.to_polygon(), coverage),
        Geometry::Triangle(triangle) => add_polygon(grid, &triangle.to_polygon(), coverage),
        Geometry::Line(line) => add_segment(grid, line.start, line.end, coverage),
        Geometry::LineString(line) => add_line(grid, line, coverage),
        Geometry::MultiLineString(lines) => {
            for line in lines {
                add_line(grid, line, coverage);
            }
        },
        Geometry::GeometryCollection(collection) => {
            for member in collection {
                accumulate(grid, member, coverage)?;
            }
        },
        Geometry::Point(_) | Geometry::MultiPoint(_) => {
            return Err(InputError::UnsupportedGeometry {
                geometry_type: geometry_type(geometry).to_string(),
            }
            .into());
        },
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn add_polygon(grid: &Grid, polygon: &Polygon<f64>, coverage: &mut [f64]) {
    let Some(bounds) = polygon.bounding_rect() else {
        return;
    };
    let bounds = Extent::from(bounds);
    let (rows, cols) = (grid.rows(), grid.cols());
    let Some((row0, row1)) = cell_range(grid.row_for_y(bounds.ymax), grid.row_for_y(bounds.ymin), rows)
    else {
        return;
    };

    let cell_area = grid.cell_area();
    let exterior = open_ring(polygon.exterior());
    let holes: Vec<Vec<Coord<f64>>> = polygon.interiors().iter().map(open_ring).collect();

    for row in row0..row1 {
        let band = Extent::new(
            grid.extent.xmin,
            grid.extent.ymax - (row + 1) as f64 * grid.dy,
            grid.extent.xmax,
            grid.extent.ymax - row as f64 * grid.dy,
        );
        let strip = clip_ring(&exterior, &[Edge::Bottom, Edge::Top], &band);
        if strip.len() < 3 {
            continue;
        }
        let hole_strips: Vec<Vec<Coord<f64>>> = holes
            .iter()
            .map(|hole| clip_ring(hole, &[Edge::Bottom, Edge::Top], &band))
            .filter(|hole| hole.len() >= 3)
            .collect();

        let (xmin, xmax) = strip
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p.x), hi.max(p.x)));
        let Some((col0, col1)) = cell_range(grid.col_for_x(xmin), grid.col_for_x(xmax), cols) else {
            continue;
        };

        for col in col0..col1 {
            let cell = grid.cell_extent(row, col);
            let mut area = ring_area(&clip_ring(&strip, &[Edge::Left, Edge::Right], &cell));
            if area <= 0.0 {
                continue;
            }
            for hole in &hole_strips {
                area -= ring_area(&clip_ring(hole, &[Edge::Left, Edge::Right], &cell));
            }
            if area > 0.0 {
                coverage[row * cols + col] += area / cell_area;
            }
        }
    }
}

fn add_line(grid: &Grid, line: &LineString<f64>, coverage: &mut [f64]) {
    for segment in line.0.windows(2) {
        add_segment(grid, segment[0], segment[1], coverage);
    }
}

fn add_segment(grid: &Grid, p0: Coord<f64>, p1: Coord<f64>, coverage: &mut [f64]) {
    let (rows, cols) = (grid.rows(), grid.cols());
    let rows_hit = cell_range(
        grid.row_for_y(p0.y.max(p1.y)),
        grid.row_for_y(p0.y.min(p1.y)),
        rows,
    );
    let cols_hit = cell_range(
        grid.col_for_x(p0.x.min(p1.x)),
        grid.col_for_x(p0.x.max(p1.x)),
        cols,
    );
    let (Some((row0, row1)), Some((col0, col1))) = (rows_hit, cols_hit) else {
        return;
    };

    for row in row0..row1 {
        for col in col0..col1 {
            let cell = grid.cell_extent(row, col);
            if let Some((a, b)) = clip_segment(p0, p1, &cell) {
                let length = (b.x - a.x).hypot(b.y - a.y);
                if length > 0.0 {
                    coverage[row * cols + col] += length;
                }
            }
        }
    }
}
