//! ESRI ASCII grid (`.asc`) rasters.
//!
//! The header is read when the file is opened; cell values are parsed on
//! first read. A `.prj` file next to the grid supplies the spatial reference.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use arrow_array::{ArrayRef, Float64Array, Int32Array};
use arrow_schema::DataType;
use log::debug;
use zonal_shared::{FormatError, SourcePosition};

use super::raster::{RasterSource, mask_nodata, slice_window};
use crate::error::{IoErrorExt, Result};
use crate::grid::{Extent, Grid};

#[derive(Debug, Clone, PartialEq)]
struct AsciiHeader {
    cols: usize,
    rows: usize,
    grid: Grid,
    nodata: Option<f64>,
    /// Line index (0-based) where cell values start
    data_start: usize,
    data_type: DataType,
}

/// A band read from an ESRI ASCII grid.
#[derive(Debug)]
pub struct AsciiGrid {
    path: PathBuf,
    header: AsciiHeader,
    spatial_reference: Option<String>,
    values: OnceLock<ArrayRef>,
}

impl AsciiGrid {
    /// Open a grid and read its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the header is invalid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path).with_read_context("ASCII grid", &path)?;
        let header = parse_header(&text, &path.display().to_string())?;

        let prj = path.with_extension("prj");
        let spatial_reference = if prj.is_file() {
            let wkt = fs::read_to_string(&prj).with_read_context("PRJ", &prj)?;
            Some(wkt.trim().to_string()).filter(|s| !s.is_empty())
        } else {
            None
        };
        debug!(
            "Opened ASCII grid {} ({}x{}, {:?})",
            path.display(),
            header.cols,
            header.rows,
            header.data_type
        );

        Ok(Self {
            path,
            header,
            spatial_reference,
            values: OnceLock::new(),
        })
    }

    /// Whether `path` looks like an ASCII grid.
    pub(crate) fn sniff(path: &Path) -> bool {
        let by_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("asc"));
        by_extension
            || fs::read(path).ok().is_some_and(|bytes| {
                bytes
                    .get(..5)
                    .is_some_and(|head| head.eq_ignore_ascii_case(b"ncols"))
            })
    }

    fn values(&self) -> Result<&ArrayRef> {
        if let Some(values) = self.values.get() {
            return Ok(values);
        }
        let text = fs::read_to_string(&self.path).with_read_context("ASCII grid", &self.path)?;
        let parsed = parse_values(&text, &self.header, &self.path.display().to_string())?;
        Ok(self.values.get_or_init(|| parsed))
    }
}

impl RasterSource for AsciiGrid {
    fn name(&self) -> &str {
        ""
    }

    fn grid(&self) -> Grid {
        self.header.grid
    }

    fn nodata(&self) -> Option<f64> {
        self.header.nodata
    }

    fn spatial_reference(&self) -> Option<&str> {
        self.spatial_reference.as_deref()
    }

    fn data_type(&self) -> DataType {
        self.header.data_type.clone()
    }

    fn read_window(
        &self,
        col_offset: usize,
        row_offset: usize,
        width: usize,
        height: usize,
    ) -> Result<ArrayRef> {
        let window = slice_window(
            self.values()?,
            self.header.cols,
            self.header.rows,
            (col_offset, row_offset, width, height),
            &self.path.display().to_string(),
        )?;
        mask_nodata(window, self.header.nodata)
    }
}

/// Open `path` as a single-band source.
pub(crate) fn open(path: &Path) -> Result<Vec<Arc<dyn RasterSource>>> {
    Ok(vec![Arc::new(AsciiGrid::open(path)?)])
}

fn parse_error(message: String, line: usize, context: &str) -> FormatError {
    FormatError::Parse {
        message,
        position: Some(SourcePosition::line(line as u64 + 1)),
        context: Some(context.to_string()),
    }
}

#[allow(clippy::cast_precision_loss)]
fn parse_header(text: &str, context: &str) -> Result<AsciiHeader> {
    let mut cols = None;
    let mut rows = None;
    let mut x = None;
    let mut y = None;
    let mut centered = false;
    let mut cellsize = None;
    let mut dx = None;
    let mut dy = None;
    let mut nodata = None;
    let mut data_start = 0;

    for (idx, line) in text.lines().enumerate() {
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else {
            data_start = idx + 1;
            continue;
        };
        if key.parse::<f64>().is_ok() {
            break;
        }
        let value = tokens
            .next()
            .ok_or_else(|| parse_error(format!("header key '{key}' has no value"), idx, context))?;
        let number = value
            .parse::<f64>()
            .map_err(|_| parse_error(format!("invalid number '{value}' for '{key}'"), idx, context))?;

        match key.to_ascii_lowercase().as_str() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            "ncols" => cols = Some(number as usize),
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            "nrows" => rows = Some(number as usize),
            "xllcorner" => x = Some(number),
            "yllcorner" => y = Some(number),
            "xllcenter" => {
                x = Some(number);
                centered = true;
            },
            "yllcenter" => {
                y = Some(number);
                centered = true;
            },
            "cellsize" => cellsize = Some(number),
            "dx" => dx = Some(number),
            "dy" => dy = Some(number),
            "nodata_value" => nodata = Some(number),
            other => {
                return Err(parse_error(format!("unknown header key '{other}'"), idx, context).into());
            },
        }
        data_start = idx + 1;
    }

    let missing = |key: &str| parse_error(format!("missing header key '{key}'"), data_start, context);
    let cols = cols.ok_or_else(|| missing("ncols"))?;
    let rows = rows.ok_or_else(|| missing("nrows"))?;
    let dx = dx.or(cellsize).ok_or_else(|| missing("cellsize"))?;
    let dy = dy.or(cellsize).ok_or_else(|| missing("cellsize"))?;
    let mut xmin = x.ok_or_else(|| missing("xllcorner"))?;
    let mut ymin = y.ok_or_else(|| missing("yllcorner"))?;
    if centered {
        xmin -= dx / 2.0;
        ymin -= dy / 2.0;
    }

    let all_integers = text
        .lines()
        .skip(data_start)
        .flat_map(str::split_whitespace)
        .all(|token| token.parse::<i32>().is_ok());

    Ok(AsciiHeader {
        cols,
        rows,
        grid: Grid::new(
            Extent::new(xmin, ymin, xmin + cols as f64 * dx, ymin + rows as f64 * dy),
            dx,
            dy,
        ),
        nodata,
        data_start,
        data_type: if all_integers {
            DataType::Int32
        } else {
            DataType::Float64
        },
    })
}

fn parse_values(text: &str, header: &AsciiHeader, context: &str) -> Result<ArrayRef> {
    let tokens: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .skip(header.data_start)
        .flat_map(|(idx, line)| line.split_whitespace().map(move |t| (idx, t)))
        .collect();
    let expected = header.rows * header.cols;
    if tokens.len() != expected {
        return Err(parse_error(
            format!("expected {expected} cell values, found {}", tokens.len()),
            header.data_start,
            context,
        )
        .into());
    }

    let array: ArrayRef = if header.data_type == DataType::Int32 {
        let values = tokens
            .iter()
            .map(|(idx, token)| {
                token
                    .parse::<i32>()
                    .map_err(|_| parse_error(format!("invalid integer '{token}'"), *idx, context))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Arc::new(Int32Array::from(values))
    } else {
        let values = tokens
            .iter()
            .map(|(idx, token)| {
                token
                    .parse::<f64>()
                    .map_err(|_| parse_error(format!("invalid number '{token}'"), *idx, context))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Arc::new(Float64Array::from(values))
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;
    use tempfile::TempDir;

    const GRID: &str = "ncols 3\nnrows 2\nxllcorner 10\nyllcorner 20\ncellsize 2\nNODATA_value -9999\n1 2 3\n4 -9999 6\n";

    #[test]
    fn test_open_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dem.asc");
        fs::write(&path, GRID).unwrap();
        fs::write(dir.path().join("dem.prj"), "EPSG:32633\n").unwrap();

        let grid = AsciiGrid::open(&path).unwrap();
        assert_eq!(grid.extent(), Extent::new(10.0, 20.0, 16.0, 24.0));
        assert_eq!(grid.data_type(), DataType::Int32);
        assert_eq!(grid.spatial_reference(), Some("EPSG:32633"));

        let window = grid.read_window(0, 1, 3, 1).unwrap();
        assert_eq!(window.len(), 3);
        assert!(window.is_null(1));
    }

    #[test]
    fn test_float_values_and_centers() {
        let text = "ncols 2\nnrows 1\nxllcenter 0.5\nyllcenter 0.5\ncellsize 1\n1.5 2\n";
        let header = parse_header(text, "inline").unwrap();
        assert_eq!(header.data_type, DataType::Float64);
        assert_eq!(header.grid.extent, Extent::new(0.0, 0.0, 2.0, 1.0));
    }

    #[test]
    fn test_value_count_mismatch() {
        let text = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        let header = parse_header(text, "inline").unwrap();
        let err = parse_values(text, &header, "inline").unwrap_err();
        assert!(err.to_string().contains("expected 4 cell values"));
    }

    #[test]
    fn test_missing_header_key() {
        let err = parse_header("ncols 2\n1 2\n", "inline").unwrap_err();
        assert!(err.to_string().contains("nrows"));
    }
}
