//! Display utilities for formatting CLI output.
//!
//! This module provides table row structures and formatting functions
//! for presenting the statistic registry, raster bands and extraction
//! results in a human-readable format.

use std::sync::Arc;

use tabled::builder::Builder;
use tabled::{Table, Tabled};

use zonal_core::source::{RasterSource, Record};
use zonal_core::stats::StatDef;
use zonal_core::value::FieldValue;

/// Table row representation for displaying a statistic.
#[derive(Tabled)]
pub struct StatRow {
    /// Registry name of the statistic.
    #[tabled(rename = "Stat")]
    pub name: String,
    /// Whether the statistic yields a scalar or an array.
    #[tabled(rename = "Kind")]
    pub kind: String,
    /// Whether a weighting raster is required.
    #[tabled(rename = "Weighted")]
    pub weighted: String,
    /// Accepted arguments, comma separated.
    #[tabled(rename = "Arguments")]
    pub args: String,
    #[tabled(rename = "Description")]
    pub description: String,
}

impl From<&StatDef> for StatRow {
    fn from(stat: &StatDef) -> Self {
        Self {
            name: stat.name.to_string(),
            kind: stat.kind.as_str().to_string(),
            weighted: if stat.requires_weights { "Yes" } else { "No" }.to_string(),
            args: stat.args.join(", "),
            description: stat.description.to_string(),
        }
    }
}

/// Table row representation for displaying a raster band.
#[derive(Tabled)]
pub struct BandRow {
    /// Band name used in output field names.
    #[tabled(rename = "Band")]
    pub name: String,
    #[tabled(rename = "Size")]
    pub size: String,
    /// Cell size as `dx x dy`.
    #[tabled(rename = "Resolution")]
    pub resolution: String,
    /// Bounds as `xmin, ymin, xmax, ymax`.
    #[tabled(rename = "Extent")]
    pub extent: String,
    #[tabled(rename = "Type")]
    pub data_type: String,
    #[tabled(rename = "NoData")]
    pub nodata: String,
    #[tabled(rename = "CRS")]
    pub crs: String,
}

impl From<&Arc<dyn RasterSource>> for BandRow {
    fn from(band: &Arc<dyn RasterSource>) -> Self {
        let grid = band.grid();
        let extent = grid.extent;
        let name = if band.name().is_empty() {
            "(unnamed)".to_string()
        } else {
            band.name().to_string()
        };
        Self {
            name,
            size: format!("{} x {}", grid.cols(), grid.rows()),
            resolution: format!("{} x {}", grid.dx, grid.dy),
            extent: format!(
                "{}, {}, {}, {}",
                extent.xmin, extent.ymin, extent.xmax, extent.ymax
            ),
            data_type: band.data_type().to_string(),
            nodata: band
                .nodata()
                .map_or_else(|| "N/A".to_string(), |nodata| nodata.to_string()),
            crs: band
                .spatial_reference()
                .map_or_else(|| "N/A".to_string(), ToString::to_string),
        }
    }
}

/// Render the statistic registry as a table.
#[must_use]
pub fn stats_table(stats: &[StatDef]) -> String {
    Table::new(stats.iter().map(StatRow::from)).to_string()
}

/// Render raster bands as a table.
#[must_use]
pub fn bands_table(bands: &[Arc<dyn RasterSource>]) -> String {
    Table::new(bands.iter().map(BandRow::from)).to_string()
}

/// Render result records as a table with one column per property.
///
/// Geometries are left out; absent values are shown as empty cells.
#[must_use]
pub fn records_table(records: &[Record]) -> String {
    let Some(first) = records.first() else {
        return String::new();
    };
    let mut builder = Builder::default();
    builder.push_record(first.properties.keys().cloned());
    for record in records {
        builder.push_record(record.properties.values().map(cell));
    }
    builder.build().to_string()
}

fn cell(value: &FieldValue) -> String {
    match value {
        FieldValue::Absent => String::new(),
        other => other.to_string(),
    }
}
