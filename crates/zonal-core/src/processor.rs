//! Drives the engine over features and raster blocks and streams one record
//! per feature to a [`Writer`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use arrow_schema::DataType;
use geo::{BoundingRect, Geometry};
use log::{debug, trace};
use rayon::prelude::*;

use crate::engine::{CellAccumulator, accumulate_block, evaluate, evaluation_grid, feature_blocks};
use crate::error::{ConfigError, InputError, Result};
use crate::grid::{Extent, Grid};
use crate::operation::Operation;
use crate::source::{FeatureSource, RasterSource, Record};
use crate::value::FieldValue;
use crate::writer::Writer;

/// Default limit on the number of cells read at once.
pub const DEFAULT_MAX_CELLS: usize = 1_000_000;

/// Default grid alignment tolerance, as a fraction of the smaller cell size.
pub const DEFAULT_GRID_TOLERANCE: f64 = 1e-6;

/// Order in which features and raster blocks are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Visit features in order and read the rasters under each one
    #[default]
    FeatureSequential,
    /// Visit raster blocks in order and accumulate every feature they touch
    RasterSequential,
    /// Like `RasterSequential`, evaluating blocks on a thread pool.
    /// Zero threads uses one per core.
    RasterParallel { threads: usize },
}

impl Strategy {
    /// Parse a strategy name; `threads` only applies to `raster-parallel`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn parse(name: &str, threads: usize) -> Result<Self> {
        match name {
            "feature-sequential" => Ok(Self::FeatureSequential),
            "raster-sequential" => Ok(Self::RasterSequential),
            "raster-parallel" => Ok(Self::RasterParallel { threads }),
            other => Err(ConfigError::InvalidOption {
                option: "strategy".to_string(),
                message: format!(
                    "'{other}' is not one of feature-sequential, raster-sequential, raster-parallel"
                ),
            }
            .into()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureSequential => "feature-sequential",
            Self::RasterSequential => "raster-sequential",
            Self::RasterParallel { .. } => "raster-parallel",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub strategy: Strategy,
    pub max_cells_in_memory: usize,
    pub grid_tolerance: f64,
    pub include_geometry: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_cells_in_memory: DEFAULT_MAX_CELLS,
            grid_tolerance: DEFAULT_GRID_TOLERANCE,
            include_geometry: false,
        }
    }
}

/// Progress callback: fraction done and a short message.
pub type ProgressFn<'a> = dyn FnMut(f64, &str) + 'a;

/// Operations sharing one (value, weight) pair, evaluated on one grid.
#[derive(Debug)]
struct SourceGroup {
    values: Arc<dyn RasterSource>,
    weights: Option<Arc<dyn RasterSource>>,
    grid: Grid,
    data_type: DataType,
    ops: Vec<usize>,
}

impl SourceGroup {
    fn accumulator(&self) -> CellAccumulator {
        CellAccumulator::new(self.data_type.clone(), self.weights.is_some())
    }

    fn accumulate(
        &self,
        acc: &mut CellAccumulator,
        block: &Grid,
        geometry: &Geometry<f64>,
    ) -> Result<()> {
        accumulate_block(acc, block, geometry, self.values.as_ref(), self.weights.as_deref())
    }
}

/// Reports strictly bounded, non-decreasing progress.
struct Progress<'a, 'b> {
    callback: &'a mut ProgressFn<'b>,
    last: f64,
}

impl<'a, 'b> Progress<'a, 'b> {
    fn new(callback: &'a mut ProgressFn<'b>) -> Self {
        Self { callback, last: 0.0 }
    }

    #[allow(clippy::cast_precision_loss)]
    fn step(&mut self, done: usize, total: usize, message: &str) {
        if total == 0 {
            return;
        }
        let fraction = (done as f64 / total as f64).clamp(self.last, 1.0);
        // 1.0 is reserved for the final call
        if fraction < 1.0 {
            self.last = fraction;
            (self.callback)(fraction, message);
        }
    }

    fn done(&mut self) {
        self.last = 1.0;
        (self.callback)(1.0, "Done");
    }
}

/// One unit of raster-ordered work: a block of a group's grid.
#[derive(Debug, Clone, Copy)]
struct Task {
    group: usize,
    block: Grid,
}

/// State of a raster-ordered pass.
struct RasterPass {
    tasks: Vec<Task>,
    features: Vec<Record>,
    extents: Vec<Option<Extent>>,
    /// Index of the last task touching each feature
    last_task: Vec<Option<usize>>,
    /// Partial accumulators by (feature, group)
    state: HashMap<(usize, usize), CellAccumulator>,
}

/// Runs operations over the features of a source.
#[derive(Debug)]
pub struct Processor<'a> {
    features: &'a dyn FeatureSource,
    ops: &'a [Operation],
    include_columns: Vec<String>,
    options: ProcessorOptions,
    groups: Vec<SourceGroup>,
}

impl<'a> Processor<'a> {
    /// Check the operations against the strategy and align their grids.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::StrategyIncompatible`] for weighted or
    /// variance operations under `raster-parallel`, and
    /// [`ConfigError::IncompatibleExtents`] when a weighting grid does not
    /// align with its value grid.
    pub fn new(
        features: &'a dyn FeatureSource,
        ops: &'a [Operation],
        include_columns: Vec<String>,
        options: ProcessorOptions,
    ) -> Result<Self> {
        if let Strategy::RasterParallel { .. } = options.strategy {
            let strategy = options.strategy.as_str();
            if ops.iter().any(Operation::is_weighted) {
                return Err(ConfigError::StrategyIncompatible {
                    kind: "Weighted",
                    strategy,
                }
                .into());
            }
            if ops.iter().any(Operation::is_variance_family) {
                return Err(ConfigError::StrategyIncompatible {
                    kind: "Variance",
                    strategy,
                }
                .into());
            }
        }

        let mut groups: Vec<SourceGroup> = Vec::new();
        for (idx, op) in ops.iter().enumerate() {
            let existing = groups.iter_mut().find(|group| {
                Arc::ptr_eq(&group.values, &op.values)
                    && match (&group.weights, &op.weights) {
                        (None, None) => true,
                        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                        _ => false,
                    }
            });
            if let Some(group) = existing {
                group.ops.push(idx);
                continue;
            }
            let grid = evaluation_grid(
                op.values.as_ref(),
                op.weights.as_deref(),
                options.grid_tolerance,
            )?;
            groups.push(SourceGroup {
                values: Arc::clone(&op.values),
                weights: op.weights.clone(),
                grid,
                data_type: op.values.data_type(),
                ops: vec![idx],
            });
        }

        debug!(
            "Processing {} operation(s) in {} source group(s) with strategy '{}'",
            ops.len(),
            groups.len(),
            options.strategy
        );
        Ok(Self {
            features,
            ops,
            include_columns,
            options,
            groups,
        })
    }

    /// Declare the output schema, process every feature and finish the
    /// writer. On error the writer is left unfinished.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a source, the engine, a custom
    /// statistic or the writer.
    pub fn process(&self, writer: &mut dyn Writer, progress: &mut ProgressFn<'_>) -> Result<()> {
        for column in &self.include_columns {
            writer.add_column(column)?;
        }
        if self.options.include_geometry {
            writer.add_geometry()?;
        }
        for op in self.ops {
            writer.add_operation(op)?;
        }

        let mut progress = Progress::new(progress);
        match self.options.strategy {
            Strategy::FeatureSequential => self.process_by_feature(writer, &mut progress)?,
            Strategy::RasterSequential => self.process_by_raster(writer, &mut progress, None)?,
            Strategy::RasterParallel { threads } => {
                self.process_by_raster(writer, &mut progress, Some(threads))?;
            },
        }
        writer.finish()?;
        progress.done();
        Ok(())
    }

    fn process_by_feature(
        &self,
        writer: &mut dyn Writer,
        progress: &mut Progress<'_, '_>,
    ) -> Result<()> {
        let total = self.features.count()?;
        let max_cells = self.options.max_cells_in_memory;

        for (index, feature) in self.features.features()?.enumerate() {
            let feature = feature?;
            let geometry = feature
                .geometry
                .as_ref()
                .ok_or(InputError::MissingGeometry { index })?;

            let mut results = vec![FieldValue::Null; self.ops.len()];
            for group in &self.groups {
                let mut acc = group.accumulator();
                for block in feature_blocks(&group.grid, geometry, max_cells) {
                    group.accumulate(&mut acc, &block, geometry)?;
                }
                for idx in &group.ops {
                    results[*idx] = evaluate(&self.ops[*idx], &acc)?;
                }
            }
            writer.write(self.record(&feature, results))?;
            progress.step(index + 1, total, "Processing features");
        }
        Ok(())
    }

    fn process_by_raster(
        &self,
        writer: &mut dyn Writer,
        progress: &mut Progress<'_, '_>,
        threads: Option<usize>,
    ) -> Result<()> {
        let mut pass = self.plan_raster_pass()?;
        for (f, last) in pass.last_task.iter().enumerate() {
            if last.is_none() {
                let results = self.evaluate_feature(&pass.state, f)?;
                writer.write(self.record(&pass.features[f], results))?;
            }
        }
        debug!(
            "Visiting {} block(s) for {} feature(s)",
            pass.tasks.len(),
            pass.features.len()
        );

        let total = pass.tasks.len();
        match threads {
            None => {
                for t in 0..total {
                    let partials = self.run_task(&pass, t)?;
                    self.complete_task(&mut pass, t, partials, writer)?;
                    progress.step(t + 1, total, "Processing raster blocks");
                }
            },
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(anyhow::Error::from)?;
                let batch = pool.current_num_threads().max(1);
                let indices: Vec<usize> = (0..total).collect();
                for chunk in indices.chunks(batch) {
                    let results: Vec<Result<Vec<(usize, CellAccumulator)>>> = pool.install(|| {
                        chunk.par_iter().map(|t| self.run_task(&pass, *t)).collect()
                    });
                    // Merge in block order
                    for (t, partials) in chunk.iter().zip(results) {
                        self.complete_task(&mut pass, *t, partials?, writer)?;
                        progress.step(t + 1, total, "Processing raster blocks");
                    }
                }
            },
        }
        Ok(())
    }

    /// Load the features and list the blocks of every group's grid.
    fn plan_raster_pass(&self) -> Result<RasterPass> {
        let mut features = Vec::new();
        let mut extents = Vec::new();
        for (index, feature) in self.features.features()?.enumerate() {
            let feature = feature?;
            let geometry = feature
                .geometry
                .as_ref()
                .ok_or(InputError::MissingGeometry { index })?;
            extents.push(geometry.bounding_rect().map(Extent::from));
            features.push(feature);
        }

        let tasks: Vec<Task> = self
            .groups
            .iter()
            .enumerate()
            .flat_map(|(group, source)| {
                source
                    .grid
                    .subdivide(self.options.max_cells_in_memory)
                    .into_iter()
                    .map(move |block| Task { group, block })
            })
            .collect();

        let mut last_task: Vec<Option<usize>> = vec![None; features.len()];
        for (t, task) in tasks.iter().enumerate() {
            for (f, extent) in extents.iter().enumerate() {
                if extent.is_some_and(|extent| task.block.extent.intersects(&extent)) {
                    last_task[f] = Some(t);
                }
            }
        }

        Ok(RasterPass {
            tasks,
            features,
            extents,
            last_task,
            state: HashMap::new(),
        })
    }

    /// Merge a block's partial results and write the features it completes.
    fn complete_task(
        &self,
        pass: &mut RasterPass,
        t: usize,
        partials: Vec<(usize, CellAccumulator)>,
        writer: &mut dyn Writer,
    ) -> Result<()> {
        let group = pass.tasks[t].group;
        for (f, partial) in partials {
            match pass.state.entry((f, group)) {
                Entry::Occupied(mut entry) => entry.get_mut().merge(partial),
                Entry::Vacant(entry) => {
                    entry.insert(partial);
                },
            }
        }
        for f in 0..pass.features.len() {
            if pass.last_task[f] != Some(t) {
                continue;
            }
            let results = self.evaluate_feature(&pass.state, f)?;
            for g in 0..self.groups.len() {
                pass.state.remove(&(f, g));
            }
            writer.write(self.record(&pass.features[f], results))?;
        }
        Ok(())
    }

    /// Accumulate one block for every feature whose bounding box touches it.
    fn run_task(&self, pass: &RasterPass, t: usize) -> Result<Vec<(usize, CellAccumulator)>> {
        let task = &pass.tasks[t];
        let group = &self.groups[task.group];
        let mut partials = Vec::new();
        for (f, feature) in pass.features.iter().enumerate() {
            let Some(extent) = pass.extents[f] else {
                continue;
            };
            let Some(window) = task.block.crop(&extent) else {
                continue;
            };
            let Some(geometry) = feature.geometry.as_ref() else {
                continue;
            };
            let mut acc = group.accumulator();
            group.accumulate(&mut acc, &window, geometry)?;
            partials.push((f, acc));
        }
        trace!(
            "Block {}x{} of '{}' touched {} feature(s)",
            task.block.cols(),
            task.block.rows(),
            group.values.name(),
            partials.len()
        );
        Ok(partials)
    }

    fn evaluate_feature(
        &self,
        state: &HashMap<(usize, usize), CellAccumulator>,
        feature: usize,
    ) -> Result<Vec<FieldValue>> {
        let mut results = vec![FieldValue::Null; self.ops.len()];
        for (g, group) in self.groups.iter().enumerate() {
            let empty;
            let acc = match state.get(&(feature, g)) {
                Some(acc) => acc,
                None => {
                    empty = group.accumulator();
                    &empty
                },
            };
            for idx in &group.ops {
                results[*idx] = evaluate(&self.ops[*idx], acc)?;
            }
        }
        Ok(results)
    }

    /// Result record: include columns, optional geometry, one field per
    /// operation.
    fn record(&self, feature: &Record, results: Vec<FieldValue>) -> Record {
        let mut record = Record {
            id: feature.id.clone(),
            ..Record::default()
        };
        for column in &self.include_columns {
            let value = feature
                .properties
                .get(column)
                .cloned()
                .or_else(|| (column == "id").then(|| feature.id.clone()).flatten())
                .unwrap_or(FieldValue::Null);
            record.properties.insert(column.clone(), value);
        }
        if self.options.include_geometry {
            record.geometry = feature.geometry.clone();
        }
        for (op, value) in self.ops.iter().zip(results) {
            record.properties.insert(op.field_name.clone(), value);
        }
        record
    }
}

/// Run `ops` over `features` with the given settings.
///
/// # Errors
///
/// See [`Processor::new`] and [`Processor::process`].
pub fn process(
    features: &dyn FeatureSource,
    writer: &mut dyn Writer,
    ops: &[Operation],
    include_columns: &[String],
    options: ProcessorOptions,
    progress: &mut ProgressFn<'_>,
) -> Result<()> {
    Processor::new(features, ops, include_columns.to_vec(), options)?.process(writer, progress)
}
