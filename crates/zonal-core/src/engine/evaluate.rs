//! Statistic evaluation over accumulated cells.
//!
//! For every included cell `c` is the coverage weight chosen by the
//! operation's `coverage_weight`, `v` the value and `w` the weight. Cells
//! with a null value (after `default_value`) are skipped by every built-in
//! statistic.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::compute::{cast, take};
use arrow_array::{ArrayRef, Float64Array, Int64Array, UInt32Array};

use super::accumulator::CellAccumulator;
use crate::error::Result;
use crate::operation::{CoverageWeight, Operation, OperationKind, StatArgs, StatInputs};
use crate::value::FieldValue;

/// Cells of one feature that pass the operation's coverage filter.
struct Cells {
    /// Included cells, in accumulation order
    typed: ArrayRef,
    values: Vec<Option<f64>>,
    coverage: Vec<f64>,
    c: Vec<f64>,
    weights: Vec<Option<f64>>,
    center_x: Vec<f64>,
    center_y: Vec<f64>,
    cell_id: Vec<i64>,
}

impl Cells {
    #[allow(clippy::cast_possible_truncation)]
    fn select(acc: &CellAccumulator, args: &StatArgs) -> Result<Self> {
        let source: Vec<usize> = acc
            .coverage()
            .iter()
            .enumerate()
            .filter(|(_, cov)| **cov > 0.0 && **cov >= args.min_coverage_frac)
            .map(|(idx, _)| idx)
            .collect();

        let values: Vec<Option<f64>> = source
            .iter()
            .map(|idx| acc.values()[*idx].or(args.default_value))
            .collect();
        let coverage: Vec<f64> = source.iter().map(|idx| acc.coverage()[*idx]).collect();
        let c = source
            .iter()
            .map(|idx| match args.coverage_weight {
                CoverageWeight::None => 1.0,
                CoverageWeight::Fraction => acc.coverage()[*idx],
                CoverageWeight::AreaCartesian => acc.coverage()[*idx] * acc.cell_area()[*idx],
            })
            .collect();
        let weights = match acc.weights() {
            Some(weights) => source
                .iter()
                .map(|idx| weights[*idx].or(args.default_weight))
                .collect(),
            None => vec![None; source.len()],
        };

        let pick = |column: &[f64]| -> Vec<f64> { source.iter().map(|idx| column[*idx]).collect() };
        let center_x = pick(acc.center_x());
        let center_y = pick(acc.center_y());
        let cell_id = source.iter().map(|idx| acc.cell_id()[*idx]).collect();

        let typed = if args.default_value.is_some() {
            let substituted: ArrayRef = Arc::new(Float64Array::from(values.clone()));
            cast(&substituted, acc.data_type())?
        } else {
            let indices = UInt32Array::from(source.iter().map(|idx| *idx as u32).collect::<Vec<_>>());
            take(acc.typed_values()?.as_ref(), &indices, None)?
        };

        Ok(Self {
            typed,
            values,
            coverage,
            c,
            weights,
            center_x,
            center_y,
            cell_id,
        })
    }

    /// Positions of cells with a value.
    fn valid(&self) -> Vec<usize> {
        (0..self.values.len()).filter(|pos| self.values[*pos].is_some()).collect()
    }

    fn value(&self, pos: usize) -> f64 {
        self.values[pos].unwrap_or(f64::NAN)
    }

    fn typed_at(&self, pos: usize) -> FieldValue {
        FieldValue::from_array_index(&self.typed, pos)
    }

    /// `(pos, v, c)` of valid cells sorted by value, stable.
    fn sorted(&self) -> Vec<(usize, f64, f64)> {
        let mut sorted: Vec<_> = self
            .valid()
            .into_iter()
            .map(|pos| (pos, self.value(pos), self.c[pos]))
            .collect();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        sorted
    }

    /// Positions of valid cells grouped by distinct value, ascending. Within
    /// a group positions are ascending.
    fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<(f64, Vec<usize>)> = Vec::new();
        for (pos, value, _) in self.sorted() {
            match groups.last_mut() {
                Some((last, members)) if last.total_cmp(&value) == Ordering::Equal => {
                    members.push(pos);
                },
                _ => groups.push((value, vec![pos])),
            }
        }
        groups.into_iter().map(|(_, members)| members).collect()
    }

    /// Weight of a valid cell, or `None` when it has no usable weight.
    fn weight(&self, pos: usize) -> Option<f64> {
        self.weights[pos]
    }
}

/// Evaluate one operation over the cells a feature touched.
///
/// # Errors
///
/// Returns an error if array gathering fails or a custom statistic raises.
pub fn evaluate(op: &Operation, acc: &CellAccumulator) -> Result<FieldValue> {
    let cells = Cells::select(acc, &op.args)?;
    match &op.kind {
        OperationKind::Custom(custom) => {
            if cells.coverage.is_empty() {
                return Ok(FieldValue::Null);
            }
            let weights = custom.is_weighted().then(|| {
                cells
                    .weights
                    .iter()
                    .map(|w| w.unwrap_or(f64::NAN))
                    .collect()
            });
            custom.call(&StatInputs {
                values: cells.typed.clone(),
                coverage: cells.coverage.clone(),
                weights,
            })
        },
        OperationKind::Builtin(def) => builtin(def.name, &op.args, &cells),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn builtin(name: &str, args: &StatArgs, cells: &Cells) -> Result<FieldValue> {
    let valid = cells.valid();
    let sum_c: f64 = valid.iter().map(|pos| cells.c[*pos]).sum();
    let sum_cv: f64 = valid.iter().map(|pos| cells.c[*pos] * cells.value(*pos)).sum();
    let mean = sum_cv / sum_c;

    let value = match name {
        "count" => FieldValue::Float(sum_c),
        "sum" => FieldValue::Float(sum_cv),
        "mean" => FieldValue::Float(mean),
        "min" | "max" => extreme(cells, &valid, name == "max")
            .map_or(FieldValue::Null, |pos| cells.typed_at(pos)),
        "min_center_x" | "min_center_y" | "max_center_x" | "max_center_y" => {
            extreme(cells, &valid, name.starts_with("max")).map_or(FieldValue::Null, |pos| {
                FieldValue::Float(if name.ends_with('x') {
                    cells.center_x[pos]
                } else {
                    cells.center_y[pos]
                })
            })
        },
        "majority" | "mode" | "minority" => {
            let groups = cells.groups();
            let mut best: Option<(f64, usize)> = None;
            for members in &groups {
                let total: f64 = members.iter().map(|pos| cells.c[*pos]).sum();
                let better = match best {
                    None => true,
                    Some((current, _)) if name == "minority" => total < current,
                    Some((current, _)) => total > current,
                };
                if better {
                    best = Some((total, members[0]));
                }
            }
            best.map_or(FieldValue::Null, |(_, pos)| cells.typed_at(pos))
        },
        "variety" => FieldValue::Int(cells.groups().len() as i64),
        "variance" | "stdev" | "coefficient_of_variation" => {
            let variance = valid
                .iter()
                .map(|pos| cells.c[*pos] * (cells.value(*pos) - mean).powi(2))
                .sum::<f64>()
                / sum_c;
            FieldValue::Float(match name {
                "variance" => variance,
                "stdev" => variance.sqrt(),
                _ => variance.sqrt() / mean,
            })
        },
        "median" => FieldValue::Float(quantile(cells, 0.5)),
        "quantile" => FieldValue::Float(quantile(cells, args.q.unwrap_or(0.5))),
        "weighted_mean" | "weighted_sum" | "weighted_variance" | "weighted_stdev" => {
            FieldValue::Float(weighted(name, cells, &valid))
        },
        "values" => FieldValue::Array(gather(&cells.typed, &valid)?),
        "coverage" => float_array(valid.iter().map(|pos| Some(cells.coverage[*pos]))),
        "weights" => float_array(valid.iter().map(|pos| cells.weight(*pos))),
        "center_x" => float_array(valid.iter().map(|pos| Some(cells.center_x[*pos]))),
        "center_y" => float_array(valid.iter().map(|pos| Some(cells.center_y[*pos]))),
        "cell_id" => FieldValue::Array(Arc::new(Int64Array::from(
            valid.iter().map(|pos| cells.cell_id[*pos]).collect::<Vec<_>>(),
        ))),
        "unique" => {
            let firsts: Vec<usize> = cells.groups().iter().map(|members| members[0]).collect();
            FieldValue::Array(gather(&cells.typed, &firsts)?)
        },
        "frac" | "weighted_frac" => {
            let groups = cells.groups();
            let share = |pos: &usize| -> Option<f64> {
                if name == "frac" {
                    Some(cells.c[*pos])
                } else {
                    cells.weight(*pos).map(|w| w * cells.c[*pos])
                }
            };
            let total: Option<f64> = valid.iter().map(share).sum();
            float_array(groups.iter().map(|members| {
                let part: Option<f64> = members.iter().map(share).sum();
                Some(match (part, total) {
                    (Some(part), Some(total)) => part / total,
                    _ => f64::NAN,
                })
            }))
        },
        _ => FieldValue::Null,
    };
    Ok(value)
}

/// Position of the smallest (or largest) valid value; the first wins ties.
fn extreme(cells: &Cells, valid: &[usize], largest: bool) -> Option<usize> {
    valid.iter().copied().reduce(|best, pos| {
        let ordering = cells.value(pos).total_cmp(&cells.value(best));
        let better = if largest {
            ordering == Ordering::Greater
        } else {
            ordering == Ordering::Less
        };
        if better { pos } else { best }
    })
}

/// First sorted value whose cumulative coverage reaches `q` of the total.
fn quantile(cells: &Cells, q: f64) -> f64 {
    let sorted = cells.sorted();
    let total: f64 = sorted.iter().map(|(_, _, c)| c).sum();
    if sorted.is_empty() || total <= 0.0 {
        return f64::NAN;
    }
    let mut cumulative = 0.0;
    for (_, value, c) in &sorted {
        cumulative += c;
        if cumulative / total >= q {
            return *value;
        }
    }
    sorted.last().map_or(f64::NAN, |(_, value, _)| *value)
}

/// Weighted statistics. Any valid cell without a weight makes the result NaN.
fn weighted(name: &str, cells: &Cells, valid: &[usize]) -> f64 {
    let mut terms = Vec::with_capacity(valid.len());
    for pos in valid {
        let Some(w) = cells.weight(*pos) else {
            return f64::NAN;
        };
        terms.push((cells.c[*pos] * w, cells.value(*pos)));
    }

    let sum_cw: f64 = terms.iter().map(|(cw, _)| cw).sum();
    let sum_cwv: f64 = terms.iter().map(|(cw, v)| cw * v).sum();
    if name == "weighted_sum" {
        return sum_cwv;
    }
    let mean = sum_cwv / sum_cw;
    if name == "weighted_mean" {
        return mean;
    }
    let variance = terms.iter().map(|(cw, v)| cw * (v - mean).powi(2)).sum::<f64>() / sum_cw;
    if name == "weighted_variance" { variance } else { variance.sqrt() }
}

#[allow(clippy::cast_possible_truncation)]
fn gather(array: &ArrayRef, positions: &[usize]) -> Result<ArrayRef> {
    let indices = UInt32Array::from(positions.iter().map(|pos| *pos as u32).collect::<Vec<_>>());
    Ok(take(array.as_ref(), &indices, None)?)
}

fn float_array(values: impl Iterator<Item = Option<f64>>) -> FieldValue {
    FieldValue::Array(Arc::new(values.collect::<Float64Array>()))
}
