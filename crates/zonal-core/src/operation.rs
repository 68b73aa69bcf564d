//! Operation builder.
//!
//! Expands stat requests across value and weight rasters into a flat,
//! deterministically named list of [`Operation`]s.
//!
//! # Pairing
//!
//! Value and weight lists of equal length are zipped. A list of length one is
//! recycled against the other. With no weights every value raster pairs with
//! no weight.
//!
//! # Naming
//!
//! With a single (value, weight) pair a field is named after the stat, or its
//! alias. Otherwise unweighted stats are named `{value}_{stat}` and weighted
//! stats `{value}_{weight}_{stat}`, skipping empty source names.
//!
//! ```
//! use std::sync::Arc;
//! use arrow_array::{ArrayRef, Float64Array};
//! use zonal_core::operation::{OperationBuilder, StatRequest};
//! use zonal_core::source::{MemoryRaster, RasterSource};
//!
//! let band = |name: &str| -> Arc<dyn RasterSource> {
//!     let values: ArrayRef = Arc::new(Float64Array::from(vec![1.0; 4]));
//!     Arc::new(MemoryRaster::new(values, 2, 2).unwrap().with_name(name))
//! };
//! let ops = OperationBuilder::new()
//!     .build(
//!         &[StatRequest::from("count"), StatRequest::from("mean")],
//!         &[band("a"), band("b")],
//!         &[],
//!     )
//!     .unwrap();
//! let names: Vec<_> = ops.iter().map(|op| op.field_name.as_str()).collect();
//! assert_eq!(names, vec!["a_count", "a_mean", "b_count", "b_mean"]);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow_array::ArrayRef;
use arrow_schema::DataType;
use indexmap::IndexMap;
use log::debug;

use crate::error::{BoxError, ConfigError, InputError, Result};
use crate::source::RasterSource;
use crate::stats::{StatDef, StatKind, find_stat, get_stat_names};
use crate::value::FieldValue;

/// Prefix marking an injected key field that the writer folds into a map.
pub const KEY_MARKER: &str = "__key__";

/// How the coverage of each cell is turned into its weight `c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverageWeight {
    /// Every touched cell counts fully
    None,
    /// Fraction of the cell covered by the feature
    #[default]
    Fraction,
    /// Covered area in squared map units
    AreaCartesian,
}

impl CoverageWeight {
    /// Parse an option value.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "fraction" => Ok(Self::Fraction),
            "area_cartesian" => Ok(Self::AreaCartesian),
            other => Err(ConfigError::InvalidOption {
                option: "coverage_weight".to_string(),
                message: format!(
                    "'{other}' is not one of none, fraction, area_cartesian"
                ),
            }
            .into()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fraction => "fraction",
            Self::AreaCartesian => "area_cartesian",
        }
    }
}

/// Parsed stat arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatArgs {
    /// Cells covered by less than this fraction are ignored
    pub min_coverage_frac: f64,
    pub coverage_weight: CoverageWeight,
    /// Substitute for nodata values
    pub default_value: Option<f64>,
    /// Substitute for nodata weights
    pub default_weight: Option<f64>,
    /// Quantile in `[0, 1]`
    pub q: Option<f64>,
}

impl StatArgs {
    fn parse(stat: &StatDef, raw: &IndexMap<String, String>) -> Result<Self> {
        let mut args = Self::default();
        for (key, value) in raw {
            if !stat.accepts_arg(key) {
                return Err(ConfigError::InvalidOption {
                    option: key.clone(),
                    message: format!("not accepted by stat '{}'", stat.name),
                }
                .into());
            }
            match key.as_str() {
                "min_coverage_frac" => {
                    let frac = parse_number(key, value)?;
                    if !(0.0..=1.0).contains(&frac) {
                        return Err(invalid(key, "must be between 0 and 1"));
                    }
                    args.min_coverage_frac = frac;
                },
                "coverage_weight" => args.coverage_weight = CoverageWeight::parse(value)?,
                "default_value" => args.default_value = Some(parse_number(key, value)?),
                "default_weight" => args.default_weight = Some(parse_number(key, value)?),
                "q" => {
                    let q = parse_number(key, value)?;
                    if !(0.0..=1.0).contains(&q) {
                        return Err(invalid(key, "must be between 0 and 1"));
                    }
                    args.q = Some(q);
                },
                _ => {},
            }
        }
        if stat.name == "quantile" && args.q.is_none() {
            return Err(ConfigError::MissingRequired {
                option: "q (for quantile)".to_string(),
            }
            .into());
        }
        Ok(args)
    }
}

fn invalid(option: &str, message: &str) -> crate::error::ZonalError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        message: message.to_string(),
    }
    .into()
}

fn parse_number(option: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| invalid(option, &format!("'{value}' is not a number")))
}

/// A parsed `alias=stat(k=v,...)` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatSpec {
    pub alias: Option<String>,
    pub stat: String,
    pub args: IndexMap<String, String>,
}

impl StatSpec {
    /// Parse `stat`, `stat(k=v,...)` or `alias=stat(k=v,...)`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed requests.
    ///
    /// # Examples
    ///
    /// ```
    /// use zonal_core::operation::StatSpec;
    ///
    /// let spec = StatSpec::parse("p90=quantile(q=0.9)").unwrap();
    /// assert_eq!(spec.alias.as_deref(), Some("p90"));
    /// assert_eq!(spec.stat, "quantile");
    /// assert_eq!(spec.args["q"], "0.9");
    /// ```
    pub fn parse(request: &str) -> Result<Self> {
        let malformed = |message: &str| -> crate::error::ZonalError {
            ConfigError::InvalidOption {
                option: "stat".to_string(),
                message: format!("cannot parse '{request}': {message}"),
            }
            .into()
        };

        let request = request.trim();
        let paren = request.find('(').unwrap_or(request.len());
        let (alias, rest) = match request[..paren].split_once('=') {
            Some((alias, _)) => (Some(alias.trim().to_string()), &request[alias.len() + 1..]),
            None => (None, request),
        };
        if alias.as_deref() == Some("") {
            return Err(malformed("empty alias"));
        }

        let (stat, args_text) = match rest.split_once('(') {
            Some((stat, tail)) => {
                let inner = tail
                    .strip_suffix(')')
                    .ok_or_else(|| malformed("missing closing parenthesis"))?;
                (stat.trim(), Some(inner))
            },
            None => (rest.trim(), None),
        };
        if stat.is_empty() {
            return Err(malformed("empty stat name"));
        }

        let mut args = IndexMap::new();
        for pair in args_text
            .into_iter()
            .flat_map(|text| text.split(','))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| malformed(&format!("argument '{pair}' is not key=value")))?;
            args.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self {
            alias,
            stat: stat.to_string(),
            args,
        })
    }
}

impl fmt::Display for StatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}=")?;
        }
        f.write_str(&self.stat)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "({})", args.join(","))?;
        }
        Ok(())
    }
}

/// Inputs handed to a custom statistic for one feature.
///
/// Only cells with coverage greater than zero are included. Nodata cells
/// are null in `values`.
#[derive(Debug, Clone)]
pub struct StatInputs {
    pub values: ArrayRef,
    pub coverage: Vec<f64>,
    /// Present for weighted statistics
    pub weights: Option<Vec<f64>>,
}

/// Signature of a custom statistic.
pub type StatFn = dyn Fn(&StatInputs) -> std::result::Result<FieldValue, BoxError> + Send + Sync;

/// A user-supplied statistic.
///
/// The declared arity decides whether it is weighted: `(values, coverage)`
/// is unweighted and `(values, coverage, weights)` is weighted.
#[derive(Clone)]
pub struct CustomStat {
    name: String,
    arity: usize,
    func: Arc<StatFn>,
}

impl CustomStat {
    /// Wrap a function with a declared argument count.
    ///
    /// # Errors
    ///
    /// Returns an error unless `arity` is 2 or 3.
    pub fn new<F>(name: impl Into<String>, arity: usize, func: F) -> Result<Self>
    where
        F: Fn(&StatInputs) -> std::result::Result<FieldValue, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        if !(2..=3).contains(&arity) {
            return Err(ConfigError::InvalidArity {
                function: name,
                arity,
            }
            .into());
        }
        Ok(Self {
            name,
            arity,
            func: Arc::new(func),
        })
    }

    /// A `(values, coverage)` statistic.
    pub fn unweighted<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StatInputs) -> std::result::Result<FieldValue, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity: 2,
            func: Arc::new(func),
        }
    }

    /// A `(values, coverage, weights)` statistic.
    pub fn weighted<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StatInputs) -> std::result::Result<FieldValue, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity: 3,
            func: Arc::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    #[must_use]
    pub fn is_weighted(&self) -> bool {
        self.arity == 3
    }

    /// Same function object with the same arity.
    fn same_function(&self, other: &CustomStat) -> bool {
        self.arity == other.arity && Arc::ptr_eq(&self.func, &other.func)
    }

    /// Built-in stat used to derive names and sources.
    fn dummy_stat(&self) -> &'static str {
        if self.is_weighted() {
            "weighted_sum"
        } else {
            "count"
        }
    }

    /// Call the function.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ZonalError::Callback`] wrapping the function's error.
    pub fn call(&self, inputs: &StatInputs) -> Result<FieldValue> {
        (self.func)(inputs).map_err(|source| crate::error::ZonalError::Callback {
            name: self.name.clone(),
            source,
        })
    }
}

impl fmt::Debug for CustomStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStat")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// One requested statistic.
#[derive(Debug, Clone)]
pub enum StatRequest {
    /// `stat`, `stat(k=v,...)` or `alias=stat(k=v,...)`
    Named(String),
    /// A user function
    Custom(CustomStat),
}

impl From<&str> for StatRequest {
    fn from(request: &str) -> Self {
        Self::Named(request.to_string())
    }
}

impl From<String> for StatRequest {
    fn from(request: String) -> Self {
        Self::Named(request)
    }
}

impl From<CustomStat> for StatRequest {
    fn from(stat: CustomStat) -> Self {
        Self::Custom(stat)
    }
}

/// What an operation computes.
#[derive(Debug, Clone)]
pub enum OperationKind {
    Builtin(StatDef),
    Custom(CustomStat),
}

/// A named statistic bound to its sources.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Output field, unique within one extraction
    pub field_name: String,
    pub kind: OperationKind,
    pub values: Arc<dyn RasterSource>,
    /// Set only for operations that use weights
    pub weights: Option<Arc<dyn RasterSource>>,
    pub args: StatArgs,
}

impl Operation {
    /// Built-in stat name, or the custom function's name.
    #[must_use]
    pub fn stat_name(&self) -> &str {
        match &self.kind {
            OperationKind::Builtin(def) => def.name,
            OperationKind::Custom(custom) => custom.name(),
        }
    }

    #[must_use]
    pub fn is_custom(&self) -> bool {
        matches!(self.kind, OperationKind::Custom(_))
    }

    #[must_use]
    pub fn is_weighted(&self) -> bool {
        match &self.kind {
            OperationKind::Builtin(def) => def.requires_weights,
            OperationKind::Custom(custom) => custom.is_weighted(),
        }
    }

    /// Whether the result needs a second pass over the values.
    #[must_use]
    pub fn is_variance_family(&self) -> bool {
        matches!(&self.kind, OperationKind::Builtin(def) if def.variance_family)
    }

    /// Scalar or array result. Custom stats may return either.
    #[must_use]
    pub fn result_kind(&self) -> Option<StatKind> {
        match &self.kind {
            OperationKind::Builtin(def) => Some(def.kind),
            OperationKind::Custom(_) => None,
        }
    }

    /// Whether this is an injected key operation.
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.field_name.starts_with(KEY_MARKER)
    }

    /// Whether `other` computes the same field from the same sources.
    fn same_as(&self, other: &Operation) -> bool {
        let same_stat = match (&self.kind, &other.kind) {
            (OperationKind::Builtin(a), OperationKind::Builtin(b)) => a.name == b.name,
            (OperationKind::Custom(a), OperationKind::Custom(b)) => a.same_function(b),
            _ => false,
        };
        let same_weights = match (&self.weights, &other.weights) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_stat
            && same_weights
            && self.field_name == other.field_name
            && Arc::ptr_eq(&self.values, &other.values)
            && self.args == other.args
    }
}

/// Builds operations from stat requests and resolved sources.
#[derive(Debug, Clone, Default)]
pub struct OperationBuilder {
    frac_as_map: bool,
}

impl OperationBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a `unique` key operation for every `frac`/`weighted_frac`.
    #[must_use]
    pub fn with_frac_as_map(mut self, frac_as_map: bool) -> Self {
        self.frac_as_map = frac_as_map;
        self
    }

    /// Expand `requests` across the value and weight sources.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown stats or arguments, mismatched source
    /// counts, weighted requests without weights, out-of-range default
    /// values and duplicate field names.
    pub fn build(
        &self,
        requests: &[StatRequest],
        values: &[Arc<dyn RasterSource>],
        weights: &[Arc<dyn RasterSource>],
    ) -> Result<Vec<Operation>> {
        if values.is_empty() {
            return Err(ConfigError::MissingRequired {
                option: "value rasters".to_string(),
            }
            .into());
        }
        let pairs = pair_sources(values, weights)?;
        let single = pairs.len() == 1;

        let mut ops: Vec<Operation> = Vec::new();
        for (value, weight) in &pairs {
            for request in requests {
                for op in self.expand(request, value, weight.as_ref(), single)? {
                    push_unique(&mut ops, op)?;
                }
            }
        }

        debug!(
            "Built {} operation(s) from {} request(s) over {} source pair(s)",
            ops.len(),
            requests.len(),
            pairs.len()
        );
        Ok(ops)
    }

    fn expand(
        &self,
        request: &StatRequest,
        value: &Arc<dyn RasterSource>,
        weight: Option<&Arc<dyn RasterSource>>,
        single: bool,
    ) -> Result<Vec<Operation>> {
        match request {
            StatRequest::Named(text) => {
                let spec = StatSpec::parse(text)?;
                let def = find_stat(&spec.stat).ok_or_else(|| ConfigError::UnknownStat {
                    name: spec.stat.clone(),
                    available: get_stat_names().join(", "),
                })?;
                let args = StatArgs::parse(&def, &spec.args)?;
                check_default_value(&args, value.as_ref())?;

                let label = spec.alias.clone().unwrap_or_else(|| stat_label(&def, &args));
                let op = bind(OperationKind::Builtin(def), &label, value, weight, single, args)?;

                let is_frac = matches!(op.stat_name(), "frac" | "weighted_frac");
                if self.frac_as_map && is_frac {
                    let unique = find_stat("unique").ok_or_else(|| ConfigError::UnknownStat {
                        name: "unique".to_string(),
                        available: get_stat_names().join(", "),
                    })?;
                    let key = Operation {
                        field_name: format!("{KEY_MARKER}{}", op.field_name),
                        kind: OperationKind::Builtin(unique),
                        values: Arc::clone(&op.values),
                        weights: None,
                        args: op.args.clone(),
                    };
                    return Ok(vec![key, op]);
                }
                Ok(vec![op])
            },
            StatRequest::Custom(custom) => {
                let dummy = custom.dummy_stat();
                let def = find_stat(dummy).ok_or_else(|| ConfigError::UnknownStat {
                    name: dummy.to_string(),
                    available: get_stat_names().join(", "),
                })?;
                let derived = bind(
                    OperationKind::Builtin(def),
                    dummy,
                    value,
                    weight,
                    single,
                    StatArgs::default(),
                )
                .map_err(|err| match err {
                    crate::error::ZonalError::Config(ConfigError::NoWeightsProvided { .. }) => {
                        ConfigError::NoWeightsProvided {
                            stat: custom.name().to_string(),
                        }
                        .into()
                    },
                    other => other,
                })?;

                let prefix = derived
                    .field_name
                    .strip_suffix(dummy)
                    .unwrap_or_default()
                    .to_string();
                Ok(vec![Operation {
                    field_name: format!("{prefix}{}", custom.name()),
                    kind: OperationKind::Custom(custom.clone()),
                    ..derived
                }])
            },
        }
    }
}

/// Build operations with default builder options.
///
/// # Errors
///
/// See [`OperationBuilder::build`].
pub fn build(
    requests: &[StatRequest],
    values: &[Arc<dyn RasterSource>],
    weights: &[Arc<dyn RasterSource>],
) -> Result<Vec<Operation>> {
    OperationBuilder::new().build(requests, values, weights)
}

type SourcePair = (Arc<dyn RasterSource>, Option<Arc<dyn RasterSource>>);

fn pair_sources(
    values: &[Arc<dyn RasterSource>],
    weights: &[Arc<dyn RasterSource>],
) -> Result<Vec<SourcePair>> {
    let pairs = match (values.len(), weights.len()) {
        (_, 0) => values.iter().map(|v| (Arc::clone(v), None)).collect(),
        (v, w) if v == w => values
            .iter()
            .zip(weights)
            .map(|(v, w)| (Arc::clone(v), Some(Arc::clone(w))))
            .collect(),
        (1, _) => weights
            .iter()
            .map(|w| (Arc::clone(&values[0]), Some(Arc::clone(w))))
            .collect(),
        (_, 1) => values
            .iter()
            .map(|v| (Arc::clone(v), Some(Arc::clone(&weights[0]))))
            .collect(),
        (v, w) => {
            return Err(InputError::MismatchedSourceCounts {
                values: v,
                weights: w,
            }
            .into());
        },
    };
    Ok(pairs)
}

fn bind(
    kind: OperationKind,
    label: &str,
    value: &Arc<dyn RasterSource>,
    weight: Option<&Arc<dyn RasterSource>>,
    single: bool,
    args: StatArgs,
) -> Result<Operation> {
    let weighted = match &kind {
        OperationKind::Builtin(def) => def.requires_weights,
        OperationKind::Custom(custom) => custom.is_weighted(),
    };
    let weights = if weighted {
        let weight = weight.ok_or_else(|| ConfigError::NoWeightsProvided {
            stat: label.to_string(),
        })?;
        Some(Arc::clone(weight))
    } else {
        None
    };

    let field_name = if single {
        label.to_string()
    } else {
        let mut parts = vec![value.name()];
        if let Some(weights) = &weights {
            parts.push(weights.name());
        }
        parts.push(label);
        parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_")
    };

    Ok(Operation {
        field_name,
        kind,
        values: Arc::clone(value),
        weights,
        args,
    })
}

/// Stat part of a field name. Quantiles carry their percentage.
fn stat_label(def: &StatDef, args: &StatArgs) -> String {
    match (def.name, args.q) {
        ("quantile", Some(q)) => format!("quantile_{}", (q * 1e8).round() / 1e6),
        (name, _) => name.to_string(),
    }
}

fn push_unique(ops: &mut Vec<Operation>, op: Operation) -> Result<()> {
    if let Some(existing) = ops.iter().find(|existing| existing.field_name == op.field_name) {
        if existing.same_as(&op) {
            return Ok(());
        }
        return Err(ConfigError::DuplicateField {
            name: op.field_name,
        }
        .into());
    }
    ops.push(op);
    Ok(())
}

/// Reject substitute values that the value raster's integer type cannot hold.
#[allow(clippy::cast_precision_loss)]
fn check_default_value(args: &StatArgs, source: &dyn RasterSource) -> Result<()> {
    let Some(value) = args.default_value else {
        return Ok(());
    };
    let data_type = source.data_type();
    let range = match data_type {
        DataType::Int8 => Some((f64::from(i8::MIN), f64::from(i8::MAX))),
        DataType::Int16 => Some((f64::from(i16::MIN), f64::from(i16::MAX))),
        DataType::Int32 => Some((f64::from(i32::MIN), f64::from(i32::MAX))),
        DataType::Int64 => Some((i64::MIN as f64, i64::MAX as f64)),
        DataType::UInt8 => Some((0.0, f64::from(u8::MAX))),
        DataType::UInt16 => Some((0.0, f64::from(u16::MAX))),
        DataType::UInt32 => Some((0.0, f64::from(u32::MAX))),
        DataType::UInt64 => Some((0.0, u64::MAX as f64)),
        _ => None,
    };
    match range {
        Some((min, max)) if !(min..=max).contains(&value) || value.fract() != 0.0 => {
            Err(ConfigError::DefaultValueOutOfRange {
                value,
                data_type: data_type.to_string(),
            }
            .into())
        },
        _ => Ok(()),
    }
}

/// Field names the writer should expect, in order.
#[must_use]
pub fn field_names(ops: &[Operation]) -> Vec<&str> {
    ops.iter().map(|op| op.field_name.as_str()).collect()
}

/// Distinct value and weight sources referenced by `ops`, by identity.
#[must_use]
pub fn distinct_sources(ops: &[Operation]) -> Vec<Arc<dyn RasterSource>> {
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for op in ops {
        for source in std::iter::once(&op.values).chain(op.weights.as_ref()) {
            if seen.insert(Arc::as_ptr(source).cast::<()>()) {
                sources.push(Arc::clone(source));
            }
        }
    }
    sources
}
