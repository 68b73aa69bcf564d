//! Registry of the statistics the engine knows how to compute.
//!
//! Each statistic declares whether it returns a scalar or an array per
//! feature, whether it needs a weighting raster, whether it belongs to the
//! variance family, and which extra arguments it accepts. The operation
//! builder and the processor consult this registry to validate requests.
//!
//! # Examples
//!
//! ```
//! use zonal_core::stats::{find_stat, StatKind};
//!
//! let mean = find_stat("mean").expect("mean should exist");
//! assert_eq!(mean.kind, StatKind::Scalar);
//! assert!(!mean.requires_weights);
//!
//! let frac = find_stat("weighted_frac").expect("weighted_frac should exist");
//! assert_eq!(frac.kind, StatKind::Array);
//! assert!(frac.requires_weights);
//! ```

/// Arguments accepted by every statistic.
pub const COMMON_ARGS: &[&str] = &[
    "min_coverage_frac",
    "coverage_weight",
    "default_value",
    "default_weight",
];

/// Shape of a statistic's per-feature result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// One value per feature.
    Scalar,
    /// One array per feature, with an element per contributing cell or class.
    Array,
}

impl StatKind {
    /// Returns the string representation of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            StatKind::Scalar => "scalar",
            StatKind::Array => "array",
        }
    }
}

/// Definition of a built-in statistic.
#[derive(Debug, Clone)]
pub struct StatDef {
    /// Name used in stat requests (e.g., `"mean"`).
    pub name: &'static str,
    /// One-line description for display purposes.
    pub description: &'static str,
    /// Scalar or array result.
    pub kind: StatKind,
    /// Needs a weighting raster.
    pub requires_weights: bool,
    /// Needs a second pass over the values (variance, stdev, ...).
    pub variance_family: bool,
    /// Result keeps the value raster's element type.
    pub preserves_type: bool,
    /// Extra arguments beyond [`COMMON_ARGS`].
    pub args: &'static [&'static str],
}

impl StatDef {
    /// Creates an unweighted statistic definition.
    #[must_use]
    pub const fn new(name: &'static str, description: &'static str, kind: StatKind) -> Self {
        Self {
            name,
            description,
            kind,
            requires_weights: false,
            variance_family: false,
            preserves_type: false,
            args: &[],
        }
    }

    #[must_use]
    const fn weighted(mut self) -> Self {
        self.requires_weights = true;
        self
    }

    #[must_use]
    const fn variance(mut self) -> Self {
        self.variance_family = true;
        self
    }

    #[must_use]
    const fn typed(mut self) -> Self {
        self.preserves_type = true;
        self
    }

    #[must_use]
    const fn with_args(mut self, args: &'static [&'static str]) -> Self {
        self.args = args;
        self
    }

    /// Whether `arg` may be passed to this statistic.
    #[must_use]
    pub fn accepts_arg(&self, arg: &str) -> bool {
        COMMON_ARGS.contains(&arg) || self.args.contains(&arg)
    }
}

/// Returns the complete registry of built-in statistics.
///
/// # Examples
///
/// ```
/// use zonal_core::stats::get_stats;
///
/// let weighted = get_stats().iter().filter(|s| s.requires_weights).count();
/// assert!(weighted > 0);
/// ```
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn get_stats() -> Vec<StatDef> {
    use StatKind::{Array, Scalar};

    vec![
        StatDef::new("count", "Sum of coverage of cells with valid values", Scalar),
        StatDef::new("sum", "Coverage-weighted sum of values", Scalar),
        StatDef::new("mean", "Coverage-weighted mean of values", Scalar),
        StatDef::new("min", "Minimum value of any covered cell", Scalar).typed(),
        StatDef::new("max", "Maximum value of any covered cell", Scalar).typed(),
        StatDef::new("minority", "Value with the smallest total coverage", Scalar).typed(),
        StatDef::new("majority", "Value with the largest total coverage", Scalar).typed(),
        StatDef::new("mode", "Alias of majority", Scalar).typed(),
        StatDef::new("variety", "Number of distinct values", Scalar),
        StatDef::new("variance", "Coverage-weighted population variance", Scalar).variance(),
        StatDef::new("stdev", "Coverage-weighted population standard deviation", Scalar)
            .variance(),
        StatDef::new(
            "coefficient_of_variation",
            "Standard deviation divided by the mean",
            Scalar,
        )
        .variance(),
        StatDef::new("median", "Coverage-weighted median", Scalar),
        StatDef::new("quantile", "Coverage-weighted quantile q", Scalar).with_args(&["q"]),
        StatDef::new("weighted_mean", "Mean weighted by coverage and weights", Scalar)
            .weighted(),
        StatDef::new("weighted_sum", "Sum weighted by coverage and weights", Scalar).weighted(),
        StatDef::new(
            "weighted_variance",
            "Variance weighted by coverage and weights",
            Scalar,
        )
        .weighted()
        .variance(),
        StatDef::new(
            "weighted_stdev",
            "Standard deviation weighted by coverage and weights",
            Scalar,
        )
        .weighted()
        .variance(),
        StatDef::new("min_center_x", "X of the center of the minimum-value cell", Scalar),
        StatDef::new("min_center_y", "Y of the center of the minimum-value cell", Scalar),
        StatDef::new("max_center_x", "X of the center of the maximum-value cell", Scalar),
        StatDef::new("max_center_y", "Y of the center of the maximum-value cell", Scalar),
        StatDef::new("values", "Values of covered cells", Array).typed(),
        StatDef::new("coverage", "Coverage of covered cells", Array),
        StatDef::new("weights", "Weights of covered cells", Array).weighted(),
        StatDef::new("center_x", "X of the centers of covered cells", Array),
        StatDef::new("center_y", "Y of the centers of covered cells", Array),
        StatDef::new("cell_id", "Row-major index of covered cells in the raster", Array),
        StatDef::new("unique", "Distinct values, ascending", Array).typed(),
        StatDef::new("frac", "Fraction of coverage taken by each distinct value", Array),
        StatDef::new(
            "weighted_frac",
            "Fraction of weighted coverage taken by each distinct value",
            Array,
        )
        .weighted(),
    ]
}

/// Finds a statistic by name (case-sensitive, as used in output field names).
///
/// # Examples
///
/// ```
/// use zonal_core::stats::find_stat;
///
/// assert!(find_stat("quantile").is_some());
/// assert!(find_stat("avg").is_none());
/// ```
#[must_use]
pub fn find_stat(name: &str) -> Option<StatDef> {
    get_stats().into_iter().find(|s| s.name == name)
}

/// Returns all statistic names in registry order.
#[must_use]
pub fn get_stat_names() -> Vec<&'static str> {
    get_stats().iter().map(|s| s.name).collect()
}
