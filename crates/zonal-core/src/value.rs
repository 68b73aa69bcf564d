//! Field values carried by input features and result records.

use std::fmt;

use arrow::compute::cast;
use arrow_array::cast::AsArray;
use arrow_array::types::Float64Type;
use arrow_array::{Array, ArrayRef};
use arrow_schema::DataType;
use serde_json::{Number, Value as JsonValue};

use crate::error::Result;

/// A single field value.
///
/// `Absent` marks a column that was not supplied for a row (for example a
/// column discovered after the row was written). It is distinct from `Null`,
/// which is a supplied value that happens to be empty.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Not supplied for this row
    Absent,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Typed array; element type and validity are preserved
    Array(ArrayRef),
    /// Plain sequence
    List(Vec<FieldValue>),
    /// Order-independent sequence, stored sorted and distinct
    Set(Vec<FieldValue>),
    /// Association built from two parallel arrays
    Map(MapValue),
}

/// Keys and values of a map field. Both arrays have the same length.
#[derive(Debug, Clone)]
pub struct MapValue {
    pub keys: ArrayRef,
    pub values: ArrayRef,
}

impl MapValue {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Entries as `(key, value)` pairs of scalar values.
    #[must_use]
    pub fn entries(&self) -> Vec<(FieldValue, FieldValue)> {
        (0..self.len())
            .map(|idx| {
                (
                    FieldValue::from_array_index(&self.keys, idx),
                    FieldValue::from_array_index(&self.values, idx),
                )
            })
            .collect()
    }
}

impl FieldValue {
    /// Whether this is the absent-value sentinel.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Whether this value carries no data (absent or null).
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Absent | Self::Null)
    }

    /// Numeric view of a scalar value.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    /// Integer view of a scalar value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of a scalar value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Typed array view.
    #[must_use]
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Short name of the value kind, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Array(_) => "array",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
        }
    }

    /// Scalar at `idx` of an array. Integer types become `Int`, floating
    /// types `Float`; null slots become `Null`.
    #[must_use]
    pub fn from_array_index(array: &ArrayRef, idx: usize) -> Self {
        if array.is_null(idx) {
            return Self::Null;
        }
        match array.data_type() {
            DataType::Boolean => Self::Bool(array.as_boolean().value(idx)),
            DataType::Utf8 => Self::Text(array.as_string::<i32>().value(idx).to_string()),
            dt if dt.is_integer() => match cast(&array.slice(idx, 1), &DataType::Int64) {
                Ok(single) => Self::Int(single.as_primitive::<arrow_array::types::Int64Type>().value(0)),
                Err(_) => Self::Null,
            },
            dt if dt.is_floating() => match cast(&array.slice(idx, 1), &DataType::Float64) {
                Ok(single) => Self::Float(single.as_primitive::<Float64Type>().value(0)),
                Err(_) => Self::Null,
            },
            _ => Self::Null,
        }
    }

    /// Convert typed arrays to plain sequences. Other values are unchanged.
    #[must_use]
    pub fn into_list(self) -> Self {
        match self {
            Self::Array(array) => {
                Self::List((0..array.len()).map(|i| Self::from_array_index(&array, i)).collect())
            },
            Self::Set(items) => Self::List(items),
            other => other,
        }
    }

    /// Convert typed arrays and lists to sorted, distinct sets.
    #[must_use]
    pub fn into_set(self) -> Self {
        let mut items = match self.into_list() {
            Self::List(items) => items,
            other => return other,
        };
        items.sort_by(compare_scalars);
        items.dedup_by(|a, b| compare_scalars(a, b) == std::cmp::Ordering::Equal);
        Self::Set(items)
    }

    /// JSON rendering. `Absent` and `Null` become JSON null, as do
    /// non-finite floats. Maps become objects keyed by the key text.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Absent | Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::Number((*v).into()),
            Self::Float(v) => Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
            Self::Text(v) => JsonValue::String(v.clone()),
            Self::Array(_) => self.clone().into_list().to_json(),
            Self::List(items) | Self::Set(items) => {
                JsonValue::Array(items.iter().map(Self::to_json).collect())
            },
            Self::Map(map) => JsonValue::Object(
                map.entries()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Value from a JSON property.
    #[must_use]
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(*v),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(_) => Self::Text(value.to_string()),
        }
    }

    /// Arrays cast to `Float64`, used when comparing values numerically.
    ///
    /// # Errors
    ///
    /// Returns an error if the array type cannot be cast.
    pub fn array_as_f64(array: &ArrayRef) -> Result<Vec<Option<f64>>> {
        let cast = cast(array, &DataType::Float64)?;
        Ok(cast.as_primitive::<Float64Type>().iter().collect())
    }
}

fn compare_scalars(a: &FieldValue, b: &FieldValue) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.to_string().cmp(&b.to_string()),
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Absent, Self::Absent) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a.to_data() == b.to_data(),
            (Self::List(a), Self::List(b)) | (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => {
                a.keys.to_data() == b.keys.to_data() && a.values.to_data() == b.values.to_data()
            },
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("<absent>"),
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::Array(_) | Self::List(_) | Self::Set(_) | Self::Map(_) => {
                write!(f, "{}", self.to_json())
            },
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<ArrayRef> for FieldValue {
    fn from(v: ArrayRef) -> Self {
        Self::Array(v)
    }
}
