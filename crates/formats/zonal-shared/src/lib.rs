//! Error types shared by the zonal format crates.

use std::error::Error as StdError;
use std::fmt;

/// A position within a source file, such as a grid row or a GeoJSON line.
///
/// All indices are 1-based where possible to align with human expectations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePosition {
    /// Line number in the source (1-based)
    pub line: Option<u64>,
    /// Column (token) number in the source (1-based)
    pub column: Option<u64>,
    /// Feature index reported by the parser (0-based)
    pub feature: Option<u64>,
}

impl SourcePosition {
    /// Position pointing at a single line.
    #[must_use]
    pub fn line(line: u64) -> Self {
        Self {
            line: Some(line),
            ..Self::default()
        }
    }

    /// Returns true when the position does not contain any location metadata.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line.is_none() && self.column.is_none() && self.feature.is_none()
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(line) = self.line {
            parts.push(format!("line {line}"));
        }
        if let Some(column) = self.column {
            parts.push(format!("column {column}"));
        }
        if let Some(feature) = self.feature {
            parts.push(format!("feature {feature}"));
        }

        if parts.is_empty() {
            write!(f, "unknown position")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Errors raised while reading or writing a spatial format.
#[derive(Debug)]
pub enum FormatError {
    /// An underlying I/O failure occurred.
    Io {
        /// The originating error.
        source: std::io::Error,
        /// Optional context describing what was being accessed.
        context: Option<String>,
    },
    /// Parsing failed for the input source.
    Parse {
        /// Human readable description of the failure.
        message: String,
        /// Optional position describing where the failure occurred.
        position: Option<SourcePosition>,
        /// Optional context describing what was being read.
        context: Option<String>,
    },
    /// Serializing output failed.
    Write {
        /// Human readable description of the failure.
        message: String,
        /// Optional context describing what was being written.
        context: Option<String>,
    },
}

impl FormatError {
    fn fmt_context(verb: &str, context: Option<&str>) -> String {
        context
            .map(|c| format!(" while {verb} {c}"))
            .unwrap_or_default()
    }

    fn fmt_position(position: Option<&SourcePosition>) -> String {
        position
            .filter(|pos| !pos.is_empty())
            .map(|pos| format!(" at {pos}"))
            .unwrap_or_default()
    }

    /// Build a parse error without position information.
    #[must_use]
    pub fn parse(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            position: None,
            context: Some(context.into()),
        }
    }

    /// Build a write error.
    #[must_use]
    pub fn write(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Attach additional context to the error, returning the updated error.
    #[must_use]
    pub fn with_additional_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        match &mut self {
            FormatError::Io {
                context: existing, ..
            }
            | FormatError::Parse {
                context: existing, ..
            }
            | FormatError::Write {
                context: existing, ..
            } => match existing {
                Some(existing) if !existing.is_empty() => {
                    existing.push_str("; ");
                    existing.push_str(&context);
                },
                _ => *existing = Some(context),
            },
        }
        self
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::Io { source, context } => {
                write!(
                    f,
                    "I/O error{}: {source}",
                    Self::fmt_context("accessing", context.as_deref())
                )
            },
            FormatError::Parse {
                message,
                position,
                context,
            } => write!(
                f,
                "Parse error{}{}: {message}",
                Self::fmt_context("reading", context.as_deref()),
                Self::fmt_position(position.as_ref())
            ),
            FormatError::Write { message, context } => write!(
                f,
                "Write error{}: {message}",
                Self::fmt_context("writing", context.as_deref())
            ),
        }
    }
}

impl StdError for FormatError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            FormatError::Io { source, .. } => Some(source),
            FormatError::Parse { .. } | FormatError::Write { .. } => None,
        }
    }
}

impl From<std::io::Error> for FormatError {
    fn from(source: std::io::Error) -> Self {
        FormatError::Io {
            source,
            context: None,
        }
    }
}

/// Result type alias that uses [`FormatError`].
pub type FormatResult<T> = Result<T, FormatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_source_position() {
        let pos = SourcePosition {
            line: Some(10),
            column: Some(3),
            ..SourcePosition::default()
        };

        assert_eq!(pos.to_string(), "line 10, column 3");
    }

    #[test]
    fn display_parse_error_with_context() {
        let error = FormatError::Parse {
            message: "expected a number".to_string(),
            position: Some(SourcePosition::line(7)),
            context: Some("dem.asc".to_string()),
        };

        assert_eq!(
            error.to_string(),
            "Parse error while reading dem.asc at line 7: expected a number"
        );
    }

    #[test]
    fn additional_context_is_appended() {
        let error = FormatError::write("bad column", "out.csv").with_additional_context("row 3");
        assert_eq!(
            error.to_string(),
            "Write error while writing out.csv; row 3: bad column"
        );
    }
}
