//! The typed value model shared by the snapshot, interpreter, and caches.

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use crate::ErrorKind;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A cell's current value as the engine sees it.
///
/// Booleans ride on the `Number` variant (`is_bool` set, 1.0/0.0) because
/// that is how the workbook cell store types them; `Display` still renders
/// `TRUE`/`FALSE`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number { value: f64, is_bool: bool },
    Text(String),
    Error(ErrorKind),
    Empty,
}

impl Eq for CellValue {}

impl Hash for CellValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            CellValue::Number { value, is_bool } => {
                value.to_bits().hash(state);
                is_bool.hash(state);
            }
            CellValue::Text(s) => s.hash(state),
            CellValue::Error(e) => e.hash(state),
            CellValue::Empty => state.write_u8(0),
        }
    }
}

/// The storage type tag the workbook keeps beside a cached value.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CellType {
    Number,
    Bool,
    Text,
    Error,
    #[default]
    Empty,
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::boolean(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// Render a number the way "General" formatting does: integers drop the
/// decimal point, everything else uses the shortest round-trip form.
pub fn render_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number { value, is_bool } => {
                if *is_bool {
                    f.write_str(if *value != 0.0 { "TRUE" } else { "FALSE" })
                } else {
                    f.write_str(&render_number(*value))
                }
            }
            CellValue::Text(s) => f.write_str(s),
            CellValue::Error(e) => write!(f, "{e}"),
            CellValue::Empty => Ok(()),
        }
    }
}

impl CellValue {
    pub fn number(value: f64) -> Self {
        CellValue::Number {
            value,
            is_bool: false,
        }
    }

    pub fn boolean(b: bool) -> Self {
        CellValue::Number {
            value: if b { 1.0 } else { 0.0 },
            is_bool: true,
        }
    }

    pub fn text<S: Into<String>>(s: S) -> Self {
        CellValue::Text(s.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// The storage type tag for this value.
    pub fn cell_type(&self) -> CellType {
        match self {
            CellValue::Number { is_bool: false, .. } => CellType::Number,
            CellValue::Number { is_bool: true, .. } => CellType::Bool,
            CellValue::Text(_) => CellType::Text,
            CellValue::Error(_) => CellType::Error,
            CellValue::Empty => CellType::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Numeric coercion following spreadsheet rules: numbers pass through,
    /// booleans map to 1/0, numeric-looking text parses, empty is 0.
    pub fn as_number(&self) -> Result<f64, ErrorKind> {
        match self {
            CellValue::Number { value, .. } => Ok(*value),
            CellValue::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(0.0);
                }
                t.parse::<f64>().map_err(|_| ErrorKind::Value)
            }
            CellValue::Error(e) => Err(*e),
            CellValue::Empty => Ok(0.0),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Number { value, .. } => *value != 0.0,
            CellValue::Text(s) => !s.is_empty(),
            CellValue::Error(_) => false,
            CellValue::Empty => false,
        }
    }

    /// Reconstruct a typed value from a raw cell-text slot: canonical error
    /// codes and `TRUE`/`FALSE` are recognised, numeric text becomes a
    /// number, anything else stays text.
    pub fn from_cell_text(s: &str) -> Self {
        if s.is_empty() {
            return CellValue::Empty;
        }
        if let Some(kind) = ErrorKind::from_code(s) {
            return CellValue::Error(kind);
        }
        match s {
            "TRUE" => return CellValue::boolean(true),
            "FALSE" => return CellValue::boolean(false),
            _ => {}
        }
        if let Ok(n) = s.parse::<f64>() {
            return CellValue::number(n);
        }
        CellValue::Text(s.to_string())
    }
}
