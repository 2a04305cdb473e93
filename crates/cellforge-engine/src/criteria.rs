//! Excel criteria matching for the conditional aggregation family
//! (SUMIF(S), COUNTIF(S), AVERAGEIF(S)).
//!
//! A criterion is a value or a string with an optional comparison prefix
//! (`>`, `>=`, `<`, `<=`, `<>`, `=`) and, in the equality case, `*`/`?`
//! wildcards. Plain-equality criteria are the ones the bulk optimiser can
//! group into hash maps; everything else is matched row by row.

use once_cell::sync::Lazy;
use regex::Regex;

use cellforge_common::{CellValue, render_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
    Eq,
}

#[derive(Debug, Clone)]
pub enum Criterion {
    /// Numeric comparison, e.g. `">=10"`.
    Number { op: CmpOp, value: f64 },
    /// Text comparison with an explicit operator prefix.
    Text { op: CmpOp, value: String },
    /// Plain equality against a canonical key (groupable).
    Equals(String),
    /// Equality with `*`/`?` wildcards.
    Wildcard { pattern: String, regex: Regex },
}

static WILDCARD_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*?]").unwrap());

/// Canonical key of a cell value for equality matching and bulk grouping:
/// numbers render in general form (so numeric text and numbers collide,
/// the way Excel matches them), text is trimmed and uppercased.
pub fn canonical_key(value: &CellValue) -> String {
    match value {
        CellValue::Number { value, is_bool } => {
            if *is_bool {
                if *value != 0.0 { "TRUE".into() } else { "FALSE".into() }
            } else {
                render_number(*value)
            }
        }
        CellValue::Text(s) => {
            let trimmed = s.trim();
            match trimmed.parse::<f64>() {
                Ok(n) => render_number(n),
                Err(_) => trimmed.to_ascii_uppercase(),
            }
        }
        CellValue::Error(e) => e.to_string(),
        CellValue::Empty => String::new(),
    }
}

impl Criterion {
    pub fn parse(value: &CellValue) -> Criterion {
        let text = match value {
            CellValue::Text(s) => s.as_str(),
            other => return Criterion::Equals(canonical_key(other)),
        };

        let (op, rest) = if let Some(rest) = text.strip_prefix(">=") {
            (CmpOp::Ge, rest)
        } else if let Some(rest) = text.strip_prefix("<=") {
            (CmpOp::Le, rest)
        } else if let Some(rest) = text.strip_prefix("<>") {
            (CmpOp::Ne, rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (CmpOp::Gt, rest)
        } else if let Some(rest) = text.strip_prefix('<') {
            (CmpOp::Lt, rest)
        } else if let Some(rest) = text.strip_prefix('=') {
            (CmpOp::Eq, rest)
        } else {
            (CmpOp::Eq, text)
        };

        let has_prefix = rest.len() != text.len();

        if let Ok(n) = rest.trim().parse::<f64>() {
            if has_prefix && op != CmpOp::Eq {
                return Criterion::Number { op, value: n };
            }
            return Criterion::Equals(render_number(n));
        }

        if op == CmpOp::Eq && WILDCARD_CHARS.is_match(rest) {
            return Criterion::Wildcard {
                pattern: rest.to_string(),
                regex: wildcard_regex(rest),
            };
        }

        match op {
            CmpOp::Eq => Criterion::Equals(rest.trim().to_ascii_uppercase()),
            op => Criterion::Text {
                op,
                value: rest.to_ascii_uppercase(),
            },
        }
    }

    pub fn matches(&self, value: &CellValue) -> bool {
        match self {
            Criterion::Equals(key) => canonical_key(value) == *key,
            Criterion::Number { op, value: rhs } => {
                let lhs = match value {
                    CellValue::Number { value, is_bool: false } => Some(*value),
                    CellValue::Text(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match lhs {
                    Some(lhs) => apply_cmp(*op, lhs.partial_cmp(rhs)),
                    None => false,
                }
            }
            Criterion::Text { op, value: rhs } => match value {
                CellValue::Text(s) => {
                    apply_cmp(*op, s.to_ascii_uppercase().partial_cmp(rhs))
                }
                _ => false,
            },
            Criterion::Wildcard { regex, .. } => match value {
                CellValue::Text(s) => regex.is_match(&s.to_ascii_uppercase()),
                _ => false,
            },
        }
    }

    /// True when this criterion is a plain equality the bulk optimiser can
    /// bucket by `canonical_key`.
    pub fn as_equality_key(&self) -> Option<&str> {
        match self {
            Criterion::Equals(key) => Some(key),
            _ => None,
        }
    }
}

fn apply_cmp(op: CmpOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    let Some(ord) = ordering else { return false };
    match op {
        CmpOp::Gt => ord == Greater,
        CmpOp::Ge => ord != Less,
        CmpOp::Lt => ord == Less,
        CmpOp::Le => ord != Greater,
        CmpOp::Ne => ord != Equal,
        CmpOp::Eq => ord == Equal,
    }
}

/// Compile an Excel wildcard pattern: `*` any run, `?` one character,
/// `~*`/`~?` literal. Anchored and case-insensitive by uppercasing both
/// sides.
fn wildcard_regex(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '~' => match chars.next() {
                Some(esc @ ('*' | '?')) => out.push_str(&regex::escape(&esc.to_string())),
                Some(other) => out.push_str(&regex::escape(&other.to_string())),
                None => {}
            },
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_ascii_uppercase().to_string())),
        }
    }
    out.push('$');
    // The pattern is escaped above, so compilation cannot fail.
    Regex::new(&out).unwrap()
}
