//! Number-format rendering for cached values.
//!
//! A deliberately small subset of the format-code language: General,
//! fixed decimals, thousands separators, percent, and date codes. Anything
//! unrecognised falls back to the general rendering — exact
//! bit-compatibility with any particular implementation is a non-goal.

use cellforge_common::{CellValue, render_number, serial_to_datetime};

/// Render `value` under a number-format code. `None` or `"General"` is the
/// general rendering; non-numeric values ignore the format.
pub fn format_value(value: &CellValue, numfmt: Option<&str>) -> String {
    let CellValue::Number {
        value: n,
        is_bool: false,
    } = value
    else {
        return value.to_string();
    };
    let Some(code) = numfmt else {
        return value.to_string();
    };
    if code.eq_ignore_ascii_case("general") || code.is_empty() {
        return value.to_string();
    }

    if code.contains('%') {
        let decimals = decimal_places(code);
        return format!("{:.*}%", decimals, n * 100.0);
    }

    if is_date_code(code) {
        return format_date(*n, code);
    }

    let decimals = decimal_places(code);
    let thousands = code.contains(',');
    let mut rendered = format!("{:.*}", decimals, n.abs());
    if thousands {
        rendered = add_thousands_separators(&rendered);
    }
    if n.is_sign_negative() && *n != 0.0 {
        rendered.insert(0, '-');
    }
    rendered
}

/// Digits after the decimal point in a numeric format code.
fn decimal_places(code: &str) -> usize {
    match code.find('.') {
        Some(dot) => code[dot + 1..]
            .chars()
            .take_while(|c| *c == '0' || *c == '#')
            .count(),
        None => 0,
    }
}

/// A code is a date format when it uses date letters and none of the
/// numeric placeholders.
fn is_date_code(code: &str) -> bool {
    let lower = code.to_ascii_lowercase();
    let has_date = lower.contains('y') || lower.contains('d') || lower.contains('m');
    let has_numeric = lower.contains('0') || lower.contains('#');
    has_date && !has_numeric
}

fn format_date(serial: f64, code: &str) -> String {
    let dt = serial_to_datetime(serial);
    let lower = code.to_ascii_lowercase();
    // Longest token first so "yyyy" is not eaten as two "yy".
    let mut out = String::with_capacity(code.len() + 4);
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let run_char = bytes[i] as char;
        let run_len = bytes[i..].iter().take_while(|&&b| b as char == run_char).count();
        use chrono::{Datelike, Timelike};
        match (run_char, run_len) {
            ('y', 4..) => out.push_str(&format!("{:04}", dt.year())),
            ('y', _) => out.push_str(&format!("{:02}", dt.year() % 100)),
            ('m', 2..) => out.push_str(&format!("{:02}", dt.month())),
            ('m', _) => out.push_str(&dt.month().to_string()),
            ('d', 2..) => out.push_str(&format!("{:02}", dt.day())),
            ('d', _) => out.push_str(&dt.day().to_string()),
            ('h', _) => out.push_str(&format!("{:02}", dt.hour())),
            ('s', _) => out.push_str(&format!("{:02}", dt.second())),
            _ => {
                for _ in 0..run_len {
                    out.push(run_char);
                }
            }
        }
        i += run_len;
    }
    out
}

fn add_thousands_separators(rendered: &str) -> String {
    let (int_part, frac_part) = match rendered.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rendered, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    match frac_part {
        Some(f) => format!("{grouped}.{f}"),
        None => grouped,
    }
}

/// General rendering without a format code — what raw mode returns.
pub fn raw_value(value: &CellValue) -> String {
    match value {
        CellValue::Number {
            value,
            is_bool: false,
        } => render_number(*value),
        other => other.to_string(),
    }
}
