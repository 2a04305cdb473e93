//! The formula interpreter: walks the parsed AST and reduces it to a
//! `CellValue`, pulling cross-cell reads through an injectable resolver.
//!
//! Error codes travel as values, the way a spreadsheet wants them: an
//! error operand makes arithmetic return that error, while IFERROR can
//! absorb it. The interpreter itself holds no state between invocations;
//! each evaluation gets its own context (resolver + the formula's own
//! sheet and coordinates).

use std::sync::Arc;

use cellforge_common::{CellValue, ErrorKind, render_number};
use cellforge_parse::{Expr, RefKind};

use crate::criteria::Criterion;

/// Name resolution the interpreter delegates to.
///
/// Implementations read from the worksheet snapshot during a scheduled
/// recalculation, or recursively evaluate on the single-cell path.
pub trait Resolver: Sync {
    /// Value of one cell (missing cells are `Empty`).
    fn cell_value(&self, sheet: &str, col: u32, row: u32) -> CellValue;

    /// Highest used row of a sheet, bounding whole-column materialisation.
    fn sheet_max_row(&self, sheet: &str) -> u32;

    /// A bounded rectangle, row-major. Implementations may serve this from
    /// a range cache.
    fn range_matrix(
        &self,
        sheet: &str,
        start_col: u32,
        start_row: u32,
        end_col: u32,
        end_row: u32,
    ) -> Arc<Vec<Vec<CellValue>>>;
}

/// Evaluation context: the resolver plus the formula's own location
/// (needed by ROW()/COLUMN() and sheet-relative references).
pub struct EvalContext<'a> {
    pub resolver: &'a dyn Resolver,
    pub sheet: &'a str,
    pub col: u32,
    pub row: u32,
}

/// An evaluated operand: most expressions reduce to a scalar, references
/// to multi-cell areas stay matrices until a consumer flattens or indexes
/// them.
#[derive(Debug, Clone)]
enum Operand {
    Scalar(CellValue),
    Matrix(Arc<Vec<Vec<CellValue>>>),
}

impl Operand {
    fn into_scalar(self) -> CellValue {
        match self {
            Operand::Scalar(v) => v,
            Operand::Matrix(m) => {
                if m.len() == 1 && m[0].len() == 1 {
                    m[0][0].clone()
                } else {
                    CellValue::Error(ErrorKind::Value)
                }
            }
        }
    }
}

pub struct Interpreter<'a> {
    ctx: EvalContext<'a>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: EvalContext<'a>) -> Self {
        Self { ctx }
    }

    /// Evaluate to a scalar value. Multi-cell areas in scalar position
    /// collapse to `#VALUE!`.
    pub fn evaluate(&self, expr: &Expr) -> CellValue {
        self.eval(expr).into_scalar()
    }

    fn eval(&self, expr: &Expr) -> Operand {
        match expr {
            Expr::Number(n) => Operand::Scalar(CellValue::number(*n)),
            Expr::Text(s) => Operand::Scalar(CellValue::Text(s.clone())),
            Expr::Bool(b) => Operand::Scalar(CellValue::boolean(*b)),
            Expr::Error(e) => Operand::Scalar(CellValue::Error(*e)),
            Expr::Name(_) => Operand::Scalar(CellValue::Error(ErrorKind::Name)),
            Expr::Ref(reference) => self.eval_reference(reference),
            Expr::Unary { op, expr } => {
                Operand::Scalar(self.eval_unary(op, self.evaluate(expr)))
            }
            Expr::Binary { op, left, right } => Operand::Scalar(self.eval_binary(op, left, right)),
            Expr::Func { name, args, .. } => self.eval_function(name, args),
        }
    }

    /* ===================  references  =================== */

    fn eval_reference(&self, reference: &RefKind) -> Operand {
        let sheet = reference.sheet().unwrap_or(self.ctx.sheet);
        match reference {
            RefKind::Cell { col, row, .. } => {
                Operand::Scalar(self.ctx.resolver.cell_value(sheet, *col, *row))
            }
            RefKind::Range {
                start_col,
                start_row,
                end_col,
                end_row,
                ..
            } => Operand::Matrix(self.ctx.resolver.range_matrix(
                sheet, *start_col, *start_row, *end_col, *end_row,
            )),
            RefKind::ColRange {
                start_col, end_col, ..
            } => {
                let max_row = self.ctx.resolver.sheet_max_row(sheet);
                if max_row == 0 {
                    return Operand::Matrix(Arc::new(Vec::new()));
                }
                Operand::Matrix(
                    self.ctx
                        .resolver
                        .range_matrix(sheet, *start_col, 1, *end_col, max_row),
                )
            }
        }
    }

    /* ===================  operators  =================== */

    fn eval_unary(&self, op: &str, v: CellValue) -> CellValue {
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        let n = match v.as_number() {
            Ok(n) => n,
            Err(e) => return CellValue::Error(e),
        };
        match op {
            "+" => CellValue::number(n),
            "-" => CellValue::number(-n),
            "%" => CellValue::number(n / 100.0),
            _ => CellValue::Error(ErrorKind::Value),
        }
    }

    fn eval_binary(&self, op: &str, left: &Expr, right: &Expr) -> CellValue {
        let l = self.evaluate(left);
        let r = self.evaluate(right);

        if matches!(op, "=" | "<>" | ">" | "<" | ">=" | "<=") {
            return self.compare(op, &l, &r);
        }

        if let CellValue::Error(e) = l {
            return CellValue::Error(e);
        }
        if let CellValue::Error(e) = r {
            return CellValue::Error(e);
        }

        if op == "&" {
            return CellValue::Text(format!("{}{}", coerce_text(&l), coerce_text(&r)));
        }

        let (a, b) = match (l.as_number(), r.as_number()) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return CellValue::Error(e),
        };
        match op {
            "+" => CellValue::number(a + b),
            "-" => CellValue::number(a - b),
            "*" => CellValue::number(a * b),
            "/" => {
                if b == 0.0 {
                    CellValue::Error(ErrorKind::Div)
                } else {
                    CellValue::number(a / b)
                }
            }
            "^" => {
                let p = a.powf(b);
                if p.is_finite() {
                    CellValue::number(p)
                } else {
                    CellValue::Error(ErrorKind::Num)
                }
            }
            _ => CellValue::Error(ErrorKind::Value),
        }
    }

    /// Spreadsheet comparison: errors win, same-class values compare
    /// within the class, and across classes Number < Text < Boolean with
    /// no cross-class equality. Empty coerces to the other side's zero
    /// value.
    fn compare(&self, op: &str, l: &CellValue, r: &CellValue) -> CellValue {
        use std::cmp::Ordering;

        if let CellValue::Error(e) = l {
            return CellValue::Error(*e);
        }
        if let CellValue::Error(e) = r {
            return CellValue::Error(*e);
        }

        fn class(v: &CellValue) -> u8 {
            match v {
                CellValue::Number { is_bool: false, .. } | CellValue::Empty => 0,
                CellValue::Text(_) => 1,
                CellValue::Number { is_bool: true, .. } => 2,
                CellValue::Error(_) => 3,
            }
        }

        let (lc, rc) = (class(l), class(r));
        let ordering = if lc != rc {
            // Empty against text compares as the empty string.
            match (l, r) {
                (CellValue::Empty, CellValue::Text(t)) => "".cmp(t.to_ascii_uppercase().as_str()),
                (CellValue::Text(t), CellValue::Empty) => t.to_ascii_uppercase().as_str().cmp(""),
                _ => lc.cmp(&rc),
            }
        } else {
            match (l, r) {
                (CellValue::Text(a), CellValue::Text(b)) => {
                    a.to_ascii_uppercase().cmp(&b.to_ascii_uppercase())
                }
                _ => {
                    let a = l.as_number().unwrap_or(0.0);
                    let b = r.as_number().unwrap_or(0.0);
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                }
            }
        };

        let result = match op {
            "=" => ordering == Ordering::Equal,
            "<>" => ordering != Ordering::Equal,
            ">" => ordering == Ordering::Greater,
            "<" => ordering == Ordering::Less,
            ">=" => ordering != Ordering::Less,
            "<=" => ordering != Ordering::Greater,
            _ => false,
        };
        CellValue::boolean(result)
    }

    /* ===================  functions  =================== */

    fn eval_function(&self, name: &str, args: &[Expr]) -> Operand {
        // Control-flow functions evaluate lazily.
        match name {
            "IF" => return Operand::Scalar(self.fn_if(args)),
            "IFERROR" => return Operand::Scalar(self.fn_iferror(args)),
            _ => {}
        }

        let operands: Vec<Operand> = args.iter().map(|a| self.eval(a)).collect();

        let result = match name {
            "SUM" => self.fn_sum(&operands),
            "COUNT" => self.fn_count(&operands),
            "COUNTA" => self.fn_counta(&operands),
            "AVERAGE" => self.fn_average(&operands),
            "MIN" => self.fn_min_max(&operands, true),
            "MAX" => self.fn_min_max(&operands, false),
            "AND" => self.fn_and_or(&operands, true),
            "OR" => self.fn_and_or(&operands, false),
            "NOT" => self.fn_not(&operands),
            "ABS" => self.fn_numeric1(&operands, f64::abs),
            "INT" => self.fn_numeric1(&operands, f64::floor),
            "ROUND" => self.fn_round(&operands),
            "MOD" => self.fn_mod(&operands),
            "ROW" => self.fn_row_column(args, true),
            "COLUMN" => self.fn_row_column(args, false),
            "CONCATENATE" => self.fn_concatenate(&operands),
            "LEN" => self.fn_text1(&operands, |s| CellValue::number(s.chars().count() as f64)),
            "UPPER" => self.fn_text1(&operands, |s| CellValue::Text(s.to_uppercase())),
            "LOWER" => self.fn_text1(&operands, |s| CellValue::Text(s.to_lowercase())),
            "TRIM" => self.fn_text1(&operands, |s| CellValue::Text(s.trim().to_string())),
            "LEFT" => self.fn_left_right(&operands, true),
            "RIGHT" => self.fn_left_right(&operands, false),
            "MID" => self.fn_mid(&operands),
            "SUMIF" => self.fn_single_criterion(&operands, Aggregate::Sum),
            "COUNTIF" => self.fn_single_criterion(&operands, Aggregate::Count),
            "AVERAGEIF" => self.fn_single_criterion(&operands, Aggregate::Average),
            "SUMIFS" => self.fn_multi_criteria(&operands, Aggregate::Sum),
            "COUNTIFS" => self.fn_multi_criteria(&operands, Aggregate::Count),
            "AVERAGEIFS" => self.fn_multi_criteria(&operands, Aggregate::Average),
            "MATCH" => self.fn_match(&operands),
            "INDEX" => return self.fn_index(&operands),
            "VLOOKUP" => self.fn_vlookup(&operands),
            _ => CellValue::Error(ErrorKind::Name),
        };
        Operand::Scalar(result)
    }

    fn fn_if(&self, args: &[Expr]) -> CellValue {
        if args.is_empty() || args.len() > 3 {
            return CellValue::Error(ErrorKind::Value);
        }
        let cond = self.evaluate(&args[0]);
        if let CellValue::Error(e) = cond {
            return CellValue::Error(e);
        }
        if cond.is_truthy() {
            args.get(1)
                .map(|a| self.evaluate(a))
                .unwrap_or(CellValue::boolean(true))
        } else {
            args.get(2)
                .map(|a| self.evaluate(a))
                .unwrap_or(CellValue::boolean(false))
        }
    }

    fn fn_iferror(&self, args: &[Expr]) -> CellValue {
        if args.len() != 2 {
            return CellValue::Error(ErrorKind::Value);
        }
        let value = self.evaluate(&args[0]);
        if value.is_error() {
            self.evaluate(&args[1])
        } else {
            value
        }
    }

    fn fn_sum(&self, operands: &[Operand]) -> CellValue {
        match fold_numbers(operands) {
            Ok(numbers) => CellValue::number(numbers.iter().sum()),
            Err(e) => CellValue::Error(e),
        }
    }

    fn fn_count(&self, operands: &[Operand]) -> CellValue {
        let mut count = 0u32;
        for_each_value(operands, &mut |v| {
            if matches!(v, CellValue::Number { is_bool: false, .. }) {
                count += 1;
            }
        });
        CellValue::number(count as f64)
    }

    fn fn_counta(&self, operands: &[Operand]) -> CellValue {
        let mut count = 0u32;
        for_each_value(operands, &mut |v| {
            if !v.is_empty() {
                count += 1;
            }
        });
        CellValue::number(count as f64)
    }

    fn fn_average(&self, operands: &[Operand]) -> CellValue {
        match fold_numbers(operands) {
            Ok(numbers) if numbers.is_empty() => CellValue::Error(ErrorKind::Div),
            Ok(numbers) => {
                CellValue::number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
            Err(e) => CellValue::Error(e),
        }
    }

    fn fn_min_max(&self, operands: &[Operand], min: bool) -> CellValue {
        match fold_numbers(operands) {
            Ok(numbers) if numbers.is_empty() => CellValue::number(0.0),
            Ok(numbers) => {
                let folded = numbers
                    .into_iter()
                    .reduce(|a, b| if (a < b) == min { a } else { b })
                    .unwrap();
                CellValue::number(folded)
            }
            Err(e) => CellValue::Error(e),
        }
    }

    fn fn_and_or(&self, operands: &[Operand], and: bool) -> CellValue {
        let mut acc = and;
        let mut error = None;
        for_each_value(operands, &mut |v| {
            if let CellValue::Error(e) = v {
                error.get_or_insert(*e);
                return;
            }
            if and {
                acc = acc && v.is_truthy();
            } else {
                acc = acc || v.is_truthy();
            }
        });
        match error {
            Some(e) => CellValue::Error(e),
            None => CellValue::boolean(acc),
        }
    }

    fn fn_not(&self, operands: &[Operand]) -> CellValue {
        if operands.len() != 1 {
            return CellValue::Error(ErrorKind::Value);
        }
        let v = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        CellValue::boolean(!v.is_truthy())
    }

    fn fn_numeric1(&self, operands: &[Operand], f: fn(f64) -> f64) -> CellValue {
        if operands.len() != 1 {
            return CellValue::Error(ErrorKind::Value);
        }
        match operands[0].clone().into_scalar().as_number() {
            Ok(n) => CellValue::number(f(n)),
            Err(e) => CellValue::Error(e),
        }
    }

    fn fn_round(&self, operands: &[Operand]) -> CellValue {
        if operands.is_empty() || operands.len() > 2 {
            return CellValue::Error(ErrorKind::Value);
        }
        let n = match operands[0].clone().into_scalar().as_number() {
            Ok(n) => n,
            Err(e) => return CellValue::Error(e),
        };
        let digits = match operands.get(1) {
            Some(op) => match op.clone().into_scalar().as_number() {
                Ok(d) => d as i32,
                Err(e) => return CellValue::Error(e),
            },
            None => 0,
        };
        let factor = 10f64.powi(digits);
        CellValue::number((n * factor).round() / factor)
    }

    fn fn_mod(&self, operands: &[Operand]) -> CellValue {
        if operands.len() != 2 {
            return CellValue::Error(ErrorKind::Value);
        }
        let a = match operands[0].clone().into_scalar().as_number() {
            Ok(n) => n,
            Err(e) => return CellValue::Error(e),
        };
        let b = match operands[1].clone().into_scalar().as_number() {
            Ok(n) => n,
            Err(e) => return CellValue::Error(e),
        };
        if b == 0.0 {
            return CellValue::Error(ErrorKind::Div);
        }
        CellValue::number(a - b * (a / b).floor())
    }

    fn fn_row_column(&self, args: &[Expr], row: bool) -> CellValue {
        match args.first() {
            None => CellValue::number(if row { self.ctx.row } else { self.ctx.col } as f64),
            Some(Expr::Ref(RefKind::Cell { col, row: r, .. })) => {
                CellValue::number(if row { *r } else { *col } as f64)
            }
            Some(Expr::Ref(RefKind::Range {
                start_col,
                start_row,
                ..
            })) => CellValue::number(if row { *start_row } else { *start_col } as f64),
            _ => CellValue::Error(ErrorKind::Value),
        }
    }

    fn fn_concatenate(&self, operands: &[Operand]) -> CellValue {
        let mut out = String::new();
        let mut error = None;
        for_each_value(operands, &mut |v| {
            if let CellValue::Error(e) = v {
                error.get_or_insert(*e);
                return;
            }
            out.push_str(&coerce_text(v));
        });
        match error {
            Some(e) => CellValue::Error(e),
            None => CellValue::Text(out),
        }
    }

    fn fn_text1(&self, operands: &[Operand], f: impl Fn(&str) -> CellValue) -> CellValue {
        if operands.len() != 1 {
            return CellValue::Error(ErrorKind::Value);
        }
        let v = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        f(&coerce_text(&v))
    }

    fn fn_left_right(&self, operands: &[Operand], left: bool) -> CellValue {
        if operands.is_empty() || operands.len() > 2 {
            return CellValue::Error(ErrorKind::Value);
        }
        let v = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        let text = coerce_text(&v);
        let n = match operands.get(1) {
            Some(op) => match op.clone().into_scalar().as_number() {
                Ok(n) if n >= 0.0 => n as usize,
                Ok(_) => return CellValue::Error(ErrorKind::Value),
                Err(e) => return CellValue::Error(e),
            },
            None => 1,
        };
        let chars: Vec<char> = text.chars().collect();
        let taken: String = if left {
            chars.iter().take(n).collect()
        } else {
            chars.iter().skip(chars.len().saturating_sub(n)).collect()
        };
        CellValue::Text(taken)
    }

    fn fn_mid(&self, operands: &[Operand]) -> CellValue {
        if operands.len() != 3 {
            return CellValue::Error(ErrorKind::Value);
        }
        let v = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        let text = coerce_text(&v);
        let start = match operands[1].clone().into_scalar().as_number() {
            Ok(n) if n >= 1.0 => n as usize,
            Ok(_) => return CellValue::Error(ErrorKind::Value),
            Err(e) => return CellValue::Error(e),
        };
        let len = match operands[2].clone().into_scalar().as_number() {
            Ok(n) if n >= 0.0 => n as usize,
            Ok(_) => return CellValue::Error(ErrorKind::Value),
            Err(e) => return CellValue::Error(e),
        };
        let taken: String = text.chars().skip(start - 1).take(len).collect();
        CellValue::Text(taken)
    }

    /* ========  conditional aggregation  ======== */

    fn fn_single_criterion(&self, operands: &[Operand], agg: Aggregate) -> CellValue {
        // SUMIF(range, criterion, [sum_range]) / COUNTIF(range, criterion)
        let expected = match agg {
            Aggregate::Count => 2..=2,
            _ => 2..=3,
        };
        if !expected.contains(&operands.len()) {
            return CellValue::Error(ErrorKind::Value);
        }
        let criteria_col = match column_of(&operands[0]) {
            Some(c) => c,
            None => return CellValue::Error(ErrorKind::Value),
        };
        let criterion = Criterion::parse(&operands[1].clone().into_scalar());
        let value_col = match operands.get(2) {
            Some(op) => match column_of(op) {
                Some(c) => c,
                None => return CellValue::Error(ErrorKind::Value),
            },
            None => criteria_col.clone(),
        };
        aggregate_matching(agg, &value_col, &[(criteria_col, criterion)])
    }

    fn fn_multi_criteria(&self, operands: &[Operand], agg: Aggregate) -> CellValue {
        // SUMIFS(sum_range, c_range1, crit1, ...) / COUNTIFS(c_range1, crit1, ...)
        let (value_col, pairs_start) = match agg {
            Aggregate::Count => {
                if operands.len() < 2 || operands.len() % 2 != 0 {
                    return CellValue::Error(ErrorKind::Value);
                }
                (None, 0)
            }
            _ => {
                if operands.len() < 3 || operands.len() % 2 != 1 {
                    return CellValue::Error(ErrorKind::Value);
                }
                (Some(&operands[0]), 1)
            }
        };

        let mut pairs = Vec::new();
        let mut idx = pairs_start;
        while idx + 1 < operands.len() {
            let col = match column_of(&operands[idx]) {
                Some(c) => c,
                None => return CellValue::Error(ErrorKind::Value),
            };
            let criterion = Criterion::parse(&operands[idx + 1].clone().into_scalar());
            pairs.push((col, criterion));
            idx += 2;
        }

        let value_col = match value_col {
            Some(op) => match column_of(op) {
                Some(c) => c,
                None => return CellValue::Error(ErrorKind::Value),
            },
            None => pairs[0].0.clone(),
        };
        aggregate_matching(agg, &value_col, &pairs)
    }

    /* ========  lookups  ======== */

    fn fn_match(&self, operands: &[Operand]) -> CellValue {
        if operands.len() < 2 || operands.len() > 3 {
            return CellValue::Error(ErrorKind::Value);
        }
        let key = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = key {
            return CellValue::Error(e);
        }
        let haystack = match column_of(&operands[1]) {
            Some(c) => c,
            None => return CellValue::Error(ErrorKind::Value),
        };
        let match_type = match operands.get(2) {
            Some(op) => match op.clone().into_scalar().as_number() {
                Ok(n) => n as i32,
                Err(e) => return CellValue::Error(e),
            },
            None => 1,
        };

        let key_canon = crate::criteria::canonical_key(&key);
        match match_type {
            0 => {
                for (i, v) in haystack.iter().enumerate() {
                    if crate::criteria::canonical_key(v) == key_canon {
                        return CellValue::number((i + 1) as f64);
                    }
                }
                CellValue::Error(ErrorKind::Na)
            }
            _ => {
                // Largest value <= key (ascending data assumed); -1 is the
                // mirrored descending form.
                let target = match key.as_number() {
                    Ok(n) => n,
                    Err(e) => return CellValue::Error(e),
                };
                let mut best: Option<usize> = None;
                for (i, v) in haystack.iter().enumerate() {
                    if let Ok(n) = v.as_number()
                        && !v.is_empty()
                    {
                        let keep = if match_type >= 1 { n <= target } else { n >= target };
                        if keep {
                            best = Some(i);
                        }
                    }
                }
                match best {
                    Some(i) => CellValue::number((i + 1) as f64),
                    None => CellValue::Error(ErrorKind::Na),
                }
            }
        }
    }

    fn fn_index(&self, operands: &[Operand]) -> Operand {
        if operands.len() < 2 || operands.len() > 3 {
            return Operand::Scalar(CellValue::Error(ErrorKind::Value));
        }
        let matrix = match &operands[0] {
            Operand::Matrix(m) => m.clone(),
            Operand::Scalar(v) => return Operand::Scalar(v.clone()),
        };
        let row_num = match operands[1].clone().into_scalar().as_number() {
            Ok(n) if n >= 0.0 => n as usize,
            Ok(_) => return Operand::Scalar(CellValue::Error(ErrorKind::Value)),
            Err(e) => return Operand::Scalar(CellValue::Error(e)),
        };
        let col_num = match operands.get(2) {
            Some(op) => match op.clone().into_scalar().as_number() {
                Ok(n) if n >= 0.0 => n as usize,
                Ok(_) => return Operand::Scalar(CellValue::Error(ErrorKind::Value)),
                Err(e) => return Operand::Scalar(CellValue::Error(e)),
            },
            None => {
                // Single-column areas default to column 1.
                if matrix.first().map(|r| r.len()).unwrap_or(0) <= 1 {
                    1
                } else {
                    0
                }
            }
        };

        if row_num == 0 {
            return Operand::Scalar(CellValue::Error(ErrorKind::Value));
        }
        let Some(row) = matrix.get(row_num - 1) else {
            return Operand::Scalar(CellValue::Error(ErrorKind::Ref));
        };
        if col_num == 0 {
            // Whole-row slice, e.g. AVERAGE(INDEX(cols, MATCH(...), 0)).
            return Operand::Matrix(Arc::new(vec![row.clone()]));
        }
        match row.get(col_num - 1) {
            Some(v) => Operand::Scalar(v.clone()),
            None => Operand::Scalar(CellValue::Error(ErrorKind::Ref)),
        }
    }

    fn fn_vlookup(&self, operands: &[Operand]) -> CellValue {
        if operands.len() < 3 || operands.len() > 4 {
            return CellValue::Error(ErrorKind::Value);
        }
        let key = operands[0].clone().into_scalar();
        if let CellValue::Error(e) = key {
            return CellValue::Error(e);
        }
        let Operand::Matrix(table) = &operands[1] else {
            return CellValue::Error(ErrorKind::Value);
        };
        let col_index = match operands[2].clone().into_scalar().as_number() {
            Ok(n) if n >= 1.0 => n as usize,
            Ok(_) => return CellValue::Error(ErrorKind::Value),
            Err(e) => return CellValue::Error(e),
        };
        let exact = match operands.get(3) {
            Some(op) => !op.clone().into_scalar().is_truthy(),
            None => false,
        };

        let key_canon = crate::criteria::canonical_key(&key);
        if exact {
            for row in table.iter() {
                if let Some(first) = row.first()
                    && crate::criteria::canonical_key(first) == key_canon
                {
                    return row
                        .get(col_index - 1)
                        .cloned()
                        .unwrap_or(CellValue::Error(ErrorKind::Ref));
                }
            }
            CellValue::Error(ErrorKind::Na)
        } else {
            let target = match key.as_number() {
                Ok(n) => n,
                Err(e) => return CellValue::Error(e),
            };
            let mut best: Option<&Vec<CellValue>> = None;
            for row in table.iter() {
                if let Some(first) = row.first()
                    && let Ok(n) = first.as_number()
                    && !first.is_empty()
                    && n <= target
                {
                    best = Some(row);
                }
            }
            match best {
                Some(row) => row
                    .get(col_index - 1)
                    .cloned()
                    .unwrap_or(CellValue::Error(ErrorKind::Ref)),
                None => CellValue::Error(ErrorKind::Na),
            }
        }
    }
}

/* ===================  operand helpers  =================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Count,
    Average,
}

/// Visit every scalar inside the operand list (matrices flattened).
fn for_each_value(operands: &[Operand], visit: &mut dyn FnMut(&CellValue)) {
    for op in operands {
        match op {
            Operand::Scalar(v) => visit(v),
            Operand::Matrix(m) => {
                for row in m.iter() {
                    for v in row {
                        visit(v);
                    }
                }
            }
        }
    }
}

/// Collect the numeric contents for SUM/AVERAGE/MIN/MAX: range text and
/// empties are skipped, scalar text must coerce, and any error value
/// short-circuits.
fn fold_numbers(operands: &[Operand]) -> Result<Vec<f64>, ErrorKind> {
    let mut out = Vec::new();
    for op in operands {
        match op {
            Operand::Scalar(v) => match v {
                CellValue::Error(e) => return Err(*e),
                CellValue::Empty => {}
                other => out.push(other.as_number()?),
            },
            Operand::Matrix(m) => {
                for row in m.iter() {
                    for v in row {
                        match v {
                            CellValue::Error(e) => return Err(*e),
                            CellValue::Number { value, is_bool: false } => out.push(*value),
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Flatten a single-column (or single-row) area into one value vector.
fn column_of(operand: &Operand) -> Option<Vec<CellValue>> {
    match operand {
        Operand::Scalar(v) => Some(vec![v.clone()]),
        Operand::Matrix(m) => {
            if m.is_empty() {
                return Some(Vec::new());
            }
            let cols = m[0].len();
            if cols == 1 {
                Some(m.iter().map(|row| row[0].clone()).collect())
            } else if m.len() == 1 {
                Some(m[0].clone())
            } else {
                None
            }
        }
    }
}

fn aggregate_matching(
    agg: Aggregate,
    values: &[CellValue],
    pairs: &[(Vec<CellValue>, Criterion)],
) -> CellValue {
    let rows = pairs
        .iter()
        .map(|(col, _)| col.len())
        .chain(std::iter::once(values.len()))
        .max()
        .unwrap_or(0);

    let mut sum = 0.0;
    let mut count = 0u32;
    for i in 0..rows {
        let all = pairs.iter().all(|(col, criterion)| {
            criterion.matches(col.get(i).unwrap_or(&CellValue::Empty))
        });
        if !all {
            continue;
        }
        match agg {
            Aggregate::Count => count += 1,
            _ => {
                if let Some(CellValue::Number { value, is_bool: false }) = values.get(i) {
                    sum += *value;
                    count += 1;
                }
            }
        }
    }
    match agg {
        Aggregate::Sum => CellValue::number(sum),
        Aggregate::Count => CellValue::number(count as f64),
        Aggregate::Average => {
            if count == 0 {
                CellValue::Error(ErrorKind::Div)
            } else {
                CellValue::number(sum / count as f64)
            }
        }
    }
}

/// Text coercion: the rendering a value contributes to `&` and the text
/// functions.
pub fn coerce_text(v: &CellValue) -> String {
    match v {
        CellValue::Number { value, is_bool } => {
            if *is_bool {
                if *value != 0.0 { "TRUE".into() } else { "FALSE".into() }
            } else {
                render_number(*value)
            }
        }
        CellValue::Text(s) => s.clone(),
        CellValue::Error(e) => e.to_string(),
        CellValue::Empty => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    /// Fixed-table resolver for interpreter tests.
    struct MapResolver {
        cells: FxHashMap<(String, u32, u32), CellValue>,
        max_rows: FxHashMap<String, u32>,
    }

    impl MapResolver {
        fn new(cells: &[(&str, u32, u32, CellValue)]) -> Self {
            let mut map = FxHashMap::default();
            let mut max_rows: FxHashMap<String, u32> = FxHashMap::default();
            for (sheet, col, row, value) in cells {
                map.insert((sheet.to_string(), *col, *row), value.clone());
                let entry = max_rows.entry(sheet.to_string()).or_insert(0);
                *entry = (*entry).max(*row);
            }
            Self {
                cells: map,
                max_rows,
            }
        }
    }

    impl Resolver for MapResolver {
        fn cell_value(&self, sheet: &str, col: u32, row: u32) -> CellValue {
            self.cells
                .get(&(sheet.to_string(), col, row))
                .cloned()
                .unwrap_or(CellValue::Empty)
        }

        fn sheet_max_row(&self, sheet: &str) -> u32 {
            self.max_rows.get(sheet).copied().unwrap_or(0)
        }

        fn range_matrix(
            &self,
            sheet: &str,
            start_col: u32,
            start_row: u32,
            end_col: u32,
            end_row: u32,
        ) -> Arc<Vec<Vec<CellValue>>> {
            let mut out = Vec::new();
            for row in start_row..=end_row {
                let mut cells = Vec::new();
                for col in start_col..=end_col {
                    cells.push(self.cell_value(sheet, col, row));
                }
                out.push(cells);
            }
            Arc::new(out)
        }
    }

    fn eval_with(resolver: &MapResolver, formula: &str) -> CellValue {
        let expr = cellforge_parse::parse_formula(formula).unwrap();
        let interp = Interpreter::new(EvalContext {
            resolver,
            sheet: "Sheet1",
            col: 1,
            row: 1,
        });
        interp.evaluate(&expr)
    }

    fn eval(formula: &str) -> CellValue {
        eval_with(&MapResolver::new(&[]), formula)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("=1+2*3"), CellValue::number(7.0));
        assert_eq!(eval("=(1+2)*3"), CellValue::number(9.0));
        assert_eq!(eval("=2^10"), CellValue::number(1024.0));
        assert_eq!(eval("=50%"), CellValue::number(0.5));
        assert_eq!(eval("=1/0"), CellValue::Error(ErrorKind::Div));
    }

    #[test]
    fn text_concat_and_comparison() {
        assert_eq!(eval("=\"a\"&\"b\""), CellValue::text("ab"));
        assert_eq!(eval("=1&2"), CellValue::text("12"));
        assert_eq!(eval("=\"a\"=\"A\""), CellValue::boolean(true));
        // Text never equals a number, even when it looks numeric.
        assert_eq!(eval("=\"0\"=0"), CellValue::boolean(false));
        assert_eq!(eval("=2>1"), CellValue::boolean(true));
    }

    #[test]
    fn cell_and_range_reads() {
        let r = MapResolver::new(&[
            ("Sheet1", 1, 1, CellValue::number(10.0)),
            ("Sheet1", 1, 2, CellValue::number(20.0)),
            ("Sheet1", 1, 3, CellValue::number(30.0)),
        ]);
        assert_eq!(eval_with(&r, "=A1*2"), CellValue::number(20.0));
        assert_eq!(eval_with(&r, "=SUM(A1:A3)"), CellValue::number(60.0));
        assert_eq!(eval_with(&r, "=SUM(A:A)"), CellValue::number(60.0));
        assert_eq!(eval_with(&r, "=AVERAGE(A1:A3)"), CellValue::number(20.0));
        assert_eq!(eval_with(&r, "=MIN(A1:A3)"), CellValue::number(10.0));
        assert_eq!(eval_with(&r, "=MAX(A1:A3)"), CellValue::number(30.0));
    }

    #[test]
    fn empty_column_aggregates() {
        let r = MapResolver::new(&[]);
        assert_eq!(eval_with(&r, "=SUM(Z:Z)"), CellValue::number(0.0));
        assert_eq!(eval_with(&r, "=COUNT(Z:Z)"), CellValue::number(0.0));
        assert_eq!(
            eval_with(&r, "=AVERAGE(Z:Z)"),
            CellValue::Error(ErrorKind::Div)
        );
    }

    #[test]
    fn if_and_iferror() {
        assert_eq!(eval("=IF(1>0,\"yes\",\"no\")"), CellValue::text("yes"));
        assert_eq!(eval("=IF(1<0,\"yes\")"), CellValue::boolean(false));
        assert_eq!(eval("=IFERROR(1/0,\"fallback\")"), CellValue::text("fallback"));
        assert_eq!(eval("=IFERROR(42,\"fallback\")"), CellValue::number(42.0));
    }

    #[test]
    fn row_and_column_context() {
        let r = MapResolver::new(&[]);
        let expr = cellforge_parse::parse_formula("=ROW()").unwrap();
        let interp = Interpreter::new(EvalContext {
            resolver: &r,
            sheet: "Sheet1",
            col: 3,
            row: 7,
        });
        assert_eq!(interp.evaluate(&expr), CellValue::number(7.0));
        assert_eq!(eval("=ROW(B9)"), CellValue::number(9.0));
        assert_eq!(eval("=COLUMN(B9)"), CellValue::number(2.0));
    }

    #[test]
    fn sumifs_and_countifs() {
        let r = MapResolver::new(&[
            ("data", 1, 1, CellValue::text("K1")),
            ("data", 1, 2, CellValue::text("K2")),
            ("data", 1, 3, CellValue::text("K1")),
            ("data", 8, 1, CellValue::number(5.0)),
            ("data", 8, 2, CellValue::number(7.0)),
            ("data", 8, 3, CellValue::number(11.0)),
        ]);
        assert_eq!(
            eval_with(&r, "=SUMIFS(data!$H:$H, data!$A:$A, \"K1\")"),
            CellValue::number(16.0)
        );
        assert_eq!(
            eval_with(&r, "=COUNTIFS(data!$A:$A, \"K1\")"),
            CellValue::number(2.0)
        );
        assert_eq!(
            eval_with(&r, "=AVERAGEIFS(data!$H:$H, data!$A:$A, \"K1\")"),
            CellValue::number(8.0)
        );
        assert_eq!(
            eval_with(&r, "=SUMIF(data!$H:$H, \">6\")"),
            CellValue::number(18.0)
        );
    }

    #[test]
    fn index_match_lookup() {
        let r = MapResolver::new(&[
            ("source", 1, 1, CellValue::text("alpha")),
            ("source", 1, 2, CellValue::text("beta")),
            ("source", 7, 1, CellValue::number(100.0)),
            ("source", 7, 2, CellValue::number(200.0)),
        ]);
        assert_eq!(
            eval_with(&r, "=INDEX(source!$G:$G, MATCH(\"beta\", source!$A:$A, 0))"),
            CellValue::number(200.0)
        );
        assert_eq!(
            eval_with(&r, "=INDEX(source!$G:$G, MATCH(\"gone\", source!$A:$A, 0))"),
            CellValue::Error(ErrorKind::Na)
        );
        assert_eq!(
            eval_with(
                &r,
                "=IFERROR(INDEX(source!$G:$G, MATCH(\"gone\", source!$A:$A, 0)), \"\")"
            ),
            CellValue::text("")
        );
    }

    #[test]
    fn index_row_slice_average() {
        let r = MapResolver::new(&[
            ("s", 1, 1, CellValue::text("k")),
            ("s", 2, 1, CellValue::number(4.0)),
            ("s", 3, 1, CellValue::number(6.0)),
        ]);
        assert_eq!(
            eval_with(&r, "=AVERAGE(INDEX(s!$B:$C, MATCH(\"k\", s!$A:$A, 0), 0))"),
            CellValue::number(5.0)
        );
    }

    #[test]
    fn vlookup_exact() {
        let r = MapResolver::new(&[
            ("s", 1, 1, CellValue::text("a")),
            ("s", 2, 1, CellValue::number(1.0)),
            ("s", 1, 2, CellValue::text("b")),
            ("s", 2, 2, CellValue::number(2.0)),
        ]);
        assert_eq!(
            eval_with(&r, "=VLOOKUP(\"b\", s!A1:B2, 2, FALSE)"),
            CellValue::number(2.0)
        );
        assert_eq!(
            eval_with(&r, "=VLOOKUP(\"z\", s!A1:B2, 2, FALSE)"),
            CellValue::Error(ErrorKind::Na)
        );
    }

    #[test]
    fn error_propagation() {
        let r = MapResolver::new(&[("Sheet1", 1, 1, CellValue::Error(ErrorKind::Na))]);
        assert_eq!(eval_with(&r, "=A1+1"), CellValue::Error(ErrorKind::Na));
        assert_eq!(eval_with(&r, "=SUM(A1:A2)"), CellValue::Error(ErrorKind::Na));
        assert_eq!(
            eval_with(&r, "=IFERROR(A1+1, \"absorbed\")"),
            CellValue::text("absorbed")
        );
    }

    #[test]
    fn unknown_function_is_name_error() {
        assert_eq!(eval("=FROBNICATE(1)"), CellValue::Error(ErrorKind::Name));
        assert_eq!(eval("=SOMENAME+1"), CellValue::Error(ErrorKind::Name));
    }

    #[test]
    fn text_functions() {
        assert_eq!(eval("=LEN(\"hello\")"), CellValue::number(5.0));
        assert_eq!(eval("=LEFT(\"hello\",2)"), CellValue::text("he"));
        assert_eq!(eval("=RIGHT(\"hello\",2)"), CellValue::text("lo"));
        assert_eq!(eval("=MID(\"hello\",2,3)"), CellValue::text("ell"));
        assert_eq!(eval("=UPPER(\"abc\")"), CellValue::text("ABC"));
        assert_eq!(eval("=TRIM(\"  x  \")"), CellValue::text("x"));
        assert_eq!(eval("=CONCATENATE(\"a\",1,\"b\")"), CellValue::text("a1b"));
    }

    #[test]
    fn logical_functions() {
        assert_eq!(eval("=AND(1,1)"), CellValue::boolean(true));
        assert_eq!(eval("=AND(1,0)"), CellValue::boolean(false));
        assert_eq!(eval("=OR(0,1)"), CellValue::boolean(true));
        assert_eq!(eval("=NOT(0)"), CellValue::boolean(true));
    }

    #[test]
    fn numeric_functions() {
        assert_eq!(eval("=ABS(-3)"), CellValue::number(3.0));
        assert_eq!(eval("=INT(2.7)"), CellValue::number(2.0));
        assert_eq!(eval("=ROUND(2.567,2)"), CellValue::number(2.57));
        assert_eq!(eval("=MOD(7,3)"), CellValue::number(1.0));
        assert_eq!(eval("=MOD(7,0)"), CellValue::Error(ErrorKind::Div));
    }
}
