//! The bulk optimiser: detects repeated conditional-aggregation and
//! lookup-join shapes inside a level and computes each group with a single
//! scan of the shared data source.
//!
//! Two families are recognised:
//!
//! * `SUMIFS` / `COUNTIFS` / `AVERAGEIFS` whose ranges are whole columns —
//!   grouped by (sheet, value column, criteria columns); one scan builds a
//!   criteria-tuple → aggregate map, then every formula in the group fills
//!   in O(1).
//! * `INDEX(col, MATCH(key, key_col, 0))` single-column lookups and the
//!   `AVERAGE(INDEX(cols, MATCH(key, key_col, 0), 0))` row-slice form —
//!   grouped by (sheet, key column, target columns); one scan builds a
//!   key → row hash index.
//!
//! A pattern found at the formula root resolves the whole cell here. Found
//! nested inside a composite, only the sub-expression is computed and
//! parked in the sub-expression cache for the substitution pass.

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tracing::debug;

use cellforge_common::CellValue;
use cellforge_parse::{Expr, RefKind};

use crate::cache::SubExprCache;
use crate::config::EngineConfig;
use crate::criteria::{Criterion, canonical_key};
use crate::graph::DependencyGraph;
use crate::interp::{Aggregate, EvalContext, Interpreter, Resolver};
use crate::snapshot::Snapshot;

/// Recalculation-scoped cache of materialised data-source columns, shared
/// across optimisation groups hitting the same sheet.
#[derive(Default)]
pub struct ColumnCache {
    columns: DashMap<(String, u32), Arc<Vec<CellValue>>>,
}

impl ColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(&self, snapshot: &Snapshot, sheet: &str, col: u32) -> Arc<Vec<CellValue>> {
        if let Some(cached) = self.columns.get(&(sheet.to_string(), col)) {
            return cached.clone();
        }
        let data = Arc::new(snapshot.column(sheet, col));
        self.columns.insert((sheet.to_string(), col), data.clone());
        data
    }
}

/// What one detected pattern instance computes.
#[derive(Debug)]
enum Shape {
    Aggregate {
        agg: Aggregate,
        sheet: String,
        value_col: Option<u32>,
        criteria_cols: Vec<u32>,
        criteria_exprs: Vec<Expr>,
    },
    Lookup {
        sheet: String,
        key_col: u32,
        target_start: u32,
        target_end: u32,
        key_expr: Expr,
        average_slice: bool,
    },
}

#[derive(Debug)]
struct Instance {
    cell: String,
    shape: Shape,
    /// Byte-exact source slice of the matched call.
    span_text: String,
    /// Pattern at the formula root: its value is the cell's value.
    pure: bool,
}

/// Result of running the optimiser over one level.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Fully computed cells (pure patterns) with their values.
    pub computed: FxHashMap<String, CellValue>,
    /// Number of sub-expression cache entries written for embedded
    /// patterns.
    pub subexpr_entries: usize,
}

/// Run the bulk optimiser over one level's formulas.
pub fn run_level(
    level_cells: &[String],
    graph: &DependencyGraph,
    snapshot: &Snapshot,
    columns: &ColumnCache,
    subexpr: &SubExprCache,
    resolver: &dyn Resolver,
    config: &EngineConfig,
) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();

    let mut instances: Vec<Instance> = Vec::new();
    for cell in level_cells {
        let Some(node) = graph.nodes.get(cell) else {
            continue;
        };
        let Some(ast) = &node.ast else { continue };
        let own_sheet = cell.split_once('!').map(|(s, _)| s).unwrap_or_default();
        collect_instances(ast, &node.formula, own_sheet, cell, true, &mut instances);
    }
    if instances.is_empty() {
        return outcome;
    }

    // Group by structural key; each group shares one data scan.
    let mut groups: FxHashMap<String, Vec<Instance>> = FxHashMap::default();
    for instance in instances {
        groups
            .entry(instance.shape.group_key())
            .or_default()
            .push(instance);
    }

    for (key, group) in groups {
        if group.len() < config.bulk_threshold {
            continue;
        }
        debug!(group = %key, size = group.len(), "bulk group");
        match &group[0].shape {
            Shape::Aggregate { .. } => {
                compute_aggregate_group(&group, snapshot, columns, subexpr, resolver, &mut outcome)
            }
            Shape::Lookup { .. } => {
                compute_lookup_group(&group, snapshot, columns, subexpr, resolver, &mut outcome)
            }
        }
    }
    outcome
}

/// Whether an expression reads the evaluating cell's own coordinates.
fn reads_own_coords(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Func { name, args, .. } = e
            && args.is_empty()
            && (name == "ROW" || name == "COLUMN")
        {
            found = true;
        }
    });
    found
}

impl Shape {
    /// True when a per-formula argument varies with the evaluating cell
    /// even though its text does not.
    fn context_dependent(&self) -> bool {
        match self {
            Shape::Aggregate { criteria_exprs, .. } => {
                criteria_exprs.iter().any(reads_own_coords)
            }
            Shape::Lookup { key_expr, .. } => reads_own_coords(key_expr),
        }
    }

    fn group_key(&self) -> String {
        match self {
            Shape::Aggregate {
                agg,
                sheet,
                value_col,
                criteria_cols,
                ..
            } => format!("agg:{agg:?}:{sheet}:{value_col:?}:{criteria_cols:?}"),
            Shape::Lookup {
                sheet,
                key_col,
                target_start,
                target_end,
                average_slice,
                ..
            } => format!("lkp:{sheet}:{key_col}:{target_start}:{target_end}:{average_slice}"),
        }
    }
}

/* ===================  detection  =================== */

fn collect_instances(
    expr: &Expr,
    formula: &str,
    own_sheet: &str,
    cell: &str,
    is_root: bool,
    out: &mut Vec<Instance>,
) {
    if let Expr::Func { name, args, span } = expr {
        let shape = match name.as_str() {
            "SUMIFS" => match_aggregate(Aggregate::Sum, args, own_sheet, true),
            "AVERAGEIFS" => match_aggregate(Aggregate::Average, args, own_sheet, true),
            "COUNTIFS" => match_aggregate(Aggregate::Count, args, own_sheet, false),
            "INDEX" => match_lookup(args, own_sheet),
            "AVERAGE" => match_average_slice(args, own_sheet),
            _ => None,
        };
        if let Some(shape) = shape {
            // The sub-expression cache is keyed on literal text. An
            // embedded call whose per-formula arguments depend on the
            // evaluating cell (ROW(), COLUMN()) has identical text in
            // every cell but different values, so it must not share a
            // text-keyed entry. Pure instances are unaffected — their
            // results go straight to the cell.
            if is_root || !shape.context_dependent() {
                out.push(Instance {
                    cell: cell.to_string(),
                    shape,
                    span_text: formula[span.0..span.1].to_string(),
                    pure: is_root,
                });
            }
            // The matched call's arguments cannot contain a second
            // pattern; stop descending.
            return;
        }
    }

    match expr {
        Expr::Unary { expr, .. } => {
            collect_instances(expr, formula, own_sheet, cell, false, out)
        }
        Expr::Binary { left, right, .. } => {
            collect_instances(left, formula, own_sheet, cell, false, out);
            collect_instances(right, formula, own_sheet, cell, false, out);
        }
        Expr::Func { args, .. } => {
            for arg in args {
                collect_instances(arg, formula, own_sheet, cell, false, out);
            }
        }
        _ => {}
    }
}

/// A whole-column reference to exactly one column.
fn single_column(expr: &Expr, own_sheet: &str) -> Option<(String, u32)> {
    match expr {
        Expr::Ref(RefKind::ColRange {
            sheet,
            start_col,
            end_col,
        }) if start_col == end_col => Some((
            sheet.clone().unwrap_or_else(|| own_sheet.to_string()),
            *start_col,
        )),
        _ => None,
    }
}

fn match_aggregate(
    agg: Aggregate,
    args: &[Expr],
    own_sheet: &str,
    has_value_range: bool,
) -> Option<Shape> {
    let (value, pairs) = if has_value_range {
        if args.len() < 3 || args.len() % 2 != 1 {
            return None;
        }
        (Some(single_column(&args[0], own_sheet)?), &args[1..])
    } else {
        if args.len() < 2 || args.len() % 2 != 0 {
            return None;
        }
        (None, args)
    };

    let sheet = match &value {
        Some((sheet, _)) => sheet.clone(),
        None => single_column(&pairs[0], own_sheet)?.0,
    };

    let mut criteria_cols = Vec::new();
    let mut criteria_exprs = Vec::new();
    for pair in pairs.chunks(2) {
        let (crit_sheet, col) = single_column(&pair[0], own_sheet)?;
        if crit_sheet != sheet {
            return None;
        }
        criteria_cols.push(col);
        criteria_exprs.push(pair[1].clone());
    }

    Some(Shape::Aggregate {
        agg,
        sheet,
        value_col: value.map(|(_, col)| col),
        criteria_cols,
        criteria_exprs,
    })
}

/// `INDEX(col, MATCH(key, key_col, 0))`.
fn match_lookup(args: &[Expr], own_sheet: &str) -> Option<Shape> {
    if args.len() != 2 {
        return None;
    }
    let (sheet, target_col) = single_column(&args[0], own_sheet)?;
    let (key_expr, key_sheet, key_col) = match_exact_match(&args[1], own_sheet)?;
    if key_sheet != sheet {
        return None;
    }
    Some(Shape::Lookup {
        sheet,
        key_col,
        target_start: target_col,
        target_end: target_col,
        key_expr,
        average_slice: false,
    })
}

/// `AVERAGE(INDEX(cols, MATCH(key, key_col, 0), 0))`.
fn match_average_slice(args: &[Expr], own_sheet: &str) -> Option<Shape> {
    let [Expr::Func { name, args: inner, .. }] = args else {
        return None;
    };
    if name != "INDEX" || inner.len() != 3 {
        return None;
    }
    let Expr::Ref(RefKind::ColRange {
        sheet,
        start_col,
        end_col,
    }) = &inner[0]
    else {
        return None;
    };
    if !matches!(&inner[2], Expr::Number(n) if *n == 0.0) {
        return None;
    }
    let sheet = sheet.clone().unwrap_or_else(|| own_sheet.to_string());
    let (key_expr, key_sheet, key_col) = match_exact_match(&inner[1], own_sheet)?;
    if key_sheet != sheet {
        return None;
    }
    Some(Shape::Lookup {
        sheet,
        key_col,
        target_start: *start_col,
        target_end: *end_col,
        key_expr,
        average_slice: true,
    })
}

/// `MATCH(key, key_col, 0)` — exact-match only.
fn match_exact_match(expr: &Expr, own_sheet: &str) -> Option<(Expr, String, u32)> {
    let Expr::Func { name, args, .. } = expr else {
        return None;
    };
    if name != "MATCH" || args.len() != 3 {
        return None;
    }
    if !matches!(&args[2], Expr::Number(n) if *n == 0.0) {
        return None;
    }
    let (sheet, col) = single_column(&args[1], own_sheet)?;
    Some((args[0].clone(), sheet, col))
}

/* ===================  computation  =================== */

/// Evaluate a per-formula scalar argument (criterion value or lookup key)
/// in the formula cell's own context.
fn eval_in_cell_context(
    expr: &Expr,
    cell: &str,
    resolver: &dyn Resolver,
) -> CellValue {
    let (sheet, local) = cell.split_once('!').unwrap_or(("", cell));
    let (col, row) = cellforge_common::parse_cell(local).unwrap_or((1, 1));
    let interp = Interpreter::new(EvalContext {
        resolver,
        sheet,
        col,
        row,
    });
    interp.evaluate(expr)
}

fn finish_instance(
    instance: &Instance,
    value: CellValue,
    subexpr: &SubExprCache,
    outcome: &mut BulkOutcome,
) {
    if instance.pure {
        outcome.computed.insert(instance.cell.clone(), value);
    } else {
        subexpr.store(&instance.span_text, value.to_string());
        outcome.subexpr_entries += 1;
    }
}

fn compute_aggregate_group(
    group: &[Instance],
    snapshot: &Snapshot,
    columns: &ColumnCache,
    subexpr: &SubExprCache,
    resolver: &dyn Resolver,
    outcome: &mut BulkOutcome,
) {
    let Shape::Aggregate {
        agg,
        sheet,
        value_col,
        criteria_cols,
        ..
    } = &group[0].shape
    else {
        return;
    };

    // Evaluate every formula's criteria first; only plain-equality tuples
    // can ride the grouped map. The rest fall through to the scheduler.
    let mut probes: Vec<(&Instance, Vec<String>)> = Vec::new();
    for instance in group {
        let Shape::Aggregate { criteria_exprs, .. } = &instance.shape else {
            continue;
        };
        let mut keys = Vec::with_capacity(criteria_exprs.len());
        let mut groupable = true;
        for expr in criteria_exprs {
            let value = eval_in_cell_context(expr, &instance.cell, resolver);
            match Criterion::parse(&value).as_equality_key() {
                Some(key) => keys.push(key.to_string()),
                None => {
                    groupable = false;
                    break;
                }
            }
        }
        if groupable {
            probes.push((instance, keys));
        }
    }
    if probes.is_empty() {
        return;
    }

    let criteria_data: Vec<Arc<Vec<CellValue>>> = criteria_cols
        .iter()
        .map(|&col| columns.column(snapshot, sheet, col))
        .collect();
    let value_data = value_col.map(|col| columns.column(snapshot, sheet, col));

    let rows = criteria_data
        .iter()
        .map(|c| c.len())
        .chain(value_data.iter().map(|v| v.len()))
        .max()
        .unwrap_or(0);

    // One scan of the data source fills the whole group's map.
    let mut buckets: FxHashMap<Vec<String>, (f64, u32)> = FxHashMap::default();
    for row in 0..rows {
        let tuple: Vec<String> = criteria_data
            .iter()
            .map(|col| canonical_key(col.get(row).unwrap_or(&CellValue::Empty)))
            .collect();
        let entry = buckets.entry(tuple).or_insert((0.0, 0));
        match value_data.as_ref().map(|v| v.get(row)) {
            Some(Some(CellValue::Number {
                value,
                is_bool: false,
            })) => {
                entry.0 += *value;
                entry.1 += 1;
            }
            Some(_) => {}
            // COUNTIFS counts matching rows, no value column involved.
            None => entry.1 += 1,
        }
    }

    for (instance, keys) in probes {
        let (sum, count) = buckets.get(&keys).copied().unwrap_or((0.0, 0));
        let value = match agg {
            Aggregate::Sum => CellValue::number(sum),
            Aggregate::Count => CellValue::number(count as f64),
            Aggregate::Average => {
                if count == 0 {
                    CellValue::Error(cellforge_common::ErrorKind::Div)
                } else {
                    CellValue::number(sum / count as f64)
                }
            }
        };
        finish_instance(instance, value, subexpr, outcome);
    }
}

fn compute_lookup_group(
    group: &[Instance],
    snapshot: &Snapshot,
    columns: &ColumnCache,
    subexpr: &SubExprCache,
    resolver: &dyn Resolver,
    outcome: &mut BulkOutcome,
) {
    let Shape::Lookup {
        sheet,
        key_col,
        target_start,
        target_end,
        average_slice,
        ..
    } = &group[0].shape
    else {
        return;
    };

    let key_data = columns.column(snapshot, sheet, *key_col);

    // First-match index, the way MATCH(…, 0) resolves.
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    for (row, value) in key_data.iter().enumerate() {
        if value.is_empty() {
            continue;
        }
        index.entry(canonical_key(value)).or_insert(row);
    }

    let target_data: Vec<Arc<Vec<CellValue>>> = (*target_start..=*target_end)
        .map(|col| columns.column(snapshot, sheet, col))
        .collect();

    for instance in group {
        let Shape::Lookup { key_expr, .. } = &instance.shape else {
            continue;
        };
        let key = eval_in_cell_context(key_expr, &instance.cell, resolver);
        let value = match key {
            CellValue::Error(e) => CellValue::Error(e),
            key => match index.get(&canonical_key(&key)) {
                None => CellValue::Error(cellforge_common::ErrorKind::Na),
                Some(&row) => {
                    if *average_slice {
                        let numbers: Vec<f64> = target_data
                            .iter()
                            .filter_map(|col| col.get(row))
                            .filter_map(|v| match v {
                                CellValue::Number {
                                    value,
                                    is_bool: false,
                                } => Some(*value),
                                _ => None,
                            })
                            .collect();
                        if numbers.is_empty() {
                            CellValue::Error(cellforge_common::ErrorKind::Div)
                        } else {
                            CellValue::number(numbers.iter().sum::<f64>() / numbers.len() as f64)
                        }
                    } else {
                        target_data[0]
                            .get(row)
                            .cloned()
                            .unwrap_or(CellValue::Empty)
                    }
                }
            },
        };
        finish_instance(instance, value, subexpr, outcome);
    }
}
