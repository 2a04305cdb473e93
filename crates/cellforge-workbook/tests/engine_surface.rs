//! Engine surface behaviour: idempotence, no-op changesets, the
//! incremental-equals-full equivalence, single-cell evaluation, batch
//! updates, the calc chain, and structural invalidation.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use cellforge_common::CellValue;
use cellforge_engine::{CalcOptions, FormulaUpdate, ValueUpdate};
use cellforge_workbook::Workbook;

fn changed(refs: &[&str]) -> FxHashSet<String> {
    refs.iter().map(|r| r.to_string()).collect()
}

fn build_ladder() -> Workbook {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 2.0).unwrap();
    wb.set_cell_value("Sheet1", "A2", 3.0).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1+A2").unwrap();
    wb.set_cell_formula("Sheet1", "B2", "=B1*10").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=SUM(A1:A2)+B2").unwrap();
    wb
}

#[test]
fn recalc_twice_is_idempotent_and_silent() {
    let wb = build_ladder();
    wb.recalculate_all().unwrap();

    let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let sink = calls.clone();
    wb.set_on_cell_calculated(Some(Arc::new(move |_, _, _, _| {
        *sink.lock().unwrap() += 1;
    })));

    let before: Vec<String> = ["B1", "B2", "C1"]
        .iter()
        .map(|c| wb.get_cell_value("Sheet1", c).unwrap())
        .collect();
    wb.recalculate_all().unwrap();
    let after: Vec<String> = ["B1", "B2", "C1"]
        .iter()
        .map(|c| wb.get_cell_value("Sheet1", c).unwrap())
        .collect();

    assert_eq!(before, after);
    // No value changed, so the callback never fired.
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn empty_change_set_is_a_noop() {
    let wb = build_ladder();
    wb.recalculate_all().unwrap();

    let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let sink = calls.clone();
    wb.set_on_cell_calculated(Some(Arc::new(move |_, _, _, _| {
        *sink.lock().unwrap() += 1;
    })));

    let stats = wb.recalculate_affected(&FxHashSet::default()).unwrap();
    assert_eq!(stats.computed, 0);
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn unrelated_change_does_not_recompute() {
    let wb = build_ladder();
    wb.set_cell_value("Sheet1", "Z9", 1.0).unwrap();
    wb.recalculate_all().unwrap();

    let stats = wb.recalculate_affected(&changed(&["Sheet1!Z9"])).unwrap();
    assert_eq!(stats.computed, 0);
}

#[test]
fn incremental_matches_full_recalculation() {
    // Same mutation driven two ways must converge to the same cache state.
    let make = || {
        let wb = build_ladder();
        wb.recalculate_all().unwrap();
        wb.set_cell_value("Sheet1", "A1", 7.0).unwrap();
        wb
    };

    let incremental = make();
    incremental
        .recalculate_affected(&changed(&["Sheet1!A1"]))
        .unwrap();

    let full = make();
    full.recalculate_all().unwrap();

    for cell in ["B1", "B2", "C1"] {
        assert_eq!(
            incremental.get_cell_value("Sheet1", cell).unwrap(),
            full.get_cell_value("Sheet1", cell).unwrap(),
            "cell {cell}"
        );
    }
}

#[test]
fn forward_reference_within_level() {
    // Two level-0 formulas referencing disjoint data; neither blocks the
    // other regardless of iteration order.
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 1.0).unwrap();
    wb.set_cell_value("Sheet1", "A2", 2.0).unwrap();
    wb.set_cell_formula("Sheet1", "Z1", "=A2*10").unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1*10").unwrap();

    let stats = wb.recalculate_all().unwrap();
    assert_eq!(stats.merged_levels, 1);
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "10");
    assert_eq!(wb.get_cell_value("Sheet1", "Z1").unwrap(), "20");
}

#[test]
fn calc_cell_value_formats_and_raw() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 1234.5).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1*2").unwrap();
    wb.set_number_format("Sheet1", "B1", "#,##0.00").unwrap();

    let formatted = wb
        .calc_cell_value("Sheet1", "B1", &CalcOptions::default())
        .unwrap();
    assert_eq!(formatted, "2,469.00");

    let raw = wb
        .calc_cell_value(
            "Sheet1",
            "B1",
            &CalcOptions {
                raw_cell_value: true,
            },
        )
        .unwrap();
    assert_eq!(raw, "2469");
}

#[test]
fn calc_cell_value_unknown_sheet_errors() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    assert!(wb
        .calc_cell_value("Nope", "A1", &CalcOptions::default())
        .is_err());
}

#[test]
fn calc_formula_value_does_not_persist() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 6.0).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1").unwrap();
    wb.recalculate_all().unwrap();

    let value = wb.calc_formula_value("Sheet1", "B1", "=A1*100").unwrap();
    assert_eq!(value, "600");

    // The cell's formula and cached value are untouched.
    assert_eq!(
        wb.get_cell_formula("Sheet1", "B1").unwrap().as_deref(),
        Some("=A1")
    );
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "6");
}

#[test]
fn batch_update_values_and_formulas_recomputes_union() {
    let wb = build_ladder();
    wb.recalculate_all().unwrap();

    wb.batch_update_values_and_formulas(
        &[ValueUpdate {
            sheet: "Sheet1".into(),
            cell: "A1".into(),
            value: CellValue::number(10.0),
        }],
        &[FormulaUpdate {
            sheet: "Sheet1".into(),
            cell: "B2".into(),
            formula: "=B1*100".into(),
        }],
    )
    .unwrap();

    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "13");
    assert_eq!(wb.get_cell_value("Sheet1", "B2").unwrap(), "1300");
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "1313");
}

#[test]
fn calc_chain_rebuild_and_round_trip() {
    let wb = build_ladder();
    wb.rebuild_calc_chain();
    let chain = wb.calc_chain();
    assert_eq!(chain.entries.len(), 3);

    let json = wb.calc_chain_json();
    let other = Workbook::new();
    other.load_calc_chain_json(&json).unwrap();
    assert_eq!(other.calc_chain(), chain);
}

#[test]
fn chain_is_only_a_hint() {
    // A stale chain listing cells that no longer exist must not affect
    // results.
    let wb = build_ladder();
    wb.load_calc_chain_json(
        "{\"entries\":[{\"cell_ref\":\"Q99\",\"sheet_index\":7},{\"cell_ref\":\"B2\",\"sheet_index\":1}]}",
    )
    .unwrap();
    wb.recalculate_all().unwrap();
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "55");
}

#[test]
fn structural_mutation_shifts_rows() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 1.0).unwrap();
    wb.set_cell_value("Sheet1", "A2", 2.0).unwrap();
    wb.set_cell_value("Sheet1", "A3", 3.0).unwrap();

    wb.insert_rows("Sheet1", 2, 1).unwrap();
    assert_eq!(wb.get_cell_value("Sheet1", "A1").unwrap(), "1");
    assert_eq!(wb.get_cell_value("Sheet1", "A2").unwrap(), "");
    assert_eq!(wb.get_cell_value("Sheet1", "A3").unwrap(), "2");
    assert_eq!(wb.get_cell_value("Sheet1", "A4").unwrap(), "3");

    wb.delete_rows("Sheet1", 2, 1).unwrap();
    assert_eq!(wb.get_cell_value("Sheet1", "A2").unwrap(), "2");
    assert_eq!(wb.get_cell_value("Sheet1", "A3").unwrap(), "3");
}

#[test]
fn error_formula_does_not_abort_run() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 1.0).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1/0").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=A1+1").unwrap();
    wb.set_cell_formula("Sheet1", "D1", "=B1+1").unwrap();

    let stats = wb.recalculate_all().unwrap();
    assert!(stats.circular_cells.is_empty());
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "#DIV/0!");
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "2");
    // Errors propagate through arithmetic dependents.
    assert_eq!(wb.get_cell_value("Sheet1", "D1").unwrap(), "#DIV/0!");
}

#[test]
fn unparseable_formula_is_value_error() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_formula("Sheet1", "A1", "=SUM(B1").unwrap();
    wb.recalculate_all().unwrap();
    assert_eq!(wb.get_cell_value("Sheet1", "A1").unwrap(), "#VALUE!");
}
