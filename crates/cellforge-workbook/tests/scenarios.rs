//! End-to-end recalculation scenarios through the workbook surface.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use cellforge_workbook::Workbook;

type Calls = Arc<Mutex<Vec<(String, String, String, String)>>>;

fn capture_calls(wb: &Workbook) -> Calls {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    wb.set_on_cell_calculated(Some(Arc::new(move |sheet, cell, old, new| {
        sink.lock().unwrap().push((
            sheet.to_string(),
            cell.to_string(),
            old.to_string(),
            new.to_string(),
        ));
    })));
    calls
}

fn changed(refs: &[&str]) -> FxHashSet<String> {
    refs.iter().map(|r| r.to_string()).collect()
}

#[test]
fn scenario_1_chain() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 10.0).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1*2").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=B1+5").unwrap();
    wb.set_cell_formula("Sheet1", "D1", "=C1*2").unwrap();

    let stats = wb.recalculate_all().unwrap();
    assert_eq!(stats.total_formulas, 3);
    assert_eq!(stats.merged_levels, 3);
    assert!(stats.circular_cells.is_empty());

    assert_eq!(wb.get_cell_value("Sheet1", "A1").unwrap(), "10");
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "20");
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "25");
    assert_eq!(wb.get_cell_value("Sheet1", "D1").unwrap(), "50");
}

#[test]
fn scenario_2_incremental_update() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_value("Sheet1", "A1", 10.0).unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1*2").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=B1+5").unwrap();
    wb.set_cell_formula("Sheet1", "D1", "=C1*2").unwrap();
    wb.recalculate_all().unwrap();

    let calls = capture_calls(&wb);
    wb.set_cell_value("Sheet1", "A1", 100.0).unwrap();
    wb.recalculate_affected(&changed(&["Sheet1!A1"])).unwrap();

    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "200");
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "205");
    assert_eq!(wb.get_cell_value("Sheet1", "D1").unwrap(), "410");

    let mut calls = calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            ("Sheet1".into(), "B1".into(), "20".into(), "200".into()),
            ("Sheet1".into(), "C1".into(), "25".into(), "205".into()),
            ("Sheet1".into(), "D1".into(), "50".into(), "410".into()),
        ]
    );
}

#[test]
fn scenario_3_bulk_sumifs() {
    let wb = Workbook::new();
    wb.add_sheet("data").unwrap();
    wb.add_sheet("summary").unwrap();

    // 200 rows over 50 keys; expected sums tracked alongside.
    let mut expected = vec![0.0f64; 51];
    for row in 1..=200u32 {
        let key = (row - 1) % 50 + 1;
        let value = (row * 3) as f64;
        wb.set_cell_value("data", &format!("A{row}"), format!("K{key}"))
            .unwrap();
        wb.set_cell_value("data", &format!("H{row}"), value).unwrap();
        expected[key as usize] += value;
    }
    for row in 1..=50u32 {
        wb.set_cell_formula(
            "summary",
            &format!("B{row}"),
            "=SUMIFS(data!$H:$H, data!$A:$A, \"K\"&ROW())",
        )
        .unwrap();
    }

    let stats = wb.recalculate_all().unwrap();
    assert_eq!(stats.total_formulas, 50);
    // The whole group is resolved by the bulk optimiser, one data scan.
    assert_eq!(stats.bulk_computed, 50);

    for row in 1..=50u32 {
        let got = wb.get_cell_value("summary", &format!("B{row}")).unwrap();
        assert_eq!(
            got.parse::<f64>().unwrap(),
            expected[row as usize],
            "summary!B{row}"
        );
    }
}

#[test]
fn scenario_4_whole_column_index_match_incremental() {
    let wb = Workbook::new();
    wb.add_sheet("source").unwrap();
    wb.add_sheet("target").unwrap();

    for row in 1..=20u32 {
        wb.set_cell_value("source", &format!("A{row}"), format!("X{row}"))
            .unwrap();
        wb.set_cell_value("source", &format!("G{row}"), (row * 10) as f64)
            .unwrap();
    }
    for row in 1..=20u32 {
        wb.set_cell_value("target", &format!("A{row}"), format!("X{row}"))
            .unwrap();
        wb.set_cell_formula(
            "target",
            &format!("I{row}"),
            &format!("=IFERROR(INDEX(source!$G:$G, MATCH(A{row}, source!$A:$A, 0)), \"\")"),
        )
        .unwrap();
    }

    wb.recalculate_all().unwrap();
    assert_eq!(wb.get_cell_value("target", "I2").unwrap(), "20");
    assert_eq!(wb.get_cell_value("target", "I5").unwrap(), "50");

    // Rename key X2: the I-cells depend on the whole source!A column, so
    // the incremental driver must pick up every lookup.
    wb.set_cell_value("source", "A2", "Y2").unwrap();
    wb.recalculate_affected(&changed(&["source!A2"])).unwrap();

    // target!A2 still looks for X2, which no longer exists.
    assert_eq!(wb.get_cell_value("target", "I2").unwrap(), "");
    // Unrelated keys are unchanged.
    assert_eq!(wb.get_cell_value("target", "I5").unwrap(), "50");
}

#[test]
fn scenario_5_circular_pair() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_formula("Sheet1", "A1", "=B1+1").unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=A1+1").unwrap();

    let stats = wb.recalculate_all().unwrap();
    let mut circular = stats.circular_cells.clone();
    circular.sort();
    assert_eq!(circular, vec!["Sheet1!A1", "Sheet1!B1"]);
    assert_eq!(wb.get_cell_value("Sheet1", "A1").unwrap(), "#VALUE!");
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "#VALUE!");
}

#[test]
fn circular_triple_reported_and_cached_as_error() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_formula("Sheet1", "A1", "=B1").unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=C1").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=A1").unwrap();
    // An innocent bystander still computes.
    wb.set_cell_value("Sheet1", "E1", 5.0).unwrap();
    wb.set_cell_formula("Sheet1", "F1", "=E1*2").unwrap();

    let stats = wb.recalculate_all().unwrap();
    let mut circular = stats.circular_cells.clone();
    circular.sort();
    assert_eq!(circular, vec!["Sheet1!A1", "Sheet1!B1", "Sheet1!C1"]);
    for cell in ["A1", "B1", "C1"] {
        assert_eq!(wb.get_cell_value("Sheet1", cell).unwrap(), "#VALUE!");
    }
    assert_eq!(wb.get_cell_value("Sheet1", "F1").unwrap(), "10");
}

#[test]
fn scenario_6_parallel_independence() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    for i in 1..=50u32 {
        wb.set_cell_value("Sheet1", &format!("A{i}"), i as f64).unwrap();
        wb.set_cell_formula("Sheet1", &format!("B{i}"), &format!("=A{i}+1")).unwrap();
    }

    let stats = wb.recalculate_all().unwrap();
    assert_eq!(stats.total_formulas, 50);
    assert_eq!(stats.merged_levels, 1);

    for i in 1..=50u32 {
        assert_eq!(
            wb.get_cell_value("Sheet1", &format!("B{i}")).unwrap(),
            (i + 1).to_string()
        );
    }
}

#[test]
fn embedded_sumifs_keeps_string_semantics() {
    let wb = Workbook::new();
    wb.add_sheet("data").unwrap();
    wb.add_sheet("summary").unwrap();

    for row in 1..=30u32 {
        let key = (row - 1) % 15 + 1;
        wb.set_cell_value("data", &format!("A{row}"), format!("K{key}"))
            .unwrap();
        wb.set_cell_value("data", &format!("H{row}"), row as f64).unwrap();
    }
    // Embedded inside IFERROR: the bulk optimiser computes the inner call,
    // the substitution pass rewrites, the composite still evaluates right.
    // Criteria go through per-row key cells so every formula's text is
    // distinct (the sub-expression cache is text-keyed).
    for row in 1..=15u32 {
        wb.set_cell_value("summary", &format!("A{row}"), format!("K{row}"))
            .unwrap();
        wb.set_cell_formula(
            "summary",
            &format!("B{row}"),
            &format!("=IFERROR(SUMIFS(data!$H:$H, data!$A:$A, A{row}), \"\")"),
        )
        .unwrap();
    }

    let stats = wb.recalculate_all().unwrap();
    // Embedded patterns fill the sub-expression cache, not cells.
    assert_eq!(stats.bulk_computed, 0);
    // K1 matches rows 1 and 16: 1 + 16 = 17.
    assert_eq!(wb.get_cell_value("summary", "B1").unwrap(), "17");
    // K15 matches rows 15 and 30: 45.
    assert_eq!(wb.get_cell_value("summary", "B15").unwrap(), "45");
}

#[test]
fn empty_column_boundary_values() {
    let wb = Workbook::new();
    wb.add_sheet("Sheet1").unwrap();
    wb.set_cell_formula("Sheet1", "A1", "=SUM(Q:Q)").unwrap();
    wb.set_cell_formula("Sheet1", "B1", "=COUNT(Q:Q)").unwrap();
    wb.set_cell_formula("Sheet1", "C1", "=AVERAGE(Q:Q)").unwrap();

    wb.recalculate_all().unwrap();
    assert_eq!(wb.get_cell_value("Sheet1", "A1").unwrap(), "0");
    assert_eq!(wb.get_cell_value("Sheet1", "B1").unwrap(), "0");
    assert_eq!(wb.get_cell_value("Sheet1", "C1").unwrap(), "#DIV/0!");
}
