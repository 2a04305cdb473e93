//! The worksheet snapshot: an in-memory typed view of every cell's current
//! value, authoritative for the duration of one recalculation.
//!
//! Pre-loaded from non-formula cells, then updated in place as formula
//! results are produced, so later formulas read the just-computed value
//! instead of the persisted one. Sheets are sharded: each sheet's map sits
//! behind its own `RwLock` inside a concurrent outer map, so workers
//! writing to different sheets never contend.

use std::sync::RwLock;

use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use cellforge_common::{CellValue, parse_cell, qualify};

use crate::store::CellStore;

#[derive(Default)]
pub struct Snapshot {
    sheets: DashMap<String, RwLock<FxHashMap<String, CellValue>>>,
    /// Highest used row per sheet, kept current as formula results land.
    max_rows: DashMap<String, u32>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load every sheet's non-formula cells from the store.
    pub fn preload(&self, store: &dyn CellStore) {
        let sheets = store.sheet_names();
        let loaded: Vec<(String, FxHashMap<String, CellValue>, u32)> = sheets
            .par_iter()
            .map(|sheet| {
                let mut map = FxHashMap::default();
                for (cell, value) in store.iter_values(sheet) {
                    map.insert(cell, value);
                }
                (sheet.clone(), map, store.max_row(sheet))
            })
            .collect();
        for (sheet, map, max_row) in loaded {
            self.max_rows.insert(sheet.clone(), max_row);
            self.sheets.insert(sheet, RwLock::new(map));
        }
    }

    /// Read one cell. Missing cells read as `Empty`.
    pub fn get(&self, sheet: &str, cell: &str) -> CellValue {
        self.get_opt(sheet, cell).unwrap_or(CellValue::Empty)
    }

    /// Read one cell, distinguishing "not loaded" from a loaded `Empty`.
    pub fn get_opt(&self, sheet: &str, cell: &str) -> Option<CellValue> {
        self.sheets.get(sheet)?.read().unwrap().get(cell).cloned()
    }

    /// Store a computed value, extending the sheet's used-row bound when
    /// the cell lies below it.
    pub fn set(&self, sheet: &str, cell: &str, value: CellValue) {
        let shard = self
            .sheets
            .entry(sheet.to_string())
            .or_insert_with(|| RwLock::new(FxHashMap::default()));
        shard.write().unwrap().insert(cell.to_string(), value);
        drop(shard);
        if let Ok((_, row)) = parse_cell(cell) {
            let mut entry = self.max_rows.entry(sheet.to_string()).or_insert(0);
            if *entry < row {
                *entry = row;
            }
        }
    }

    /// Highest used row of a sheet (0 when unknown or empty).
    pub fn max_row(&self, sheet: &str) -> u32 {
        self.max_rows.get(sheet).map(|r| *r).unwrap_or(0)
    }

    pub fn has_sheet(&self, sheet: &str) -> bool {
        self.sheets.contains_key(sheet)
    }

    /// Materialise a bounded rectangle as a row-major matrix.
    pub fn materialise(
        &self,
        sheet: &str,
        start_col: u32,
        start_row: u32,
        end_col: u32,
        end_row: u32,
    ) -> Vec<Vec<CellValue>> {
        let mut out = Vec::with_capacity((end_row - start_row + 1) as usize);
        match self.sheets.get(sheet) {
            Some(shard) => {
                let guard = shard.read().unwrap();
                for row in start_row..=end_row {
                    let mut cells = Vec::with_capacity((end_col - start_col + 1) as usize);
                    for col in start_col..=end_col {
                        let cell = format!("{}{row}", cellforge_common::index_to_col(col));
                        cells.push(guard.get(&cell).cloned().unwrap_or(CellValue::Empty));
                    }
                    out.push(cells);
                }
            }
            None => {
                for _ in start_row..=end_row {
                    out.push(vec![CellValue::Empty; (end_col - start_col + 1) as usize]);
                }
            }
        }
        out
    }

    /// One column as a rows-1..=max_row vector. Empty sheet gives an empty
    /// vector, which is what whole-column aggregates over an empty column
    /// want (SUM→0, COUNT→0, AVERAGE→#DIV/0!).
    pub fn column(&self, sheet: &str, col: u32) -> Vec<CellValue> {
        let max_row = self.max_row(sheet);
        if max_row == 0 {
            return Vec::new();
        }
        self.materialise(sheet, col, 1, col, max_row)
            .into_iter()
            .map(|mut row| row.pop().unwrap_or(CellValue::Empty))
            .collect()
    }

    /// Full references (`Sheet!A1`) of every loaded cell of a sheet.
    /// Materialises the key set first; callers may mutate afterwards.
    pub fn cell_refs(&self, sheet: &str) -> Vec<String> {
        match self.sheets.get(sheet) {
            Some(shard) => shard
                .read()
                .unwrap()
                .keys()
                .map(|cell| qualify(sheet, cell))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let snap = Snapshot::new();
        snap.set("Sheet1", "A1", CellValue::number(10.0));
        assert_eq!(snap.get("Sheet1", "A1"), CellValue::number(10.0));
        assert_eq!(snap.get("Sheet1", "B9"), CellValue::Empty);
        assert_eq!(snap.max_row("Sheet1"), 1);
    }

    #[test]
    fn max_row_tracks_writes() {
        let snap = Snapshot::new();
        snap.set("s", "A5", CellValue::number(1.0));
        snap.set("s", "A3", CellValue::number(1.0));
        assert_eq!(snap.max_row("s"), 5);
    }

    #[test]
    fn materialise_rectangle() {
        let snap = Snapshot::new();
        snap.set("s", "A1", CellValue::number(1.0));
        snap.set("s", "B2", CellValue::text("x"));
        let m = snap.materialise("s", 1, 1, 2, 2);
        assert_eq!(m[0][0], CellValue::number(1.0));
        assert_eq!(m[0][1], CellValue::Empty);
        assert_eq!(m[1][1], CellValue::text("x"));
    }

    #[test]
    fn empty_column_has_no_rows() {
        let snap = Snapshot::new();
        assert!(snap.column("nosheet", 1).is_empty());
    }
}
