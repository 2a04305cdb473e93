//! Shared test store: a minimal in-memory `CellStore`.

use std::sync::RwLock;

use rustc_hash::FxHashMap;

use cellforge_common::{CellType, CellValue, row_of_cell};
use cellforge_engine::CellStore;

#[derive(Default)]
pub struct MemStore {
    order: RwLock<Vec<String>>,
    values: RwLock<FxHashMap<String, CellValue>>,
    formulas: RwLock<FxHashMap<String, String>>,
    cached: RwLock<FxHashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet(&self, name: &str) -> &Self {
        let mut order = self.order.write().unwrap();
        if !order.iter().any(|s| s == name) {
            order.push(name.to_string());
        }
        drop(order);
        self
    }

    pub fn value(&self, sheet: &str, cell: &str, value: impl Into<CellValue>) -> &Self {
        self.sheet(sheet);
        self.values
            .write()
            .unwrap()
            .insert(format!("{sheet}!{cell}"), value.into());
        self
    }

    pub fn formula(&self, sheet: &str, cell: &str, text: &str) -> &Self {
        self.sheet(sheet);
        self.formulas
            .write()
            .unwrap()
            .insert(format!("{sheet}!{cell}"), text.to_string());
        self
    }

    pub fn cached_value(&self, sheet: &str, cell: &str) -> Option<String> {
        self.cached
            .read()
            .unwrap()
            .get(&format!("{sheet}!{cell}"))
            .cloned()
    }
}

impl CellStore for MemStore {
    fn sheet_names(&self) -> Vec<String> {
        self.order.read().unwrap().clone()
    }

    fn iter_formulas(&self, sheet: &str) -> Vec<(String, String)> {
        let prefix = format!("{sheet}!");
        self.formulas
            .read()
            .unwrap()
            .iter()
            .filter_map(|(full, f)| {
                full.strip_prefix(&prefix).map(|c| (c.to_string(), f.clone()))
            })
            .collect()
    }

    fn iter_values(&self, sheet: &str) -> Vec<(String, CellValue)> {
        let prefix = format!("{sheet}!");
        let formulas = self.formulas.read().unwrap();
        self.values
            .read()
            .unwrap()
            .iter()
            .filter(|(full, _)| !formulas.contains_key(*full))
            .filter_map(|(full, v)| {
                full.strip_prefix(&prefix).map(|c| (c.to_string(), v.clone()))
            })
            .collect()
    }

    fn get_raw(&self, sheet: &str, cell: &str) -> Option<CellValue> {
        let full = format!("{sheet}!{cell}");
        if self.formulas.read().unwrap().contains_key(&full) {
            return self
                .cached
                .read()
                .unwrap()
                .get(&full)
                .map(|s| CellValue::from_cell_text(s));
        }
        self.values.read().unwrap().get(&full).cloned()
    }

    fn get_cached(&self, sheet: &str, cell: &str) -> Option<String> {
        self.cached
            .read()
            .unwrap()
            .get(&format!("{sheet}!{cell}"))
            .cloned()
    }

    fn set_cached(&self, sheet: &str, cell: &str, value: &str, _cell_type: CellType) {
        self.cached
            .write()
            .unwrap()
            .insert(format!("{sheet}!{cell}"), value.to_string());
    }

    fn set_value(&self, sheet: &str, cell: &str, value: CellValue) {
        let full = format!("{sheet}!{cell}");
        self.formulas.write().unwrap().remove(&full);
        self.cached.write().unwrap().remove(&full);
        self.values.write().unwrap().insert(full, value);
    }

    fn set_formula(&self, sheet: &str, cell: &str, formula: &str) {
        let full = format!("{sheet}!{cell}");
        self.values.write().unwrap().remove(&full);
        self.formulas.write().unwrap().insert(full, formula.to_string());
    }

    fn max_row(&self, sheet: &str) -> u32 {
        let prefix = format!("{sheet}!");
        let values = self.values.read().unwrap();
        let formulas = self.formulas.read().unwrap();
        values
            .keys()
            .chain(formulas.keys())
            .filter_map(|full| full.strip_prefix(&prefix))
            .filter_map(row_of_cell)
            .max()
            .unwrap_or(0)
    }
}
