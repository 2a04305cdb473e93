//! The in-memory cell store and the `Workbook` facade.
//!
//! `SheetStore` owns the cells and implements the engine's `CellStore`
//! contract with its own synchronisation: sheet order behind one lock,
//! each sheet's cell map behind its own, so engine workers writing cached
//! values to different sheets never contend. Iteration APIs materialise
//! key sets before returning — callers can mutate freely afterwards,
//! never during a walk.

use std::sync::{Arc, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use cellforge_common::{CellType, CellValue, ErrorKind, normalize_cell, qualify, row_of_cell};
use cellforge_engine::{
    CalcChain, CalcOptions, CellCalculatedHook, CellStore, Engine, EngineConfig, EngineError,
    FormulaUpdate, RecalcStats, ValueUpdate,
};

use crate::format;

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown sheet '{0}'")]
    UnknownSheet(String),

    #[error("sheet '{0}' already exists")]
    DuplicateSheet(String),

    #[error("malformed cell reference '{0}'")]
    BadReference(String),
}

/// One stored cell.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    /// Literal value for data cells.
    pub value: Option<CellValue>,
    /// Formula text (with its leading `=`) for formula cells.
    pub formula: Option<String>,
    /// Cached computed value string, written by the engine.
    pub cached: Option<String>,
    /// Type tag of the cached value.
    pub cell_type: CellType,
    /// Number-format code applied when rendering.
    pub numfmt: Option<String>,
}

impl Cell {
    /// The typed value the engine reads: data cells give their literal,
    /// formula cells their previously cached value (typed back through
    /// the stored type tag).
    fn typed_value(&self) -> Option<CellValue> {
        if self.formula.is_some() {
            let cached = self.cached.as_deref()?;
            return Some(match self.cell_type {
                CellType::Number => cached
                    .parse::<f64>()
                    .map(CellValue::number)
                    .unwrap_or_else(|_| CellValue::from_cell_text(cached)),
                CellType::Bool => CellValue::boolean(cached == "TRUE"),
                CellType::Error => ErrorKind::from_code(cached)
                    .map(CellValue::Error)
                    .unwrap_or_else(|| CellValue::Text(cached.to_string())),
                CellType::Text => CellValue::Text(cached.to_string()),
                CellType::Empty => CellValue::from_cell_text(cached),
            });
        }
        self.value.clone()
    }
}

type CellMap = FxHashMap<String, Cell>;

/// The workbook's cell storage.
#[derive(Default)]
pub struct SheetStore {
    order: RwLock<Vec<String>>,
    sheets: RwLock<FxHashMap<String, Arc<RwLock<CellMap>>>>,
}

impl SheetStore {
    fn sheet(&self, name: &str) -> Option<Arc<RwLock<CellMap>>> {
        self.sheets.read().unwrap().get(name).cloned()
    }

    fn add_sheet(&self, name: &str) -> bool {
        let mut sheets = self.sheets.write().unwrap();
        if sheets.contains_key(name) {
            return false;
        }
        sheets.insert(name.to_string(), Arc::new(RwLock::new(CellMap::default())));
        self.order.write().unwrap().push(name.to_string());
        true
    }

    fn with_cell_mut<R>(&self, sheet: &str, cell: &str, f: impl FnOnce(&mut Cell) -> R) -> Option<R> {
        let shard = self.sheet(sheet)?;
        let mut guard = shard.write().unwrap();
        Some(f(guard.entry(cell.to_string()).or_default()))
    }
}

impl CellStore for SheetStore {
    fn sheet_names(&self) -> Vec<String> {
        self.order.read().unwrap().clone()
    }

    fn iter_formulas(&self, sheet: &str) -> Vec<(String, String)> {
        let Some(shard) = self.sheet(sheet) else {
            return Vec::new();
        };
        let guard = shard.read().unwrap();
        guard
            .iter()
            .filter_map(|(cell, c)| c.formula.as_ref().map(|f| (cell.clone(), f.clone())))
            .collect()
    }

    fn iter_values(&self, sheet: &str) -> Vec<(String, CellValue)> {
        let Some(shard) = self.sheet(sheet) else {
            return Vec::new();
        };
        let guard = shard.read().unwrap();
        guard
            .iter()
            .filter(|(_, c)| c.formula.is_none())
            .filter_map(|(cell, c)| c.value.clone().map(|v| (cell.clone(), v)))
            .collect()
    }

    fn get_raw(&self, sheet: &str, cell: &str) -> Option<CellValue> {
        let shard = self.sheet(sheet)?;
        let guard = shard.read().unwrap();
        guard.get(cell).and_then(|c| c.typed_value())
    }

    fn get_cached(&self, sheet: &str, cell: &str) -> Option<String> {
        let shard = self.sheet(sheet)?;
        let guard = shard.read().unwrap();
        guard.get(cell).and_then(|c| c.cached.clone())
    }

    fn set_cached(&self, sheet: &str, cell: &str, value: &str, cell_type: CellType) {
        self.with_cell_mut(sheet, cell, |c| {
            c.cached = Some(value.to_string());
            c.cell_type = cell_type;
        });
    }

    fn set_value(&self, sheet: &str, cell: &str, value: CellValue) {
        self.with_cell_mut(sheet, cell, |c| {
            c.cell_type = value.cell_type();
            c.value = Some(value);
            c.formula = None;
            c.cached = None;
        });
    }

    fn set_formula(&self, sheet: &str, cell: &str, formula: &str) {
        self.with_cell_mut(sheet, cell, |c| {
            c.formula = Some(formula.to_string());
            c.value = None;
        });
    }

    fn max_row(&self, sheet: &str) -> u32 {
        let Some(shard) = self.sheet(sheet) else {
            return 0;
        };
        let guard = shard.read().unwrap();
        guard
            .keys()
            .filter_map(|cell| row_of_cell(cell))
            .max()
            .unwrap_or(0)
    }

    fn format_value(&self, sheet: &str, cell: &str, value: &CellValue) -> String {
        let numfmt = self.sheet(sheet).and_then(|shard| {
            shard
                .read()
                .unwrap()
                .get(cell)
                .and_then(|c| c.numfmt.clone())
        });
        format::format_value(value, numfmt.as_deref())
    }
}

/// The public workbook: storage plus the calculation surface.
///
/// `calc_lock` is the coarse workbook-level gate: a recalculation holds
/// it exclusively, cell mutations hold it shared, so no user operation
/// overlaps a running recalculation.
pub struct Workbook {
    store: Arc<SheetStore>,
    engine: Engine<SheetStore>,
    calc_lock: RwLock<()>,
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbook {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(SheetStore::default());
        let engine = Engine::new(store.clone(), config);
        Self {
            store,
            engine,
            calc_lock: RwLock::new(()),
        }
    }

    pub fn add_sheet(&self, name: &str) -> Result<(), WorkbookError> {
        if self.store.add_sheet(name) {
            Ok(())
        } else {
            Err(WorkbookError::DuplicateSheet(name.to_string()))
        }
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.store.sheet_names()
    }

    fn require_sheet(&self, name: &str) -> Result<(), WorkbookError> {
        if self.store.sheet(name).is_some() {
            Ok(())
        } else {
            Err(WorkbookError::UnknownSheet(name.to_string()))
        }
    }

    /// Set a literal cell value. The cell's cached result variants are
    /// invalidated; dependents recompute on the next recalculation.
    pub fn set_cell_value(
        &self,
        sheet: &str,
        cell: &str,
        value: impl Into<CellValue>,
    ) -> Result<(), WorkbookError> {
        let _gate = self.calc_lock.read().unwrap();
        self.require_sheet(sheet)?;
        let local =
            normalize_cell(cell).map_err(|_| WorkbookError::BadReference(cell.to_string()))?;
        self.store.set_value(sheet, &local, value.into());
        self.engine.invalidate_cell(sheet, &local);
        Ok(())
    }

    pub fn set_cell_formula(
        &self,
        sheet: &str,
        cell: &str,
        formula: &str,
    ) -> Result<(), WorkbookError> {
        let _gate = self.calc_lock.read().unwrap();
        self.require_sheet(sheet)?;
        let local =
            normalize_cell(cell).map_err(|_| WorkbookError::BadReference(cell.to_string()))?;
        self.store.set_formula(sheet, &local, formula);
        self.engine.invalidate_cell(sheet, &local);
        Ok(())
    }

    /// The cell's current rendering: a formula cell's cached value, or a
    /// data cell's formatted literal.
    pub fn get_cell_value(&self, sheet: &str, cell: &str) -> Result<String, WorkbookError> {
        self.require_sheet(sheet)?;
        let local =
            normalize_cell(cell).map_err(|_| WorkbookError::BadReference(cell.to_string()))?;
        if let Some(cached) = self.store.get_cached(sheet, &local) {
            return Ok(cached);
        }
        let value = self.store.get_raw(sheet, &local).unwrap_or(CellValue::Empty);
        Ok(self.store.format_value(sheet, &local, &value))
    }

    pub fn get_cell_formula(&self, sheet: &str, cell: &str) -> Result<Option<String>, WorkbookError> {
        self.require_sheet(sheet)?;
        let local =
            normalize_cell(cell).map_err(|_| WorkbookError::BadReference(cell.to_string()))?;
        let shard = self.store.sheet(sheet).unwrap();
        let guard = shard.read().unwrap();
        Ok(guard.get(&local).and_then(|c| c.formula.clone()))
    }

    pub fn set_number_format(
        &self,
        sheet: &str,
        cell: &str,
        numfmt: &str,
    ) -> Result<(), WorkbookError> {
        self.require_sheet(sheet)?;
        let local =
            normalize_cell(cell).map_err(|_| WorkbookError::BadReference(cell.to_string()))?;
        self.store.with_cell_mut(sheet, &local, |c| {
            c.numfmt = Some(numfmt.to_string());
        });
        Ok(())
    }

    /* ========  structural mutations  ======== */

    /// Insert `count` empty rows above `at` (1-based). Cells shift down;
    /// the engine's result cache is cleared wholesale. Formula text is not
    /// rewritten here — callers follow up with `recalculate_all`.
    pub fn insert_rows(&self, sheet: &str, at: u32, count: u32) -> Result<(), WorkbookError> {
        self.remap_rows(sheet, |row| {
            if row >= at { Some(row + count) } else { Some(row) }
        })
    }

    /// Delete `count` rows starting at `at` (1-based). Deleted cells are
    /// dropped; rows below shift up.
    pub fn delete_rows(&self, sheet: &str, at: u32, count: u32) -> Result<(), WorkbookError> {
        self.remap_rows(sheet, |row| {
            if row >= at && row < at + count {
                None
            } else if row >= at + count {
                Some(row - count)
            } else {
                Some(row)
            }
        })
    }

    fn remap_rows(
        &self,
        sheet: &str,
        remap: impl Fn(u32) -> Option<u32>,
    ) -> Result<(), WorkbookError> {
        let _gate = self.calc_lock.read().unwrap();
        self.require_sheet(sheet)?;
        let shard = self.store.sheet(sheet).unwrap();
        {
            let mut guard = shard.write().unwrap();
            // Materialise the key set first; mutate after.
            let keys: Vec<String> = guard.keys().cloned().collect();
            let mut moved: Vec<(String, Cell)> = Vec::new();
            for key in keys {
                let Some(row) = row_of_cell(&key) else { continue };
                let Some(cell) = guard.remove(&key) else { continue };
                if let Some(new_row) = remap(row) {
                    let letters: String =
                        key.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
                    moved.push((format!("{letters}{new_row}"), cell));
                }
            }
            for (key, cell) in moved {
                guard.insert(key, cell);
            }
        }
        self.engine.invalidate_all_results();
        Ok(())
    }

    /* ========  calculation surface  ======== */

    pub fn recalculate_all(&self) -> Result<RecalcStats, EngineError> {
        let _gate = self.calc_lock.write().unwrap();
        self.engine.recalculate_all()
    }

    pub fn recalculate_affected(
        &self,
        changed: &FxHashSet<String>,
    ) -> Result<RecalcStats, EngineError> {
        let _gate = self.calc_lock.write().unwrap();
        self.engine.recalculate_affected(changed)
    }

    pub fn batch_update_values_and_formulas(
        &self,
        values: &[ValueUpdate],
        formulas: &[FormulaUpdate],
    ) -> Result<RecalcStats, EngineError> {
        let _gate = self.calc_lock.write().unwrap();
        self.engine.batch_update_values_and_formulas(values, formulas)
    }

    pub fn set_on_cell_calculated(&self, hook: Option<CellCalculatedHook>) {
        self.engine.set_on_cell_calculated(hook);
    }

    pub fn calc_cell_value(
        &self,
        sheet: &str,
        cell: &str,
        options: &CalcOptions,
    ) -> Result<String, EngineError> {
        self.engine.calc_cell_value(sheet, cell, options)
    }

    pub fn calc_formula_value(
        &self,
        sheet: &str,
        cell: &str,
        formula: &str,
    ) -> Result<String, EngineError> {
        self.engine.calc_formula_value(sheet, cell, formula)
    }

    pub fn rebuild_calc_chain(&self) {
        self.engine.rebuild_calc_chain();
    }

    pub fn calc_chain(&self) -> CalcChain {
        self.engine.calc_chain()
    }

    /// Persist the calc chain as JSON (the workbook file embeds this).
    pub fn calc_chain_json(&self) -> String {
        serde_json::to_string(&self.engine.calc_chain()).unwrap_or_else(|_| "{}".into())
    }

    pub fn load_calc_chain_json(&self, json: &str) -> Result<(), serde_json::Error> {
        let chain: CalcChain = serde_json::from_str(json)?;
        self.engine.set_calc_chain(chain);
        Ok(())
    }

    /// Full reference (`Sheet!A1`) helper for change-set building.
    pub fn full_ref(sheet: &str, cell: &str) -> String {
        qualify(sheet, cell)
    }
}
