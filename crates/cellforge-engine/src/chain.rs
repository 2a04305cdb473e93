//! The calculation chain: an ordered list of formula cells the workbook
//! may persist. The engine consumes it strictly as a traversal-order hint
//! — the dependency graph built from fresh edges is always the ordering
//! authority — and can rebuild it from scratch by scanning all sheets.

use serde::{Deserialize, Serialize};

use cellforge_common::qualify;

use crate::store::CellStore;

/// One chain record. `sheet_index` is 1-based; `0` means "same sheet as
/// the previous record", the compact form workbook files use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub cell_ref: String,
    pub sheet_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcChain {
    pub entries: Vec<ChainEntry>,
}

impl CalcChain {
    /// Rebuild by scanning every sheet's formulas in workbook order.
    pub fn rebuild(store: &dyn CellStore) -> Self {
        let mut entries = Vec::new();
        let mut last_index = 0u32;
        for (i, sheet) in store.sheet_names().iter().enumerate() {
            let index = (i + 1) as u32;
            for (cell, _) in store.iter_formulas(sheet) {
                entries.push(ChainEntry {
                    cell_ref: cell,
                    sheet_index: if index == last_index { 0 } else { index },
                });
                last_index = index;
            }
        }
        CalcChain { entries }
    }

    /// Expand to full references (`Sheet!A1`) for use as a graph-build
    /// traversal hint. Records with an out-of-range sheet index are
    /// skipped — the chain is a hint, not a contract.
    pub fn full_refs(&self, sheet_names: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut current = 0u32;
        for entry in &self.entries {
            if entry.sheet_index != 0 {
                current = entry.sheet_index;
            }
            let Some(sheet) = current
                .checked_sub(1)
                .and_then(|i| sheet_names.get(i as usize))
            else {
                continue;
            };
            out.push(qualify(sheet, &entry.cell_ref));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
