//! The cell-store contract the engine consumes.
//!
//! The workbook owns the cells; the engine only needs a narrow window onto
//! them: enumerate formulas, read raw values, write computed cached values
//! back, and answer a few shape questions (sheet names, used rows). The
//! store handles its own synchronisation; the engine calls these methods
//! from worker threads.

use cellforge_common::{CellType, CellValue};

/// Read/write window onto the workbook's cells.
pub trait CellStore: Send + Sync {
    /// Worksheet names in workbook order.
    fn sheet_names(&self) -> Vec<String>;

    /// Every formula cell of `sheet` as `(cell, formula_text)`, where
    /// `cell` is a normalised A1 address and `formula_text` may carry a
    /// leading `=`.
    fn iter_formulas(&self, sheet: &str) -> Vec<(String, String)>;

    /// Every non-formula cell of `sheet` with its typed value. Used to
    /// pre-load the worksheet snapshot.
    fn iter_values(&self, sheet: &str) -> Vec<(String, CellValue)>;

    /// The typed value of one cell, `None` when the cell does not exist.
    /// For formula cells this is the previously cached value, if any.
    fn get_raw(&self, sheet: &str, cell: &str) -> Option<CellValue>;

    /// The currently cached value string of a formula cell.
    fn get_cached(&self, sheet: &str, cell: &str) -> Option<String>;

    /// Write a computed value into the cell's cached-value slot.
    fn set_cached(&self, sheet: &str, cell: &str, value: &str, cell_type: CellType);

    /// Mutate a cell's stored value (clearing any formula it carried).
    fn set_value(&self, sheet: &str, cell: &str, value: CellValue);

    /// Mutate a cell's formula text, keeping prior cached value until the
    /// next recalculation overwrites it.
    fn set_formula(&self, sheet: &str, cell: &str, formula: &str);

    /// Highest used row of `sheet` (0 when empty). Bounds whole-column
    /// scans and materialisation.
    fn max_row(&self, sheet: &str) -> u32;

    /// Apply the cell's number format to a computed value. The default
    /// renders the value's general form; stores with a style layer
    /// override this.
    fn format_value(&self, _sheet: &str, _cell: &str, value: &CellValue) -> String {
        value.to_string()
    }
}
