//! Engine configuration, per-call options, and the recalculation report.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Configuration for the recalculation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on worker threads per level (actual count is
    /// `min(available_parallelism, level_size, max_workers)`).
    pub max_workers: usize,

    /// Minimum number of same-pattern formulas before the bulk optimiser
    /// takes a group instead of letting the scheduler evaluate them one
    /// by one.
    pub bulk_threshold: usize,

    /// Capacity of the materialised-range LRU cache.
    pub range_lru_capacity: usize,

    /// Bounded ranges up to this many cells expand into individual cell
    /// dependencies; larger ones become whole-column dependencies.
    pub range_expansion_limit: usize,

    /// Upper bound for resolver recursion when a formula pulls in other
    /// uncomputed formulas outside a scheduled recalculation.
    pub max_calc_iterations: u32,

    /// Per-level scheduler timeout floor; the effective timeout is
    /// `max(floor, per_formula × level_size)`.
    pub level_timeout_floor: Duration,
    pub level_timeout_per_formula: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            bulk_threshold: 10,
            range_lru_capacity: 50,
            range_expansion_limit: 64,
            max_calc_iterations: 100,
            level_timeout_floor: Duration::from_secs(5),
            level_timeout_per_formula: Duration::from_millis(10),
        }
    }
}

impl EngineConfig {
    #[inline]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    #[inline]
    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.bulk_threshold = threshold;
        self
    }

    #[inline]
    pub fn with_range_lru_capacity(mut self, capacity: usize) -> Self {
        self.range_lru_capacity = capacity.max(1);
        self
    }

    #[inline]
    pub fn with_range_expansion_limit(mut self, limit: usize) -> Self {
        self.range_expansion_limit = limit;
        self
    }

    #[inline]
    pub fn with_max_calc_iterations(mut self, iterations: u32) -> Self {
        self.max_calc_iterations = iterations;
        self
    }
}

/// Options for a single `calc_cell_value` / `calc_formula_value` call.
#[derive(Debug, Clone)]
pub struct CalcOptions {
    /// When true, return the unformatted value string; when false, apply
    /// the cell's number format.
    pub raw_cell_value: bool,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self {
            raw_cell_value: false,
        }
    }
}

/// Report of one recalculation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecalcStats {
    /// Formula cells known to the dependency graph for this run.
    pub total_formulas: usize,
    /// Level count before merging.
    pub levels: usize,
    /// Level count after merging.
    pub merged_levels: usize,
    /// Formulas actually computed (equals `total_formulas` on a full run,
    /// the affected subset on an incremental one).
    pub computed: usize,
    /// Formulas resolved by the bulk optimiser.
    pub bulk_computed: usize,
    /// Cells participating in circular references, cached as errors.
    pub circular_cells: Vec<String>,
    /// Wall-clock duration of the run.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// Engine-level failures. Cell-local error codes are values, not errors;
/// these are the conditions that surface to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scheduler timed out with {} formulas unfinished", unfinished.len())]
    Timeout { unfinished: Vec<String> },

    #[error("unknown sheet '{0}'")]
    UnknownSheet(String),

    #[error("malformed reference '{0}'")]
    BadReference(String),

    #[error("formula parse failed: {0}")]
    Parse(String),
}
