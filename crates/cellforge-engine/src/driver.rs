//! The recalculation driver: builds the per-run `CalcState`, walks the
//! level partition applying the bulk optimiser then the DAG scheduler,
//! and owns the public calculation surface (`recalculate_all`,
//! `recalculate_affected`, batch updates, single-cell evaluation).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, info_span, warn};

use cellforge_common::{CellValue, ErrorKind, index_to_col, normalize_cell, parse_cell, qualify};
use cellforge_parse::parse_formula;

use crate::bulk::{self, ColumnCache};
use crate::cache::{RangeLru, ResultCache, SubExprCache};
use crate::chain::CalcChain;
use crate::config::{CalcOptions, EngineConfig, EngineError, RecalcStats};
use crate::graph::DependencyGraph;
use crate::interp::{EvalContext, Interpreter, Resolver};
use crate::scheduler::{self, LevelRun};
use crate::snapshot::Snapshot;
use crate::store::CellStore;
use crate::subst::{has_optimisable_subexpr, substitute};

/// Change notification: `(sheet, cell, old_value, new_value)`. Fires from
/// worker threads; treat it as concurrent.
pub type CellCalculatedHook = Arc<dyn Fn(&str, &str, &str, &str) + Send + Sync>;

/// A pending plain-value mutation for `batch_update_values_and_formulas`.
#[derive(Debug, Clone)]
pub struct ValueUpdate {
    pub sheet: String,
    pub cell: String,
    pub value: CellValue,
}

/// A pending formula mutation.
#[derive(Debug, Clone)]
pub struct FormulaUpdate {
    pub sheet: String,
    pub cell: String,
    pub formula: String,
}

enum RunScope {
    Full,
    Affected(FxHashSet<String>),
}

/// Per-run state, created at the start of a recalculation and dropped at
/// its end. The result cache is deliberately *not* here: it outlives runs.
struct CalcState {
    graph: DependencyGraph,
    snapshot: Snapshot,
    subexpr: SubExprCache,
    ranges: RangeLru,
    columns: ColumnCache,
    /// Set once the build pass has parsed every formula; the parallel
    /// phases only read after this flips, so workers never mutate parse
    /// state concurrently.
    formulas_checked: bool,
}

/// The recalculation engine. Generic over the cell store it drives.
pub struct Engine<S: CellStore> {
    store: Arc<S>,
    pub config: EngineConfig,
    results: ResultCache,
    hook: RwLock<Option<CellCalculatedHook>>,
    chain: Mutex<CalcChain>,
}

impl<S: CellStore> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            results: ResultCache::new(),
            hook: RwLock::new(None),
            chain: Mutex::new(CalcChain::default()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Install (or clear) the change callback.
    pub fn set_on_cell_calculated(&self, hook: Option<CellCalculatedHook>) {
        *self.hook.write().unwrap() = hook;
    }

    /// Full recalculation of every formula in the workbook.
    pub fn recalculate_all(&self) -> Result<RecalcStats, EngineError> {
        self.run(RunScope::Full, None)
    }

    /// Full recalculation bounded by a wall-clock deadline.
    pub fn recalculate_all_with_deadline(
        &self,
        deadline: Instant,
    ) -> Result<RecalcStats, EngineError> {
        self.run(RunScope::Full, Some(deadline))
    }

    /// Recompute only the transitive dependents of `changed` cells.
    pub fn recalculate_affected(
        &self,
        changed: &FxHashSet<String>,
    ) -> Result<RecalcStats, EngineError> {
        if changed.is_empty() {
            return Ok(RecalcStats::default());
        }
        self.run(RunScope::Affected(changed.clone()), None)
    }

    /// Apply value and formula mutations through the cell store, then
    /// incrementally recompute everything they touch.
    pub fn batch_update_values_and_formulas(
        &self,
        values: &[ValueUpdate],
        formulas: &[FormulaUpdate],
    ) -> Result<RecalcStats, EngineError> {
        let mut changed: FxHashSet<String> = FxHashSet::default();
        for update in values {
            let local = normalize_cell(&update.cell)
                .map_err(|_| EngineError::BadReference(update.cell.clone()))?;
            self.store.set_value(&update.sheet, &local, update.value.clone());
            self.results.invalidate_cell(&update.sheet, &local);
            changed.insert(qualify(&update.sheet, &local));
        }
        for update in formulas {
            let local = normalize_cell(&update.cell)
                .map_err(|_| EngineError::BadReference(update.cell.clone()))?;
            self.store.set_formula(&update.sheet, &local, &update.formula);
            self.results.invalidate_cell(&update.sheet, &local);
            changed.insert(qualify(&update.sheet, &local));
        }
        // The dependency graph is rebuilt inside the run — mandatory here,
        // formula edges just changed.
        self.recalculate_affected(&changed)
    }

    /// Drop every cached result (structural mutations: row/column
    /// insert/delete). Persisted per-cell cached values are left in place;
    /// callers refresh formatted output with `recalculate_all`.
    pub fn invalidate_all_results(&self) {
        self.results.clear();
    }

    /// Drop the cached result variants of one mutated cell.
    pub fn invalidate_cell(&self, sheet: &str, cell: &str) {
        self.results.invalidate_cell(sheet, cell);
    }

    /// Rebuild the persisted calculation chain by rescanning all sheets.
    pub fn rebuild_calc_chain(&self) {
        let chain = CalcChain::rebuild(self.store.as_ref());
        *self.chain.lock().unwrap() = chain;
    }

    /// The current chain (for workbook persistence).
    pub fn calc_chain(&self) -> CalcChain {
        self.chain.lock().unwrap().clone()
    }

    /// Replace the chain with one loaded from a workbook file. Consumed as
    /// a traversal hint only.
    pub fn set_calc_chain(&self, chain: CalcChain) {
        *self.chain.lock().unwrap() = chain;
    }

    /* ===================  single-cell surface  =================== */

    /// Evaluate one cell now, consulting and updating the result cache.
    pub fn calc_cell_value(
        &self,
        sheet: &str,
        cell: &str,
        options: &CalcOptions,
    ) -> Result<String, EngineError> {
        if !self.store.sheet_names().iter().any(|s| s == sheet) {
            return Err(EngineError::UnknownSheet(sheet.to_string()));
        }
        let local =
            normalize_cell(cell).map_err(|_| EngineError::BadReference(cell.to_string()))?;

        let resolver = RecursiveResolver::new(self);
        let full = qualify(sheet, &local);
        let Some(formula) = resolver.formulas.get(&full).cloned() else {
            // Not a formula cell: render the stored value directly.
            let value = self.store.get_raw(sheet, &local).unwrap_or(CellValue::Empty);
            return Ok(self.render(sheet, &local, &value, options));
        };

        if let Some(cached) = self.results.get(sheet, &local, options.raw_cell_value) {
            return Ok(cached);
        }

        let (col, row) = parse_cell(&local)
            .map_err(|_| EngineError::BadReference(cell.to_string()))?;
        let value = resolver.evaluate_formula(&formula, sheet, col, row);
        let formatted = self.store.format_value(sheet, &local, &value);
        self.results
            .store(sheet, &local, &formatted, Some(&value.to_string()));
        Ok(if options.raw_cell_value {
            value.to_string()
        } else {
            formatted
        })
    }

    /// Evaluate an ad-hoc formula in a cell's context without persisting
    /// it — the cell's stored formula and cached value stay untouched.
    pub fn calc_formula_value(
        &self,
        sheet: &str,
        cell: &str,
        formula_text: &str,
    ) -> Result<String, EngineError> {
        if !self.store.sheet_names().iter().any(|s| s == sheet) {
            return Err(EngineError::UnknownSheet(sheet.to_string()));
        }
        let local =
            normalize_cell(cell).map_err(|_| EngineError::BadReference(cell.to_string()))?;
        let (col, row) =
            parse_cell(&local).map_err(|_| EngineError::BadReference(cell.to_string()))?;
        let resolver = RecursiveResolver::new(self);
        let value = resolver.evaluate_formula(formula_text, sheet, col, row);
        Ok(value.to_string())
    }

    fn render(&self, sheet: &str, cell: &str, value: &CellValue, options: &CalcOptions) -> String {
        if options.raw_cell_value {
            value.to_string()
        } else {
            self.store.format_value(sheet, cell, value)
        }
    }

    /* ===================  the run  =================== */

    fn run(
        &self,
        scope: RunScope,
        deadline: Option<Instant>,
    ) -> Result<RecalcStats, EngineError> {
        let _span = info_span!("recalculate").entered();
        let started = Instant::now();

        // Per-run caches start clean; the result cache persists.
        let mut state = CalcState {
            graph: DependencyGraph::default(),
            snapshot: Snapshot::new(),
            subexpr: SubExprCache::new(),
            ranges: RangeLru::new(self.config.range_lru_capacity),
            columns: ColumnCache::new(),
            formulas_checked: false,
        };

        let hint = {
            let chain = self.chain.lock().unwrap();
            if chain.is_empty() {
                Vec::new()
            } else {
                chain.full_refs(&self.store.sheet_names())
            }
        };
        state.graph = DependencyGraph::build(self.store.as_ref(), &self.config, &hint);
        state.graph.assign_levels();
        // Build parsed every formula single-threaded; parallel phases may
        // now read without mutating.
        state.formulas_checked = true;

        let scope_set = match &scope {
            RunScope::Full => None,
            RunScope::Affected(changed) => {
                let reverse = state.graph.reverse_index();
                let mut affected = state.graph.affected_by(&reverse, changed);
                // A changed cell that is itself a formula gets recomputed
                // too (batch formula updates land here).
                for cell in changed {
                    if state.graph.nodes.contains_key(cell) {
                        affected.insert(cell.clone());
                    }
                }
                if affected.is_empty() {
                    return Ok(RecalcStats {
                        duration: started.elapsed(),
                        ..RecalcStats::default()
                    });
                }
                for full in &affected {
                    if let Some((sheet, cell)) = full.split_once('!') {
                        self.results.invalidate_cell(sheet, cell);
                    }
                }
                Some(affected)
            }
        };

        state.snapshot.preload(self.store.as_ref());
        if let Some(affected) = &scope_set {
            // Unaffected formulas keep their previous cached values; make
            // them visible to the formulas being recomputed.
            for full in state.graph.nodes.keys() {
                if affected.contains(full) {
                    continue;
                }
                if let Some((sheet, cell)) = full.split_once('!')
                    && let Some(value) = self.store.get_raw(sheet, cell)
                {
                    state.snapshot.set(sheet, cell, value);
                }
            }
        }

        let mut stats = RecalcStats {
            total_formulas: state.graph.nodes.len(),
            levels: state.graph.raw_level_count,
            merged_levels: state.graph.levels.len(),
            ..RecalcStats::default()
        };

        let in_scope = |cell: &str| -> bool {
            match &scope_set {
                None => true,
                Some(set) => set.contains(cell),
            }
        };

        // Circular cells never run through the scheduler; they are cached
        // as errors up front.
        for cell in state.graph.circular.clone() {
            if in_scope(&cell) {
                self.finish_cell(&state, &cell, CellValue::Error(ErrorKind::Value));
                stats.computed += 1;
            }
        }
        stats.circular_cells = state
            .graph
            .circular
            .iter()
            .filter(|c| in_scope(c.as_str()))
            .cloned()
            .collect();

        let resolver = SnapshotResolver {
            snapshot: &state.snapshot,
            ranges: &state.ranges,
            store: self.store.as_ref(),
        };

        let mut done: FxHashSet<String> = FxHashSet::default();

        // Level-0 fast path: pure cell-arithmetic formulas clear cheaply
        // in parallel before the general machinery starts.
        debug_assert!(state.formulas_checked);
        if let Some(first) = state.graph.levels.first() {
            let simple: Vec<String> = first
                .iter()
                .filter(|cell| in_scope(cell.as_str()))
                .filter(|cell| {
                    state
                        .graph
                        .nodes
                        .get(*cell)
                        .and_then(|n| n.ast.as_ref())
                        .is_some_and(|ast| ast.is_simple())
                })
                .cloned()
                .collect();
            if !simple.is_empty() {
                debug!(count = simple.len(), "level-0 simple fast path");
                simple.par_iter().for_each(|cell| {
                    self.compute_cell(&state, &resolver, cell);
                });
                stats.computed += simple.len();
                done.extend(simple);
            }
        }

        for (level_index, level) in state.graph.levels.iter().enumerate() {
            let mut remaining: Vec<String> = level
                .iter()
                .filter(|cell| in_scope(cell.as_str()) && !done.contains(*cell))
                .cloned()
                .collect();
            if remaining.is_empty() {
                continue;
            }

            // Bulk first: grouped patterns fill the result and
            // sub-expression caches in one scan per data source.
            let outcome = bulk::run_level(
                &remaining,
                &state.graph,
                &state.snapshot,
                &state.columns,
                &state.subexpr,
                &resolver,
                &self.config,
            );
            if !outcome.computed.is_empty() || outcome.subexpr_entries > 0 {
                debug!(
                    level = level_index,
                    bulk = outcome.computed.len(),
                    subexpr = outcome.subexpr_entries,
                    "bulk optimiser"
                );
            }
            for (cell, value) in &outcome.computed {
                self.finish_cell(&state, cell, value.clone());
            }
            stats.bulk_computed += outcome.computed.len();
            stats.computed += outcome.computed.len();
            remaining.retain(|cell| !outcome.computed.contains_key(cell));

            // Everything else goes through the scheduler.
            let run = scheduler::run_level(
                &remaining,
                &state.graph,
                &self.config,
                deadline,
                &|cell| self.compute_cell(&state, &resolver, cell),
                &|cell| self.finish_cell(&state, cell, CellValue::Error(ErrorKind::Value)),
            );
            match run {
                LevelRun::Completed => {
                    stats.computed += remaining.len();
                }
                LevelRun::Cycle(involved) => {
                    for cell in &involved {
                        self.finish_cell(&state, cell, CellValue::Error(ErrorKind::Value));
                        stats.circular_cells.push(cell.clone());
                    }
                    stats.computed += involved.len();
                }
                LevelRun::TimedOut(unfinished) => {
                    warn!(level = level_index, unfinished = unfinished.len(), "level timed out");
                    return Err(EngineError::Timeout { unfinished });
                }
            }
            done.extend(remaining);
        }

        stats.duration = started.elapsed();
        info!(
            formulas = stats.total_formulas,
            levels = stats.levels,
            merged = stats.merged_levels,
            bulk = stats.bulk_computed,
            circular = stats.circular_cells.len(),
            ms = stats.duration.as_millis() as u64,
            "recalculation done"
        );
        Ok(stats)
    }

    /// Per-formula work: substitute → evaluate → format → cache →
    /// snapshot → callback. Runs on worker threads; holds no lock across
    /// evaluation.
    fn compute_cell(&self, state: &CalcState, resolver: &dyn Resolver, full: &str) {
        let Some(node) = state.graph.nodes.get(full) else {
            return;
        };
        let Some((sheet, local)) = full.split_once('!') else {
            return;
        };
        let (col, row) = parse_cell(local).unwrap_or((1, 1));
        let interp = Interpreter::new(EvalContext {
            resolver,
            sheet,
            col,
            row,
        });

        let value = if has_optimisable_subexpr(&node.formula) {
            let (rewritten, hits) = substitute(&node.formula, &state.subexpr);
            if hits > 0 {
                let value = match parse_formula(&rewritten) {
                    Ok(expr) => interp.evaluate(&expr),
                    Err(_) => CellValue::Error(ErrorKind::Value),
                };
                self.results
                    .store_rewritten(sheet, local, &rewritten, &value.to_string());
                value
            } else {
                self.eval_node_ast(&interp, node)
            }
        } else {
            self.eval_node_ast(&interp, node)
        };

        self.finish_cell(state, full, value);
    }

    fn eval_node_ast(
        &self,
        interp: &Interpreter<'_>,
        node: &crate::graph::FormulaNode,
    ) -> CellValue {
        match &node.ast {
            Some(expr) => interp.evaluate(expr),
            // Unparseable formula text is a cell-local #VALUE!.
            None => CellValue::Error(ErrorKind::Value),
        }
    }

    /// Store a computed value everywhere it belongs and notify.
    fn finish_cell(&self, state: &CalcState, full: &str, value: CellValue) {
        let Some((sheet, local)) = full.split_once('!') else {
            return;
        };
        let formatted = self.store.format_value(sheet, local, &value);
        let raw = value.to_string();
        let old = self.store.get_cached(sheet, local);

        self.results.store(sheet, local, &formatted, Some(&raw));
        self.store
            .set_cached(sheet, local, &formatted, value.cell_type());
        state.snapshot.set(sheet, local, value);

        if old.as_deref() != Some(formatted.as_str()) {
            let hook = self.hook.read().unwrap().clone();
            if let Some(hook) = hook {
                hook(sheet, local, old.as_deref().unwrap_or(""), &formatted);
            }
        }
    }
}

/* ===================  resolvers  =================== */

/// Worker-side resolver: reads go to the worksheet snapshot (authoritative
/// during a run), ranges ride the bounded LRU.
struct SnapshotResolver<'a> {
    snapshot: &'a Snapshot,
    ranges: &'a RangeLru,
    store: &'a dyn CellStore,
}

impl Resolver for SnapshotResolver<'_> {
    fn cell_value(&self, sheet: &str, col: u32, row: u32) -> CellValue {
        let cell = format!("{}{row}", index_to_col(col));
        match self.snapshot.get_opt(sheet, &cell) {
            Some(value) => value,
            // Forward reads of cells outside the snapshot (e.g. a formula
            // cell that is not a dependency) fall back to the store.
            None => self.store.get_raw(sheet, &cell).unwrap_or(CellValue::Empty),
        }
    }

    fn sheet_max_row(&self, sheet: &str) -> u32 {
        self.snapshot.max_row(sheet)
    }

    fn range_matrix(
        &self,
        sheet: &str,
        start_col: u32,
        start_row: u32,
        end_col: u32,
        end_row: u32,
    ) -> Arc<Vec<Vec<CellValue>>> {
        let key = format!(
            "{sheet}!{}{start_row}:{}{end_row}",
            index_to_col(start_col),
            index_to_col(end_col)
        );
        if let Some(cached) = self.ranges.load(&key) {
            return cached;
        }
        let matrix = Arc::new(
            self.snapshot
                .materialise(sheet, start_col, start_row, end_col, end_row),
        );
        self.ranges.store(&key, matrix.clone());
        matrix
    }
}

/// Single-cell resolver: referenced formula cells are pulled from the
/// result cache or evaluated recursively, depth-bounded by
/// `max_calc_iterations`. Every recursive result co-writes the simple
/// result-cache key, keeping this path's cache layout identical to the
/// scheduled one.
struct RecursiveResolver<'e, S: CellStore> {
    engine: &'e Engine<S>,
    formulas: FxHashMap<String, String>,
    depth: AtomicU32,
}

impl<'e, S: CellStore> RecursiveResolver<'e, S> {
    fn new(engine: &'e Engine<S>) -> Self {
        let mut formulas = FxHashMap::default();
        for sheet in engine.store.sheet_names() {
            for (cell, formula) in engine.store.iter_formulas(&sheet) {
                formulas.insert(qualify(&sheet, &cell), formula);
            }
        }
        Self {
            engine,
            formulas,
            depth: AtomicU32::new(0),
        }
    }

    fn evaluate_formula(&self, formula: &str, sheet: &str, col: u32, row: u32) -> CellValue {
        let Ok(expr) = parse_formula(formula) else {
            return CellValue::Error(ErrorKind::Value);
        };
        let interp = Interpreter::new(EvalContext {
            resolver: self,
            sheet,
            col,
            row,
        });
        interp.evaluate(&expr)
    }
}

impl<S: CellStore> Resolver for RecursiveResolver<'_, S> {
    fn cell_value(&self, sheet: &str, col: u32, row: u32) -> CellValue {
        let cell = format!("{}{row}", index_to_col(col));
        let full = qualify(sheet, &cell);
        let Some(formula) = self.formulas.get(&full) else {
            return self
                .engine
                .store
                .get_raw(sheet, &cell)
                .unwrap_or(CellValue::Empty);
        };

        if let Some(cached) = self
            .engine
            .results
            .get(sheet, &cell, true)
            .or_else(|| self.engine.results.get(sheet, &cell, false))
        {
            return CellValue::from_cell_text(&cached);
        }

        if self.depth.fetch_add(1, Ordering::Relaxed) >= self.engine.config.max_calc_iterations {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return CellValue::Error(ErrorKind::Value);
        }
        let value = self.evaluate_formula(formula, sheet, col, row);
        self.depth.fetch_sub(1, Ordering::Relaxed);

        let formatted = self.engine.store.format_value(sheet, &cell, &value);
        self.engine
            .results
            .store(sheet, &cell, &formatted, Some(&value.to_string()));
        value
    }

    fn sheet_max_row(&self, sheet: &str) -> u32 {
        self.engine.store.max_row(sheet)
    }

    fn range_matrix(
        &self,
        sheet: &str,
        start_col: u32,
        start_row: u32,
        end_col: u32,
        end_row: u32,
    ) -> Arc<Vec<Vec<CellValue>>> {
        let mut out = Vec::with_capacity((end_row - start_row + 1) as usize);
        for row in start_row..=end_row {
            let mut cells = Vec::with_capacity((end_col - start_col + 1) as usize);
            for col in start_col..=end_col {
                cells.push(self.cell_value(sheet, col, row));
            }
            out.push(cells);
        }
        Arc::new(out)
    }
}
