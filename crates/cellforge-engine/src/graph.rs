//! The dependency graph: formula nodes, topological levels, level merging,
//! and the reverse index driving incremental recalculation.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use cellforge_common::{column_key_of_cell, is_column_key, qualify, split_column_key};
use cellforge_parse::{Expr, parse_formula};

use crate::config::EngineConfig;
use crate::refs::extract_refs;
use crate::store::CellStore;

/// One formula cell in the graph.
#[derive(Debug)]
pub struct FormulaNode {
    /// Full reference, `Sheet!A1`.
    pub cell: String,
    /// Original formula text (leading `=` preserved as stored).
    pub formula: String,
    /// Parsed once at build time; `None` when the text does not parse, in
    /// which case evaluation yields `#VALUE!`.
    pub ast: Option<Expr>,
    /// Deduplicated dependencies: concrete full refs and column sentinels.
    pub dependencies: FxHashSet<String>,
    /// Topological level; `None` until assignment, stays `None` for
    /// circular nodes (they are excluded from the level partition).
    pub level: Option<u32>,
}

/// Per-column metadata backing whole-column sentinel resolution.
#[derive(Debug, Default)]
pub struct ColumnMeta {
    /// Formula cells lying in this column.
    pub formulas: FxHashSet<String>,
    /// Highest used row of the column's sheet.
    pub max_row: u32,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    pub nodes: FxHashMap<String, FormulaNode>,
    /// The merged level partition. Within a level no formula depends on
    /// another formula of the same level.
    pub levels: Vec<Vec<String>>,
    /// Level count before merging.
    pub raw_level_count: usize,
    /// Sentinel-keyed (`COLUMN:Sheet!A`) column metadata, built lazily for
    /// columns some formula references as a whole.
    pub column_meta: FxHashMap<String, ColumnMeta>,
    /// Cells participating in circular references.
    pub circular: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph by scanning every sheet's formulas.
    ///
    /// `hint` is a calc-chain traversal order: listed cells are processed
    /// first. It never influences correctness — levels are always derived
    /// from the freshly extracted edges.
    pub fn build(store: &dyn CellStore, config: &EngineConfig, hint: &[String]) -> Self {
        let mut graph = DependencyGraph::default();

        let mut pending: Vec<(String, String, String)> = Vec::new();
        for sheet in store.sheet_names() {
            for (cell, formula) in store.iter_formulas(&sheet) {
                pending.push((sheet.clone(), cell, formula));
            }
        }
        if !hint.is_empty() {
            let order: FxHashMap<&str, usize> = hint
                .iter()
                .enumerate()
                .map(|(i, r)| (r.as_str(), i))
                .collect();
            pending.sort_by_key(|(sheet, cell, _)| {
                let full = qualify(sheet, cell);
                order.get(full.as_str()).copied().unwrap_or(usize::MAX)
            });
        }

        for (sheet, cell, formula) in pending {
            let full = qualify(&sheet, &cell);
            let dependencies: FxHashSet<String> =
                extract_refs(&formula, &sheet, config.range_expansion_limit)
                    .into_iter()
                    .collect();
            let ast = parse_formula(&formula).ok();
            graph.nodes.insert(
                full.clone(),
                FormulaNode {
                    cell: full,
                    formula,
                    ast,
                    dependencies,
                    level: None,
                },
            );
        }

        graph.build_column_meta(store);
        graph
    }

    /// Resolve every referenced column sentinel against the formula set.
    fn build_column_meta(&mut self, store: &dyn CellStore) {
        let mut keys: FxHashSet<String> = FxHashSet::default();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if is_column_key(dep) {
                    keys.insert(dep.clone());
                }
            }
        }
        for key in keys {
            let Some((sheet, _col)) = split_column_key(&key) else {
                continue;
            };
            let mut meta = ColumnMeta {
                formulas: FxHashSet::default(),
                max_row: store.max_row(sheet),
            };
            for cell in self.nodes.keys() {
                if column_key_of_cell(cell).as_deref() == Some(key.as_str()) {
                    meta.formulas.insert(cell.clone());
                }
            }
            self.column_meta.insert(key, meta);
        }
    }

    /// Kahn-style iterative relaxation: a node's level is one past the
    /// highest level among its formula dependencies, where a column
    /// sentinel contributes the highest level of the formulas in that
    /// column (−1 when the column holds none). Nodes that never settle
    /// after a no-progress pass are circular.
    pub fn assign_levels(&mut self) {
        let cells: Vec<String> = self.nodes.keys().cloned().collect();
        let mut unassigned: FxHashSet<String> = cells.iter().cloned().collect();

        loop {
            let mut assigned_this_pass = Vec::new();
            for cell in &unassigned {
                if let Some(level) = self.try_level(cell) {
                    assigned_this_pass.push((cell.clone(), level));
                }
            }
            if assigned_this_pass.is_empty() {
                break;
            }
            for (cell, level) in assigned_this_pass {
                self.nodes.get_mut(&cell).unwrap().level = Some(level);
                unassigned.remove(&cell);
            }
        }

        if !unassigned.is_empty() {
            let mut circular: Vec<String> = unassigned.into_iter().collect();
            circular.sort();
            warn!(cells = circular.len(), "circular references detected");
            self.circular = circular;
        }

        let mut max_level = 0u32;
        for node in self.nodes.values() {
            if let Some(l) = node.level {
                max_level = max_level.max(l);
            }
        }
        let mut raw: Vec<Vec<String>> = vec![Vec::new(); (max_level + 1) as usize];
        for node in self.nodes.values() {
            if let Some(l) = node.level {
                raw[l as usize].push(node.cell.clone());
            }
        }
        raw.retain(|level| !level.is_empty());
        for level in &mut raw {
            level.sort();
        }
        self.raw_level_count = raw.len();
        let deps = |cell: &str| self.formula_deps_of(cell);
        let merged = merge_levels(raw, &deps);
        self.levels = merged;
        debug!(
            raw = self.raw_level_count,
            merged = self.levels.len(),
            "level partition built"
        );
    }

    /// The level this node would get now, or `None` while some formula
    /// dependency is still unassigned.
    fn try_level(&self, cell: &str) -> Option<u32> {
        let node = self.nodes.get(cell)?;
        let mut max_dep: i64 = -1;
        for dep in &node.dependencies {
            if is_column_key(dep) {
                let Some(meta) = self.column_meta.get(dep) else {
                    continue;
                };
                for f in &meta.formulas {
                    if f == cell {
                        // A formula aggregating its own column would
                        // otherwise deadlock on itself.
                        continue;
                    }
                    match self.nodes.get(f).and_then(|n| n.level) {
                        Some(l) => max_dep = max_dep.max(l as i64),
                        None => return None,
                    }
                }
            } else if let Some(dep_node) = self.nodes.get(dep) {
                match dep_node.level {
                    Some(l) => max_dep = max_dep.max(l as i64),
                    None => return None,
                }
            }
            // Plain data cells contribute nothing.
        }
        Some((max_dep + 1) as u32)
    }

    /// Every formula cell this node's dependencies resolve to, with column
    /// sentinels expanded through the column metadata.
    pub fn formula_deps_of(&self, cell: &str) -> FxHashSet<String> {
        let mut out = FxHashSet::default();
        let Some(node) = self.nodes.get(cell) else {
            return out;
        };
        for dep in &node.dependencies {
            if is_column_key(dep) {
                if let Some(meta) = self.column_meta.get(dep) {
                    for f in &meta.formulas {
                        if f != cell {
                            out.insert(f.clone());
                        }
                    }
                }
            } else if self.nodes.contains_key(dep) {
                out.insert(dep.clone());
            }
        }
        out
    }

    /// Reverse index: for every dependency key (formula cell, data cell,
    /// or column sentinel), the formulas that depend on it.
    pub fn reverse_index(&self) -> FxHashMap<String, FxHashSet<String>> {
        let mut reverse: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                reverse
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.cell.clone());
            }
        }
        reverse
    }

    /// Transitive dependents of a set of changed cells.
    ///
    /// A changed cell also stands for its column: formulas bound to the
    /// matching column sentinel are affected too, which is what makes
    /// whole-column lookups recompute when one key cell changes.
    pub fn affected_by(
        &self,
        reverse: &FxHashMap<String, FxHashSet<String>>,
        changed: &FxHashSet<String>,
    ) -> FxHashSet<String> {
        let mut affected: FxHashSet<String> = FxHashSet::default();
        let mut work: Vec<String> = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();

        let mut seed = |key: String, work: &mut Vec<String>, seen: &mut FxHashSet<String>| {
            if seen.insert(key.clone()) {
                work.push(key);
            }
        };

        for cell in changed {
            seed(cell.clone(), &mut work, &mut seen);
            if let Some(col_key) = column_key_of_cell(cell) {
                seed(col_key, &mut work, &mut seen);
            }
        }

        while let Some(key) = work.pop() {
            let Some(dependents) = reverse.get(&key) else {
                continue;
            };
            for dependent in dependents {
                if !self.nodes.contains_key(dependent) {
                    continue;
                }
                if affected.insert(dependent.clone()) {
                    seed(dependent.clone(), &mut work, &mut seen);
                    if let Some(col_key) = column_key_of_cell(dependent) {
                        seed(col_key, &mut work, &mut seen);
                    }
                }
            }
        }
        affected
    }

    /// Highest data row a column sentinel covers, for evaluators that need
    /// to bound a whole-column scan.
    pub fn column_max_row(&self, key: &str) -> Option<u32> {
        self.column_meta.get(key).map(|m| m.max_row)
    }
}

/// Merge the level partition: scan left to right, absorbing a later level
/// into the current block when none of its formulas depends on a formula
/// inside the block. Only whole levels are absorbed, so the within-level
/// independence invariant is preserved by construction.
pub fn merge_levels(
    raw: Vec<Vec<String>>,
    formula_deps: &dyn Fn(&str) -> FxHashSet<String>,
) -> Vec<Vec<String>> {
    let mut merged: Vec<Vec<String>> = Vec::with_capacity(raw.len());
    let mut block_members: FxHashSet<String> = FxHashSet::default();

    for level in raw {
        if merged.is_empty() {
            block_members = level.iter().cloned().collect();
            merged.push(level);
            continue;
        }
        let independent = level
            .iter()
            .all(|cell| formula_deps(cell).is_disjoint(&block_members));
        if independent {
            block_members.extend(level.iter().cloned());
            merged.last_mut().unwrap().extend(level);
        } else {
            block_members = level.iter().cloned().collect();
            merged.push(level);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps_fn(
        edges: &FxHashMap<String, Vec<String>>,
    ) -> impl Fn(&str) -> FxHashSet<String> + '_ {
        move |cell: &str| {
            edges
                .get(cell)
                .map(|v| v.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    #[test]
    fn merge_absorbs_independent_levels() {
        // b's only dependency is outside both levels, so level 1 folds into
        // level 0 (the shape pass-ordered leveling produces).
        let mut edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
        edges.insert("s!B1".into(), vec![]);
        let raw = vec![vec!["s!A1".to_string()], vec!["s!B1".to_string()]];
        let merged = merge_levels(raw, &deps_fn(&edges));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0], vec!["s!A1".to_string(), "s!B1".to_string()]);
    }

    #[test]
    fn merge_keeps_dependent_levels_apart() {
        let mut edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
        edges.insert("s!B1".into(), vec!["s!A1".into()]);
        let raw = vec![vec!["s!A1".to_string()], vec!["s!B1".to_string()]];
        let merged = merge_levels(raw, &deps_fn(&edges));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_blocks_reset_after_dependency() {
        // L0 <- L1, L2 independent of L1 block: L2 merges into the L1 block.
        let mut edges: FxHashMap<String, Vec<String>> = FxHashMap::default();
        edges.insert("s!B1".into(), vec!["s!A1".into()]);
        edges.insert("s!C1".into(), vec!["s!A1".into()]);
        let raw = vec![
            vec!["s!A1".to_string()],
            vec!["s!B1".to_string()],
            vec!["s!C1".to_string()],
        ];
        let merged = merge_levels(raw, &deps_fn(&edges));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], vec!["s!B1".to_string(), "s!C1".to_string()]);
    }
}
