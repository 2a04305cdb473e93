//! Dependency-graph construction and level assignment against a real
//! store, including whole-column sentinel binding.

mod common;

use std::sync::Arc;

use cellforge_engine::CellStore;
use common::MemStore;
use rustc_hash::FxHashSet;

use cellforge_engine::{DependencyGraph, Engine, EngineConfig};

fn level_of(graph: &DependencyGraph, cell: &str) -> u32 {
    graph.nodes[cell].level.expect("level assigned")
}

#[test]
fn chain_levels_are_strictly_increasing() {
    let store = MemStore::new();
    store
        .value("s", "A1", 1.0)
        .formula("s", "B1", "=A1*2")
        .formula("s", "C1", "=B1+1")
        .formula("s", "D1", "=C1+B1");

    let mut graph = DependencyGraph::build(&store, &EngineConfig::default(), &[]);
    graph.assign_levels();

    assert_eq!(level_of(&graph, "s!B1"), 0);
    assert_eq!(level_of(&graph, "s!C1"), 1);
    assert_eq!(level_of(&graph, "s!D1"), 2);
    assert!(graph.circular.is_empty());

    // The invariant: every formula sits strictly above its formula deps.
    for node in graph.nodes.values() {
        for dep in graph.formula_deps_of(&node.cell) {
            assert!(level_of(&graph, &node.cell) > level_of(&graph, &dep));
        }
    }
}

#[test]
fn column_sentinel_binds_above_column_formulas() {
    // G2 is a formula inside the column that W1 aggregates, so W1 must
    // run after it.
    let store = MemStore::new();
    store
        .value("s", "A1", 5.0)
        .value("s", "G1", 1.0)
        .formula("s", "G2", "=A1*2")
        .formula("s", "W1", "=SUM(G:G)");

    let mut graph = DependencyGraph::build(&store, &EngineConfig::default(), &[]);
    graph.assign_levels();

    assert_eq!(level_of(&graph, "s!G2"), 0);
    assert_eq!(level_of(&graph, "s!W1"), 1);

    // And the whole pipeline produces the right number: 1 + 10.
    let engine = Engine::new(Arc::new(store), EngineConfig::default());
    engine.recalculate_all().unwrap();
    assert_eq!(
        engine.store().cached_value("s", "W1").as_deref(),
        Some("11")
    );
}

#[test]
fn empty_column_sentinel_stays_level_zero() {
    let store = MemStore::new();
    store.sheet("s").formula("s", "B1", "=SUM(Q:Q)");

    let mut graph = DependencyGraph::build(&store, &EngineConfig::default(), &[]);
    graph.assign_levels();
    assert_eq!(level_of(&graph, "s!B1"), 0);
}

#[test]
fn circular_nodes_are_excluded_from_levels() {
    let store = MemStore::new();
    store
        .formula("s", "A1", "=B1")
        .formula("s", "B1", "=A1")
        .value("s", "D1", 1.0)
        .formula("s", "C1", "=D1+1");

    let mut graph = DependencyGraph::build(&store, &EngineConfig::default(), &[]);
    graph.assign_levels();

    let mut circular = graph.circular.clone();
    circular.sort();
    assert_eq!(circular, vec!["s!A1", "s!B1"]);
    let levelled: FxHashSet<String> = graph.levels.iter().flatten().cloned().collect();
    assert!(levelled.contains("s!C1"));
    assert!(!levelled.contains("s!A1"));
    assert!(!levelled.contains("s!B1"));
}

#[test]
fn incremental_propagates_through_formula_chain() {
    let store = Arc::new(MemStore::new());
    store
        .value("s", "A1", 1.0)
        .formula("s", "B1", "=A1+1")
        .formula("s", "C1", "=B1+1");

    let engine = Engine::new(store.clone(), EngineConfig::default());
    engine.recalculate_all().unwrap();
    assert_eq!(store.cached_value("s", "C1").as_deref(), Some("3"));

    store.set_value("s", "A1", 41.0.into());
    engine.invalidate_cell("s", "A1");
    let mut changed = FxHashSet::default();
    changed.insert("s!A1".to_string());
    let stats = engine.recalculate_affected(&changed).unwrap();

    assert_eq!(stats.computed, 2);
    assert_eq!(store.cached_value("s", "B1").as_deref(), Some("42"));
    assert_eq!(store.cached_value("s", "C1").as_deref(), Some("43"));
}

#[test]
fn affected_set_respects_column_membership() {
    // lookup depends on COLUMN:s!A; a change to any cell of that column
    // must reach it, a change elsewhere must not.
    let store = Arc::new(MemStore::new());
    store
        .value("s", "A1", 1.0)
        .value("s", "A2", 2.0)
        .value("s", "Z1", 9.0)
        .formula("s", "B1", "=SUM(A:A)");

    let engine = Engine::new(store.clone(), EngineConfig::default());
    engine.recalculate_all().unwrap();
    assert_eq!(store.cached_value("s", "B1").as_deref(), Some("3"));

    store.set_value("s", "A2", 10.0.into());
    let mut changed = FxHashSet::default();
    changed.insert("s!A2".to_string());
    let stats = engine.recalculate_affected(&changed).unwrap();
    assert_eq!(stats.computed, 1);
    assert_eq!(store.cached_value("s", "B1").as_deref(), Some("11"));

    let mut unrelated = FxHashSet::default();
    unrelated.insert("s!Z1".to_string());
    let stats = engine.recalculate_affected(&unrelated).unwrap();
    assert_eq!(stats.computed, 0);
}
