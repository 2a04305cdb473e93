//! Indegree-driven parallel executor for one level.
//!
//! Workers pull ready formulas off a bounded channel, run the per-formula
//! work, and report completions; a single listener drains completions,
//! decrements child indegrees, and feeds newly ready formulas back into
//! the queue. The listener owns the only ready-queue sender, so dropping
//! it (normal end, timeout, or unwinding) is what terminates the workers —
//! there is no path that leaves them blocked.
//!
//! Cross-level ordering is already guaranteed by the level partition; the
//! indegree bookkeeping here only covers intra-level edges, which are
//! normally absent and only appear when a cycle slipped into a level.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded, unbounded};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::graph::DependencyGraph;

/// How a level run ended.
#[derive(Debug)]
pub enum LevelRun {
    Completed,
    /// The level seeded zero ready formulas despite being non-empty: an
    /// intra-level cycle. The scheduler declined to run.
    Cycle(Vec<String>),
    /// The wall-clock budget expired; these formulas never finished.
    TimedOut(Vec<String>),
}

/// Sender half the listener keeps; dropping it closes the ready queue.
struct QueueGuard {
    tx: Option<crossbeam_channel::Sender<String>>,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.tx.take();
    }
}

/// Execute one level. `compute` is the per-formula work (substitute →
/// evaluate → format → cache → snapshot → callback); it must not panic —
/// panics are caught here and reported through `on_panic` so the cell can
/// be cached as an error.
pub fn run_level(
    cells: &[String],
    graph: &DependencyGraph,
    config: &EngineConfig,
    deadline: Option<Instant>,
    compute: &(dyn Fn(&str) + Sync),
    on_panic: &(dyn Fn(&str) + Sync),
) -> LevelRun {
    if cells.is_empty() {
        return LevelRun::Completed;
    }

    let level_set: FxHashSet<&str> = cells.iter().map(|s| s.as_str()).collect();

    // Intra-level edges only: cross-level dependencies are satisfied by
    // construction.
    let mut in_degree: FxHashMap<&str, AtomicUsize> = FxHashMap::default();
    let mut children: FxHashMap<&str, SmallVec<[&str; 4]>> = FxHashMap::default();
    for cell in cells {
        let deps = graph.formula_deps_of(cell);
        let intra: SmallVec<[&str; 4]> = deps
            .iter()
            .filter_map(|d| level_set.get(d.as_str()).copied())
            .collect();
        in_degree.insert(cell.as_str(), AtomicUsize::new(intra.len()));
        for dep in intra {
            children.entry(dep).or_default().push(cell.as_str());
        }
    }

    let seeds: Vec<&str> = cells
        .iter()
        .map(|c| c.as_str())
        .filter(|c| in_degree[c].load(Ordering::Relaxed) == 0)
        .collect();
    if seeds.is_empty() {
        let involved: Vec<String> = cells.to_vec();
        warn!(cells = involved.len(), "intra-level cycle, declining level");
        return LevelRun::Cycle(involved);
    }

    let workers = worker_count(cells.len(), config);
    let timeout = level_timeout(cells.len(), config, deadline);

    let (ready_tx, ready_rx) = bounded::<String>(cells.len());
    let (done_tx, done_rx) = unbounded::<String>();
    for seed in &seeds {
        ready_tx.send(seed.to_string()).expect("queue sized to level");
    }
    let mut guard = QueueGuard { tx: Some(ready_tx) };

    debug!(
        size = cells.len(),
        workers,
        seeds = seeds.len(),
        "level dispatch"
    );

    let mut completed: FxHashSet<String> = FxHashSet::default();
    let result = std::thread::scope(|scope| {
        for _ in 0..workers {
            let ready_rx: Receiver<String> = ready_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(cell) = ready_rx.recv() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| compute(&cell)));
                    if outcome.is_err() {
                        on_panic(&cell);
                    }
                    if done_tx.send(cell).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        // Listener: the only writer of indegrees and the ready queue.
        let started = Instant::now();
        while completed.len() < cells.len() {
            let remaining = timeout.checked_sub(started.elapsed());
            let Some(remaining) = remaining else {
                break;
            };
            match done_rx.recv_timeout(remaining) {
                Ok(cell) => {
                    for &child in children.get(cell.as_str()).into_iter().flatten() {
                        let prior = in_degree[child].fetch_sub(1, Ordering::AcqRel);
                        if prior == 1
                            && let Some(tx) = guard.tx.as_ref()
                        {
                            let _ = tx.send(child.to_string());
                        }
                    }
                    completed.insert(cell);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Close the queue so workers drain out before the scope joins.
        guard.tx.take();

        if completed.len() == cells.len() {
            LevelRun::Completed
        } else {
            let mut unfinished: Vec<String> = cells
                .iter()
                .filter(|c| !completed.contains(*c))
                .cloned()
                .collect();
            unfinished.sort();
            LevelRun::TimedOut(unfinished)
        }
    });

    result
}

fn worker_count(level_size: usize, config: &EngineConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.min(level_size).min(config.max_workers).max(1)
}

fn level_timeout(level_size: usize, config: &EngineConfig, deadline: Option<Instant>) -> Duration {
    let per_level = config
        .level_timeout_floor
        .max(config.level_timeout_per_formula * level_size as u32);
    match deadline {
        Some(deadline) => per_level.min(deadline.saturating_duration_since(Instant::now())),
        None => per_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::{DependencyGraph, FormulaNode};
    use rustc_hash::FxHashSet;
    use std::sync::Mutex;

    fn graph_with(nodes: &[(&str, &[&str])]) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for (cell, deps) in nodes {
            graph.nodes.insert(
                cell.to_string(),
                FormulaNode {
                    cell: cell.to_string(),
                    formula: String::new(),
                    ast: None,
                    dependencies: deps.iter().map(|d| d.to_string()).collect(),
                    level: None,
                },
            );
        }
        graph
    }

    #[test]
    fn independent_formulas_all_run() {
        let graph = graph_with(&[("s!A1", &[]), ("s!B1", &[]), ("s!C1", &[])]);
        let cells = vec!["s!A1".to_string(), "s!B1".to_string(), "s!C1".to_string()];
        let seen = Mutex::new(FxHashSet::default());
        let run = run_level(
            &cells,
            &graph,
            &EngineConfig::default(),
            None,
            &|cell| {
                seen.lock().unwrap().insert(cell.to_string());
            },
            &|_| {},
        );
        assert!(matches!(run, LevelRun::Completed));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn intra_level_dependency_orders_execution() {
        // B depends on A inside the same level (a cycle remnant shape).
        let graph = graph_with(&[("s!A1", &[]), ("s!B1", &["s!A1"])]);
        let cells = vec!["s!A1".to_string(), "s!B1".to_string()];
        let order = Mutex::new(Vec::new());
        let run = run_level(
            &cells,
            &graph,
            &EngineConfig::default(),
            None,
            &|cell| {
                order.lock().unwrap().push(cell.to_string());
            },
            &|_| {},
        );
        assert!(matches!(run, LevelRun::Completed));
        assert_eq!(*order.lock().unwrap(), vec!["s!A1", "s!B1"]);
    }

    #[test]
    fn cycle_declines_to_run() {
        let graph = graph_with(&[("s!A1", &["s!B1"]), ("s!B1", &["s!A1"])]);
        let cells = vec!["s!A1".to_string(), "s!B1".to_string()];
        let ran = Mutex::new(0usize);
        let run = run_level(
            &cells,
            &graph,
            &EngineConfig::default(),
            None,
            &|_| {
                *ran.lock().unwrap() += 1;
            },
            &|_| {},
        );
        match run {
            LevelRun::Cycle(involved) => assert_eq!(involved.len(), 2),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert_eq!(*ran.lock().unwrap(), 0);
    }

    #[test]
    fn panicking_formula_is_reported_and_level_finishes() {
        let graph = graph_with(&[("s!A1", &[]), ("s!B1", &[])]);
        let cells = vec!["s!A1".to_string(), "s!B1".to_string()];
        let panicked = Mutex::new(Vec::new());
        let run = run_level(
            &cells,
            &graph,
            &EngineConfig::default(),
            None,
            &|cell| {
                if cell == "s!A1" {
                    panic!("boom");
                }
            },
            &|cell| {
                panicked.lock().unwrap().push(cell.to_string());
            },
        );
        assert!(matches!(run, LevelRun::Completed));
        assert_eq!(*panicked.lock().unwrap(), vec!["s!A1"]);
    }

    #[test]
    fn timeout_reports_unfinished() {
        let graph = graph_with(&[("s!A1", &[]), ("s!B1", &["s!A1"])]);
        let cells = vec!["s!A1".to_string(), "s!B1".to_string()];
        let config = EngineConfig {
            level_timeout_floor: Duration::from_millis(50),
            level_timeout_per_formula: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let run = run_level(
            &cells,
            &graph,
            &config,
            None,
            &|cell| {
                if cell == "s!A1" {
                    std::thread::sleep(Duration::from_millis(300));
                }
            },
            &|_| {},
        );
        match run {
            LevelRun::TimedOut(unfinished) => {
                assert!(unfinished.contains(&"s!B1".to_string()));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
