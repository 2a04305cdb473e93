//! cellforge-engine — the formula recalculation core.
//!
//! Given a cell store, the engine extracts dependency edges from formula
//! text, layers the dependency graph topologically, and computes each
//! level with a bulk optimiser for repeated aggregation/lookup shapes
//! followed by an indegree-driven parallel scheduler for the rest.
//! Incremental recalculation recomputes only the transitive dependents of
//! a changed-cell set.

pub mod bulk;
pub mod cache;
pub mod chain;
pub mod config;
pub mod criteria;
pub mod driver;
pub mod graph;
pub mod interp;
pub mod refs;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod subst;

pub use cache::{KeyVariant, RangeLru, ResultCache, ResultKey, SubExprCache};
pub use chain::{CalcChain, ChainEntry};
pub use config::{CalcOptions, EngineConfig, EngineError, RecalcStats};
pub use driver::{CellCalculatedHook, Engine, FormulaUpdate, ValueUpdate};
pub use graph::{ColumnMeta, DependencyGraph, FormulaNode};
pub use interp::{EvalContext, Interpreter, Resolver};
pub use snapshot::Snapshot;
pub use store::CellStore;
