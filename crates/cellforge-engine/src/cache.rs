//! The cache tier: result cache, sub-expression cache, and the range LRU.
//!
//! The result cache outlives individual recalculations and is invalidated
//! selectively; the sub-expression cache and range LRU are scoped to one
//! run. Keys are structured (`sheet`, `cell`, variant) rather than glued
//! strings so the writer contract — simple and raw-variant entries land
//! together — is enforced in one place.

use std::sync::Mutex;

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use cellforge_common::CellValue;

/// Which rendering of a cell's result an entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyVariant {
    /// The default formatted rendering.
    Simple,
    /// Explicit raw-mode variant: `Raw(true)` is unformatted, `Raw(false)`
    /// formatted (same string as `Simple`).
    Raw(bool),
    /// The result of evaluating a rewritten formula, keyed by the rewritten
    /// text.
    SubExpr(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub sheet: String,
    pub cell: String,
    pub variant: KeyVariant,
}

impl ResultKey {
    fn new(sheet: &str, cell: &str, variant: KeyVariant) -> Self {
        Self {
            sheet: sheet.to_string(),
            cell: cell.to_string(),
            variant,
        }
    }
}

/// Concurrent cell-result cache. Persists across recalculations.
#[derive(Debug, Default)]
pub struct ResultCache {
    map: DashMap<ResultKey, String>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a computed result. Writes the `Simple` and `Raw(false)`
    /// entries together (the writer contract); the raw rendering is added
    /// when the caller computed one.
    pub fn store(&self, sheet: &str, cell: &str, formatted: &str, raw: Option<&str>) {
        self.map.insert(
            ResultKey::new(sheet, cell, KeyVariant::Simple),
            formatted.to_string(),
        );
        self.map.insert(
            ResultKey::new(sheet, cell, KeyVariant::Raw(false)),
            formatted.to_string(),
        );
        if let Some(raw) = raw {
            self.map.insert(
                ResultKey::new(sheet, cell, KeyVariant::Raw(true)),
                raw.to_string(),
            );
        }
    }

    /// Store the result of a rewritten-formula evaluation.
    pub fn store_rewritten(&self, sheet: &str, cell: &str, rewritten: &str, value: &str) {
        self.map.insert(
            ResultKey::new(sheet, cell, KeyVariant::SubExpr(rewritten.to_string())),
            value.to_string(),
        );
    }

    /// Probe for a cached result: the simple entry first, then the
    /// requested raw-mode variant.
    pub fn get(&self, sheet: &str, cell: &str, raw_mode: bool) -> Option<String> {
        if !raw_mode
            && let Some(v) = self.map.get(&ResultKey::new(sheet, cell, KeyVariant::Simple))
        {
            return Some(v.clone());
        }
        self.map
            .get(&ResultKey::new(sheet, cell, KeyVariant::Raw(raw_mode)))
            .map(|v| v.clone())
    }

    /// Drop every variant for one cell (value mutation).
    pub fn invalidate_cell(&self, sheet: &str, cell: &str) {
        self.map
            .retain(|k, _| !(k.sheet == sheet && k.cell == cell));
    }

    /// Drop everything (structural mutation: row/column insert or delete).
    pub fn clear(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Cache of computed sub-expression results, keyed on the byte-exact
/// sub-expression text as it appears in source formulas. Lives for one
/// recalculation.
#[derive(Debug, Default)]
pub struct SubExprCache {
    map: DashMap<String, String>,
}

impl SubExprCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, expr_text: &str, value: String) {
        self.map.insert(expr_text.to_string(), value);
    }

    pub fn get(&self, expr_text: &str) -> Option<String> {
        self.map.get(expr_text).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Bounded LRU of materialised range matrices.
///
/// Entries form a doubly-linked order list threaded through a slab; the
/// map finds the slot, the links maintain recency, the back evicts.
pub struct RangeLru {
    inner: Mutex<LruInner>,
    capacity: usize,
}

struct LruInner {
    slots: Vec<LruSlot>,
    index: FxHashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
}

struct LruSlot {
    key: String,
    value: std::sync::Arc<Vec<Vec<CellValue>>>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl RangeLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                slots: Vec::with_capacity(capacity),
                index: FxHashMap::default(),
                head: None,
                tail: None,
                free: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Fetch a matrix and mark it most-recently-used.
    pub fn load(&self, key: &str) -> Option<std::sync::Arc<Vec<Vec<CellValue>>>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = *inner.index.get(key)?;
        inner.unlink(slot);
        inner.push_front(slot);
        Some(inner.slots[slot].value.clone())
    }

    /// Insert a matrix, evicting the least-recently-used entry at capacity.
    pub fn store(&self, key: &str, value: std::sync::Arc<Vec<Vec<CellValue>>>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.index.get(key) {
            inner.slots[slot].value = value;
            inner.unlink(slot);
            inner.push_front(slot);
            return;
        }
        if inner.index.len() >= self.capacity
            && let Some(tail) = inner.tail
        {
            inner.unlink(tail);
            let key = std::mem::take(&mut inner.slots[tail].key);
            inner.index.remove(&key);
            inner.free.push(tail);
        }
        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot] = LruSlot {
                    key: key.to_string(),
                    value,
                    prev: None,
                    next: None,
                };
                slot
            }
            None => {
                inner.slots.push(LruSlot {
                    key: key.to_string(),
                    value,
                    prev: None,
                    next: None,
                });
                inner.slots.len() - 1
            }
        };
        inner.index.insert(key.to_string(), slot);
        inner.push_front(slot);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }
}

impl LruInner {
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None if self.head == Some(slot) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None if self.tail == Some(slot) => self.tail = prev,
            None => {}
        }
        self.slots[slot].prev = None;
        self.slots[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].next = self.head;
        self.slots[slot].prev = None;
        if let Some(head) = self.head {
            self.slots[head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn matrix(n: f64) -> Arc<Vec<Vec<CellValue>>> {
        Arc::new(vec![vec![CellValue::number(n)]])
    }

    #[test]
    fn result_cache_writer_contract() {
        let cache = ResultCache::new();
        cache.store("Sheet1", "A1", "1,234", Some("1234"));
        assert_eq!(cache.get("Sheet1", "A1", false).as_deref(), Some("1,234"));
        assert_eq!(cache.get("Sheet1", "A1", true).as_deref(), Some("1234"));

        cache.invalidate_cell("Sheet1", "A1");
        assert_eq!(cache.get("Sheet1", "A1", false), None);
        assert_eq!(cache.get("Sheet1", "A1", true), None);
    }

    #[test]
    fn invalidation_is_per_cell() {
        let cache = ResultCache::new();
        cache.store("Sheet1", "A1", "1", None);
        cache.store("Sheet1", "A2", "2", None);
        cache.invalidate_cell("Sheet1", "A1");
        assert_eq!(cache.get("Sheet1", "A2", false).as_deref(), Some("2"));
    }

    #[test]
    fn lru_evicts_back() {
        let lru = RangeLru::new(2);
        lru.store("a", matrix(1.0));
        lru.store("b", matrix(2.0));
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(lru.load("a").is_some());
        lru.store("c", matrix(3.0));
        assert!(lru.load("b").is_none());
        assert!(lru.load("a").is_some());
        assert!(lru.load("c").is_some());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn lru_update_existing_key() {
        let lru = RangeLru::new(2);
        lru.store("a", matrix(1.0));
        lru.store("a", matrix(9.0));
        assert_eq!(lru.len(), 1);
        let got = lru.load("a").unwrap();
        assert_eq!(got[0][0], CellValue::number(9.0));
    }
}
