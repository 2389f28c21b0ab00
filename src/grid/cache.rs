//! A process-wide cache of loaded shift grids, keyed by resolved file
//! identifier. Retained bytes are bounded: grids evicted from the
//! strong layer remain reachable through weak references for as long as
//! somebody holds them.

use super::{GridData, ShiftGrid};
use crate::Error;
use lru::LruCache;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The identifier of a cached grid: one resolved file identifier, or a
/// pair for grids assembled from two files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GridKey {
    Single(String),
    Pair(String, String),
}

struct State {
    // One cell per key currently loading: at most one concurrent load
    loading: HashMap<GridKey, Arc<OnceCell<Arc<ShiftGrid>>>>,
    strong: LruCache<GridKey, Arc<ShiftGrid>>,
    weak: HashMap<GridKey, Weak<ShiftGrid>>,
    retained: usize,
}

/// A byte-bounded, concurrent grid cache. Lookup-or-load is atomic per
/// key: concurrent requests for the same key trigger a single load.
pub struct GridCache {
    budget: usize,
    state: Mutex<State>,
}

impl GridCache {
    /// A cache retaining up to `budget` bytes of grid data with strong
    /// references.
    pub fn new(budget: usize) -> GridCache {
        GridCache {
            budget,
            state: Mutex::new(State {
                loading: HashMap::new(),
                strong: LruCache::unbounded(),
                weak: HashMap::new(),
                retained: 0,
            }),
        }
    }

    /// The grid under `key`, loading it with `loader` on a miss. The
    /// loader runs at most once per key at any time; concurrent callers
    /// block until it finishes.
    pub fn get_or_load<F>(&self, key: &GridKey, loader: F) -> Result<Arc<ShiftGrid>, Error>
    where
        F: FnOnce() -> Result<ShiftGrid, Error>,
    {
        let cell = {
            let mut state = self.lock();
            if let Some(grid) = state.strong.get(key) {
                return Ok(grid.clone());
            }
            if let Some(grid) = state.weak.get(key).and_then(Weak::upgrade) {
                promote(&mut state, key.clone(), grid.clone(), self.budget);
                return Ok(grid);
            }
            state
                .loading
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // Outside the lock: the first caller loads, the others block here
        let loaded = cell.get_or_try_init(|| loader().map(Arc::new)).cloned();

        let mut state = self.lock();
        state.loading.remove(key);
        let grid = loaded?;
        state.weak.insert(key.clone(), Arc::downgrade(&grid));
        promote(&mut state, key.clone(), grid.clone(), self.budget);
        Ok(grid)
    }

    /// A strongly cached data array bit-for-bit equal to `data`, if any
    /// grid holds one. Used by [ShiftGrid::share_data].
    pub fn find_shared_data(&self, data: &Arc<GridData>) -> Option<Arc<GridData>> {
        let state = self.lock();
        for (_, grid) in state.strong.iter() {
            if Arc::ptr_eq(grid.data(), data) {
                // Already the same allocation, nothing to share
                return None;
            }
            if grid.data().bitwise_eq(data) {
                return Some(grid.data().clone());
            }
        }
        None
    }

    /// Number of strongly retained grids.
    pub fn len(&self) -> usize {
        self.lock().strong.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of grid data currently strongly retained.
    pub fn retained_bytes(&self) -> usize {
        self.lock().retained
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking loader must not wedge the cache for everyone else
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

// Insert into the strong layer and evict the oldest entries down to the
// byte budget. Evicted grids stay reachable through the weak map.
fn promote(state: &mut State, key: GridKey, grid: Arc<ShiftGrid>, budget: usize) {
    let bytes = grid.memory_bytes();
    if let Some(replaced) = state.strong.put(key, grid) {
        state.retained -= replaced.memory_bytes();
    }
    state.retained += bytes;
    while state.retained > budget && state.strong.len() > 1 {
        let Some((_, evicted)) = state.strong.pop_lru() else {
            break;
        };
        state.retained -= evicted.memory_bytes();
    }
    state.weak.retain(|_, w| w.strong_count() > 0);
}

// ----- T E S T S ------------------------------------------------------------------
