//! The search cache: maps foreign object descriptors to the identifier
//! sets found for them, indexed by finder configuration.
//!
//! Keys are held weakly, so a descriptor nobody references any more
//! drops out of the pool at the next sweep. A small MRU buffer keeps
//! strong references to the most recent queries, so results are not
//! lost to collection between two immediately successive searches.

use super::ObjectKind;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

/// How far a search may reach into the back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDomain {
    /// Declared identifiers only.
    CodeOnly,
    /// Identifiers and names.
    NameAndCode,
    /// Full scan of the authority data.
    Exhaustive,
}

impl SearchDomain {
    fn ordinal(&self) -> usize {
        match self {
            SearchDomain::CodeOnly => 0,
            SearchDomain::NameAndCode => 1,
            SearchDomain::Exhaustive => 2,
        }
    }
}

/// A finder configuration. Each distinct configuration owns one slot in
/// the per-key result array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinderConfig {
    pub domain: SearchDomain,
    pub ignore_axes: bool,
    pub single_match: bool,
}

// One slot per (domain, ignore_axes, single_match) combination
const CONFIGURATIONS: usize = 3 * 2 * 2;

impl FinderConfig {
    // Deterministic index of this configuration in the result array
    fn index(&self) -> usize {
        (self.domain.ordinal() * 2 + self.ignore_axes as usize) * 2 + self.single_match as usize
    }
}

/// A descriptor of an object defined outside this authority, used as a
/// search query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SearchTarget {
    pub kind: ObjectKind,
    pub name: String,
}

impl SearchTarget {
    pub fn new(kind: ObjectKind, name: &str) -> Arc<SearchTarget> {
        Arc::new(SearchTarget {
            kind,
            name: name.to_string(),
        })
    }
}

// Strong retention of the most recent queries
const MRU_RETENTION: usize = 16;

// Dead entries are purged every so many operations
const SWEEP_INTERVAL: usize = 64;

struct Entry {
    key: Weak<SearchTarget>,
    results: [Option<Arc<BTreeSet<String>>>; CONFIGURATIONS],
}

#[derive(Default)]
struct FindState {
    entries: Vec<Entry>,
    mru: VecDeque<Arc<SearchTarget>>,
    operations: usize,
}

/// The find pool itself.
#[derive(Default)]
pub(super) struct FindPool {
    state: Mutex<FindState>,
}

impl FindPool {
    pub fn get(
        &self,
        target: &Arc<SearchTarget>,
        config: FinderConfig,
    ) -> Option<Arc<BTreeSet<String>>> {
        let mut state = self.lock();
        state.maybe_sweep();
        let entry = state
            .entries
            .iter()
            .find(|e| e.key.upgrade().is_some_and(|k| Arc::ptr_eq(&k, target)))?;
        entry.results[config.index()].clone()
    }

    pub fn put(
        &self,
        target: &Arc<SearchTarget>,
        config: FinderConfig,
        results: Arc<BTreeSet<String>>,
    ) {
        let mut state = self.lock();
        state.maybe_sweep();
        state.retain_recent(target);
        let slot = config.index();
        for entry in &mut state.entries {
            if entry.key.upgrade().is_some_and(|k| Arc::ptr_eq(&k, target)) {
                entry.results[slot] = Some(results);
                return;
            }
        }
        let mut entry = Entry {
            key: Arc::downgrade(target),
            results: Default::default(),
        };
        entry.results[slot] = Some(results);
        state.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FindState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl FindState {
    // The periodic sweep standing in for the garbage collector:
    // entries whose key died since the last epoch are dropped
    fn maybe_sweep(&mut self) {
        self.operations += 1;
        if self.operations % SWEEP_INTERVAL != 0 {
            return;
        }
        self.entries.retain(|e| e.key.strong_count() > 0);
    }

    fn retain_recent(&mut self, target: &Arc<SearchTarget>) {
        self.mru.retain(|t| !Arc::ptr_eq(t, target));
        self.mru.push_front(target.clone());
        self.mru.truncate(MRU_RETENTION);
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: FinderConfig = FinderConfig {
        domain: SearchDomain::NameAndCode,
        ignore_axes: true,
        single_match: false,
    };

    #[test]
    fn configuration_indices_are_distinct() {
        let mut seen = std::collections::BTreeSet::new();
        for domain in [
            SearchDomain::CodeOnly,
            SearchDomain::NameAndCode,
            SearchDomain::Exhaustive,
        ] {
            for ignore_axes in [false, true] {
                for single_match in [false, true] {
                    let config = FinderConfig {
                        domain,
                        ignore_axes,
                        single_match,
                    };
                    assert!(config.index() < CONFIGURATIONS);
                    assert!(seen.insert(config.index()));
                }
            }
        }
        assert_eq!(seen.len(), CONFIGURATIONS);
    }

    #[test]
    fn results_are_stored_per_configuration() {
        let pool = FindPool::default();
        let target = SearchTarget::new(ObjectKind::CoordinateReferenceSystem, "WGS 84");

        let results = Arc::new(BTreeSet::from(["4326".to_string()]));
        pool.put(&target, CONFIG, results.clone());

        assert!(Arc::ptr_eq(&pool.get(&target, CONFIG).unwrap(), &results));

        // A different configuration is a different slot
        let other = FinderConfig {
            single_match: true,
            ..CONFIG
        };
        assert!(pool.get(&target, other).is_none());
    }

    #[test]
    fn dead_keys_are_swept() {
        let pool = FindPool::default();
        let target = SearchTarget::new(ObjectKind::Datum, "ephemeral");
        pool.put(&target, CONFIG, Arc::new(BTreeSet::new()));
        assert_eq!(pool.len(), 1);
        drop(target);

        // Flush "ephemeral" out of the MRU retention buffer, so its
        // only remaining reference is the weak key
        let keepalive: Vec<_> = (0..MRU_RETENTION)
            .map(|i| SearchTarget::new(ObjectKind::Datum, &format!("keepalive {i}")))
            .collect();
        for t in &keepalive {
            pool.put(t, CONFIG, Arc::new(BTreeSet::new()));
        }

        // Enough operations to trigger the periodic sweep
        for _ in 0..=SWEEP_INTERVAL {
            pool.get(&keepalive[0], CONFIG);
        }
        assert_eq!(pool.len(), MRU_RETENTION);
    }

    #[test]
    fn recent_queries_survive_in_the_mru_buffer() {
        let pool = FindPool::default();
        {
            let state = pool.lock();
            assert_eq!(state.mru.len(), 0);
        }
        let target = SearchTarget::new(ObjectKind::Ellipsoid, "GRS 1980");
        pool.put(&target, CONFIG, Arc::new(BTreeSet::new()));
        let state = pool.lock();
        assert_eq!(state.mru.len(), 1);
        assert!(Arc::ptr_eq(&state.mru[0], &target));
    }
}
