//! A concurrent cache of authoritatively defined geodetic objects,
//! fronting a bounded pool of non-thread-safe data-access sessions.
//!
//! The cache guarantees that concurrent requests for the same
//! (kind, code) pair trigger exactly one back-end creation, and that a
//! request observing a completed one returns the same object instance.

mod find;
mod pool;

pub use find::{FinderConfig, SearchDomain, SearchTarget};
pub use pool::{SessionLease, SessionPool, TIMEOUT_RESOLUTION};

use crate::Error;
use lru::LruCache;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// A cached geodetic object. Callers downcast to the concrete type they
/// asked the back end for.
pub type SharedObject = Arc<dyn Any + Send + Sync>;

/// The kinds of objects an authority defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    CoordinateReferenceSystem,
    CoordinateSystem,
    Datum,
    Ellipsoid,
    PrimeMeridian,
    Operation,
    Unit,
}

/// One back-end data-access session. Not thread-safe: a session is
/// leased to one thread at a time by the pool.
pub trait AccessSession: Send {
    /// Create the object registered under `code`.
    fn create(&mut self, kind: ObjectKind, code: &str) -> Result<SharedObject, Error>;

    /// Search for the identifiers matching a foreign object.
    fn find(
        &mut self,
        target: &SearchTarget,
        config: FinderConfig,
    ) -> Result<BTreeSet<String>, Error>;

    /// Release any resources the session holds.
    fn close(&mut self) -> Result<(), Error>;
}

/// The back end itself: creates sessions on demand.
pub trait SessionProvider: Send + Sync {
    fn new_session(&self) -> Result<Box<dyn AccessSession>, Error>;
}

// ----- T H E   A U T H O R I T Y   C A C H E -----------------------------------------

type Key = (ObjectKind, String);

const STRIPES: usize = 64;
const DEFAULT_STRONG_CAPACITY: usize = 256;

struct Objects {
    strong: LruCache<Key, SharedObject>,
    weak: HashMap<Key, Weak<dyn Any + Send + Sync>>,
    capacity: usize,
}

/// The concurrent object cache.
pub struct AuthorityCache {
    pool: SessionPool,
    objects: Mutex<Objects>,
    // Creation locks: threads creating the same key serialize here
    stripes: Vec<Mutex<()>>,
    find_pool: find::FindPool,
}

impl AuthorityCache {
    pub fn new(provider: Box<dyn SessionProvider>, max_concurrent_sessions: usize) -> AuthorityCache {
        Self::with_capacity(provider, max_concurrent_sessions, DEFAULT_STRONG_CAPACITY)
    }

    /// As [AuthorityCache::new], with an explicit bound on the number of
    /// strongly retained objects. Objects beyond the bound remain
    /// reachable through weak references for as long as callers hold
    /// them.
    pub fn with_capacity(
        provider: Box<dyn SessionProvider>,
        max_concurrent_sessions: usize,
        strong_capacity: usize,
    ) -> AuthorityCache {
        AuthorityCache {
            pool: SessionPool::new(provider, max_concurrent_sessions),
            objects: Mutex::new(Objects {
                strong: LruCache::unbounded(),
                weak: HashMap::new(),
                capacity: strong_capacity.max(1),
            }),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            find_pool: find::FindPool::default(),
        }
    }

    /// The underlying session pool, e.g. for adjusting the idle timeout.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Change the idle timeout of pooled sessions. Takes effect for
    /// subsequent idle checks.
    pub fn set_timeout(&self, timeout: Duration) {
        self.pool.set_timeout(timeout);
    }

    /// The object registered under `code`. Concurrent calls for the
    /// same (kind, normalized code) trigger exactly one back-end
    /// creation; everybody receives the same instance.
    pub fn create(&self, kind: ObjectKind, code: &str) -> Result<SharedObject, Error> {
        let key = (kind, normalize_code(code));
        if let Some(object) = self.cached(&key) {
            return Ok(object);
        }

        // Serialize creations per key: other threads observing the same
        // key block on the same stripe
        let stripe = &self.stripes[stripe_of(&key)];
        let _guard = stripe.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(object) = self.cached(&key) {
            return Ok(object);
        }

        let lease = self.pool.lease()?;
        let object = lease.with(|session| session.create(kind, &key.1));
        drop(lease);
        let object = object?;
        if self.is_cacheable(&key.1, &object) {
            self.store(key, object.clone());
        }
        Ok(object)
    }

    /// The identifiers matching a foreign object descriptor, from the
    /// find pool or from the back end.
    pub fn find_matches(
        &self,
        target: &Arc<SearchTarget>,
        config: FinderConfig,
    ) -> Result<Arc<BTreeSet<String>>, Error> {
        if let Some(results) = self.find_pool.get(target, config) {
            return Ok(results);
        }
        let lease = self.pool.lease()?;
        let found = lease.with(|session| session.find(target, config));
        drop(lease);
        // Copied into an immutable set: the pool must never retain a
        // back end's lazy iterator
        let results = Arc::new(found?);
        self.find_pool.put(target, config, results.clone());
        Ok(results)
    }

    /// Close every idle session. Leased sessions are preserved, and the
    /// cache remains usable afterwards.
    pub fn close(&self) -> Result<(), Error> {
        self.pool.close_idle()
    }

    /// Number of objects currently strongly retained.
    pub fn len(&self) -> usize {
        self.lock_objects().strong.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Codes which should not be retained would be rejected here; the
    // default authority retains everything it creates
    fn is_cacheable(&self, _code: &str, _object: &SharedObject) -> bool {
        true
    }

    fn cached(&self, key: &Key) -> Option<SharedObject> {
        let mut objects = self.lock_objects();
        if let Some(object) = objects.strong.get(key) {
            return Some(object.clone());
        }
        if let Some(object) = objects.weak.get(key).and_then(Weak::upgrade) {
            let object: SharedObject = object;
            objects.promote(key.clone(), object.clone());
            return Some(object);
        }
        None
    }

    fn store(&self, key: Key, object: SharedObject) {
        let mut objects = self.lock_objects();
        objects.weak.insert(key.clone(), Arc::downgrade(&object));
        objects.promote(key, object);
    }

    fn lock_objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Objects {
    // Insert into the strong layer, demoting the least recently used
    // entries to weak references beyond the capacity
    fn promote(&mut self, key: Key, object: SharedObject) {
        self.strong.put(key, object);
        while self.strong.len() > self.capacity {
            if self.strong.pop_lru().is_none() {
                break;
            }
        }
        self.weak.retain(|_, w| w.strong_count() > 0);
    }
}

// Strip any namespace prefix ("EPSG:4326", "urn:ogc:def:crs:EPSG::4326")
// and surrounding whitespace
fn normalize_code(code: &str) -> String {
    let trimmed = code.trim();
    match trimmed.rsplit(':').next() {
        Some(tail) => tail.trim().to_string(),
        None => trimmed.to_string(),
    }
}

fn stripe_of(key: &Key) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % STRIPES as u64) as usize
}

// ----- T E S T S ------------------------------------------------------------------
