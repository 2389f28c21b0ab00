//! A bounded pool of non-thread-safe data-access sessions.
//!
//! Sessions are leased to one thread at a time. Within a thread, leases
//! are reentrant: a nested request returns the session already held,
//! and the session only goes back to the pool when the outermost lease
//! is dropped. Idle sessions are closed by a deferred sweeper task once
//! they have been unused for longer than the configured timeout.

use super::{AccessSession, SessionProvider};
use crate::diagnostic::{Diagnostic, Severity};
use crate::Error;
use log::warn;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Granularity of the idle sweeps, and of the safety poll performed by
/// threads waiting for a session slot.
pub const TIMEOUT_RESOLUTION: Duration = Duration::from_millis(200);

// How long a lease request may wait on an exhausted pool before
// giving up
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct IdleSession {
    session: Box<dyn AccessSession>,
    released_at: Instant,
}

struct PoolState {
    idle: Vec<IdleSession>,
    /// How many more sessions may still be created before the
    /// `max_concurrent` bound is reached.
    remaining: usize,
    sweeper_scheduled: bool,
}

struct PoolInner {
    /// Identity of this pool: the key of the per-thread reentrancy slot.
    id: Uuid,
    provider: Box<dyn SessionProvider>,
    state: Mutex<PoolState>,
    available: Condvar,
    /// Idle timeout in nanoseconds; settable while the pool is running.
    timeout: AtomicU64,
}

/// The session pool. Cloning shares the same underlying pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SessionPool")
            .field("id", &self.inner.id)
            .field("idle", &state.idle.len())
            .field("remaining", &state.remaining)
            .finish()
    }
}

// The sessions currently leased by this thread, one slot per pool
thread_local! {
    static LEASED: RefCell<HashMap<Uuid, ActiveLease>> = RefCell::new(HashMap::new());
}

struct ActiveLease {
    session: Rc<RefCell<Box<dyn AccessSession>>>,
    depth: usize,
}

impl SessionPool {
    pub fn new(provider: Box<dyn SessionProvider>, max_concurrent: usize) -> SessionPool {
        SessionPool {
            inner: Arc::new(PoolInner {
                id: Uuid::new_v4(),
                provider,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    remaining: max_concurrent.max(1),
                    sweeper_scheduled: false,
                }),
                available: Condvar::new(),
                timeout: AtomicU64::new(DEFAULT_IDLE_TIMEOUT.as_nanos() as u64),
            }),
        }
    }

    /// Change the idle timeout. Takes effect for subsequent idle checks.
    pub fn set_timeout(&self, timeout: Duration) {
        let nanos = timeout.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.timeout.store(nanos.max(1), Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.timeout.load(Ordering::Relaxed))
    }

    /// Number of sessions currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Lease a session. Reentrant: when this thread already holds one,
    /// the same session is returned and a depth counter incremented.
    pub fn lease(&self) -> Result<SessionLease, Error> {
        let reentered = LEASED.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(lease) = slots.get_mut(&self.inner.id) {
                lease.depth += 1;
                return true;
            }
            false
        });
        if reentered {
            return Ok(SessionLease {
                pool: self.clone(),
                _pinned: std::marker::PhantomData,
            });
        }

        let session = self.acquire()?;
        LEASED.with(|slots| {
            slots.borrow_mut().insert(
                self.inner.id,
                ActiveLease {
                    session: Rc::new(RefCell::new(session)),
                    depth: 1,
                },
            );
        });
        Ok(SessionLease {
            pool: self.clone(),
            _pinned: std::marker::PhantomData,
        })
    }

    // Take an idle session, or create one if the bound allows, or wait
    // on the condition variable with a safety poll
    fn acquire(&self) -> Result<Box<dyn AccessSession>, Error> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        let mut state = self.inner.lock();
        loop {
            if let Some(idle) = state.idle.pop() {
                return Ok(idle.session);
            }
            if state.remaining > 0 {
                state.remaining -= 1;
                drop(state);
                // Creation happens outside the monitor. On failure the
                // slot is restored: no session may leak
                return match self.inner.provider.new_session() {
                    Ok(session) => Ok(session),
                    Err(e) => {
                        self.inner.lock().remaining += 1;
                        self.inner.available.notify_one();
                        Err(e)
                    }
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Unavailable(
                    "no data-access session became available".to_string(),
                ));
            }
            let wait = TIMEOUT_RESOLUTION.min(deadline - now);
            state = match self.inner.available.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poison) => poison.into_inner().0,
            };
        }
    }

    // Outermost lease dropped: move the session back to the idle list
    // and make sure a sweeper will eventually close it
    fn release(&self) {
        let finished = LEASED.with(|slots| {
            let mut slots = slots.borrow_mut();
            let Some(lease) = slots.get_mut(&self.inner.id) else {
                return None;
            };
            lease.depth -= 1;
            if lease.depth > 0 {
                return None;
            }
            slots.remove(&self.inner.id)
        });
        let Some(lease) = finished else {
            return;
        };
        let Ok(cell) = Rc::try_unwrap(lease.session) else {
            // A with() call still holds the session; cannot happen from
            // safe code, but better to leak than to wedge the pool
            return;
        };

        let schedule = {
            let mut state = self.inner.lock();
            state.idle.push(IdleSession {
                session: cell.into_inner(),
                released_at: Instant::now(),
            });
            let schedule = !state.sweeper_scheduled;
            state.sweeper_scheduled = true;
            schedule
        };
        self.inner.available.notify_one();
        if schedule {
            let inner = self.inner.clone();
            std::thread::spawn(move || sweep(inner));
        }
    }

    /// Close every idle session. Sessions currently leased are
    /// untouched, and the pool remains usable: new sessions will be
    /// created on demand. The first close error is returned, with any
    /// further ones attached.
    pub fn close_idle(&self) -> Result<(), Error> {
        let idle = {
            let mut state = self.inner.lock();
            std::mem::take(&mut state.idle)
        };
        let mut errors = Vec::new();
        for mut idle in idle {
            if let Err(e) = idle.session.close() {
                errors.push(e);
            }
            self.inner.lock().remaining += 1;
            self.inner.available.notify_one();
        }
        collect_close_errors(errors)
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn collect_close_errors(mut errors: Vec<Error>) -> Result<(), Error> {
    if errors.is_empty() {
        return Ok(());
    }
    let first = errors.remove(0);
    if errors.is_empty() {
        return Err(first);
    }
    Err(Error::Factory {
        message: first.to_string(),
        warnings: errors
            .into_iter()
            .map(|e| Diagnostic {
                severity: Severity::Error,
                message: e.to_string(),
            })
            .collect(),
    })
}

// The deferred close-expired task: sleeps until the oldest idle session
// reaches the timeout, closes every expired one, and reschedules itself
// for as long as any session remains idle
fn sweep(inner: Arc<PoolInner>) {
    loop {
        let timeout = Duration::from_nanos(inner.timeout.load(Ordering::Relaxed));
        let sleep_for = {
            let mut state = inner.lock();
            match state.idle.iter().map(|s| s.released_at).min() {
                None => {
                    state.sweeper_scheduled = false;
                    return;
                }
                Some(oldest) => (oldest + timeout).saturating_duration_since(Instant::now()),
            }
        };
        if !sleep_for.is_zero() {
            std::thread::sleep(sleep_for.min(TIMEOUT_RESOLUTION.max(timeout)));
            continue;
        }

        // Deadline reached: close everything that expired
        let expired = {
            let mut state = inner.lock();
            let now = Instant::now();
            let timeout = Duration::from_nanos(inner.timeout.load(Ordering::Relaxed));
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|s| now.duration_since(s.released_at) >= timeout);
            state.idle = kept;
            state.remaining += expired.len();
            expired
        };
        for _ in 0..expired.len() {
            inner.available.notify_one();
        }
        for mut idle in expired {
            // Background cleanup failures are logged and swallowed
            if let Err(e) = idle.session.close() {
                warn!("failed to close an expired session: {e}");
            }
        }
    }
}

// ----- T H E   L E A S E   G U A R D -------------------------------------------------

/// A leased session. Dropping the guard decrements the reentrancy depth
/// and, at depth zero, returns the session to the pool.
///
/// Leases are bound to the thread that took them, and therefore not
/// `Send`: the session itself lives in thread-local storage.
pub struct SessionLease {
    pool: SessionPool,
    _pinned: std::marker::PhantomData<Rc<()>>,
}

impl SessionLease {
    /// Run `f` against the leased session.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn AccessSession) -> R) -> R {
        let session = LEASED.with(|slots| {
            slots
                .borrow()
                .get(&self.pool.inner.id)
                .map(|lease| lease.session.clone())
                // The slot is populated for the lifetime of the lease
                .expect("session lease without a thread-local slot")
        });
        let mut session = session.borrow_mut();
        f(session.as_mut())
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.release();
    }
}

// ----- T E S T S ------------------------------------------------------------------
