//! Bounded pool of live sessions, keyed by kernel spec.
//!
//! ```text
//! SessionPool ── Mutex<PoolState> ──┬── entry 0  python3  idle    Session
//!      │                            ├── entry 1  python3  leased  (held by PooledSession)
//!      │                            └── entry 2  ir       opening (reserved slot)
//!      └── Notify  (wakes waiting acquirers on release / failed open / shutdown)
//! ```
//!
//! Every entry transition (scan, mark in-use, reserve, evict) happens under
//! the one pool mutex, so two acquirers can never be handed the same idle
//! session. Slow work (launching a kernel, closing one) happens outside the
//! lock against a reserved slot.
//!
//! A lease ([`PooledSession`]) owns its session exclusively until it is
//! released or dropped. Sessions that come back in `Error`, `Closed`, or
//! mid-execute are evicted and shut down instead of returning to the idle
//! set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use kernelgate_types::{ExecutionResult, KernelIdentity, KernelSpec};

use crate::constants::{DEFAULT_POOL_ACQUIRE_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_SESSIONS};
use crate::error::GatewayError;
use crate::gateway::KernelLifecycle;
use crate::session::{KernelSession, Session, SessionOptions, SessionState};

/// What `acquire` does when every slot is taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Fail immediately with `PoolExhausted`.
    Fail,
    /// Wait up to `timeout` for a release, then fail with `PoolExhausted`.
    Wait { timeout: Duration },
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::Wait {
            timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
        }
    }
}

/// Pool sizing and session options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Live sessions across all specs, including leased and opening ones.
    pub max_sessions: usize,
    /// Idle sessions older than this are shut down on the next acquire.
    pub idle_timeout: Duration,
    pub on_exhausted: ExhaustionPolicy,
    pub session: SessionOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_POOL_MAX_SESSIONS,
            idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            on_exhausted: ExhaustionPolicy::default(),
            session: SessionOptions::default(),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolEntry {
    id: u64,
    spec: KernelSpec,
    /// `None` while leased or while the session is being opened.
    session: Option<Session>,
    in_use: bool,
    last_used: Instant,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        !self.in_use && self.session.is_some()
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    shut_down: bool,
    next_id: u64,
}

impl PoolState {
    fn reserve(&mut self, spec: &KernelSpec) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(PoolEntry {
            id,
            spec: spec.clone(),
            session: None,
            in_use: true,
            last_used: Instant::now(),
        });
        id
    }

    fn remove(&mut self, id: u64) -> Option<PoolEntry> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.swap_remove(idx))
    }

    /// Drop idle entries unused for longer than `idle_timeout`.
    fn take_expired(&mut self, idle_timeout: Duration) -> Vec<Session> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.retain_mut(|e| {
            if e.is_idle() && now.duration_since(e.last_used) > idle_timeout {
                expired.extend(e.session.take());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove the least-recently-used idle entry whose spec differs from `spec`.
    fn take_lru_other(&mut self, spec: &KernelSpec) -> Option<Session> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_idle() && &e.spec != spec)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(idx, _)| idx)?;
        self.entries.swap_remove(idx).session
    }

    fn stats(&self) -> PoolStats {
        let idle = self.entries.iter().filter(|e| e.is_idle()).count();
        PoolStats {
            total: self.entries.len(),
            idle,
            in_use: self.entries.len() - idle,
        }
    }
}

struct PoolInner {
    lifecycle: Arc<dyn KernelLifecycle>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolInner {
    /// Return a session to the pool. Gives the session back when it must be
    /// closed instead (dead, mid-execute, evicted, or pool shut down).
    fn check_in(&self, entry_id: u64, session: Session) -> Option<Session> {
        let to_close = {
            let mut state = self.state.lock();
            if state.shut_down {
                Some(session)
            } else if session.state() != SessionState::Ready {
                debug!(kernel_id = %session.identity().id, state = %session.state(), "evicting session");
                state.remove(entry_id);
                Some(session)
            } else if let Some(entry) = state.entries.iter_mut().find(|e| e.id == entry_id) {
                entry.session = Some(session);
                entry.in_use = false;
                entry.last_used = Instant::now();
                None
            } else {
                Some(session)
            }
        };
        self.released.notify_waiters();
        to_close
    }

    fn cancel_reservation(&self, entry_id: u64) {
        self.state.lock().remove(entry_id);
        self.released.notify_waiters();
    }
}

/// Frees a reserved slot if the open it guards doesn't complete, including
/// when the acquiring future is dropped.
struct Reservation {
    pool: Arc<PoolInner>,
    entry_id: u64,
    armed: bool,
}

impl Reservation {
    /// Reserve a slot for `spec`. Call with the pool lock held.
    fn new(pool: &Arc<PoolInner>, state: &mut PoolState, spec: &KernelSpec) -> Self {
        Self {
            pool: Arc::clone(pool),
            entry_id: state.reserve(spec),
            armed: true,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_reservation(self.entry_id);
        }
    }
}

/// What an acquire attempt decided under the lock. The lease and the
/// reservation are armed before the lock is released, so dropping the
/// acquire at any later await hands the slot back.
enum Step {
    Reuse(PooledSession),
    Open(Reservation),
    Full,
}

/// A bounded, explicitly scoped pool of kernel sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(lifecycle: Arc<dyn KernelLifecycle>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                lifecycle,
                config,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats()
    }

    /// Lease a ready session for `spec`, reusing an idle one when possible.
    #[instrument(name = "pool.acquire", skip(self, spec), fields(kernel = %spec.name))]
    pub async fn acquire(&self, spec: &KernelSpec) -> Result<PooledSession, GatewayError> {
        let capacity = self.inner.config.max_sessions;
        let deadline = match self.inner.config.on_exhausted {
            ExhaustionPolicy::Fail => None,
            ExhaustionPolicy::Wait { timeout } => Some(Instant::now() + timeout),
        };

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, to_close) = {
                let mut state = self.inner.state.lock();
                if state.shut_down {
                    return Err(GatewayError::PoolShutdown);
                }
                let mut to_close = state.take_expired(self.inner.config.idle_timeout);

                let reusable = state
                    .entries
                    .iter_mut()
                    .find(|e| {
                        !e.in_use
                            && &e.spec == spec
                            && e.session.as_ref().is_some_and(|s| s.state() == SessionState::Ready)
                    })
                    .and_then(|entry| {
                        let session = entry.session.take()?;
                        entry.in_use = true;
                        entry.last_used = Instant::now();
                        Some((entry.id, session))
                    });
                let step = if let Some((entry_id, session)) = reusable {
                    Step::Reuse(PooledSession::new(Arc::clone(&self.inner), entry_id, session))
                } else if state.entries.len() < capacity {
                    Step::Open(Reservation::new(&self.inner, &mut state, spec))
                } else if let Some(victim) = state.take_lru_other(spec) {
                    to_close.push(victim);
                    Step::Open(Reservation::new(&self.inner, &mut state, spec))
                } else {
                    Step::Full
                };
                (step, to_close)
            };

            close_all(to_close).await;

            match step {
                Step::Reuse(lease) => {
                    debug!(kernel_id = %lease.identity.id, "reusing idle session");
                    return Ok(lease);
                }
                Step::Open(reservation) => {
                    let entry_id = reservation.entry_id;
                    let session = self.open_reserved(reservation, spec).await?;
                    return Ok(PooledSession::new(Arc::clone(&self.inner), entry_id, session));
                }
                Step::Full => {
                    let Some(deadline) = deadline else {
                        return Err(GatewayError::PoolExhausted { capacity });
                    };
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(capacity, "timed out waiting for a pooled session");
                        return Err(GatewayError::PoolExhausted { capacity });
                    }
                }
            }
        }
    }

    async fn open_reserved(&self, mut reservation: Reservation, spec: &KernelSpec) -> Result<Session, GatewayError> {
        let mut session = Session::open(
            Arc::clone(&self.inner.lifecycle),
            spec.clone(),
            self.inner.config.session.clone(),
        )
        .await?;
        let shut_down = self.inner.state.lock().shut_down;
        if shut_down {
            debug!(kernel_id = %session.identity().id, "pool shut down while opening; closing new session");
            session.close().await;
            return Err(GatewayError::PoolShutdown);
        }
        reservation.armed = false;
        info!(kernel_id = %session.identity().id, "pooled session opened");
        Ok(session)
    }

    /// Return a leased session. Same as [`PooledSession::release`].
    pub async fn release(&self, lease: PooledSession) {
        lease.release().await;
    }

    /// Open up to `count` idle sessions for `spec` ahead of demand, bounded
    /// by free capacity. Returns how many were opened; fails only if every
    /// attempt failed.
    #[instrument(name = "pool.prewarm", skip(self, spec), fields(kernel = %spec.name))]
    pub async fn prewarm(&self, spec: &KernelSpec, count: usize) -> Result<usize, GatewayError> {
        let reserved: Vec<Reservation> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(GatewayError::PoolShutdown);
            }
            let free = self.inner.config.max_sessions.saturating_sub(state.entries.len());
            (0..count.min(free))
                .map(|_| Reservation::new(&self.inner, &mut state, spec))
                .collect()
        };
        if reserved.is_empty() {
            return Ok(0);
        }

        // Each opened session is checked in before its future yields again.
        let attempts = reserved.into_iter().map(|reservation| async move {
            let id = reservation.entry_id;
            let session = self.open_reserved(reservation, spec).await?;
            let kept = match self.inner.check_in(id, session) {
                Some(mut rejected) => {
                    rejected.close().await;
                    false
                }
                None => true,
            };
            Ok::<bool, GatewayError>(kept)
        });
        let outcomes = futures::future::join_all(attempts).await;

        let mut opened = 0;
        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(true) => opened += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "prewarm open failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if opened == 0 => Err(e),
            _ => Ok(opened),
        }
    }

    /// Shut down idle sessions past the idle timeout. Returns how many.
    pub async fn evict_idle(&self) -> usize {
        let expired = self.inner.state.lock().take_expired(self.inner.config.idle_timeout);
        let n = expired.len();
        close_all(expired).await;
        n
    }

    /// Close every idle session and refuse further acquires. Leased
    /// sessions are closed when they come back. Idempotent.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.entries.drain(..).filter_map(|e| e.session).collect()
        };
        self.inner.released.notify_waiters();
        info!(sessions = sessions.len(), "session pool shutting down");
        close_all(sessions).await;
    }
}

async fn close_all(sessions: Vec<Session>) {
    for mut session in sessions {
        session.close().await;
    }
}

/// An exclusively held session from a [`SessionPool`].
///
/// Release it explicitly with [`PooledSession::release`]; dropping it also
/// returns it to the pool, but a session that must be shut down is then
/// closed in the background.
pub struct PooledSession {
    pool: Arc<PoolInner>,
    entry_id: u64,
    identity: KernelIdentity,
    session: Option<Session>,
}

impl PooledSession {
    fn new(pool: Arc<PoolInner>, entry_id: u64, session: Session) -> Self {
        Self {
            pool,
            entry_id,
            identity: session.identity().clone(),
            session: Some(session),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Give the session back to the pool, or shut it down if it is unusable.
    pub async fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(mut dead) = self.pool.check_in(self.entry_id, session) {
            dead.close().await;
        }
    }
}

#[async_trait]
impl KernelSession for PooledSession {
    fn kernel(&self) -> &KernelIdentity {
        &self.identity
    }

    fn state(&self) -> SessionState {
        self.session.as_ref().map_or(SessionState::Closed, Session::state)
    }

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        match self.session.as_mut() {
            Some(session) => session.execute(code, timeout).await,
            None => Err(GatewayError::ChannelClosed),
        }
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some(mut dead) = self.pool.check_in(self.entry_id, session) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { dead.close().await });
            }
            Err(_) => warn!(kernel_id = %self.identity.id, "lease dropped outside a runtime; session not closed"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
