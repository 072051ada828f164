//! Synchronous wrappers for callers without an async runtime.
//!
//! Each wrapper owns (or shares) a multi-threaded tokio runtime and drives
//! the async type on it with `block_on`. The channel reader task keeps
//! running on the runtime's workers between calls, so ordering and
//! correlation behave exactly as in the async API.
//!
//! These types must not be used from inside an async context. Every call
//! checks for that and returns `InvalidRequest` instead of panicking.
//! Dropping one there is tolerated: nothing is closed synchronously, and if
//! it held the last handle on its runtime, the runtime is shut down in the
//! background.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::warn;

use kernelgate_types::{ExecutionResult, KernelIdentity, KernelSpec};

use crate::error::GatewayError;
use crate::gateway::KernelLifecycle;
use crate::pool::{self, PoolConfig, PoolStats};
use crate::session::{self, KernelSession, SessionOptions, SessionState};

/// A share of the runtime a blocking wrapper drives its async type on.
#[derive(Clone)]
struct SharedRuntime(Option<Arc<Runtime>>);

impl SharedRuntime {
    fn build() -> Result<Self, GatewayError> {
        ensure_outside_runtime()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("kernelgate-blocking")
            .enable_all()
            .build()?;
        Ok(Self(Some(Arc::new(runtime))))
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, GatewayError> {
        ensure_outside_runtime()?;
        let runtime = self
            .0
            .as_ref()
            .ok_or_else(|| GatewayError::InvalidRequest("blocking runtime already shut down".into()))?;
        Ok(runtime.block_on(fut))
    }
}

impl Drop for SharedRuntime {
    fn drop(&mut self) {
        let Some(runtime) = self.0.take() else {
            return;
        };
        if Handle::try_current().is_err() {
            return;
        }
        // A runtime can't be dropped where blocking is forbidden.
        if let Some(runtime) = Arc::into_inner(runtime) {
            runtime.shutdown_background();
        }
    }
}

fn ensure_outside_runtime() -> Result<(), GatewayError> {
    if Handle::try_current().is_ok() {
        return Err(GatewayError::InvalidRequest(
            "blocking API called from within an async runtime".into(),
        ));
    }
    Ok(())
}


// ============================================================================
// Session
// ============================================================================

/// Blocking counterpart of [`crate::Session`].
pub struct Session {
    inner: session::Session,
    runtime: SharedRuntime,
}

impl Session {
    /// Launch a kernel and wait until it is ready.
    pub fn open(
        lifecycle: Arc<dyn KernelLifecycle>,
        spec: KernelSpec,
        options: SessionOptions,
    ) -> Result<Self, GatewayError> {
        let runtime = SharedRuntime::build()?;
        let inner = runtime.block_on(session::Session::open(lifecycle, spec, options))??;
        Ok(Self { inner, runtime })
    }

    pub fn kernel(&self) -> &KernelIdentity {
        self.inner.identity()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        self.runtime.block_on(self.inner.execute(code, timeout))?
    }

    pub fn execute_default(&mut self, code: &str) -> Result<ExecutionResult, GatewayError> {
        self.runtime.block_on(self.inner.execute_default(code))?
    }

    pub fn interrupt(&self) -> Result<(), GatewayError> {
        self.runtime.block_on(self.inner.interrupt())?
    }

    /// Shut the kernel down. Idempotent.
    pub fn close(&mut self) -> Result<(), GatewayError> {
        self.runtime.block_on(self.inner.close())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Err(e) = self.runtime.block_on(self.inner.close()) {
            warn!(error = %e, "blocking session dropped inside a runtime; closing in the background");
        }
    }
}

// ============================================================================
// SessionPool
// ============================================================================

/// Blocking counterpart of [`crate::SessionPool`]. Leases share its runtime.
pub struct SessionPool {
    inner: pool::SessionPool,
    runtime: SharedRuntime,
}

impl SessionPool {
    pub fn new(lifecycle: Arc<dyn KernelLifecycle>, config: PoolConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            inner: pool::SessionPool::new(lifecycle, config),
            runtime: SharedRuntime::build()?,
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn acquire(&self, spec: &KernelSpec) -> Result<PooledSession, GatewayError> {
        let lease = self.runtime.block_on(self.inner.acquire(spec))??;
        Ok(PooledSession {
            lease: Some(lease),
            runtime: self.runtime.clone(),
        })
    }

    pub fn prewarm(&self, spec: &KernelSpec, count: usize) -> Result<usize, GatewayError> {
        self.runtime.block_on(self.inner.prewarm(spec, count))?
    }

    pub fn evict_idle(&self) -> Result<usize, GatewayError> {
        self.runtime.block_on(self.inner.evict_idle())
    }

    /// Close idle sessions and refuse further acquires. Idempotent.
    pub fn shutdown(&self) -> Result<(), GatewayError> {
        self.runtime.block_on(self.inner.shutdown())
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "blocking pool dropped inside a runtime; idle sessions not closed");
        }
    }
}

/// A leased session from a blocking [`SessionPool`].
pub struct PooledSession {
    lease: Option<pool::PooledSession>,
    runtime: SharedRuntime,
}

impl PooledSession {
    pub fn kernel(&self) -> Option<&KernelIdentity> {
        self.lease.as_ref().map(|l| l.kernel())
    }

    pub fn state(&self) -> SessionState {
        self.lease.as_ref().map_or(SessionState::Closed, |l| l.state())
    }

    pub fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        let lease = self.lease.as_mut().ok_or(GatewayError::ChannelClosed)?;
        self.runtime.block_on(lease.execute(code, timeout))?
    }

    /// Return the session to the pool.
    pub fn release(mut self) -> Result<(), GatewayError> {
        self.give_back()
    }

    fn give_back(&mut self) -> Result<(), GatewayError> {
        match self.lease.take() {
            Some(lease) => self.runtime.block_on(lease.release()),
            None => Ok(()),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Err(e) = self.give_back() {
            warn!(error = %e, "blocking lease dropped inside a runtime");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;
    use crate::pool::ExhaustionPolicy;
    use crate::retry::RetryPolicy;

    fn options() -> SessionOptions {
        SessionOptions::default()
            .with_startup_timeout(Duration::from_secs(2))
            .with_retry(RetryPolicy::none())
    }

    #[test]
    fn test_blocking_execute() {
        let gateway = MockGateway::new();
        let mut session = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options()).unwrap();

        let result = session.execute("print(hello)", Duration::from_secs(2)).unwrap();
        assert_eq!(result.stdout(), "hello\n");
        assert_eq!(session.state(), SessionState::Ready);

        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(gateway.shutdowns(), 1);
    }

    #[test]
    fn test_blocking_timeout_taints_session() {
        let gateway = MockGateway::new();
        let mut session = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options()).unwrap();

        let err = session.execute("hang", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, GatewayError::ExecutionTimeout(_)));
        assert!(matches!(
            session.execute("1", Duration::from_secs(1)),
            Err(GatewayError::ChannelClosed)
        ));
    }

    #[test]
    fn test_drop_closes_kernel() {
        let gateway = MockGateway::new();
        let session = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options()).unwrap();
        drop(session);
        assert_eq!(gateway.shutdowns(), 1);
    }

    #[test]
    fn test_blocking_pool_reuses_released_session() {
        let gateway = MockGateway::new();
        let config = PoolConfig {
            max_sessions: 1,
            on_exhausted: ExhaustionPolicy::Fail,
            session: options(),
            ..PoolConfig::default()
        };
        let pool = SessionPool::new(gateway.lifecycle(), config).unwrap();
        let spec = KernelSpec::new("python3");

        let mut lease = pool.acquire(&spec).unwrap();
        assert!(matches!(pool.acquire(&spec), Err(GatewayError::PoolExhausted { capacity: 1 })));
        assert_eq!(lease.execute("2+2", Duration::from_secs(1)).unwrap().return_value, Some(serde_json::json!(4)));
        lease.release().unwrap();

        let again = pool.acquire(&spec).unwrap();
        assert_eq!(gateway.launches(), 1);
        drop(again);
        assert_eq!(pool.stats().idle, 1);

        pool.shutdown().unwrap();
        assert_eq!(gateway.shutdowns(), 1);
    }

    fn async_context() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn test_session_dropped_inside_a_runtime() {
        let gateway = MockGateway::new();
        let session = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options()).unwrap();

        async_context().block_on(async move {
            drop(session);
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(gateway.shutdowns(), 1);
    }

    #[test]
    fn test_pool_and_lease_dropped_inside_a_runtime() {
        let gateway = MockGateway::new();
        let config = PoolConfig {
            max_sessions: 1,
            on_exhausted: ExhaustionPolicy::Fail,
            session: options(),
            ..PoolConfig::default()
        };
        let pool = SessionPool::new(gateway.lifecycle(), config).unwrap();
        let lease = pool.acquire(&KernelSpec::new("python3")).unwrap();

        async_context().block_on(async move {
            drop(pool);
            drop(lease);
        });
        assert_eq!(gateway.launches(), 1);
    }

    #[tokio::test]
    async fn test_refuses_inside_runtime() {
        let gateway = MockGateway::new();
        let result = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options());
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }
}
