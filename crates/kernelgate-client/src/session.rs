//! Execute protocol on top of a [`Connection`].
//!
//! ```text
//!   Created ──connect──▶ Connecting ──▶ Ready ◀──────────┐
//!                            │            │ execute      │ idle
//!                            ▼            ▼              │
//!                          Error ◀──── Executing ────────┘
//!                                      (timeout / channel lost)
//!
//!   any ──close──▶ Closing ──▶ Closed
//! ```
//!
//! One execute at a time: `execute` takes `&mut self`, so a second call can
//! only be made after the first future completes or is dropped. A dropped
//! execute leaves the session in `Executing` and later calls report `Busy`;
//! the kernel may still be producing output for it, so the session is not
//! reused.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{Span, debug, field, info, instrument, warn};

use kernelgate_types::{ExecutionResult, KernelId, KernelIdentity, KernelSpec, ProtocolMessage};

use crate::connection::Connection;
use crate::constants::{DEFAULT_EXECUTE_TIMEOUT, DEFAULT_STARTUP_TIMEOUT};
use crate::error::GatewayError;
use crate::gateway::KernelLifecycle;
use crate::retry::{RetryPolicy, with_retry};

/// Lifecycle state of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Created,
    Connecting,
    Ready,
    Executing,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// Terminal states: the session will never execute again.
    pub fn is_dead(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

/// Timeouts and retry policy for opening and using a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub startup_timeout: Duration,
    pub execute_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionOptions {
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// The execute contract shared by sessions, pool leases and decorators.
#[async_trait]
pub trait KernelSession: Send {
    /// The kernel this session talks to.
    fn kernel(&self) -> &KernelIdentity;

    fn state(&self) -> SessionState;

    /// Run `code` and collect everything the kernel emits for it.
    ///
    /// Kernel-side errors (exceptions in `code`) are returned inside the
    /// result; `Err` is reserved for client and transport faults.
    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError>;

    /// Release the session. Idempotent.
    async fn close(&mut self);
}

/// A client session: one kernel, one connection, one execute at a time.
pub struct Session {
    spec: KernelSpec,
    lifecycle: Arc<dyn KernelLifecycle>,
    options: SessionOptions,
    connection: Option<Connection>,
    /// Placeholder identity until connected.
    identity: KernelIdentity,
    state: SessionState,
}

impl Session {
    /// A session in `Created` state. Nothing is launched until [`Session::connect`].
    pub fn new(lifecycle: Arc<dyn KernelLifecycle>, spec: KernelSpec, options: SessionOptions) -> Self {
        let identity = KernelIdentity {
            id: KernelId::from_wire(""),
            name: spec.name.clone(),
        };
        Self {
            spec,
            lifecycle,
            options,
            connection: None,
            identity,
            state: SessionState::Created,
        }
    }

    /// Create and connect in one step.
    pub async fn open(
        lifecycle: Arc<dyn KernelLifecycle>,
        spec: KernelSpec,
        options: SessionOptions,
    ) -> Result<Self, GatewayError> {
        let mut session = Self::new(lifecycle, spec, options);
        session.connect().await?;
        Ok(session)
    }

    /// Launch the kernel and wait for it to become ready, retrying
    /// transient failures per the session's retry policy.
    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        if self.state != SessionState::Created {
            return Err(GatewayError::InvalidRequest(format!(
                "cannot connect a session in state {}",
                self.state
            )));
        }
        self.state = SessionState::Connecting;

        let opened = with_retry("session.open", &self.options.retry, |_| {
            Connection::open(Arc::clone(&self.lifecycle), &self.spec, self.options.startup_timeout)
        })
        .await;

        match opened {
            Ok(connection) => {
                self.identity = connection.identity().clone();
                self.connection = Some(connection);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Error;
                Err(e)
            }
        }
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn identity(&self) -> &KernelIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `execute` with the configured default timeout.
    pub async fn execute_default(&mut self, code: &str) -> Result<ExecutionResult, GatewayError> {
        let timeout = self.options.execute_timeout;
        self.execute(code, timeout).await
    }

    /// Send `code` to the kernel and aggregate its output until the
    /// correlated `idle` status arrives or `timeout` elapses.
    #[instrument(
        name = "session.execute",
        skip(self, code),
        fields(kernel_id = %self.identity.id, msg_id = field::Empty)
    )]
    pub async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Executing => return Err(GatewayError::Busy),
            SessionState::Created | SessionState::Connecting => {
                return Err(GatewayError::InvalidRequest("session is not connected".into()));
            }
            SessionState::Closing | SessionState::Closed | SessionState::Error => {
                return Err(GatewayError::ChannelClosed);
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            self.state = SessionState::Error;
            return Err(GatewayError::ChannelClosed);
        };

        let mut request = ProtocolMessage::execute_request(connection.session_id(), code);
        let (traceparent, tracestate) = kernelgate_telemetry::inject_trace_context();
        if !traceparent.is_empty() {
            request = request.with_metadata("traceparent", traceparent);
            if !tracestate.is_empty() {
                request = request.with_metadata("tracestate", tracestate);
            }
        }
        let msg_id = request.msg_id().clone();
        Span::current().record("msg_id", field::display(&msg_id));

        let sent = {
            let connection = &*connection;
            with_retry("execute.send", &self.options.retry, move |_| connection.send(request.clone())).await
        };
        if let Err(e) = sent {
            self.state = SessionState::Error;
            return Err(e);
        }
        self.state = SessionState::Executing;

        let started = Instant::now();
        let deadline = started + timeout;
        let mut result = ExecutionResult::default();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = match connection.receive(remaining).await {
                Ok(msg) => msg,
                Err(GatewayError::ReceiveTimeout(_)) => {
                    warn!(msg_id = %msg_id, ?timeout, "execution timed out");
                    self.state = SessionState::Error;
                    return Err(GatewayError::ExecutionTimeout(timeout));
                }
                Err(e) => {
                    self.state = SessionState::Error;
                    return Err(e);
                }
            };

            if !msg.is_reply_to(&msg_id) {
                debug!(
                    msg_type = %msg.msg_type(),
                    parent = ?msg.parent_id(),
                    "discarding uncorrelated message"
                );
                continue;
            }
            if msg.is_idle() {
                break;
            }
            result.apply(&msg);
        }

        self.state = SessionState::Ready;
        info!(
            msg_id = %msg_id,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );
        Ok(result)
    }

    /// Interrupt the running execution, if any.
    pub async fn interrupt(&self) -> Result<(), GatewayError> {
        match &self.connection {
            Some(connection) => connection.interrupt().await,
            None => Err(GatewayError::ChannelClosed),
        }
    }

    /// Close the channel and shut the kernel down. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.state = SessionState::Closed;
    }
}

#[async_trait]
impl KernelSession for Session {
    fn kernel(&self) -> &KernelIdentity {
        &self.identity
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        Session::execute(self, code, timeout).await
    }

    async fn close(&mut self) {
        Session::close(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGateway, Script};
    use serde_json::json;
    use std::collections::HashSet;

    fn options() -> SessionOptions {
        SessionOptions::default()
            .with_startup_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)).without_jitter())
    }

    async fn open(gateway: &MockGateway) -> Session {
        Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_plus_two() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;
        assert_eq!(session.state(), SessionState::Ready);

        let result = session.execute("2+2", Duration::from_secs(1)).await.unwrap();

        assert_eq!(result.return_value, Some(json!(4)));
        assert_eq!(result.stdout(), "");
        assert!(result.error.is_none());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_runtime_error_is_a_result_and_session_stays_ready() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        let result = session.execute("raise 1/0", Duration::from_secs(1)).await.unwrap();

        let error = result.error.as_ref().unwrap();
        assert_eq!(error.name, "ZeroDivisionError");
        assert_eq!(error.message, "division by zero");
        assert!(result.return_value.is_none());
        assert_eq!(session.state(), SessionState::Ready);

        let next = session.execute("1+1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(next.return_value, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_taints_session() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        let err = session.execute("hang", Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(err, GatewayError::ExecutionTimeout(d) if d == Duration::from_secs(2)));
        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(
            session.execute("1", Duration::from_secs(1)).await,
            Err(GatewayError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_stream_preserves_arrival_order() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        let result = session.execute("chatty", Duration::from_secs(1)).await.unwrap();

        assert_eq!(result.text(), "abc");
        assert_eq!(result.stdout(), "ac");
        assert_eq!(result.stderr(), "b");
    }

    #[tokio::test]
    async fn test_uncorrelated_messages_are_discarded() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        let result = session.execute("noise", Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.text(), "ok");

        let next = session.execute("print('x')", Duration::from_secs(1)).await.unwrap();
        assert_eq!(next.text(), "x\n");
    }

    #[tokio::test]
    async fn test_results_follow_call_order() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        for n in 0..5i64 {
            let result = session.execute(&format!("{n}+0"), Duration::from_secs(1)).await.unwrap();
            assert_eq!(result.return_value, Some(json!(n)));
        }
        let requests = gateway.execute_requests();
        assert_eq!(requests.len(), 5);
        let ids: HashSet<_> = requests.iter().map(|r| r.msg_id().clone()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_channel_lost_mid_execute() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        let err = session.execute("exit", Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, GatewayError::ChannelClosed));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_dropped_execute_leaves_session_busy() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        {
            let fut = session.execute("hang", Duration::from_secs(60));
            let _ = tokio::time::timeout(Duration::from_millis(20), fut).await;
        }

        assert_eq!(session.state(), SessionState::Executing);
        assert!(matches!(
            session.execute("1", Duration::from_secs(1)).await,
            Err(GatewayError::Busy)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_launch_failures_are_retried() {
        let gateway = MockGateway::new().failing_launches(2);
        let session = open(&gateway).await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(gateway.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_retries_exhaust() {
        let gateway = MockGateway::new().failing_launches(10);
        let err = Session::open(gateway.lifecycle(), KernelSpec::new("python3"), options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(gateway.launches(), 4);
    }

    #[tokio::test]
    async fn test_rejected_launch_is_not_retried() {
        let gateway = MockGateway::new().with_script(Script::RejectLaunch(400));
        let err = Session::open(gateway.lifecycle(), KernelSpec::new("nope"), options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::LaunchRejected { status: 400, .. }));
        assert_eq!(gateway.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_send_failure_is_retried() {
        let gateway = MockGateway::new().failing_sends(1);
        let mut session = open(&gateway).await;

        let result = session.execute("3+4", Duration::from_secs(1)).await.unwrap();

        assert_eq!(result.return_value, Some(json!(7)));
        assert_eq!(gateway.execute_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_close_twice_shuts_down_once() {
        let gateway = MockGateway::new();
        let mut session = open(&gateway).await;

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(gateway.shutdowns(), 1);
        assert!(matches!(
            session.execute("1", Duration::from_secs(1)).await,
            Err(GatewayError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_execute_before_connect_is_rejected() {
        let gateway = MockGateway::new();
        let mut session = Session::new(gateway.lifecycle(), KernelSpec::new("python3"), options());
        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(
            session.execute("1", Duration::from_secs(1)).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert_eq!(gateway.launches(), 0);
    }
}
