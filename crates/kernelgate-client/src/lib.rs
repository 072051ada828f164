//! Kernel gateway session client.
//!
//! Launches kernels through a Jupyter-style gateway over HTTP, talks to
//! them over the gateway's WebSocket channel, and turns the message stream
//! for one `execute_request` into an [`ExecutionResult`].
//!
//! ```text
//!   AuthenticatedSession / MetricsSession    (decorators, wrap any KernelSession)
//!                  │
//!   Session ── execute: send request, collect by parent msg_id until idle
//!                  │
//!   Connection ── launch + channel + kernel_info handshake, one shutdown
//!                  │
//!   KernelLifecycle (GatewayClient: reqwest)   MessageChannel (WsChannel: tungstenite)
//! ```
//!
//! [`SessionPool`] leases sessions across callers; [`blocking`] wraps both
//! for callers without a runtime.

pub mod auth;
pub mod blocking;
pub mod channel;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod session;

#[cfg(any(test, feature = "test-mock"))]
pub mod mock;

use std::sync::Arc;

pub use auth::{AuthenticatedSession, FileExchange, FileExchangeConfig, FileOp, FileOpOutput};
pub use config::ClientConfig;
pub use connection::Connection;
pub use error::GatewayError;
pub use gateway::{GatewayClient, GatewayConfig, KernelLifecycle, MessageChannel};
pub use metrics::{ExecutionMetrics, MetricsSession, MetricsSnapshot, Outcome};
pub use pool::{ExhaustionPolicy, PoolConfig, PoolStats, PooledSession, SessionPool};
pub use retry::{RetryPolicy, with_retry};
pub use session::{KernelSession, Session, SessionOptions, SessionState};

pub use kernelgate_types::{ExecutionResult, KernelIdentity, KernelSpec};

/// Open a session against the gateway described by `config`.
pub async fn open_session(config: &ClientConfig, spec: KernelSpec) -> Result<Session, GatewayError> {
    let client: Arc<dyn KernelLifecycle> = Arc::new(GatewayClient::new(config.gateway())?);
    Session::open(client, spec, config.session_options()).await
}

/// A session pool against the gateway described by `config`.
pub fn session_pool(config: &ClientConfig) -> Result<SessionPool, GatewayError> {
    let client: Arc<dyn KernelLifecycle> = Arc::new(GatewayClient::new(config.gateway())?);
    Ok(SessionPool::new(client, config.pool_config()))
}
