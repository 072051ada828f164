//! Error taxonomy for the kernel session client.
//!
//! One public error type. Transport-level faults (connection refused, reset,
//! launch timeout) are *transient* and retried by [`crate::retry`]; every
//! other variant is surfaced on first occurrence. Code-level kernel errors
//! are not here at all; they are returned inside
//! [`kernelgate_types::ExecutionResult`].

use std::time::Duration;

use kernelgate_types::CodecError;

/// Errors from the gateway client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("kernel not ready within {0:?}")]
    LaunchTimeout(Duration),

    #[error("gateway rejected launch ({status}): {message}")]
    LaunchRejected { status: u16, message: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("no message within {0:?}")]
    ReceiveTimeout(Duration),

    #[error("execution did not finish within {0:?}")]
    ExecutionTimeout(Duration),

    #[error("session busy: an execute request is already outstanding")]
    Busy,

    #[error("session pool exhausted ({capacity} sessions in use)")]
    PoolExhausted { capacity: usize },

    #[error("session pool shut down")]
    PoolShutdown,

    #[error("not authorized: {0}")]
    AuthFailure(String),

    #[error("file exchange error ({status}): {message}")]
    FileExchange { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<GatewayError>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::LaunchTimeout(_))
    }

    /// The innermost error, looking through retry annotation.
    pub fn root(&self) -> &GatewayError {
        match self {
            GatewayError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(e: CodecError) -> Self {
        GatewayError::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            GatewayError::Transport(e.to_string())
        } else if e.is_decode() || e.is_body() {
            GatewayError::Protocol(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => GatewayError::ChannelClosed,
            WsError::Http(resp) => GatewayError::LaunchRejected {
                status: resp.status().as_u16(),
                message: "channel upgrade refused".into(),
            },
            WsError::Url(e) => GatewayError::InvalidRequest(e.to_string()),
            other => GatewayError::Transport(other.to_string()),
        }
    }
}
