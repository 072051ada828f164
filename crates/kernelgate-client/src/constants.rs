//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default gateway HTTP endpoint for local development.
pub const DEFAULT_GATEWAY_HTTP: &str = "http://localhost:8889";

/// Default file-exchange endpoint (compose service name).
pub const DEFAULT_FILE_SERVER_URL: &str = "http://file-server:8080";

/// How long the gateway gets to launch a kernel and answer the readiness
/// handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-execute timeout when the caller doesn't pass one.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries after the first attempt for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff delay; doubles per attempt.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff ceiling.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Live sessions a pool may hold across all kernel specs.
pub const DEFAULT_POOL_MAX_SESSIONS: usize = 4;

/// Idle pooled sessions older than this are shut down on the next acquire.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long `acquire` waits for a release when the pool is full and
/// configured to wait.
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for gateway HTTP calls other than launch (shutdown, listing).
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for file-exchange HTTP calls.
pub const FILE_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variables the auth decorator injects into kernels.
pub const ENV_FILE_SERVER_URL: &str = "FILE_SERVER_URL";
pub const ENV_WRITE_TOKEN: &str = "WRITE_TOKEN";

/// Environment overrides applied on top of the config file.
pub const ENV_GATEWAY_URL: &str = "KERNELGATE_GATEWAY_URL";
pub const ENV_GATEWAY_WS_URL: &str = "KERNELGATE_GATEWAY_WS_URL";
pub const ENV_GATEWAY_TOKEN: &str = "KERNELGATE_GATEWAY_TOKEN";

/// Config file name under `<config_dir>/kernelgate/`.
pub const CONFIG_FILE_NAME: &str = "config.toml";
