//! Client configuration: TOML file, then environment overrides.
//!
//! ```toml
//! [gateway]
//! http_url = "http://gateway:8888"
//! # ws_url derived from http_url when absent
//! auth_token = "..."
//!
//! [session]
//! startup_timeout_secs = 30
//! execute_timeout_secs = 10
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! jitter = true
//!
//! [pool]
//! max_sessions = 4
//! idle_timeout_secs = 600
//! on_exhausted = "wait"   # or "fail"
//! acquire_timeout_secs = 30
//!
//! [file_exchange]
//! url = "http://file-server:8080"
//! token = "..."
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::auth::FileExchangeConfig;
use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_EXECUTE_TIMEOUT, DEFAULT_FILE_SERVER_URL, DEFAULT_GATEWAY_HTTP, DEFAULT_MAX_RETRIES,
    DEFAULT_POOL_ACQUIRE_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_SESSIONS, DEFAULT_RETRY_BASE_DELAY,
    DEFAULT_RETRY_MAX_DELAY, DEFAULT_STARTUP_TIMEOUT, ENV_FILE_SERVER_URL, ENV_GATEWAY_TOKEN, ENV_GATEWAY_URL,
    ENV_GATEWAY_WS_URL, ENV_WRITE_TOKEN,
};
use crate::error::GatewayError;
use crate::gateway::GatewayConfig;
use crate::pool::{ExhaustionPolicy, PoolConfig};
use crate::retry::RetryPolicy;
use crate::session::SessionOptions;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub gateway: GatewaySection,
    pub session: SessionSection,
    pub retry: RetrySection,
    pub pool: PoolSection,
    pub file_exchange: FileExchangeSection,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub http_url: String,
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            http_url: DEFAULT_GATEWAY_HTTP.to_string(),
            ws_url: None,
            auth_token: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub startup_timeout_secs: u64,
    pub execute_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT.as_secs(),
            execute_timeout_secs: DEFAULT_EXECUTE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY.as_millis() as u64,
            jitter: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    Fail,
    #[default]
    Wait,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub on_exhausted: OnExhausted,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_POOL_MAX_SESSIONS,
            idle_timeout_secs: DEFAULT_POOL_IDLE_TIMEOUT.as_secs(),
            on_exhausted: OnExhausted::default(),
            acquire_timeout_secs: DEFAULT_POOL_ACQUIRE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileExchangeSection {
    pub url: String,
    pub token: Option<String>,
}

impl Default for FileExchangeSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_FILE_SERVER_URL.to_string(),
            token: None,
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or from the default location when `None`, then
    /// apply environment overrides. A missing default file means defaults;
    /// a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// `<config_dir>/kernelgate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kernelgate").join(CONFIG_FILE_NAME))
    }

    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded client config");
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, GatewayError> {
        let config: Self = toml::from_str(contents).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.pool.max_sessions == 0 {
            return Err(GatewayError::Config("pool.max_sessions must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(GatewayError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Overlay non-empty environment variables.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());
        if let Some(url) = var(ENV_GATEWAY_URL) {
            self.gateway.http_url = url;
        }
        if let Some(url) = var(ENV_GATEWAY_WS_URL) {
            self.gateway.ws_url = Some(url);
        }
        if let Some(token) = var(ENV_GATEWAY_TOKEN) {
            self.gateway.auth_token = Some(token);
        }
        if let Some(url) = var(ENV_FILE_SERVER_URL) {
            self.file_exchange.url = url;
        }
        if let Some(token) = var(ENV_WRITE_TOKEN) {
            self.file_exchange.token = Some(token);
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        let mut config = GatewayConfig::new(&self.gateway.http_url);
        if let Some(ws_url) = &self.gateway.ws_url {
            config = config.with_ws_url(ws_url);
        }
        if let Some(token) = &self.gateway.auth_token {
            config = config.with_auth_token(token);
        }
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::default()
            .with_startup_timeout(Duration::from_secs(self.session.startup_timeout_secs))
            .with_execute_timeout(Duration::from_secs(self.session.execute_timeout_secs))
            .with_retry(self.retry_policy())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let on_exhausted = match self.pool.on_exhausted {
            OnExhausted::Fail => ExhaustionPolicy::Fail,
            OnExhausted::Wait => ExhaustionPolicy::Wait {
                timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            },
        };
        PoolConfig {
            max_sessions: self.pool.max_sessions,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            on_exhausted,
            session: self.session_options(),
        }
    }

    pub fn file_exchange(&self) -> FileExchangeConfig {
        let config = FileExchangeConfig::new(&self.file_exchange.url);
        match &self.file_exchange.token {
            Some(token) => config.with_token(token),
            None => config,
        }
    }
}
