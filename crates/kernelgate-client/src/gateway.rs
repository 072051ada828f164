//! Gateway lifecycle over HTTP.
//!
//! The gateway is an opaque server that starts container-backed kernels and
//! multiplexes each kernel's sockets onto one WebSocket. This module holds
//! the two seams the rest of the client is written against:
//!
//! - [`KernelLifecycle`]: launch / shut down / interrupt a kernel and open
//!   its execution channel.
//! - [`MessageChannel`]: send and receive protocol messages on that channel.
//!
//! [`GatewayClient`] is the production implementation (reqwest for HTTP,
//! [`crate::channel::WsChannel`] for the channel).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use kernelgate_types::{KernelId, KernelIdentity, KernelInfo, KernelSpec, KernelSpecInfo, ProtocolMessage, SessionId};

use crate::channel::WsChannel;
use crate::constants::{DEFAULT_GATEWAY_HTTP, HTTP_REQUEST_TIMEOUT};
use crate::error::GatewayError;

/// Kernel lifecycle operations exposed by a gateway.
#[async_trait]
pub trait KernelLifecycle: Send + Sync {
    /// Ask the gateway to start a kernel. Expensive and externally visible.
    async fn launch(&self, spec: &KernelSpec) -> Result<KernelIdentity, GatewayError>;

    /// Ask the gateway to terminate a kernel. A kernel that is already gone
    /// is not an error.
    async fn shutdown(&self, kernel: &KernelId) -> Result<(), GatewayError>;

    /// Interrupt whatever the kernel is running.
    async fn interrupt(&self, kernel: &KernelId) -> Result<(), GatewayError>;

    /// Open the persistent execution channel for a kernel.
    async fn open_channel(
        &self,
        kernel: &KernelId,
        session: &SessionId,
    ) -> Result<Box<dyn MessageChannel>, GatewayError>;
}

/// A bidirectional, message-oriented channel to one kernel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), GatewayError>;

    /// Next inbound message, or `None` once the channel has closed.
    async fn recv(&mut self) -> Option<ProtocolMessage>;

    /// Close the channel. Safe to call more than once.
    async fn close(&mut self);
}

/// Where the gateway lives and how to authenticate to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub http_url: String,
    pub ws_url: String,
    /// Sent as `Authorization: token <t>` on HTTP calls and the channel upgrade.
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY_HTTP)
    }
}

impl GatewayConfig {
    /// Config for an HTTP endpoint; the WebSocket endpoint is derived from it.
    pub fn new(http_url: impl Into<String>) -> Self {
        let http_url = http_url.into().trim_end_matches('/').to_string();
        let ws_url = derive_ws_url(&http_url);
        Self {
            http_url,
            ws_url,
            auth_token: None,
        }
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Channel URL for a kernel and client session.
    pub fn channel_url(&self, kernel: &KernelId, session: &SessionId) -> String {
        format!(
            "{}/api/kernels/{}/channels?session_id={}",
            self.ws_url,
            kernel,
            session.to_hex()
        )
    }
}

/// `http://` → `ws://`, `https://` → `wss://`.
pub fn derive_ws_url(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

#[derive(Deserialize)]
struct LaunchResponse {
    id: KernelId,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct KernelSpecsResponse {
    #[serde(default)]
    kernelspecs: HashMap<String, KernelSpecEntry>,
}

#[derive(Deserialize)]
struct KernelSpecEntry {
    name: String,
    #[serde(default)]
    spec: Value,
}

/// HTTP + WebSocket client for a kernel gateway.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("kernelgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.http_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.config.auth_token {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }
        builder
    }

    /// Kernels currently running on the gateway.
    pub async fn list_kernels(&self) -> Result<Vec<KernelInfo>, GatewayError> {
        let resp = self
            .request(Method::GET, "/api/kernels")
            .timeout(HTTP_REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = expect_success(resp).await?;
        Ok(resp.json().await?)
    }

    /// Kernelspecs the gateway can launch, sorted by name.
    pub async fn list_kernelspecs(&self) -> Result<Vec<KernelSpecInfo>, GatewayError> {
        let resp = self
            .request(Method::GET, "/api/kernelspecs")
            .timeout(HTTP_REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = expect_success(resp).await?;
        let body: KernelSpecsResponse = resp.json().await?;

        let mut specs: Vec<KernelSpecInfo> = body
            .kernelspecs
            .into_values()
            .map(|entry| {
                let field = |key: &str| {
                    entry
                        .spec
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                KernelSpecInfo {
                    display_name: field("display_name"),
                    language: field("language"),
                    name: entry.name,
                }
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }
}

#[async_trait]
impl KernelLifecycle for GatewayClient {
    #[instrument(name = "session.launch", skip(self), fields(kernel = %spec.name))]
    async fn launch(&self, spec: &KernelSpec) -> Result<KernelIdentity, GatewayError> {
        let mut body = serde_json::json!({ "name": spec.name });
        if !spec.env.is_empty() {
            body["env"] = serde_json::to_value(&spec.env)
                .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        }

        let resp = self.request(Method::POST, "/api/kernels").json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::LaunchRejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let launched: LaunchResponse = resp.json().await?;
        info!(kernel_id = %launched.id, "kernel launched");
        Ok(KernelIdentity {
            id: launched.id,
            name: launched.name.unwrap_or_else(|| spec.name.clone()),
        })
    }

    #[instrument(name = "session.shutdown", skip(self))]
    async fn shutdown(&self, kernel: &KernelId) -> Result<(), GatewayError> {
        let resp = self
            .request(Method::DELETE, &format!("/api/kernels/{kernel}"))
            .timeout(HTTP_REQUEST_TIMEOUT)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(kernel_id = %kernel, "kernel already gone");
                Ok(())
            }
            _ => expect_success(resp).await.map(|_| ()),
        }
    }

    async fn interrupt(&self, kernel: &KernelId) -> Result<(), GatewayError> {
        let resp = self
            .request(Method::POST, &format!("/api/kernels/{kernel}/interrupt"))
            .timeout(HTTP_REQUEST_TIMEOUT)
            .send()
            .await?;
        expect_success(resp).await.map(|_| ())
    }

    async fn open_channel(
        &self,
        kernel: &KernelId,
        session: &SessionId,
    ) -> Result<Box<dyn MessageChannel>, GatewayError> {
        let url = self.config.channel_url(kernel, session);
        let channel = WsChannel::connect(&url, self.config.auth_token.as_deref()).await?;
        Ok(Box::new(channel))
    }
}

async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(GatewayError::Protocol(format!(
        "gateway returned {}: {}",
        status.as_u16(),
        error_message(&text)
    )))
}

/// Pull `message`/`reason` out of a Jupyter JSON error body; fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
