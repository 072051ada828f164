//! Authenticated file exchange and the session decorator that carries it.
//!
//! The file-exchange service is a plain HTTP file store shared with the
//! kernels. Reads are open; writes and deletes need the write token, sent
//! both as `Authorization: Bearer <t>` and as the `token` header the store
//! checks. None of this touches the execution channel.
//!
//! | Operation | Request                             | Token |
//! |-----------|-------------------------------------|-------|
//! | list      | `GET /list`                         | no    |
//! | read      | `GET /read/{name}`                  | no    |
//! | upload    | `POST /upload` (multipart `file`)   | yes   |
//! | overwrite | `PUT /overwrite/{name}` (multipart) | yes   |
//! | delete    | `DELETE /delete/{name}`             | yes   |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, StatusCode};
use tracing::{debug, instrument};

use kernelgate_types::{ExecutionResult, KernelIdentity, KernelSpec};

use crate::constants::{DEFAULT_FILE_SERVER_URL, ENV_FILE_SERVER_URL, ENV_WRITE_TOKEN, FILE_EXCHANGE_TIMEOUT};
use crate::error::GatewayError;
use crate::gateway::KernelLifecycle;
use crate::session::{KernelSession, Session, SessionOptions, SessionState};

/// Where the file-exchange service lives and the write token for it.
#[derive(Clone, PartialEq, Eq)]
pub struct FileExchangeConfig {
    pub url: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for FileExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileExchangeConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for FileExchangeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_SERVER_URL)
    }
}

impl FileExchangeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// `FILE_SERVER_URL` / `WRITE_TOKEN` from the environment, with defaults.
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_FILE_SERVER_URL).unwrap_or_else(|_| DEFAULT_FILE_SERVER_URL.to_string());
        let mut config = Self::new(url);
        config.token = std::env::var(ENV_WRITE_TOKEN).ok().filter(|t| !t.is_empty());
        config
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Launch environment that lets code inside the kernel reach the store.
    pub fn kernel_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([(ENV_FILE_SERVER_URL.to_string(), self.url.clone())]);
        if let Some(token) = &self.token {
            env.insert(ENV_WRITE_TOKEN.to_string(), token.clone());
        }
        env
    }
}

/// File operation kinds accepted by [`FileExchange::execute_file_op`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FileOp {
    Read,
    Write,
    Append,
    Delete,
    List,
}

/// What a file operation produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOpOutput {
    Content(Vec<u8>),
    Names(Vec<String>),
    Done,
}

/// HTTP client for the file-exchange service.
#[derive(Clone)]
pub struct FileExchange {
    http: reqwest::Client,
    config: FileExchangeConfig,
}

impl FileExchange {
    pub fn new(config: FileExchangeConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(FILE_EXCHANGE_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FileExchangeConfig {
        &self.config
    }

    pub fn kernel_env(&self) -> BTreeMap<String, String> {
        self.config.kernel_env()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.config.url, path))
    }

    fn authorized(&self, method: Method, path: &str) -> Result<RequestBuilder, GatewayError> {
        let token = self
            .config
            .token
            .as_deref()
            .ok_or_else(|| GatewayError::AuthFailure("no write token configured".into()))?;
        Ok(self.request(method, path).bearer_auth(token).header("token", token))
    }

    /// Names of all files in the shared namespace.
    pub async fn list(&self) -> Result<Vec<String>, GatewayError> {
        let resp = check(self.request(Method::GET, "/list").send().await?).await?;
        Ok(resp.json().await?)
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, GatewayError> {
        validate_name(name)?;
        let resp = check(self.request(Method::GET, &format!("/read/{name}")).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn upload(&self, name: &str, content: Vec<u8>) -> Result<(), GatewayError> {
        validate_name(name)?;
        let form = Form::new().part("file", Part::bytes(content).file_name(name.to_string()));
        check(self.authorized(Method::POST, "/upload")?.multipart(form).send().await?).await?;
        Ok(())
    }

    /// Create or replace `name`.
    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn overwrite(&self, name: &str, content: Vec<u8>) -> Result<(), GatewayError> {
        validate_name(name)?;
        let form = Form::new().part("file", Part::bytes(content).file_name(name.to_string()));
        let builder = self.authorized(Method::PUT, &format!("/overwrite/{name}"))?;
        check(builder.multipart(form).send().await?).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), GatewayError> {
        validate_name(name)?;
        let builder = self.authorized(Method::DELETE, &format!("/delete/{name}"))?;
        check(builder.send().await?).await?;
        Ok(())
    }

    /// Whether the configured token is accepted by the store.
    pub async fn validate_token(&self) -> bool {
        let Ok(builder) = self.authorized(Method::GET, "/list") else {
            return false;
        };
        match builder.send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "token validation request failed");
                false
            }
        }
    }

    /// Dispatch one file operation. `content` is required for writes and appends.
    pub async fn execute_file_op(
        &self,
        op: FileOp,
        name: &str,
        content: Option<&[u8]>,
    ) -> Result<FileOpOutput, GatewayError> {
        let payload = || {
            content
                .map(<[u8]>::to_vec)
                .ok_or_else(|| GatewayError::InvalidRequest(format!("{op} needs content")))
        };
        match op {
            FileOp::List => Ok(FileOpOutput::Names(self.list().await?)),
            FileOp::Read => Ok(FileOpOutput::Content(self.read(name).await?)),
            FileOp::Write => {
                self.overwrite(name, payload()?).await?;
                Ok(FileOpOutput::Done)
            }
            FileOp::Append => {
                let extra = payload()?;
                let mut existing = match self.read(name).await {
                    Ok(bytes) => bytes,
                    Err(GatewayError::FileExchange { status: 404, .. }) => Vec::new(),
                    Err(e) => return Err(e),
                };
                existing.extend_from_slice(&extra);
                self.overwrite(name, existing).await?;
                Ok(FileOpOutput::Done)
            }
            FileOp::Delete => {
                self.delete(name).await?;
                Ok(FileOpOutput::Done)
            }
        }
    }

    /// Upload a local file, by default under its own file name. Returns the
    /// name it was stored under.
    pub async fn upload_file(&self, path: &Path, name: Option<&str>) -> Result<String, GatewayError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| GatewayError::InvalidRequest(format!("no file name in {}", path.display())))?,
        };
        let content = tokio::fs::read(path).await?;
        self.upload(&name, content).await?;
        Ok(name)
    }

    /// Download `name` to `dest`, or to `./name` when `dest` is `None`.
    pub async fn download_file(&self, name: &str, dest: Option<&Path>) -> Result<PathBuf, GatewayError> {
        let content = self.read(name).await?;
        let dest = dest.map_or_else(|| PathBuf::from(name), Path::to_path_buf);
        tokio::fs::write(&dest, content).await?;
        Ok(dest)
    }
}

/// Names are flat: no separators, no parent references.
fn validate_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(GatewayError::InvalidRequest(format!("invalid file name: {name:?}")));
    }
    Ok(())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(GatewayError::AuthFailure(message)),
        _ => Err(GatewayError::FileExchange {
            status: status.as_u16(),
            message,
        }),
    }
}

// ============================================================================
// AuthenticatedSession
// ============================================================================

/// A session plus authenticated access to the file-exchange service.
///
/// Forwards the execute contract unchanged; file operations go over HTTP.
pub struct AuthenticatedSession<S> {
    inner: S,
    files: FileExchange,
}

impl<S: KernelSession> AuthenticatedSession<S> {
    pub fn new(inner: S, files: FileExchange) -> Self {
        Self { inner, files }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn files(&self) -> &FileExchange {
        &self.files
    }

    pub async fn execute_file_op(
        &self,
        op: FileOp,
        name: &str,
        content: Option<&[u8]>,
    ) -> Result<FileOpOutput, GatewayError> {
        self.files.execute_file_op(op, name, content).await
    }

    /// Put a local file where code in the kernel can read it.
    pub async fn upload_to_kernel(&self, path: &Path, name: Option<&str>) -> Result<String, GatewayError> {
        self.files.upload_file(path, name).await
    }

    /// Fetch a file the kernel wrote.
    pub async fn download_from_kernel(&self, name: &str, dest: Option<&Path>) -> Result<PathBuf, GatewayError> {
        self.files.download_file(name, dest).await
    }
}

impl AuthenticatedSession<Session> {
    /// Open a session whose kernel is launched with the file-exchange
    /// URL and token in its environment.
    pub async fn open(
        lifecycle: Arc<dyn KernelLifecycle>,
        spec: KernelSpec,
        options: SessionOptions,
        files: FileExchange,
    ) -> Result<Self, GatewayError> {
        let spec = spec.with_env(files.kernel_env());
        let session = Session::open(lifecycle, spec, options).await?;
        Ok(Self::new(session, files))
    }
}

#[async_trait]
impl<S: KernelSession> KernelSession for AuthenticatedSession<S> {
    fn kernel(&self) -> &KernelIdentity {
        self.inner.kernel()
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, GatewayError> {
        self.inner.execute(code, timeout).await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;

    #[test]
    fn test_kernel_env_carries_url_and_token() {
        let env = FileExchangeConfig::new("http://files:8080/").with_token("s3cr3t").kernel_env();
        assert_eq!(env.get("FILE_SERVER_URL").map(String::as_str), Some("http://files:8080"));
        assert_eq!(env.get("WRITE_TOKEN").map(String::as_str), Some("s3cr3t"));

        let anonymous = FileExchangeConfig::new("http://files:8080").kernel_env();
        assert!(!anonymous.contains_key("WRITE_TOKEN"));
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let config = FileExchangeConfig::new("http://files").with_token("s3cr3t");
        assert!(!format!("{config:?}").contains("s3cr3t"));
    }

    #[test]
    fn test_file_names_are_flat() {
        assert!(validate_name("data.csv").is_ok());
        for bad in ["", "../etc/passwd", "a/b", "a\\b", ".."] {
            assert!(matches!(validate_name(bad), Err(GatewayError::InvalidRequest(_))), "{bad}");
        }
    }

    #[test]
    fn test_file_op_parses_from_lowercase() {
        assert_eq!("append".parse::<FileOp>().unwrap(), FileOp::Append);
        assert_eq!(FileOp::Delete.to_string(), "delete");
        assert!("chmod".parse::<FileOp>().is_err());
    }

    #[tokio::test]
    async fn test_writes_without_token_fail_before_any_request() {
        let files = FileExchange::new(FileExchangeConfig::new("http://127.0.0.1:9")).unwrap();
        let err = files
            .execute_file_op(FileOp::Write, "a.txt", Some(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailure(_)));
        assert!(!files.validate_token().await);
    }

    #[tokio::test]
    async fn test_write_without_content_is_invalid() {
        let files = FileExchange::new(FileExchangeConfig::new("http://127.0.0.1:9").with_token("t")).unwrap();
        let err = files.execute_file_op(FileOp::Write, "a.txt", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_decorator_forwards_execute_unchanged() {
        let gateway = MockGateway::new();
        let files = FileExchange::new(FileExchangeConfig::new("http://files").with_token("t")).unwrap();
        let mut session = AuthenticatedSession::open(
            gateway.lifecycle(),
            KernelSpec::new("python3"),
            SessionOptions::default(),
            files,
        )
        .await
        .unwrap();

        let result = session.execute("2+2", Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.return_value, Some(serde_json::json!(4)));
        assert_eq!(session.state(), SessionState::Ready);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
