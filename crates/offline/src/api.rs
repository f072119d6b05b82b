//! Remote REST API boundary.
//!
//! The backend is the system of record. The contract relied on here:
//! - a create that repeats a previously-seen `Idempotency-Key` is a no-op;
//! - status classes are used verbatim (2xx ok, 409 conflict, other 4xx final,
//!   5xx transient).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stockcount_core::MutationId;

use crate::config::OfflineConfig;
use crate::retry::Retryable;

/// Header carrying the client-generated mutation id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// How a failed call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No response reached us (connect error, DNS, timeout).
    Transport,
    /// 5xx.
    Server,
    /// 409.
    Conflict,
    /// 404.
    NotFound,
    /// Any other 4xx, or a response we could not understand.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("API error ({status}): {message}")]
    Status {
        status: u16,
        message: String,
        body: Value,
    },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(status: u16, body: Value) -> Self {
        let message = extract_message(&body).unwrap_or_else(|| default_reason(status));
        ApiError::Status {
            status,
            message,
            body,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Transport(_) | ApiError::Timeout(_) => FailureKind::Transport,
            ApiError::Decode(_) => FailureKind::Rejected,
            ApiError::Status { status, .. } => match *status {
                409 => FailureKind::Conflict,
                404 => FailureKind::NotFound,
                s if s >= 500 => FailureKind::Server,
                _ => FailureKind::Rejected,
            },
        }
    }

    /// Message suitable for the user: the server's own wording when it sent one.
    pub fn message(&self) -> String {
        match self {
            ApiError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Response body of a status error (the server's view of the entity on 409).
    pub fn body(&self) -> Option<&Value> {
        match self {
            ApiError::Status { body, .. } if !body.is_null() => Some(body),
            _ => None,
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transport | FailureKind::Server)
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"detail": "..."}`, `{"detail": [{"msg": "..."}]}`,
/// `{"message": "..."}` and `{"error": "..."}`; a bare JSON string is used as-is.
pub fn extract_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => {
            match map.get("detail") {
                Some(Value::String(s)) => return Some(s.clone()),
                Some(Value::Array(items)) => {
                    let msgs: Vec<&str> = items
                        .iter()
                        .filter_map(|i| i.get("msg").and_then(Value::as_str))
                        .collect();
                    if !msgs.is_empty() {
                        return Some(msgs.join("; "));
                    }
                }
                _ => {}
            }
            ["message", "error"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        }
        _ => None,
    }
}

fn default_reason(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

/// A write sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub path: String,
    pub body: Value,
    pub idempotency_key: MutationId,
    /// Ask the server to skip its conflict check (client wins).
    pub force: bool,
    /// Per-call override of the client's default timeout.
    pub timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(path: impl Into<String>, body: Value, idempotency_key: MutationId) -> Self {
        Self {
            path: path.into(),
            body,
            idempotency_key,
            force: false,
            timeout: None,
        }
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The slice of the backend the offline layer talks to.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, ApiError>;

    async fn submit(&self, request: &SubmitRequest) -> Result<Value, ApiError>;
}

/// Answers "can the server be reached right now".
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// `reqwest`-backed client for the counting backend.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    timeout: Duration,
    probe_path: String,
}

impl HttpApiClient {
    pub fn new(config: &OfflineConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
            timeout: config.request_timeout,
            probe_path: config.probe_path.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_send_error(&self, err: reqwest::Error, timeout: Duration) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(timeout)
        } else {
            ApiError::Transport(err.to_string())
        }
    }

    async fn read_response(resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(format!("failed to read response body: {e}")))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else if status.is_success() {
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiError::status(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let req = self.authorize(self.client.get(self.url(path)));
        let resp = req
            .send()
            .await
            .map_err(|e| self.map_send_error(e, self.timeout))?;
        Self::read_response(resp).await
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Value, ApiError> {
        let mut req = self
            .client
            .post(self.url(&request.path))
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.to_string())
            .json(&request.body);

        if request.force {
            req = req.query(&[("force", "true")]);
        }
        let timeout = request.timeout.unwrap_or(self.timeout);
        if let Some(t) = request.timeout {
            req = req.timeout(t);
        }

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;
        Self::read_response(resp).await
    }
}

#[async_trait]
impl Reachability for HttpApiClient {
    /// Any HTTP response counts: the host answered.
    async fn is_reachable(&self) -> bool {
        self.client
            .get(self.url(&self.probe_path))
            .send()
            .await
            .is_ok()
    }
}
