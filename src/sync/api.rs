//! Action Transport - HTTP delivery of queued actions
//!
//! Each queued action carries its own target (method, URL, headers), so the
//! transport is a thin layer that:
//! - Builds the request from the action
//! - Attaches a stable idempotency key (the action id)
//! - Classifies the response: 2xx is success, everything else is a failure

use super::models::{ActionPayload, OfflineAction};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;

/// Header carrying the action id so the server can drop duplicate retries
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status: u16,
}

/// Delivers one action to the remote collaborator
#[async_trait]
pub trait ActionTransport: Send + Sync {
    async fn dispatch(&self, action: &OfflineAction) -> Result<DispatchResponse, DispatchError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
    default_headers: HeaderMap,
}

impl HttpTransport {
    /// Create a transport with the default request timeout
    pub fn new() -> Result<Self, DispatchError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::InvalidRequest(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            default_headers: HeaderMap::new(),
        })
    }

    /// Header sent with every request (tenant id, client version, ...)
    pub fn with_default_header(mut self, name: &str, value: &str) -> Result<Self, DispatchError> {
        let (name, value) = parse_header(name, value)?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    fn build_request(&self, action: &OfflineAction) -> Result<reqwest::RequestBuilder, DispatchError> {
        let url = url::Url::parse(&action.target.url)
            .map_err(|e| DispatchError::InvalidRequest(format!("{}: {}", action.target.url, e)))?;

        let mut headers = self.default_headers.clone();
        for (name, value) in &action.target.headers {
            let (name, value) = parse_header(name, value)?;
            headers.insert(name, value);
        }
        let (name, value) = parse_header(IDEMPOTENCY_HEADER, &action.id)?;
        headers.insert(name, value);

        let request = self
            .client
            .request(action.target.method.into(), url)
            .headers(headers);

        let request = match &action.payload {
            ActionPayload::Empty => request,
            ActionPayload::Json { body } => request.json(body),
            ActionPayload::Binary {
                content_type,
                file_name,
                data,
            } => {
                let request = request
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(data.clone());
                match file_name {
                    Some(name) => request.header(
                        "Content-Disposition",
                        format!("attachment; filename=\"{}\"", name.replace('"', "")),
                    ),
                    None => request,
                }
            }
        };

        Ok(request)
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn dispatch(&self, action: &OfflineAction) -> Result<DispatchResponse, DispatchError> {
        let request = self.build_request(action)?;

        log::debug!(
            "Dispatching {} {} for action {} ({})",
            action.target.method.as_str(),
            action.target.url,
            action.id,
            action.entity
        );

        let response = request
            .send()
            .await
            .map_err(|e| classify_error(e, self.timeout))?;
        let status = response.status();

        if status.is_success() {
            Ok(DispatchResponse {
                status: status.as_u16(),
            })
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), DispatchError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| DispatchError::InvalidRequest(format!("invalid header name: {}", name)))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| DispatchError::InvalidRequest(format!("invalid value for header {}", name)))?;
    Ok((header_name, header_value))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// HTTP status, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// A client error that will not succeed by resending the same request.
    /// 408 and 429 are throttling/timeouts and stay retryable.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            Self::InvalidRequest(_) => true,
            _ => false,
        }
    }
}

fn classify_error(e: reqwest::Error, timeout: Duration) -> DispatchError {
    if e.is_timeout() {
        DispatchError::Timeout(timeout)
    } else if e.is_builder() {
        DispatchError::InvalidRequest(e.to_string())
    } else {
        DispatchError::Network(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
