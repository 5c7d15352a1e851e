use std::time::Duration;

use http::{HeaderMap, StatusCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Captured upstream HTTP failure, preserved so the handler can translate
/// status and Retry-After into the client-facing envelope.
#[derive(Debug, Clone)]
pub struct UpstreamHttpError {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl UpstreamHttpError {
    pub fn new(status: u16, headers: HeaderMap, body: String) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no providers configured")]
    NoProviders,

    #[error("all providers are unhealthy")]
    AllProvidersUnhealthy,

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("provider '{provider}' error: {source}")]
    Provider {
        provider: String,
        #[source]
        source: anyhow::Error,
        retry_after: Option<Duration>,
        http: Option<UpstreamHttpError>,
    },

    #[error("event stream error: {0}")]
    EventStream(#[from] crate::eventstream::FrameError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("operation timed out")]
    Timeout,
}

/// Client-facing error taxonomy. Every error leaving the relay is rendered
/// as `{"type":"error","error":{"type":<kind>,"message":...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Api,
    Overloaded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Api => "api_error",
            ErrorKind::Overloaded => "overloaded_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Permission => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Api => StatusCode::BAD_GATEWAY,
            ErrorKind::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoProviders | Error::AllProvidersUnhealthy => ErrorKind::Overloaded,
            Error::UnknownProvider(_) => ErrorKind::NotFound,
            Error::CircuitOpen(_) => ErrorKind::Overloaded,
            Error::Provider { http, .. } => match http.as_ref().and_then(|h| h.status_code()) {
                Some(StatusCode::TOO_MANY_REQUESTS) => ErrorKind::RateLimit,
                Some(StatusCode::UNAUTHORIZED) => ErrorKind::Authentication,
                Some(StatusCode::FORBIDDEN) => ErrorKind::Permission,
                Some(StatusCode::NOT_FOUND) => ErrorKind::NotFound,
                Some(status) if status.is_client_error() => ErrorKind::InvalidRequest,
                _ => ErrorKind::Api,
            },
            Error::Http(_) | Error::EventStream(_) => ErrorKind::Api,
            Error::Json(_) | Error::InvalidRequest(_) | Error::Config(_) => {
                ErrorKind::InvalidRequest
            }
            Error::Io(_) => ErrorKind::Api,
            Error::Auth(_) => ErrorKind::Authentication,
            Error::RateLimited(_) => ErrorKind::RateLimit,
            Error::Timeout => ErrorKind::Overloaded,
        }
    }

    /// HTTP status for the client response. Upstream 4xx statuses are kept
    /// so clients see the same code the backend produced; everything else
    /// comes from the kind.
    pub fn client_status(&self) -> StatusCode {
        if let Error::Provider {
            http: Some(http), ..
        } = self
        {
            if let Some(status) = http.status_code() {
                if status.is_client_error() {
                    return status;
                }
            }
        }
        self.kind().status()
    }

    /// Anthropic-shaped error envelope. Upstream failures are translated,
    /// never forwarded verbatim.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.kind().as_str(),
                "message": self.to_string(),
            }
        })
    }

    /// Whether this error permits routing the request to another provider.
    ///
    /// Triggers: connect failures and timeouts, upstream 5xx, 429 carrying
    /// Retry-After, 408/425, and transport-level resets. No other 4xx fires.
    pub fn is_failover_trigger(&self) -> bool {
        match self {
            Error::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            Error::Timeout => true,
            Error::CircuitOpen(_) => true,
            Error::Provider {
                http, retry_after, ..
            } => match http.as_ref().and_then(|h| h.status_code()) {
                Some(status) if status.is_server_error() => true,
                Some(StatusCode::TOO_MANY_REQUESTS) => retry_after.is_some(),
                Some(StatusCode::REQUEST_TIMEOUT) => true,
                Some(StatusCode::TOO_EARLY) => true,
                Some(_) => false,
                // No HTTP status at all means the transport failed.
                None => true,
            },
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
