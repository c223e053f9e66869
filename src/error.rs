use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invocation error: {0}")]
    Invocation(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Throttled(#[from] Throttled),
    #[error("User lookup failed: {0}")]
    UserLookup(String),
    #[error("Counter store error: {0}")]
    Store(String),
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

/// Failures raised by the binding container while producing an instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("no binding registered for `{0}`")]
    Unbound(&'static str),
    #[error("`{0}` is request scoped and no request scope holds it")]
    NotInScope(&'static str),
    #[error("provider for `{service}` failed: {message}")]
    Provider {
        service: &'static str,
        message: String,
    },
}

/// Rejection raised when at least one throttle policy denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Throttled {
    #[serde(with = "humantime_serde")]
    pub wait: Option<Duration>,
}

impl Throttled {
    pub fn new(wait: Option<Duration>) -> Self {
        Self { wait }
    }

    /// Seconds a client should wait, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.wait.map(|wait| {
            let secs = wait.as_secs();
            if wait.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }

    pub fn detail(&self) -> String {
        match self.retry_after_secs() {
            Some(secs) => format!(
                "Request was throttled. Expected available in {} second{}.",
                secs,
                if secs == 1 { "" } else { "s" }
            ),
            None => "Request was throttled.".to_string(),
        }
    }
}

impl fmt::Display for Throttled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail())
    }
}

impl std::error::Error for Throttled {}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttled: Option<Throttled>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            throttled: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Configuration(msg) => Self::new("configuration_error", msg, 500),
            Error::Invocation(msg) => Self::new("invocation_error", msg, 500),
            Error::Resolve(err) => Self::new("resolution_error", &err.to_string(), 500),
            Error::Throttled(throttled) => Self {
                throttled: Some(*throttled),
                ..Self::new("throttled", &throttled.detail(), 429)
            },
            Error::UserLookup(msg) => Self::new("internal_error", msg, 500),
            Error::Store(msg) => Self::new("service_unavailable", msg, 503),
            Error::PayloadTooLarge { .. } => {
                Self::new("payload_too_large", &err.to_string(), 413)
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Throttled(throttled) => {
                tracing::debug!(wait = ?throttled.wait, "request throttled");
            }
            Error::PayloadTooLarge { limit } => {
                tracing::debug!(limit, "request body rejected");
            }
            other => {
                tracing::error!(error = %other, "request failed");
            }
        }

        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = match &self {
            Error::Throttled(throttled) => throttled.retry_after_secs(),
            _ => None,
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            resp.headers_mut()
                .insert("Retry-After", HeaderValue::from(secs));
        }
        resp
    }
}
