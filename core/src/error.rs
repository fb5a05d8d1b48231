//! Error types for the context broker client.
//!
//! # Design
//! A rejected HTTP exchange becomes a `FetchError` carrying the full request
//! and the raw response, because diagnosing a broker rejection usually needs
//! the payload that caused it. Not-found is not an error: the session maps
//! 404 on GET/DELETE to `Fetched::Absent` before an error is ever built.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, OrionError>;

/// Header whose value is never printed.
const REDACTED_HEADER: &str = "X-Auth-Token";

/// An HTTP exchange that completed with a status outside 200..=204.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub method: HttpMethod,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub response: HttpResponse,
}

impl FetchError {
    pub fn new(request: &HttpRequest, response: HttpResponse) -> Self {
        Self {
            method: request.method,
            url: request.url.clone(),
            params: request.params.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            response,
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {} {} (headers: {{", self.method, self.url)?;
        for (i, (name, value)) in self.headers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if name.eq_ignore_ascii_case(REDACTED_HEADER) {
                write!(f, "{name}: <redacted>")?;
            } else {
                write!(f, "{name}: {value}")?;
            }
        }
        f.write_str("}, params: {")?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "}}): [{}] {}", self.response.status, self.response.body)
    }
}

impl std::error::Error for FetchError {}

/// Errors returned by the session, auth manager and broker client.
#[derive(Error, Debug)]
pub enum OrionError {
    /// The server answered with a status outside 200..=204.
    #[error(transparent)]
    Fetch(Box<FetchError>),

    /// The request never produced a response (connect, DNS, timeout, I/O).
    #[error("transport error on {method} {url}: {message}")]
    Transport {
        method: HttpMethod,
        url: String,
        message: String,
    },

    /// A broker operation was attempted before `auth()` succeeded.
    #[error("context broker client not authenticated: call auth() first")]
    NotAuthenticated,

    /// The identity service accepted the credentials but sent no token.
    #[error("identity response carries no X-Subject-Token header")]
    MissingToken,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("invalid rate limit: {calls} calls per {period_ms} ms")]
    InvalidRateLimit { calls: u32, period_ms: u128 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrionError {
    /// HTTP status of the failed exchange, if one completed.
    pub fn status(&self) -> Option<u16> {
        match self {
            OrionError::Fetch(err) => Some(err.status()),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            OrionError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FetchError> for OrionError {
    fn from(err: FetchError) -> Self {
        OrionError::Fetch(Box::new(err))
    }
}
