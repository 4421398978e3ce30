//! Error types for API requests.

use thiserror::Error;

use crate::auth::AuthError;

/// Largest response body excerpt kept in [`RequestError::HttpStatus`].
pub const MAX_ERROR_BODY_BYTES: usize = 500;

/// Errors that can occur while sending an API request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The endpoint path could not be joined onto the API base.
    #[error("invalid API path '{path}': {source}")]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// Transport-level failure (DNS, connect, timeout, reset).
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The requested URL.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The final response (after any recovery) was not a success.
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        /// The requested URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },

    /// A success response body did not decode into the expected type.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        /// The requested URL.
        url: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Establishing the session failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl RequestError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error, truncating the body excerpt.
    pub fn http_status(url: impl Into<String>, status: u16, body: &str) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body: truncate_body(body, MAX_ERROR_BODY_BYTES).to_string(),
        }
    }

    /// The HTTP status, for errors that carry one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the final response was 401 or 403.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

/// Cuts `body` to at most `max_bytes`, backing off to a char boundary.
fn truncate_body(body: &str, max_bytes: usize) -> &str {
    if body.len() <= max_bytes {
        return body;
    }
    let mut end = max_bytes;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
