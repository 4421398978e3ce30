//! Error types for session authentication.

use thiserror::Error;

/// Errors raised by the login handshake and session restore.
///
/// Reauthentication that is skipped because another login is already running
/// is not an error; see [`crate::SessionManager::reauthenticate_and_get_headers`].
#[derive(Debug, Error)]
pub enum AuthError {
    /// Another login flow holds the session.
    #[error("a login flow is already in progress")]
    LoginInProgress,

    /// A login response carried no `Set-Cookie` header.
    #[error("login response did not set any cookies")]
    MissingCookie,

    /// Cookies were set but none of them is the session cookie.
    #[error("session is missing the JSESSIONID cookie")]
    MissingSessionCookie,

    /// The session cookie's expiry has passed.
    #[error("session cookie has expired")]
    SessionExpired,

    /// The service rejected the identity/secret pair (HTTP 401 on login).
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The service demands an interactive challenge (CAPTCHA, 2FA, ...).
    #[error("login requires an interactive challenge (result: {result}){}", challenge_hint(.challenge_url.as_deref()))]
    ChallengeRequired {
        /// The `login_result` value the service returned.
        result: String,
        /// Where the challenge can be completed out of band.
        challenge_url: Option<String>,
    },

    /// Any other non-success login status.
    #[error("login failed with HTTP {status}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
    },

    /// Transport failure talking to the login endpoint.
    #[error("network error during login at {url}: {source}")]
    Network {
        /// The login URL.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The login response body could not be decoded.
    #[error("invalid login response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// Session material could not be encoded as an HTTP header.
    #[error("cannot encode {0} header from session cookies")]
    InvalidHeader(&'static str),
}

impl AuthError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Whether retrying the same login automatically is pointless.
    ///
    /// Bad credentials and interactive challenges need a human.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::ChallengeRequired { .. }
        )
    }
}

fn challenge_hint(url: Option<&str>) -> String {
    url.map(|u| format!("; complete it at {u}"))
        .unwrap_or_default()
}
