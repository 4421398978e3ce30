//! The seam between the request pipeline and whatever owns the session.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};

use super::AuthError;

/// Header carrying the CSRF token on authenticated requests.
pub const CSRF_HEADER: &str = "csrf-token";

/// The pair of headers that authorize an API request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// Value for `csrf-token`.
    pub csrf_token: String,
    /// Value for `cookie`: `name=value` pairs joined by `; `.
    pub cookie: String,
}

impl AuthHeaders {
    /// Bundles a CSRF token and cookie header value.
    #[must_use]
    pub fn new(csrf_token: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            csrf_token: csrf_token.into(),
            cookie: cookie.into(),
        }
    }

    /// Sets (replacing) `csrf-token` and `cookie` on `headers`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidHeader`] if either value contains bytes
    /// that are not valid in an HTTP header.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let csrf = HeaderValue::from_str(&self.csrf_token)
            .map_err(|_| AuthError::InvalidHeader(CSRF_HEADER))?;
        let mut cookie =
            HeaderValue::from_str(&self.cookie).map_err(|_| AuthError::InvalidHeader("cookie"))?;
        cookie.set_sensitive(true);

        headers.insert(HeaderName::from_static(CSRF_HEADER), csrf);
        headers.insert(COOKIE, cookie);
        Ok(())
    }
}

impl fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("csrf_token", &"[REDACTED]")
            .field("cookie", &"[REDACTED]")
            .finish()
    }
}

/// Supplies authorization headers and recovers from authorization failures.
///
/// [`crate::SessionManager`] is the production implementation; tests can plug
/// in scripted providers.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Headers for the current session, or `None` when there is none yet.
    fn current_headers(&self) -> Option<AuthHeaders>;

    /// Runs a fresh login and returns the new headers.
    ///
    /// Returns `None` when a login is already in flight or the login failed.
    async fn reauthenticate_and_get_headers(&self) -> Option<AuthHeaders>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sets_both_headers() {
        let mut headers = HeaderMap::new();
        AuthHeaders::new("ajax:1", "JSESSIONID=\"ajax:1\"; li_at=x")
            .apply(&mut headers)
            .unwrap();
        assert_eq!(headers[CSRF_HEADER], "ajax:1");
        assert_eq!(headers[COOKIE], "JSESSIONID=\"ajax:1\"; li_at=x");
        assert!(headers[COOKIE].is_sensitive());
    }

    #[test]
    fn test_apply_replaces_existing_values() {
        let mut headers = HeaderMap::new();
        AuthHeaders::new("stale", "a=stale").apply(&mut headers).unwrap();
        AuthHeaders::new("fresh", "a=fresh").apply(&mut headers).unwrap();
        assert_eq!(headers.get_all(CSRF_HEADER).iter().count(), 1);
        assert_eq!(headers[CSRF_HEADER], "fresh");
        assert_eq!(headers[COOKIE], "a=fresh");
    }

    #[test]
    fn test_apply_rejects_control_characters() {
        let mut headers = HeaderMap::new();
        let result = AuthHeaders::new("bad\ntoken", "a=1").apply(&mut headers);
        assert!(matches!(result, Err(AuthError::InvalidHeader(CSRF_HEADER))));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_debug_redacts_values() {
        let debug = format!("{:?}", AuthHeaders::new("tok-123", "li_at=secret"));
        assert!(!debug.contains("tok-123"));
        assert!(!debug.contains("secret"));
    }
}
