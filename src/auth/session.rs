//! Session lifecycle: restore, login handshake, and single-flight reauthentication.
//!
//! [`SessionManager`] owns the account credentials, an unthrottled login
//! client, and the current session (cookie jar plus derived CSRF token). Its
//! status moves through:
//!
//! ```text
//! Unauthenticated --authenticate--> Authenticating --ok--> Authenticated
//!        ^                                |                     |
//!        +------------- error ------------+        authorization failure
//!        |                                                      v
//!        +------------- error ------------- Reauthenticating <--+
//!                                                  |
//!                                                  +--ok--> Authenticated
//! ```
//!
//! Only one login flow runs at a time. The in-flight state is held by a guard
//! that resets the status if the flow fails, panics, or is cancelled.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use url::Url;
use url::form_urlencoded;

use super::cookies::{CookieJar, folded_set_cookie};
use super::provider::{AuthHeaders, AuthProvider, CSRF_HEADER};
use super::storage::{CredentialStore, StorageError};
use super::AuthError;
use crate::client::ClientError;
use crate::config::{ClientConfig, ConfigError, Credentials, join_endpoint};
use crate::http::build_http_client;
use crate::user_agent;

/// Login endpoint, relative to the base URL.
pub const AUTH_PATH: &str = "uas/authenticate";

const LOGIN_PASS: &str = "PASS";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No usable session.
    #[default]
    Unauthenticated,
    /// First login (or restore) in progress.
    Authenticating,
    /// Session holds a valid CSRF token and cookies.
    Authenticated,
    /// Login in progress after an authorization failure.
    Reauthenticating,
}

impl SessionStatus {
    /// Whether a login flow currently holds the session.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Authenticating | Self::Reauthenticating)
    }

    /// Stable lowercase name, for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Reauthenticating => "reauthenticating",
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    status: SessionStatus,
    jar: CookieJar,
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    login_result: Option<String>,
    #[serde(default)]
    challenge_url: Option<String>,
}

/// Owns credentials and the authenticated session for one account.
///
/// Share it behind an [`Arc`]; every method takes `&self`.
pub struct SessionManager {
    credentials: Credentials,
    client: reqwest::Client,
    auth_url: Url,
    store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
    settled: Notify,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.credentials.identity())
            .field("auth_url", &self.auth_url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager with its own login client built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for invalid configuration and
    /// [`ClientError::Build`] if the HTTP client cannot be built.
    pub fn new(
        credentials: Credentials,
        store: Arc<dyn CredentialStore>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let headers = user_agent::auth_headers(&config.auth_headers)?;
        let client = build_http_client(headers, config)?;
        Ok(Self::with_http_client(credentials, store, client, config)?)
    }

    /// Creates a manager around a caller-supplied login client.
    ///
    /// The client should carry the login identification headers; see
    /// [`SessionManager::new`] for the default setup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] if the login URL cannot be derived.
    pub fn with_http_client(
        credentials: Credentials,
        store: Arc<dyn CredentialStore>,
        client: reqwest::Client,
        config: &ClientConfig,
    ) -> Result<Self, ConfigError> {
        let base = config.base_url()?;
        let auth_url = join_endpoint(&base, AUTH_PATH).map_err(|e| ConfigError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            credentials,
            client,
            auth_url,
            store,
            state: Mutex::new(SessionState::default()),
            settled: Notify::new(),
        })
    }

    /// Account identity this manager logs in as.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.credentials.identity()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Whether the session is currently `Authenticated`.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// CSRF token of the current (or last) session.
    #[must_use]
    pub fn csrf_token(&self) -> Option<String> {
        self.lock_state().csrf_token.clone()
    }

    /// `cookie` header value for the current (or last) session.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        let state = self.lock_state();
        (!state.jar.is_empty()).then(|| state.jar.cookie_header())
    }

    /// Authorization headers for the current (or last) session.
    ///
    /// While a reauthentication is running this still returns the previous
    /// session's headers; callers that hit an authorization failure with them
    /// go through recovery.
    #[must_use]
    pub fn current_headers(&self) -> Option<AuthHeaders> {
        let state = self.lock_state();
        state
            .csrf_token
            .as_ref()
            .map(|csrf| AuthHeaders::new(csrf.clone(), state.jar.cookie_header()))
    }

    /// Makes sure the session is usable, restoring or logging in as needed.
    ///
    /// Returns immediately when already authenticated. If another task is
    /// logging in, waits for it and re-checks. Otherwise adopts a persisted,
    /// unexpired session for this identity, falling back to a full login.
    ///
    /// # Errors
    ///
    /// Returns the login's [`AuthError`]; the status is then `Unauthenticated`.
    #[instrument(skip(self), fields(identity = %self.identity()))]
    pub async fn ensure_authenticated(&self) -> Result<(), AuthError> {
        loop {
            // Register before inspecting state so a settle between the check
            // and the await is not missed.
            let settled = self.settled.notified();
            let flight = {
                let mut state = self.lock_state();
                match state.status {
                    SessionStatus::Authenticated => {
                        debug!("session already authenticated");
                        return Ok(());
                    }
                    SessionStatus::Authenticating | SessionStatus::Reauthenticating => None,
                    SessionStatus::Unauthenticated => {
                        state.status = SessionStatus::Authenticating;
                        Some(LoginFlight::new(self, SessionStatus::Authenticating))
                    }
                }
            };

            match flight {
                Some(flight) => return self.restore_or_login(flight).await,
                None => {
                    debug!("login in flight; waiting for it to settle");
                    settled.await;
                }
            }
        }
    }

    /// Runs the full two-step login handshake.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LoginInProgress`] if another login flow is running,
    /// otherwise the handshake's error.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let flight = self
            .begin_flight(SessionStatus::Authenticating)
            .ok_or(AuthError::LoginInProgress)?;
        self.login(flight).await.map(|_| ())
    }

    /// Logs in again after an authorization failure and returns fresh headers.
    ///
    /// Returns `None` without touching the network when a login is already in
    /// flight, and `None` (after logging a warning) when the login fails.
    pub async fn reauthenticate_and_get_headers(&self) -> Option<AuthHeaders> {
        let Some(flight) = self.begin_flight(SessionStatus::Reauthenticating) else {
            debug!(identity = %self.identity(), "login already in flight; skipping reauthentication");
            return None;
        };

        info!(identity = %self.identity(), "reauthenticating after authorization failure");
        match self.login(flight).await {
            Ok(headers) => Some(headers),
            Err(error) => {
                warn!(identity = %self.identity(), error = %error, "reauthentication failed");
                None
            }
        }
    }

    /// Drops an authenticated session and its persisted copy.
    ///
    /// Returns `true` if the session was authenticated. A login in flight is
    /// left alone.
    pub fn invalidate(&self) -> bool {
        let was_authenticated = {
            let mut state = self.lock_state();
            if state.status == SessionStatus::Authenticated {
                *state = SessionState::default();
                true
            } else {
                false
            }
        };

        if was_authenticated {
            info!(identity = %self.identity(), "session invalidated");
            if let Err(error) = self.store.clear(self.identity()) {
                warn!(error = %error, "failed to clear persisted session");
            }
        }
        was_authenticated
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_flight(&self, kind: SessionStatus) -> Option<LoginFlight<'_>> {
        let mut state = self.lock_state();
        if state.status.is_in_flight() {
            return None;
        }
        state.status = kind;
        Some(LoginFlight::new(self, kind))
    }

    async fn restore_or_login(&self, flight: LoginFlight<'_>) -> Result<(), AuthError> {
        if let Some((jar, csrf_token)) = self.restore_persisted().await {
            info!(cookies = jar.len(), "restored persisted session");
            flight.complete(jar, csrf_token);
            return Ok(());
        }
        self.login(flight).await.map(|_| ())
    }

    /// Loads the persisted blob and checks it is still usable.
    async fn restore_persisted(&self) -> Option<(CookieJar, String)> {
        let store = Arc::clone(&self.store);
        let identity = self.identity().to_string();
        let loaded = tokio::task::spawn_blocking(move || store.load(&identity))
            .await
            .unwrap_or_else(|join_error| Err(StorageError::Io(std::io::Error::other(join_error))));
        let blob = match loaded {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                debug!("no persisted session");
                return None;
            }
            Err(error) => {
                warn!(error = %error, "failed to read persisted session; logging in");
                return None;
            }
        };

        let restored = CookieJar::parse(&blob).and_then(|jar| {
            let csrf_token = jar.csrf_token(SystemTime::now())?;
            Ok((jar, csrf_token))
        });
        match restored {
            Ok(restored) => Some(restored),
            Err(error) => {
                warn!(error = %error, "persisted session unusable; logging in");
                None
            }
        }
    }

    #[instrument(skip_all, fields(identity = %self.identity(), kind = flight.kind.as_str()))]
    async fn login(&self, flight: LoginFlight<'_>) -> Result<AuthHeaders, AuthError> {
        let (jar, csrf_token) = self.handshake().await?;
        self.persist(&jar).await;
        info!(cookies = jar.len(), "login succeeded");
        Ok(flight.complete(jar, csrf_token))
    }

    async fn handshake(&self) -> Result<(CookieJar, String), AuthError> {
        let url = self.auth_url.as_str();

        let seed = self
            .client
            .get(self.auth_url.clone())
            .send()
            .await
            .map_err(|e| AuthError::network(url, e))?;
        if !seed.status().is_success() {
            return Err(AuthError::HttpStatus {
                status: seed.status().as_u16(),
            });
        }
        let seed_jar = jar_from_response(seed.headers())?;
        let seed_csrf = seed_jar.csrf_token(SystemTime::now())?;
        debug!(cookies = seed_jar.len(), "received seed session");

        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("session_key", self.credentials.identity())
            .append_pair("session_password", self.credentials.secret())
            .append_pair("JSESSIONID", &seed_csrf)
            .finish();
        let response = self
            .client
            .post(self.auth_url.clone())
            .header(CSRF_HEADER, seed_csrf.as_str())
            .header(COOKIE, seed_jar.cookie_header())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(form)
            .send()
            .await
            .map_err(|e| AuthError::network(url, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidCredentials);
        }
        if status != StatusCode::OK {
            return Err(AuthError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let login_headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::network(url, e))?;
        let outcome: LoginResponse = serde_json::from_slice(&body)?;
        match outcome.login_result.as_deref() {
            Some(LOGIN_PASS) => {}
            other => {
                return Err(AuthError::ChallengeRequired {
                    result: other.unwrap_or("<missing>").to_string(),
                    challenge_url: outcome.challenge_url,
                });
            }
        }

        // The login response's cookies replace the seed session.
        let jar = jar_from_response(&login_headers)?;
        let csrf_token = jar.csrf_token(SystemTime::now())?;
        Ok((jar, csrf_token))
    }

    /// Writes the jar through the store on the blocking pool.
    async fn persist(&self, jar: &CookieJar) {
        let store = Arc::clone(&self.store);
        let identity = self.identity().to_string();
        let blob = jar.to_set_cookie_string();
        let stored = tokio::task::spawn_blocking(move || store.store(&identity, &blob))
            .await
            .unwrap_or_else(|join_error| Err(StorageError::Io(std::io::Error::other(join_error))));
        if let Err(error) = stored {
            warn!(error = %error, "failed to persist session; continuing with in-memory session");
        }
    }
}

fn jar_from_response(headers: &reqwest::header::HeaderMap) -> Result<CookieJar, AuthError> {
    let folded = folded_set_cookie(headers).ok_or(AuthError::MissingCookie)?;
    CookieJar::parse(&folded)
}

#[async_trait]
impl AuthProvider for SessionManager {
    fn current_headers(&self) -> Option<AuthHeaders> {
        SessionManager::current_headers(self)
    }

    async fn reauthenticate_and_get_headers(&self) -> Option<AuthHeaders> {
        SessionManager::reauthenticate_and_get_headers(self).await
    }
}

/// Exclusive claim on the session while a login runs.
///
/// Dropping it without [`LoginFlight::complete`] returns the session to
/// `Unauthenticated`. Either way, tasks waiting in `ensure_authenticated` wake.
struct LoginFlight<'a> {
    manager: &'a SessionManager,
    kind: SessionStatus,
    completed: bool,
}

impl<'a> LoginFlight<'a> {
    fn new(manager: &'a SessionManager, kind: SessionStatus) -> Self {
        Self {
            manager,
            kind,
            completed: false,
        }
    }

    fn complete(mut self, jar: CookieJar, csrf_token: String) -> AuthHeaders {
        let headers = AuthHeaders::new(csrf_token.clone(), jar.cookie_header());
        {
            let mut state = self.manager.lock_state();
            state.jar = jar;
            state.csrf_token = Some(csrf_token);
            state.status = SessionStatus::Authenticated;
        }
        self.completed = true;
        self.manager.settled.notify_waiters();
        headers
    }
}

impl Drop for LoginFlight<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        {
            let mut state = self.manager.lock_state();
            if state.status == self.kind {
                state.status = SessionStatus::Unauthenticated;
            }
        }
        debug!(kind = self.kind.as_str(), "login flight ended without a session");
        self.manager.settled.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::MemoryCredentialStore;

    const IDENTITY: &str = "user@example.com";

    // Nothing listens on the discard port; tests that reach the network fail fast.
    fn unreachable_config() -> ClientConfig {
        let mut config = ClientConfig::with_base_url("http://127.0.0.1:9");
        config.connect_timeout_secs = 1;
        config.read_timeout_secs = 1;
        config
    }

    fn manager_with(store: Arc<dyn CredentialStore>) -> SessionManager {
        let credentials = Credentials::new(IDENTITY, "hunter2").unwrap();
        SessionManager::new(credentials, store, &unreachable_config()).unwrap()
    }

    fn valid_blob() -> String {
        let expires = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(3600));
        format!("JSESSIONID=\"ajax:persisted\"; Expires={expires}; Path=/, li_at=token; Secure")
    }

    #[test]
    fn test_auth_url_joins_base() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        assert_eq!(
            manager.auth_url.as_str(),
            "http://127.0.0.1:9/uas/authenticate"
        );
    }

    #[test]
    fn test_new_manager_is_unauthenticated() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
        assert!(manager.current_headers().is_none());
        assert!(manager.cookie_header().is_none());
        assert_eq!(manager.identity(), IDENTITY);
    }

    #[test]
    fn test_begin_flight_is_exclusive() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let flight = manager.begin_flight(SessionStatus::Authenticating).unwrap();
        assert_eq!(manager.status(), SessionStatus::Authenticating);
        assert!(manager.begin_flight(SessionStatus::Reauthenticating).is_none());
        assert!(manager.begin_flight(SessionStatus::Authenticating).is_none());
        drop(flight);
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
    }

    #[test]
    fn test_dropped_reauth_flight_resets_status() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let flight = manager.begin_flight(SessionStatus::Reauthenticating).unwrap();
        assert_eq!(manager.status(), SessionStatus::Reauthenticating);
        drop(flight);
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
    }

    #[test]
    fn test_completed_flight_installs_session() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let jar = CookieJar::parse("JSESSIONID=\"ajax:9\", li_at=t").unwrap();
        let flight = manager.begin_flight(SessionStatus::Authenticating).unwrap();
        let headers = flight.complete(jar, "ajax:9".to_string());

        assert_eq!(manager.status(), SessionStatus::Authenticated);
        assert_eq!(headers.csrf_token, "ajax:9");
        assert_eq!(headers.cookie, "JSESSIONID=\"ajax:9\"; li_at=t");
        assert_eq!(manager.current_headers(), Some(headers));
        assert_eq!(manager.csrf_token().as_deref(), Some("ajax:9"));
    }

    #[tokio::test]
    async fn test_ensure_authenticated_restores_persisted_session_without_network() {
        let store = Arc::new(MemoryCredentialStore::with_entry(IDENTITY, valid_blob()));
        let manager = manager_with(store);

        manager.ensure_authenticated().await.unwrap();

        assert!(manager.is_authenticated());
        assert_eq!(manager.csrf_token().as_deref(), Some("ajax:persisted"));
        assert!(
            manager
                .cookie_header()
                .unwrap()
                .contains("li_at=token")
        );
    }

    /// Records which thread served each `load`.
    struct ThreadRecordingStore {
        inner: MemoryCredentialStore,
        load_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl CredentialStore for ThreadRecordingStore {
        fn load(&self, identity: &str) -> Result<Option<String>, StorageError> {
            self.load_threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            self.inner.load(identity)
        }

        fn store(&self, identity: &str, blob: &str) -> Result<(), StorageError> {
            self.inner.store(identity, blob)
        }

        fn clear(&self, identity: &str) -> Result<bool, StorageError> {
            self.inner.clear(identity)
        }
    }

    #[tokio::test]
    async fn test_restore_reads_store_off_the_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore {
            inner: MemoryCredentialStore::with_entry(IDENTITY, valid_blob()),
            load_threads: Mutex::new(Vec::new()),
        });
        let manager = manager_with(store.clone());

        manager.ensure_authenticated().await.unwrap();

        let threads = store.load_threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn test_ensure_authenticated_is_noop_when_authenticated() {
        let store = Arc::new(MemoryCredentialStore::with_entry(IDENTITY, valid_blob()));
        let manager = manager_with(store.clone());
        manager.ensure_authenticated().await.unwrap();

        // Even with the blob gone, a second call must not look for it.
        store.clear(IDENTITY).unwrap();
        manager.ensure_authenticated().await.unwrap();
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_fails_fast_while_login_in_flight() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let _flight = manager.begin_flight(SessionStatus::Reauthenticating).unwrap();

        let result = manager.authenticate().await;
        assert!(matches!(result, Err(AuthError::LoginInProgress)));
        assert_eq!(manager.status(), SessionStatus::Reauthenticating);
    }

    #[tokio::test]
    async fn test_reauthenticate_returns_none_while_login_in_flight() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let _flight = manager.begin_flight(SessionStatus::Authenticating).unwrap();

        assert!(manager.reauthenticate_and_get_headers().await.is_none());
        assert_eq!(manager.status(), SessionStatus::Authenticating);
    }

    #[tokio::test]
    async fn test_failed_login_leaves_unauthenticated() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let result = manager.authenticate().await;
        assert!(matches!(result, Err(AuthError::Network { .. })));
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_invalidate_clears_session_and_store() {
        let store = Arc::new(MemoryCredentialStore::with_entry(IDENTITY, valid_blob()));
        let manager = manager_with(store.clone());
        manager.ensure_authenticated().await.unwrap();

        assert!(manager.invalidate());
        assert_eq!(manager.status(), SessionStatus::Unauthenticated);
        assert!(manager.current_headers().is_none());
        assert!(store.load(IDENTITY).unwrap().is_none());
        assert!(!manager.invalidate());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(SessionStatus::default(), SessionStatus::Unauthenticated);
        assert_eq!(SessionStatus::Reauthenticating.as_str(), "reauthenticating");
        assert!(SessionStatus::Authenticating.is_in_flight());
        assert!(!SessionStatus::Authenticated.is_in_flight());
    }

    #[test]
    fn test_debug_omits_secret() {
        let manager = manager_with(Arc::new(MemoryCredentialStore::new()));
        let debug = format!("{manager:?}");
        assert!(debug.contains(IDENTITY));
        assert!(!debug.contains("hunter2"));
    }
}
