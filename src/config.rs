//! Client configuration and account credentials.
//!
//! [`ClientConfig`] carries everything that shapes the HTTP clients (origin,
//! timeouts, extra identification headers) and the request throttle. It is
//! plain data with defaults; call [`ClientConfig::validate`] before building
//! a client (the constructors in [`crate::client`] do this for you).
//!
//! [`Credentials`] are resolved explicitly or from the environment
//! (`LINKEDIN_EMAIL` / `LINKEDIN_PASSWORD`).

use std::env;
use std::fmt;
use std::time::Duration;

use url::Url;

/// Default web origin of the remote service.
pub const DEFAULT_BASE_URL: &str = "https://www.linkedin.com";

/// Environment variable holding the account identity (email).
pub const IDENTITY_ENV_VAR: &str = "LINKEDIN_EMAIL";

/// Environment variable holding the account secret (password).
pub const SECRET_ENV_VAR: &str = "LINKEDIN_PASSWORD";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

const DEFAULT_JITTER_MIN: Duration = Duration::from_secs(1);
const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(5);
const DEFAULT_RATE_LIMIT: u32 = 1;
const DEFAULT_RATE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for any single jitter delay.
const MAX_JITTER: Duration = Duration::from_secs(60);

/// Errors raised while resolving or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No identity/secret supplied and none resolvable from the environment.
    #[error(
        "missing credentials: supply an identity and secret or set {IDENTITY_ENV_VAR} and {SECRET_ENV_VAR}"
    )]
    MissingCredentials,

    /// The configured base URL cannot be used as an HTTP origin.
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Throttle settings are inconsistent.
    #[error("invalid throttle configuration: {0}")]
    InvalidThrottle(String),

    /// A timeout value is outside the accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: 1..=3600")]
    InvalidTimeout {
        /// Config field name.
        field: &'static str,
        /// Rejected value.
        value: u64,
    },

    /// A configured extra header has an invalid name or value.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

/// Account credentials used by the login handshake.
///
/// The secret is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    identity: String,
    secret: String,
}

impl Credentials {
    /// Creates credentials from explicit values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] when either value is blank.
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Result<Self, ConfigError> {
        let identity = identity.into();
        let secret = secret.into();
        if identity.trim().is_empty() || secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(Self {
            identity: identity.trim().to_string(),
            secret,
        })
    }

    /// Resolves credentials from `LINKEDIN_EMAIL` and `LINKEDIN_PASSWORD`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] when either variable is
    /// absent or blank.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let identity = non_empty(lookup(IDENTITY_ENV_VAR)).ok_or(ConfigError::MissingCredentials)?;
        let secret = non_empty(lookup(SECRET_ENV_VAR)).ok_or(ConfigError::MissingCredentials)?;
        Self::new(identity, secret)
    }

    /// Account identity; also the key under which the session is persisted.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Account secret. Never log the return value.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Pre-request throttle settings for the authenticated API client.
///
/// The login client is never throttled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Whether throttling is applied at all.
    pub enabled: bool,
    /// Lower bound of the random delay injected before each request.
    pub jitter_min: Duration,
    /// Upper bound of the random delay injected before each request.
    pub jitter_max: Duration,
    /// Requests admitted per `interval`.
    pub limit: u32,
    /// Rate-limit window.
    pub interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
            limit: DEFAULT_RATE_LIMIT,
            interval: DEFAULT_RATE_INTERVAL,
        }
    }
}

impl ThrottleConfig {
    /// Throttle settings that let every request straight through.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Checks the settings for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidThrottle`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.limit == 0 {
            return Err(ConfigError::InvalidThrottle(
                "limit must admit at least one request per interval".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidThrottle(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.jitter_min > self.jitter_max {
            return Err(ConfigError::InvalidThrottle(format!(
                "jitter_min ({:?}) exceeds jitter_max ({:?})",
                self.jitter_min, self.jitter_max
            )));
        }
        if self.jitter_max > MAX_JITTER {
            return Err(ConfigError::InvalidThrottle(format!(
                "jitter_max ({:?}) exceeds {:?}",
                self.jitter_max, MAX_JITTER
            )));
        }
        Ok(())
    }
}

/// Construction parameters for [`crate::Client`], [`crate::SessionManager`]
/// and [`crate::RequestPipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Web origin; login lives at `uas/authenticate`, the API under `voyager/api/`.
    pub base_url: String,
    /// API request throttle.
    pub throttle: ThrottleConfig,
    /// TCP connect timeout for both clients.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for both clients.
    pub read_timeout_secs: u64,
    /// Extra headers for API requests; override the defaults by name.
    pub api_headers: Vec<(String, String)>,
    /// Extra headers for login requests; override the defaults by name.
    pub auth_headers: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            throttle: ThrottleConfig::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            api_headers: Vec::new(),
            auth_headers: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Returns a default configuration pointed at `base_url`.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        self.throttle.validate()?;
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }

    /// Parses the base URL, requiring an `http`/`https` origin.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] when the URL is malformed or
    /// uses another scheme.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let parsed = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(parsed)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whole-request timeout as a [`Duration`].
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::InvalidTimeout { field, value });
    }
    Ok(())
}

/// Joins `path` onto `base`, treating `base` as a directory.
///
/// `https://host/prefix` + `a/b` gives `https://host/prefix/a/b`; a leading
/// slash on `path` does not escape the prefix.
pub(crate) fn join_endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}
