//! High-level client tying a session to a request pipeline.
//!
//! # Example
//!
//! ```no_run
//! use linkedin_core::{Client, ClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::from_env(&ClientConfig::default())?;
//! let me: serde_json::Value = client.get_json("me").await?;
//! println!("{me}");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::auth::{AuthError, CredentialStore, EncryptedFileStore, SessionManager, StorageError};
use crate::config::{ClientConfig, ConfigError, Credentials};
use crate::request::{RequestError, RequestPipeline};

/// Errors raised while constructing or preparing a [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Configuration or credentials are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The underlying HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// The HTTP client builder panicked even with the env-proxy fallback.
    #[error("HTTP client builder panicked while loading proxy settings")]
    BuilderPanicked,

    /// The default session store could not be located.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Establishing the session failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// An authenticated API client for one account.
///
/// The login client and the API client are separate: only API traffic is
/// throttled, and the API client picks up the session's headers on every
/// request.
#[derive(Debug)]
pub struct Client {
    session: Arc<SessionManager>,
    pipeline: RequestPipeline,
}

impl Client {
    /// Creates a client for `credentials`, persisting sessions in `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] for invalid configuration or HTTP client
    /// construction failures.
    pub fn new(
        credentials: Credentials,
        store: Arc<dyn CredentialStore>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let session = Arc::new(SessionManager::new(credentials, store, config)?);
        let pipeline = RequestPipeline::new(config, Arc::clone(&session) as _)?;
        Ok(Self { session, pipeline })
    }

    /// Creates a client from `LINKEDIN_EMAIL` / `LINKEDIN_PASSWORD`, persisting
    /// sessions in the default encrypted store.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when credentials are missing and
    /// [`ClientError::Storage`] when no config directory can be found.
    pub fn from_env(config: &ClientConfig) -> Result<Self, ClientError> {
        let credentials = Credentials::from_env()?;
        let store = Arc::new(EncryptedFileStore::new()?);
        Self::new(credentials, store, config)
    }

    /// The session manager.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// The request pipeline, for raw requests.
    #[must_use]
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Restores or establishes the session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Auth`] if login fails.
    #[instrument(skip(self))]
    pub async fn ensure_ready(&self) -> Result<(), ClientError> {
        self.session.ensure_authenticated().await?;
        Ok(())
    }

    /// Ensures a session, then GETs `path` and decodes JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] from the login or the request.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.session.ensure_authenticated().await?;
        self.pipeline.get_json(path).await
    }

    /// Ensures a session, then GETs `path` with `query` and decodes JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] from the login or the request.
    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RequestError> {
        self.session.ensure_authenticated().await?;
        self.pipeline.get_json_with_query(path, query).await
    }

    /// Ensures a session, then POSTs `body` as JSON and decodes the reply.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] from the login or the request.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.session.ensure_authenticated().await?;
        self.pipeline.post_json(path, body).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    #[test]
    fn test_new_client_starts_unauthenticated() {
        let credentials = Credentials::new("user@example.com", "hunter2").unwrap();
        let client = Client::new(
            credentials,
            Arc::new(MemoryCredentialStore::new()),
            &ClientConfig::default(),
        )
        .unwrap();
        assert!(!client.session().is_authenticated());
        assert_eq!(
            client.pipeline().api_base().as_str(),
            "https://www.linkedin.com/voyager/api/"
        );
    }

    #[test]
    fn test_new_client_rejects_invalid_config() {
        let credentials = Credentials::new("user@example.com", "hunter2").unwrap();
        let mut config = ClientConfig::default();
        config.read_timeout_secs = 0;
        let result = Client::new(credentials, Arc::new(MemoryCredentialStore::new()), &config);
        assert!(matches!(
            result,
            Err(ClientError::Config(ConfigError::InvalidTimeout { .. }))
        ));
    }
}
