//! Throttled, self-healing API request pipeline.
//!
//! Every request takes the same path:
//!
//! 1. throttle (jitter, then rate-limit admission);
//! 2. attach the provider's current `csrf-token` and `cookie` headers;
//! 3. send;
//! 4. on 401/403, ask the provider to reauthenticate and, if it hands back
//!    fresh headers, resend a patched copy of the request exactly once.
//!
//! Recovery never hides the original failure: if reauthentication is skipped
//! or fails, or the retry cannot be sent, the caller gets the original
//! response back.

use std::sync::Arc;

use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use url::Url;

use super::error::RequestError;
use super::throttle::Throttle;
use crate::auth::AuthProvider;
use crate::client::ClientError;
use crate::config::{ClientConfig, ConfigError, join_endpoint};
use crate::http::build_http_client;
use crate::user_agent;

/// API prefix, relative to the base URL.
pub const API_PATH: &str = "voyager/api/";

/// Sends authenticated API requests and recovers from expired sessions.
pub struct RequestPipeline {
    client: reqwest::Client,
    api_base: Url,
    throttle: Option<Throttle>,
    auth: Arc<dyn AuthProvider>,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("api_base", &self.api_base.as_str())
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl RequestPipeline {
    /// Creates a pipeline with its own API client built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] for invalid configuration and
    /// [`ClientError::Build`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, ClientError> {
        config.validate()?;
        let headers = user_agent::api_headers(&config.api_headers)?;
        let client = build_http_client(headers, config)?;
        Ok(Self::with_http_client(client, config, auth)?)
    }

    /// Creates a pipeline around a caller-supplied API client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] if the API base cannot be derived.
    pub fn with_http_client(
        client: reqwest::Client,
        config: &ClientConfig,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, ConfigError> {
        let base = config.base_url()?;
        let api_base = join_endpoint(&base, API_PATH).map_err(|e| ConfigError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            api_base,
            throttle: Throttle::from_config(&config.throttle),
            auth,
        })
    }

    /// Base URL all API paths are resolved against.
    #[must_use]
    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    /// The pipeline's throttle, if enabled.
    #[must_use]
    pub fn throttle(&self) -> Option<&Throttle> {
        self.throttle.as_ref()
    }

    /// Resolves an API path (`me`, `/identity/profiles/x`) to a full URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPath`] if the path does not parse.
    pub fn url_for(&self, path: &str) -> Result<Url, RequestError> {
        join_endpoint(&self.api_base, path).map_err(|source| RequestError::InvalidPath {
            path: path.to_string(),
            source,
        })
    }

    /// Starts a request on the API client. Send it with [`Self::execute`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPath`] if the path does not parse.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, RequestError> {
        Ok(self.client.request(method, self.url_for(path)?))
    }

    /// GET `path`, returning the final response whatever its status.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] for bad paths and transport failures.
    pub async fn get(&self, path: &str) -> Result<Response, RequestError> {
        self.get_with_query(path, &[]).await
    }

    /// GET `path` with query parameters appended.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] for bad paths and transport failures.
    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response, RequestError> {
        let mut url = self.url_for(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        self.send(self.client.get(url)).await
    }

    /// GET `path` and decode a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::HttpStatus`] for non-success final responses and
    /// [`RequestError::Decode`] for bodies that do not match `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        decode_json(self.get(path).await?).await
    }

    /// GET `path` with query parameters and decode a JSON body.
    ///
    /// # Errors
    ///
    /// As [`Self::get_json`].
    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RequestError> {
        decode_json(self.get_with_query(path, query).await?).await
    }

    /// POST a JSON body to `path` and decode a JSON response.
    ///
    /// # Errors
    ///
    /// As [`Self::get_json`].
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let builder = self.request(Method::POST, path)?.json(body);
        decode_json(self.send(builder).await?).await
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RequestError> {
        let request = builder.build().map_err(|e| {
            let url = e.url().map_or_else(|| "<unknown>".to_string(), ToString::to_string);
            RequestError::network(url, e)
        })?;
        self.execute(request).await
    }

    /// Sends a prepared request through the throttle and recovery logic.
    ///
    /// The final response is returned whatever its status; only transport
    /// failures of the first attempt are errors.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Network`] if the request cannot be sent and
    /// [`RequestError::Auth`] if the session headers cannot be encoded.
    #[instrument(skip_all, fields(method = %request.method(), url = %request.url()))]
    pub async fn execute(&self, mut request: Request) -> Result<Response, RequestError> {
        if let Some(throttle) = &self.throttle {
            throttle.before_request().await;
        }
        if let Some(headers) = self.auth.current_headers() {
            headers.apply(request.headers_mut())?;
        }

        let replay = request.try_clone();
        let url = request.url().to_string();
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| RequestError::network(&url, e))?;

        if !is_auth_failure(response.status()) {
            return Ok(response);
        }
        Ok(self.recover(response, replay).await)
    }

    async fn recover(&self, original: Response, replay: Option<Request>) -> Response {
        warn!(
            status = original.status().as_u16(),
            "authorization failure; attempting reauthentication"
        );

        let Some(headers) = self.auth.reauthenticate_and_get_headers().await else {
            debug!("no fresh session available; returning original response");
            return original;
        };
        let Some(mut retry) = replay else {
            warn!("request body cannot be replayed; returning original response");
            return original;
        };
        if let Err(error) = headers.apply(retry.headers_mut()) {
            warn!(error = %error, "cannot attach fresh session headers; returning original response");
            return original;
        }

        if let Some(throttle) = &self.throttle {
            throttle.before_retry().await;
        }
        match self.client.execute(retry).await {
            Ok(response) => {
                debug!(
                    status = response.status().as_u16(),
                    "retried request after reauthentication"
                );
                response
            }
            Err(error) => {
                warn!(error = %error, "retry after reauthentication failed; returning original response");
                original
            }
        }
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, RequestError> {
    let url = response.url().to_string();
    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                debug!(error = %error, "failed to read error response body");
                String::new()
            }
        };
        return Err(RequestError::http_status(url, status.as_u16(), &body));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| RequestError::network(&url, e))?;
    serde_json::from_slice(&bytes).map_err(|source| RequestError::Decode { url, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::auth::AuthHeaders;

    struct NoSession;

    #[async_trait]
    impl AuthProvider for NoSession {
        fn current_headers(&self) -> Option<AuthHeaders> {
            None
        }

        async fn reauthenticate_and_get_headers(&self) -> Option<AuthHeaders> {
            None
        }
    }

    fn pipeline(base: &str) -> RequestPipeline {
        RequestPipeline::new(&ClientConfig::with_base_url(base), Arc::new(NoSession)).unwrap()
    }

    #[test]
    fn test_api_base_is_under_voyager() {
        assert_eq!(
            pipeline("https://www.linkedin.com").api_base().as_str(),
            "https://www.linkedin.com/voyager/api/"
        );
    }

    #[test]
    fn test_url_for_keeps_prefix_with_leading_slash() {
        let pipeline = pipeline("https://www.linkedin.com");
        assert_eq!(
            pipeline.url_for("/me").unwrap().as_str(),
            "https://www.linkedin.com/voyager/api/me"
        );
        assert_eq!(
            pipeline.url_for("identity/profiles/jdoe").unwrap().as_str(),
            "https://www.linkedin.com/voyager/api/identity/profiles/jdoe"
        );
    }

    #[test]
    fn test_base_with_path_prefix() {
        let pipeline = pipeline("http://127.0.0.1:8080/proxy");
        assert_eq!(
            pipeline.url_for("me").unwrap().as_str(),
            "http://127.0.0.1:8080/proxy/voyager/api/me"
        );
    }

    #[test]
    fn test_default_config_enables_throttle() {
        assert!(pipeline("https://www.linkedin.com").throttle().is_some());
    }

    #[test]
    fn test_auth_failure_statuses() {
        assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
        assert!(is_auth_failure(StatusCode::FORBIDDEN));
        assert!(!is_auth_failure(StatusCode::NOT_FOUND));
        assert!(!is_auth_failure(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_unbuildable_request_is_network_error() {
        // JSON object keys must be strings, so the body cannot be serialized.
        let body: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        let result = pipeline("http://127.0.0.1:9")
            .post_json::<_, serde_json::Value>("messaging/conversations", &body)
            .await;

        match result {
            Err(RequestError::Network { source, .. }) => assert!(source.is_builder()),
            other => panic!("expected builder error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = RequestPipeline::new(&ClientConfig::with_base_url("not a url"), Arc::new(NoSession));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
