//! `reqwest::Client` construction shared by the login and API clients.

use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::sync::{Mutex, PoisonError};

use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::warn;

use crate::client::ClientError;
use crate::config::ClientConfig;

// `catch_unwind` does not silence the panic hook; builds that are expected to
// recover from a system-proxy panic swap the hook out while they run.
static CLIENT_BUILD_PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());

/// Builds a client with `default_headers`, gzip, and the configured timeouts.
///
/// Some platforms panic while reading system proxy settings; in that case the
/// build is retried once with proxies taken from the environment only.
///
/// # Errors
///
/// Returns [`ClientError::Build`] if reqwest rejects the configuration, or
/// [`ClientError::BuilderPanicked`] if both attempts panic.
pub(crate) fn build_http_client(
    default_headers: HeaderMap,
    config: &ClientConfig,
) -> Result<Client, ClientError> {
    match try_build(default_headers.clone(), config, false) {
        Ok(client) => Ok(client),
        Err(BuildFailure::Build(error)) => Err(ClientError::Build(error)),
        Err(BuildFailure::Panic) => {
            warn!(
                "HTTP client builder panicked while loading system proxy settings; retrying with env-proxy fallback"
            );
            match try_build(default_headers, config, true) {
                Ok(client) => Ok(client),
                Err(BuildFailure::Build(error)) => Err(ClientError::Build(error)),
                Err(BuildFailure::Panic) => Err(ClientError::BuilderPanicked),
            }
        }
    }
}

enum BuildFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build(
    default_headers: HeaderMap,
    config: &ClientConfig,
    env_proxy_only: bool,
) -> Result<Client, BuildFailure> {
    catch_unwind_silent(AssertUnwindSafe(move || {
        let mut builder = base_builder(default_headers, config);
        if env_proxy_only {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildFailure::Build)
    }))
    .map_err(|_| BuildFailure::Panic)?
}

fn catch_unwind_silent<F, T>(operation: F) -> Result<T, Box<dyn std::any::Any + Send + 'static>>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    let _hook_guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(operation);
    set_hook(previous_hook);
    outcome
}

fn base_builder(default_headers: HeaderMap, config: &ClientConfig) -> ClientBuilder {
    Client::builder()
        .default_headers(default_headers)
        .connect_timeout(config.connect_timeout())
        .timeout(config.read_timeout())
        .gzip(true)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = first_env_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = first_env_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn first_env_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
