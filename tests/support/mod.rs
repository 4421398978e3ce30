//! Shared fixtures for integration tests: mock-server guard, login mocks,
//! and configuration pointed at a mock server.

#![allow(dead_code)]

pub mod socket_guard;

use std::sync::Once;
use std::time::{Duration, SystemTime};

use linkedin_core::{ClientConfig, Credentials, ThrottleConfig};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const IDENTITY: &str = "user@example.com";
pub const SECRET: &str = "hunter2";
pub const LOGIN_PATH: &str = "/uas/authenticate";

static TRACING: Once = Once::new();

/// Routes library logs to the test harness; `RUST_LOG` filters them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn credentials() -> Credentials {
    Credentials::new(IDENTITY, SECRET).unwrap()
}

/// Default config aimed at `server`, with throttling off so tests run at wire speed.
pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig {
        throttle: ThrottleConfig::disabled(),
        ..ClientConfig::with_base_url(server.uri())
    }
}

pub fn http_date_in(secs: u64) -> String {
    httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(secs))
}

pub fn session_cookie(token: &str, expires: &str) -> String {
    format!("JSESSIONID=\"{token}\"; Expires={expires}; Path=/; Secure")
}

/// A persisted blob holding a session that is valid for another hour.
pub fn persisted_blob(token: &str) -> String {
    format!(
        "{}, li_at=persisted-li-at; Path=/; HttpOnly",
        session_cookie(token, &http_date_in(3600))
    )
}

/// Seed GET that hands out `JSESSIONID="<seed>"`.
pub fn seed_response(seed: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .append_header("set-cookie", session_cookie(seed, &http_date_in(3600)).as_str())
        .append_header("set-cookie", "bcookie=\"v=2&seed\"; Path=/")
}

/// Successful login POST that hands out `JSESSIONID="<token>"`.
pub fn login_pass_response(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .append_header("set-cookie", session_cookie(token, &http_date_in(3600)).as_str())
        .append_header("set-cookie", "li_at=fresh-li-at; Path=/; HttpOnly")
        .set_body_json(json!({ "login_result": "PASS" }))
}

/// Mounts a complete, successful handshake expected exactly `times` times.
pub async fn mount_login(server: &MockServer, seed: &str, token: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path(LOGIN_PATH))
        .respond_with(seed_response(seed))
        .expect(times)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(login_pass_response(token))
        .expect(times)
        .mount(server)
        .await;
}
