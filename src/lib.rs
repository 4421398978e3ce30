//! LinkedIn Client Core Library
//!
//! Cookie-session authentication and a throttled, self-healing request
//! pipeline for the LinkedIn web API.
//!
//! # Architecture
//!
//! - [`config`] - Client configuration and credentials
//! - [`auth`] - Login handshake, cookie jar, session persistence
//! - [`request`] - Throttle and request pipeline with reauthentication
//! - [`client`] - [`Client`], which wires a session to a pipeline
//!
//! The session and the pipeline only meet through [`AuthProvider`], so the
//! pipeline can run against any header source.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod client;
pub mod config;
mod http;
pub mod request;
mod user_agent;

// Re-export commonly used types
pub use auth::{
    AuthError, AuthHeaders, AuthProvider, CookieJar, CredentialStore, EncryptedFileStore,
    MemoryCredentialStore, SessionManager, SessionStatus, StorageError,
};
pub use client::{Client, ClientError};
pub use config::{ClientConfig, ConfigError, Credentials, ThrottleConfig};
pub use request::{RequestError, RequestPipeline, Throttle};
