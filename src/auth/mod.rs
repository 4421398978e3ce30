//! Cookie-session authentication.
//!
//! [`SessionManager`] performs the login handshake, restores persisted
//! sessions through a [`CredentialStore`], and hands the request pipeline
//! fresh [`AuthHeaders`] after an authorization failure via [`AuthProvider`].

mod cookies;
mod error;
mod provider;
mod session;
mod storage;

pub use cookies::{
    Cookie, CookieJar, SESSION_COOKIE_NAME, derive_csrf_token, folded_set_cookie,
    split_set_cookie_string,
};
pub use error::AuthError;
pub use provider::{AuthHeaders, AuthProvider, CSRF_HEADER};
pub use session::{AUTH_PATH, SessionManager, SessionStatus};
pub use storage::{
    CredentialStore, EncryptedFileStore, MASTER_KEY_ENV_VAR, MemoryCredentialStore, StorageError,
};
