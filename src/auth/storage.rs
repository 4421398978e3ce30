//! Persisted session cookies, keyed by account identity.
//!
//! The session manager only sees the [`CredentialStore`] trait. Two stores
//! ship with the crate:
//!
//! - [`MemoryCredentialStore`]: process-local, for tests and ephemeral use.
//! - [`EncryptedFileStore`]: one encrypted file per identity under
//!   `~/.config/linkedin-client/sessions/` (or
//!   `$XDG_CONFIG_HOME/linkedin-client/sessions/`).
//!
//! Blobs are folded `Set-Cookie` strings as produced by
//! [`crate::auth::CookieJar::to_set_cookie_string`].

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Environment variable that supplies the encryption key material directly.
pub const MASTER_KEY_ENV_VAR: &str = "LINKEDIN_CLIENT_MASTER_KEY";

const APP_DIR_NAME: &str = "linkedin-client";
const SESSIONS_DIR_NAME: &str = "sessions";
const SESSION_FILE_EXT: &str = "enc";
const KEYRING_SERVICE: &str = "linkedin-client";
const KEYRING_ENTRY_NAME: &str = "session-master-key-v1";
const MAGIC: &[u8; 4] = b"LKS1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Errors for persisted session storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No suitable user config directory is available.
    #[error("unable to determine config directory (set XDG_CONFIG_HOME or HOME)")]
    ConfigDirUnavailable,
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Could not access keychain and no env fallback key was provided.
    #[error(
        "unable to access system keychain for session encryption key; set {MASTER_KEY_ENV_VAR} or configure keychain access"
    )]
    KeychainUnavailable,
    /// Stored encrypted payload is malformed or belongs to another identity.
    #[error("persisted session payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt persisted session")]
    EncryptionFailed,
    /// Decryption failed (wrong key or tampered file).
    #[error("failed to decrypt persisted session")]
    DecryptionFailed,
}

/// Key-value persistence for session cookie blobs.
///
/// Implementations are synchronous and may block on disk or keychain access.
/// The session manager runs `load` and `store` on tokio's blocking pool;
/// `clear` runs inline from [`crate::auth::SessionManager::invalidate`], so
/// keep it cheap.
pub trait CredentialStore: Send + Sync {
    /// Reads the blob stored for `identity`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backing store cannot be read.
    fn load(&self, identity: &str) -> Result<Option<String>, StorageError>;

    /// Stores `blob` for `identity`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backing store cannot be written.
    fn store(&self, identity: &str, blob: &str) -> Result<(), StorageError>;

    /// Removes the blob for `identity`. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when removal fails.
    fn clear(&self, identity: &str) -> Result<bool, StorageError>;
}

/// In-memory store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with one blob.
    #[must_use]
    pub fn with_entry(identity: impl Into<String>, blob: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.into(), blob.into());
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, identity: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned())
    }

    fn store(&self, identity: &str, blob: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.to_string(), blob.to_string());
        Ok(())
    }

    fn clear(&self, identity: &str) -> Result<bool, StorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredSession {
    identity: String,
    set_cookie: String,
    saved_at: u64,
}

#[derive(Clone)]
enum KeySource {
    /// `LINKEDIN_CLIENT_MASTER_KEY`, falling back to the system keychain.
    /// Resolved on first use and shared by clones of the store.
    Resolve(Arc<OnceLock<String>>),
    Fixed(String),
}

/// Encrypted-at-rest store, one file per identity.
///
/// File names are the SHA-256 of the identity, so the directory listing does
/// not reveal account names. Files are written owner-only on Unix.
#[derive(Clone)]
pub struct EncryptedFileStore {
    dir: PathBuf,
    key: KeySource,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = match self.key {
            KeySource::Resolve(_) => "env-or-keychain",
            KeySource::Fixed(_) => "[REDACTED]",
        };
        f.debug_struct("EncryptedFileStore")
            .field("dir", &self.dir)
            .field("key", &key)
            .finish()
    }
}

impl EncryptedFileStore {
    /// Store rooted at the default sessions directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConfigDirUnavailable`] if no usable config dir is found.
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_dir(default_sessions_dir()?))
    }

    /// Store rooted at `dir`, with the key resolved from the environment or keychain.
    #[must_use]
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key: KeySource::Resolve(Arc::default()),
        }
    }

    /// Store rooted at `dir` using explicit key material.
    #[must_use]
    pub fn with_dir_and_key(dir: impl Into<PathBuf>, key_material: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key: KeySource::Fixed(key_material.into()),
        }
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file that holds `identity`'s session.
    #[must_use]
    pub fn path_for(&self, identity: &str) -> PathBuf {
        let digest = Sha256::digest(identity.as_bytes());
        self.dir
            .join(format!("{}.{SESSION_FILE_EXT}", hex_encode(&digest)))
    }

    fn key_material(&self) -> Result<String, StorageError> {
        match &self.key {
            KeySource::Fixed(key) => Ok(key.clone()),
            KeySource::Resolve(resolved) => {
                if let Some(key) = resolved.get() {
                    return Ok(key.clone());
                }
                let key = load_or_create_key()?;
                Ok(resolved.get_or_init(|| key).clone())
            }
        }
    }
}

impl CredentialStore for EncryptedFileStore {
    fn load(&self, identity: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(None);
        }

        let key = self.key_material()?;
        let bytes = fs::read(&path)?;
        let plaintext = decrypt_bytes(&bytes, &key)?;
        let stored = serde_json::from_slice::<StoredSession>(&plaintext)?;
        if stored.identity != identity {
            return Err(StorageError::InvalidPayload);
        }
        debug!(path = %path.display(), saved_at = stored.saved_at, "loaded persisted session");
        Ok(Some(stored.set_cookie))
    }

    fn store(&self, identity: &str, blob: &str) -> Result<(), StorageError> {
        let stored = StoredSession {
            identity: identity.to_string(),
            set_cookie: blob.to_string(),
            saved_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
        };
        let key = self.key_material()?;
        let plaintext = serde_json::to_vec(&stored)?;
        let encrypted = encrypt_bytes(&plaintext, &key)?;
        let path = self.path_for(identity);
        write_encrypted_payload(&path, &encrypted)?;
        debug!(path = %path.display(), "persisted session");
        Ok(())
    }

    fn clear(&self, identity: &str) -> Result<bool, StorageError> {
        // The master key is shared by every identity, so it stays in the keychain.
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

fn default_sessions_dir() -> Result<PathBuf, StorageError> {
    Ok(resolve_config_dir(
        sanitize_env_path(env::var_os("XDG_CONFIG_HOME")),
        sanitize_env_path(env::var_os("HOME")),
        sanitize_env_path(env::var_os("APPDATA")),
    )?
    .join(SESSIONS_DIR_NAME))
}

fn sanitize_env_path(value: Option<OsString>) -> Option<PathBuf> {
    let value = value?;
    if value.to_string_lossy().trim().is_empty() {
        return None;
    }

    Some(PathBuf::from(value))
}

fn resolve_config_dir(
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    app_data: Option<PathBuf>,
) -> Result<PathBuf, StorageError> {
    if let Some(xdg) = xdg_config_home {
        return Ok(xdg.join(APP_DIR_NAME));
    }
    if let Some(home) = home {
        return Ok(home.join(".config").join(APP_DIR_NAME));
    }
    if let Some(app_data) = app_data {
        return Ok(app_data.join(APP_DIR_NAME));
    }

    Err(StorageError::ConfigDirUnavailable)
}

fn load_or_create_key() -> Result<String, StorageError> {
    if let Some(from_env) = env::var_os(MASTER_KEY_ENV_VAR) {
        let key = from_env.to_string_lossy().trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let entry = safe_keyring_entry()?;

    match safe_keyring_get_password(&entry) {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing),
        _ => {
            let generated = generate_key_material();
            safe_keyring_set_password(&entry, &generated)?;
            Ok(generated)
        }
    }
}

// keyring backends can panic on headless systems without a secret service.
fn safe_keyring_entry() -> Result<keyring::Entry, StorageError> {
    catch_unwind(|| keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY_NAME))
        .map_err(|_| StorageError::KeychainUnavailable)?
        .map_err(|_| StorageError::KeychainUnavailable)
}

fn safe_keyring_get_password(entry: &keyring::Entry) -> Result<String, StorageError> {
    catch_unwind(AssertUnwindSafe(|| entry.get_password()))
        .map_err(|_| StorageError::KeychainUnavailable)?
        .map_err(|_| StorageError::KeychainUnavailable)
}

fn safe_keyring_set_password(entry: &keyring::Entry, password: &str) -> Result<(), StorageError> {
    catch_unwind(AssertUnwindSafe(|| entry.set_password(password)))
        .map_err(|_| StorageError::KeychainUnavailable)?
        .map_err(|_| StorageError::KeychainUnavailable)
}

fn generate_key_material() -> String {
    let mut bytes = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(key_material.as_bytes());
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

fn write_encrypted_payload(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, payload)?;
    set_owner_only_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

fn encrypt_bytes(plaintext: &[u8], key_material: &str) -> Result<Vec<u8>, StorageError> {
    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| StorageError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(payload: &[u8], key_material: &str) -> Result<Vec<u8>, StorageError> {
    if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
        return Err(StorageError::InvalidPayload);
    }

    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let nonce_end = MAGIC.len() + NONCE_LEN;
    let nonce = XNonce::from_slice(&payload[MAGIC.len()..nonce_end]);

    cipher
        .decrypt(nonce, &payload[nonce_end..])
        .map_err(|_| StorageError::DecryptionFailed)
}
