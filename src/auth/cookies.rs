//! `Set-Cookie` parsing, cookie jar, and CSRF token derivation.
//!
//! The service hands out its session as ordinary cookies. A single header
//! value may carry several cookies joined by `, ` (the form `fetch`-style
//! clients produce when folding repeated `Set-Cookie` lines), so splitting has
//! to skip the comma inside `Expires=Wed, 21 Oct 2015 ...` dates.
//!
//! The jar can render itself back into that same folded form, which is what
//! gets persisted: a stored blob always round-trips through [`CookieJar::parse`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use reqwest::header::{HeaderMap, SET_COOKIE};
use tracing::{debug, instrument};

use super::AuthError;

/// Name of the cookie that carries the session id (and the CSRF token).
pub const SESSION_COOKIE_NAME: &str = "JSESSIONID";

/// A single cookie as parsed from a `Set-Cookie` header.
///
/// The value is redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    value: String,
    /// Absolute expiry from the `Expires` attribute.
    pub expires_at: Option<SystemTime>,
    /// Raw `Max-Age` attribute in seconds. Not converted into `expires_at`.
    pub max_age: Option<i64>,
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Path` attribute.
    pub path: Option<String>,
    /// `Secure` flag.
    pub secure: bool,
    /// `HttpOnly` flag.
    pub http_only: bool,
    /// `SameSite` attribute.
    pub same_site: Option<String>,
    /// Unrecognised attributes, kept in order so rendering is lossless.
    pub attributes: Vec<(String, Option<String>)>,
}

impl Cookie {
    /// Creates a cookie with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires_at: None,
            max_age: None,
            domain: None,
            path: None,
            secure: false,
            http_only: false,
            same_site: None,
            attributes: Vec::new(),
        }
    }

    /// Returns the raw cookie value, quotes included.
    ///
    /// Cookie values are sensitive; avoid logging the return value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the cookie's `Expires` instant lies before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }

    /// Parses one cookie (`name=value; Attr=...; Flag`).
    ///
    /// Returns `None` for fragments without a `name=` pair.
    #[must_use]
    pub fn parse(set_cookie: &str) -> Option<Self> {
        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Self::new(name, value.trim());
        for attribute in parts {
            let attribute = attribute.trim();
            if attribute.is_empty() {
                continue;
            }
            let (key, attr_value) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attribute, None),
            };
            match (key.to_ascii_lowercase().as_str(), attr_value) {
                ("expires", Some(v)) => cookie.expires_at = parse_cookie_date(v),
                ("max-age", Some(v)) => cookie.max_age = v.parse().ok(),
                ("domain", Some(v)) => cookie.domain = Some(v.to_string()),
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("samesite", Some(v)) => cookie.same_site = Some(v.to_string()),
                ("secure", _) => cookie.secure = true,
                ("httponly", _) => cookie.http_only = true,
                _ => cookie
                    .attributes
                    .push((key.to_string(), attr_value.map(str::to_string))),
            }
        }
        Some(cookie)
    }

    /// Renders the cookie back into `Set-Cookie` syntax.
    #[must_use]
    pub fn to_set_cookie(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(expires) = self.expires_at {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = &self.same_site {
            out.push_str(&format!("; SameSite={same_site}"));
        }
        for (key, value) in &self.attributes {
            match value {
                Some(value) => out.push_str(&format!("; {key}={value}")),
                None => out.push_str(&format!("; {key}")),
            }
        }
        out
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .finish_non_exhaustive()
    }
}

/// Cookies keyed by name; re-inserting a name replaces the old cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, Cookie>,
}

impl CookieJar {
    /// Creates an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a jar from a (possibly folded) `Set-Cookie` string.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCookie`] when the string yields no cookies.
    pub fn parse(set_cookie: &str) -> Result<Self, AuthError> {
        let mut jar = Self::new();
        if jar.merge_set_cookie(set_cookie) == 0 {
            return Err(AuthError::MissingCookie);
        }
        Ok(jar)
    }

    /// Merges every cookie in `set_cookie` into the jar, overwriting by name.
    ///
    /// Returns how many cookies were parsed.
    #[instrument(level = "debug", skip_all)]
    pub fn merge_set_cookie(&mut self, set_cookie: &str) -> usize {
        let mut merged = 0;
        for fragment in split_set_cookie_string(set_cookie) {
            match Cookie::parse(fragment) {
                Some(cookie) => {
                    debug!(name = %cookie.name, "merged cookie");
                    self.insert(cookie);
                    merged += 1;
                }
                None => debug!("skipping malformed Set-Cookie fragment"),
            }
        }
        merged
    }

    /// Inserts a cookie, replacing any cookie with the same name.
    pub fn insert(&mut self, cookie: Cookie) {
        self.cookies.insert(cookie.name.clone(), cookie);
    }

    /// Looks up a cookie by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    /// Number of cookies held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Whether the jar is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Iterates cookies in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.values()
    }

    /// The `JSESSIONID` cookie, if present.
    #[must_use]
    pub fn session_cookie(&self) -> Option<&Cookie> {
        self.get(SESSION_COOKIE_NAME)
    }

    /// Validates the session cookie at `now` and derives the CSRF token.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingSessionCookie`] if there is no `JSESSIONID`, or
    ///   its value is empty once quotes are stripped.
    /// - [`AuthError::SessionExpired`] if its `Expires` lies before `now`.
    pub fn csrf_token(&self, now: SystemTime) -> Result<String, AuthError> {
        let session = self
            .session_cookie()
            .ok_or(AuthError::MissingSessionCookie)?;
        if session.is_expired_at(now) {
            return Err(AuthError::SessionExpired);
        }
        let token = derive_csrf_token(session.value());
        if token.is_empty() {
            return Err(AuthError::MissingSessionCookie);
        }
        Ok(token)
    }

    /// Value for a `cookie` request header: `name=value` pairs joined by `; `.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        self.iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Renders the whole jar as one folded `Set-Cookie` string.
    #[must_use]
    pub fn to_set_cookie_string(&self) -> String {
        self.iter()
            .map(Cookie::to_set_cookie)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Strips every `"` from a session id to obtain the CSRF token.
#[must_use]
pub fn derive_csrf_token(session_id: &str) -> String {
    session_id.replace('"', "")
}

/// Folds every `Set-Cookie` header line of a response into one string.
///
/// Returns `None` when the response set no cookies.
#[must_use]
pub fn folded_set_cookie(headers: &HeaderMap) -> Option<String> {
    let lines: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join(", "))
    }
}

/// Splits a folded `Set-Cookie` string into single-cookie fragments.
///
/// A comma only separates cookies when what follows looks like `name=`;
/// commas inside attribute values (such as `Expires` dates) are kept.
#[must_use]
pub fn split_set_cookie_string(folded: &str) -> Vec<&str> {
    let bytes = folded.as_bytes();
    let mut fragments = Vec::new();
    let mut start = 0;

    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b',' && starts_new_cookie(&bytes[idx + 1..]) {
            push_fragment(&mut fragments, &folded[start..idx]);
            start = idx + 1;
        }
    }
    push_fragment(&mut fragments, &folded[start..]);
    fragments
}

fn starts_new_cookie(rest: &[u8]) -> bool {
    let rest = rest.trim_ascii_start();
    let name_len = rest
        .iter()
        .take_while(|&&b| !matches!(b, b'=' | b';' | b',') && !b.is_ascii_whitespace())
        .count();
    name_len > 0 && rest.get(name_len) == Some(&b'=')
}

fn push_fragment<'a>(fragments: &mut Vec<&'a str>, fragment: &'a str) {
    let fragment = fragment.trim();
    if !fragment.is_empty() {
        fragments.push(fragment);
    }
}

/// Parses a cookie `Expires` value.
///
/// Accepts RFC 7231 dates and the dashed `01-Jan-2026` variant; anything else
/// is treated as "no expiry".
fn parse_cookie_date(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    httpdate::parse_http_date(value)
        .or_else(|_| httpdate::parse_http_date(&value.replace('-', " ")))
        .ok()
        .or_else(|| {
            debug!(value, "unparseable cookie expiry, ignoring");
            None
        })
}
