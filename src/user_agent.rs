//! Identification headers for the login and API clients.
//!
//! Single source for the product/user-agent strings so login and API traffic
//! stay consistent with the clients the service expects to talk to.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::ConfigError;

/// Auth-library identification sent with login requests (mobile app flavour).
const AUTH_LIBRARY_USER_AGENT: &str =
    "LIAuthLibrary:0.0.3 com.linkedin.android:4.1.881 Asus_ASUS_Z01QD:android_9";

/// Browser User-Agent sent with authenticated API requests.
const API_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_5) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/83.0.4103.116 Safari/537.36";

const AUTH_DEFAULTS: &[(&str, &str)] = &[
    ("x-li-user-agent", AUTH_LIBRARY_USER_AGENT),
    ("user-agent", "ANDROID OS"),
    ("x-user-language", "en"),
    ("x-user-locale", "en_US"),
    ("accept-language", "en-us"),
];

const API_DEFAULTS: &[(&str, &str)] = &[
    ("user-agent", API_USER_AGENT),
    ("accept-language", "en-AU,en-GB;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("x-li-lang", "en_US"),
    ("x-restli-protocol-version", "2.0.0"),
];

/// Default headers for the login client, with `extra` overriding by name.
pub(crate) fn auth_headers(extra: &[(String, String)]) -> Result<HeaderMap, ConfigError> {
    build_headers(AUTH_DEFAULTS, extra)
}

/// Default headers for the API client, with `extra` overriding by name.
pub(crate) fn api_headers(extra: &[(String, String)]) -> Result<HeaderMap, ConfigError> {
    build_headers(API_DEFAULTS, extra)
}

fn build_headers(
    defaults: &[(&str, &str)],
    extra: &[(String, String)],
) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    let pairs = defaults
        .iter()
        .map(|(name, value)| (*name, *value))
        .chain(extra.iter().map(|(name, value)| (name.as_str(), value.as_str())));
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_headers_identify_auth_library() {
        let headers = auth_headers(&[]).unwrap();
        assert_eq!(headers["user-agent"], "ANDROID OS");
        assert!(
            headers["x-li-user-agent"]
                .to_str()
                .unwrap()
                .starts_with("LIAuthLibrary")
        );
    }

    #[test]
    fn test_api_headers_carry_restli_version() {
        let headers = api_headers(&[]).unwrap();
        assert_eq!(headers["x-restli-protocol-version"], "2.0.0");
        assert!(headers["user-agent"].to_str().unwrap().contains("Chrome"));
    }

    #[test]
    fn test_extra_headers_override_defaults() {
        let headers = api_headers(&[("x-li-lang".to_string(), "de_DE".to_string())]).unwrap();
        assert_eq!(headers["x-li-lang"], "de_DE");
        assert_eq!(headers.get_all("x-li-lang").iter().count(), 1);
    }

    #[test]
    fn test_invalid_extra_header_name_rejected() {
        let result = auth_headers(&[("bad header".to_string(), "x".to_string())]);
        assert!(matches!(result, Err(ConfigError::InvalidHeader(name)) if name == "bad header"));
    }
}
