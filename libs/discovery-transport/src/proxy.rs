use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::{HeaderValue, Uri};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::error::ConfigError;

/// User sent to the proxy when no credentials are configured
pub const PLACEHOLDER_PROXY_USER: &str = "guest";
/// Password sent to the proxy when no credentials are configured
pub const PLACEHOLDER_PROXY_PASSWORD: &str = "guest";

/// Forward HTTP proxy with basic credentials.
///
/// Credentials are only used when both user and password are given;
/// otherwise the placeholder `guest`/`guest` pair is sent, which proxies
/// that do not authenticate simply ignore.
#[derive(Clone)]
pub struct ProxyConfig {
    uri: Uri,
    username: String,
    password: SecretString,
    placeholder: bool,
    authorization: HeaderValue,
}

impl ProxyConfig {
    /// # Errors
    /// Returns `ConfigError::InvalidProxy` if host and port do not form a
    /// valid proxy URI or the credentials cannot be sent as a header.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<SecretString>,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::InvalidProxy("proxy host is empty".to_owned()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidProxy(format!(
                "proxy port for '{host}' must be non-zero"
            )));
        }
        let uri: Uri = format!("http://{host}:{port}/")
            .parse()
            .map_err(|e| ConfigError::InvalidProxy(format!("'{host}:{port}': {e}")))?;

        let (username, password, placeholder) = match (username, password) {
            (Some(user), Some(password)) => (user, password, false),
            _ => (
                PLACEHOLDER_PROXY_USER.to_owned(),
                SecretString::from(PLACEHOLDER_PROXY_PASSWORD.to_owned()),
                true,
            ),
        };

        let authorization = basic_authorization(&username, &password)
            .map_err(|e| ConfigError::InvalidProxy(format!("invalid credentials: {e}")))?;

        Ok(Self {
            uri,
            username,
            password,
            placeholder,
            authorization,
        })
    }

    /// Proxy URI, `http://host:port/`
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Whether the placeholder credentials are in use
    #[must_use]
    pub fn uses_placeholder_credentials(&self) -> bool {
        self.placeholder
    }

    /// Value of the `Proxy-Authorization` header
    pub(crate) fn authorization(&self) -> &HeaderValue {
        &self.authorization
    }

}

/// Sensitive `Basic` credentials header value
pub(crate) fn basic_authorization(
    username: &str,
    password: &SecretString,
) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
    let token = STANDARD.encode(format!("{username}:{}", password.expose_secret()));
    let mut value = HeaderValue::from_str(&format!("Basic {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_credentials() {
        let proxy = ProxyConfig::new(
            "proxy.internal",
            8080,
            Some("svc".to_owned()),
            Some(SecretString::from("s3cret".to_owned())),
        )
        .unwrap();

        assert_eq!(proxy.uri().to_string(), "http://proxy.internal:8080/");
        assert_eq!(proxy.username(), "svc");
        assert!(!proxy.uses_placeholder_credentials());
        // base64("svc:s3cret")
        assert_eq!(proxy.authorization(), "Basic c3ZjOnMzY3JldA==");
        assert!(proxy.authorization().is_sensitive());
    }

    #[test]
    fn test_missing_password_uses_placeholder() {
        let proxy = ProxyConfig::new("proxy.internal", 8080, Some("svc".to_owned()), None).unwrap();
        assert!(proxy.uses_placeholder_credentials());
        assert_eq!(proxy.username(), PLACEHOLDER_PROXY_USER);
        // base64("guest:guest")
        assert_eq!(proxy.authorization(), "Basic Z3Vlc3Q6Z3Vlc3Q=");
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        assert!(matches!(
            ProxyConfig::new("  ", 8080, None, None),
            Err(ConfigError::InvalidProxy(_))
        ));
        assert!(matches!(
            ProxyConfig::new("proxy.internal", 0, None, None),
            Err(ConfigError::InvalidProxy(_))
        ));
        assert!(matches!(
            ProxyConfig::new("bad host/", 8080, None, None),
            Err(ConfigError::InvalidProxy(_))
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy = ProxyConfig::new(
            "proxy.internal",
            8080,
            Some("svc".to_owned()),
            Some(SecretString::from("s3cret".to_owned())),
        )
        .unwrap();
        let debug = format!("{proxy:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("REDACTED"));
    }
}
