use http::HeaderValue;
use http::header::USER_AGENT;
use http::request::Parts;

use crate::error::ConfigError;
use crate::layers::RequestFilter;

/// Request filter stamping the transport's user agent.
///
/// A user agent already set on the request is kept.
#[derive(Clone, Debug)]
pub struct UserAgentFilter {
    user_agent: HeaderValue,
}

impl UserAgentFilter {
    /// # Errors
    /// Returns `ConfigError::InvalidHeader` if the user agent is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, ConfigError> {
        let user_agent =
            HeaderValue::from_str(user_agent.as_ref()).map_err(|source| ConfigError::InvalidHeader {
                name: USER_AGENT.to_string(),
                source,
            })?;
        Ok(Self { user_agent })
    }

    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

impl RequestFilter for UserAgentFilter {
    fn filter(&self, request: &mut Parts) {
        request
            .headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());
    }
}
