//! Client identity headers.

use http::HeaderValue;
use http::header::HeaderName;
use http::request::Parts;

use crate::error::ConfigError;
use crate::layers::RequestFilter;

/// Header carrying the client name
pub const IDENTITY_NAME_HEADER: &str = "DiscoveryIdentity-Name";
/// Header carrying the client version
pub const IDENTITY_VERSION_HEADER: &str = "DiscoveryIdentity-Version";
/// Header carrying the client instance id
pub const IDENTITY_ID_HEADER: &str = "DiscoveryIdentity-Id";

/// Name used when the caller does not supply an identity
pub const DEFAULT_IDENTITY_NAME: &str = "DefaultClient";
/// Version used when the caller does not supply an identity
pub const DEFAULT_IDENTITY_VERSION: &str = "1.4";

const NAME_KEY: HeaderName = HeaderName::from_static("discoveryidentity-name");
const VERSION_KEY: HeaderName = HeaderName::from_static("discoveryidentity-version");
const ID_KEY: HeaderName = HeaderName::from_static("discoveryidentity-id");

/// Metadata identifying the calling client.
///
/// This is not an authentication mechanism. Servers use it for diagnostics
/// and per-client throttling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    name: String,
    version: String,
    id: Option<String>,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            id,
        }
    }

    /// The default client identity, optionally keyed by the local instance address.
    #[must_use]
    pub fn default_client(instance_ip: Option<String>) -> Self {
        Self::new(DEFAULT_IDENTITY_NAME, DEFAULT_IDENTITY_VERSION, instance_ip)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Request filter stamping identity headers on every request.
///
/// Header values are validated once at construction, so applying the filter
/// never fails.
#[derive(Debug, Clone)]
pub struct IdentityHeaderFilter {
    headers: Option<IdentityHeaderValues>,
}

#[derive(Debug, Clone)]
struct IdentityHeaderValues {
    name: HeaderValue,
    version: HeaderValue,
    id: Option<HeaderValue>,
}

impl IdentityHeaderFilter {
    /// Create a filter for the given identity; `None` yields a no-op filter.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidHeader` if a field is not a valid header value.
    pub fn try_new(identity: Option<&ClientIdentity>) -> Result<Self, ConfigError> {
        let headers = identity
            .map(|identity| -> Result<_, ConfigError> {
                Ok(IdentityHeaderValues {
                    name: header_value(IDENTITY_NAME_HEADER, identity.name())?,
                    version: header_value(IDENTITY_VERSION_HEADER, identity.version())?,
                    id: identity
                        .id()
                        .map(|id| header_value(IDENTITY_ID_HEADER, id))
                        .transpose()?,
                })
            })
            .transpose()?;
        Ok(Self { headers })
    }
}

impl RequestFilter for IdentityHeaderFilter {
    fn filter(&self, request: &mut Parts) {
        let Some(values) = &self.headers else {
            return;
        };
        request.headers.insert(NAME_KEY, values.name.clone());
        request.headers.insert(VERSION_KEY, values.version.clone());
        if let Some(id) = &values.id {
            request.headers.insert(ID_KEY, id.clone());
        }
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|source| ConfigError::InvalidHeader {
        name: name.to_owned(),
        source,
    })
}
