//! Transport settings as read from service configuration.
//!
//! ```yaml
//! discovery_transport:
//!   config:
//!     connect_timeout_ms: 5000
//!     read_timeout_ms: 8000
//!     connection_idle_timeout_secs: 30
//!     max_connections_per_host: 50
//!     max_total_connections: 200
//!     use_system_ssl: false
//!     client_data_accept: full
//!     proxy:
//!       host: proxy.internal
//!       port: 3128
//! ```

use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::JSON_CODEC;
use crate::config::{
    DEFAULT_CLIENT_NAME, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_CONNECTION_TIMEOUT,
    DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_MAX_TOTAL_CONNECTIONS,
    DEFAULT_READ_TIMEOUT, HostnameVerification, TransportConfig, TransportConfigBuilder,
};
use crate::error::ConfigError;
use crate::factory::ClientAccept;
use crate::identity::ClientIdentity;

/// Client name used with the OS trust store
pub const SYSTEM_SSL_CLIENT_NAME: &str = "DiscoveryClient-HTTPClient-System";
/// Client name used behind a proxy
pub const PROXY_CLIENT_NAME: &str = "Proxy-DiscoveryClient-HTTPClient";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustStoreSettings {
    pub path: PathBuf,
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Require certificates to match the requested host name.
    /// Off by default: any host name is accepted for certificates issued by
    /// this trust store.
    #[serde(default)]
    pub verify_hostname: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySettings {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub id: Option<String>,
}

impl From<&IdentitySettings> for ClientIdentity {
    fn from(settings: &IdentitySettings) -> Self {
        ClientIdentity::new(&settings.name, &settings.version, settings.id.clone())
    }
}

/// Externally supplied transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub client_name: Option<String>,
    pub user_agent: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Seconds; zero or negative disables idle reaping
    pub connection_idle_timeout_secs: i64,
    pub max_connections_per_host: usize,
    pub max_total_connections: usize,
    pub max_body_size: usize,
    pub proxy: Option<ProxySettings>,
    pub trust_store: Option<TrustStoreSettings>,
    /// Use the OS trust store; takes precedence over `trust_store`
    pub use_system_ssl: bool,
    pub encoder: String,
    pub decoder: String,
    /// `full` or `compact`
    pub client_data_accept: String,
    /// Tell servers this client accepts redirects
    pub allow_redirects: bool,
    pub identity: Option<IdentitySettings>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            client_name: None,
            user_agent: None,
            connect_timeout_ms: millis(DEFAULT_CONNECT_TIMEOUT),
            read_timeout_ms: millis(DEFAULT_READ_TIMEOUT),
            connection_idle_timeout_secs: i64::try_from(DEFAULT_IDLE_CONNECTION_TIMEOUT.as_secs())
                .unwrap_or(i64::MAX),
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            proxy: None,
            trust_store: None,
            use_system_ssl: false,
            encoder: JSON_CODEC.to_owned(),
            decoder: JSON_CODEC.to_owned(),
            client_data_accept: "full".to_owned(),
            allow_redirects: false,
            identity: None,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TransportSettings {
    /// Parse settings from a JSON value; `null` yields the defaults.
    ///
    /// # Errors
    /// Returns `ConfigError::Settings` for unknown fields or mistyped values.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(ConfigError::Settings)
    }

    /// Name under which the transport is created
    #[must_use]
    pub fn effective_client_name(&self) -> &str {
        if let Some(name) = &self.client_name {
            return name;
        }
        if self.use_system_ssl {
            SYSTEM_SSL_CLIENT_NAME
        } else if self.proxy.is_some() {
            PROXY_CLIENT_NAME
        } else {
            DEFAULT_CLIENT_NAME
        }
    }

    /// Idle threshold, `None` when reaping is disabled
    #[must_use]
    pub fn idle_connection_timeout(&self) -> Option<Duration> {
        u64::try_from(self.connection_idle_timeout_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn client_accept(&self) -> ClientAccept {
        ClientAccept::parse(&self.client_data_accept)
    }

    #[must_use]
    pub fn identity(&self) -> Option<ClientIdentity> {
        self.identity.as_ref().map(ClientIdentity::from)
    }

    /// Builder preloaded with these settings
    pub fn config_builder(&self) -> TransportConfigBuilder {
        let mut builder = TransportConfig::builder()
            .client_name(self.effective_client_name())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .read_timeout(Duration::from_millis(self.read_timeout_ms))
            .max_connections_per_host(self.max_connections_per_host)
            .max_total_connections(self.max_total_connections)
            .max_body_size(self.max_body_size)
            .encoder(&self.encoder)
            .decoder(&self.decoder);

        builder = match self.idle_connection_timeout() {
            Some(idle) => builder.idle_connection_timeout(idle),
            None => builder.disable_idle_reaping(),
        };
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(
                &proxy.host,
                proxy.port,
                proxy.user.clone(),
                proxy.password.clone(),
            );
        }
        if let Some(store) = &self.trust_store {
            builder = builder
                .trust_store(&store.path, store.password.clone())
                .hostname_verification(if store.verify_hostname {
                    HostnameVerification::Strict
                } else {
                    HostnameVerification::AcceptAnyHostname
                });
        }
        // last write wins, so system trust applied after the trust store prevails
        if self.use_system_ssl {
            builder = builder.system_trust();
        }
        builder
    }

    /// Validate and build the transport configuration
    ///
    /// # Errors
    /// See [`TransportConfigBuilder::build`].
    pub fn to_config(&self) -> Result<TransportConfig, ConfigError> {
        self.config_builder().build()
    }
}
