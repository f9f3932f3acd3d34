use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, Codecs, EntityDecoder, EntityEncoder, JSON_CODEC};
use crate::error::ConfigError;
use crate::proxy::ProxyConfig;
use crate::tls;

/// Version stamped into the derived user agent
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client name used when none is configured
pub const DEFAULT_CLIENT_NAME: &str = "DiscoveryClient-HTTPClient";

/// Default connect timeout (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout (8 seconds)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Default idle-connection timeout (30 seconds)
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on connections to a single route
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 50;

/// Default cap on connections across all routes
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: usize = 200;

/// Default response body limit (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Hostname verification policy for custom trust stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostnameVerification {
    /// Certificate must be valid for the requested host name
    Strict,
    /// Certificate chain must be trusted, host name is not checked
    ///
    /// This is the default for custom trust stores, so registries fronted by
    /// a private CA work without SAN entries for every host name.
    ///
    /// **WARNING**: any certificate issued by the trust store's CAs is
    /// accepted for any host. Use `Strict` when the CA is shared.
    #[default]
    AcceptAnyHostname,
}

/// A trust store loaded from disk at configuration time.
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
    roots: Arc<rustls::RootCertStore>,
    hostname_verification: HostnameVerification,
}

impl TrustStore {
    pub(crate) fn new(
        path: PathBuf,
        roots: rustls::RootCertStore,
        hostname_verification: HostnameVerification,
    ) -> Self {
        Self {
            path,
            roots: Arc::new(roots),
            hostname_verification,
        }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Number of trust anchors loaded from the file
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    #[must_use]
    pub fn hostname_verification(&self) -> HostnameVerification {
        self.hostname_verification
    }

    pub(crate) fn roots(&self) -> Arc<rustls::RootCertStore> {
        Arc::clone(&self.roots)
    }
}

/// TLS trust configuration
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum TlsMode {
    /// Mozilla's root certificates bundled with the binary (no OS dependency)
    #[default]
    Default,
    /// OS native root certificate store
    SystemTrust,
    /// Roots loaded from a trust store file
    CustomTrustStore(TrustStore),
}

/// Immutable transport configuration.
///
/// Built through [`TransportConfig::builder`]; every value has been
/// validated by the time a `TransportConfig` exists, and the trust store (if
/// any) has already been loaded.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    client_name: String,
    user_agent: String,
    tls: TlsMode,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
    read_timeout: Duration,
    idle_connection_timeout: Option<Duration>,
    max_connections_per_host: usize,
    max_total_connections: usize,
    max_body_size: usize,
    codecs: Codecs,
}

impl TransportConfig {
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Full user agent, `<agent or client name>/v<build version>`
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[must_use]
    pub fn tls(&self) -> &TlsMode {
        &self.tls
    }

    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Idle threshold for reaping; `None` means reaping is disabled
    #[must_use]
    pub fn idle_connection_timeout(&self) -> Option<Duration> {
        self.idle_connection_timeout
    }

    #[must_use]
    pub fn max_connections_per_host(&self) -> usize {
        self.max_connections_per_host
    }

    #[must_use]
    pub fn max_total_connections(&self) -> usize {
        self.max_total_connections
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    #[must_use]
    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }
}

#[derive(Debug, Clone, Default)]
enum TlsSelection {
    #[default]
    Default,
    System,
    TrustStore {
        path: PathBuf,
        password: Option<SecretString>,
    },
}

#[derive(Debug, Clone)]
struct ProxySelection {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
}

/// Fluent builder for [`TransportConfig`].
///
/// TLS choices are last-write-wins: calling [`system_trust`] after
/// [`trust_store`] selects the system trust store and vice versa. Callers
/// that read both from configuration must decide precedence themselves.
///
/// [`system_trust`]: TransportConfigBuilder::system_trust
/// [`trust_store`]: TransportConfigBuilder::trust_store
#[derive(Debug, Clone)]
#[must_use]
pub struct TransportConfigBuilder {
    client_name: Option<String>,
    user_agent: Option<String>,
    tls: TlsSelection,
    hostname_verification: HostnameVerification,
    proxy: Option<ProxySelection>,
    connect_timeout: Duration,
    read_timeout: Duration,
    idle_connection_timeout: Option<Duration>,
    max_connections_per_host: usize,
    max_total_connections: usize,
    max_body_size: usize,
    encoder_id: String,
    encoder: Option<Arc<dyn EntityEncoder>>,
    decoder_id: String,
    decoder: Option<Arc<dyn EntityDecoder>>,
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self {
            client_name: None,
            user_agent: None,
            tls: TlsSelection::Default,
            hostname_verification: HostnameVerification::default(),
            proxy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_connection_timeout: Some(DEFAULT_IDLE_CONNECTION_TIMEOUT),
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            encoder_id: JSON_CODEC.to_owned(),
            encoder: None,
            decoder_id: JSON_CODEC.to_owned(),
            decoder: None,
        }
    }

    /// Name of this client; also the user agent base when none is set
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// User agent base; the build version is appended at `build()`
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on waiting for a response (headers and body)
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Idle threshold after which pooled connections are reaped
    ///
    /// A zero duration disables reaping, same as
    /// [`disable_idle_reaping`](Self::disable_idle_reaping).
    pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Keep idle connections until they fail or the process exits
    pub fn disable_idle_reaping(mut self) -> Self {
        self.idle_connection_timeout = None;
        self
    }

    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.max_connections_per_host = max;
        self
    }

    pub fn max_total_connections(mut self, max: usize) -> Self {
        self.max_total_connections = max;
        self
    }

    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Route all requests through an HTTP proxy
    ///
    /// When either credential is missing, placeholder credentials are sent
    /// instead (see [`ProxyConfig`]).
    pub fn proxy(
        mut self,
        host: impl Into<String>,
        port: u16,
        username: Option<String>,
        password: Option<SecretString>,
    ) -> Self {
        self.proxy = Some(ProxySelection {
            host: host.into(),
            port,
            username,
            password,
        });
        self
    }

    /// Trust the OS native certificate store (replaces any trust store)
    pub fn system_trust(mut self) -> Self {
        self.tls = TlsSelection::System;
        self
    }

    /// Trust only the certificates in a PEM trust store file (replaces system trust)
    pub fn trust_store(mut self, path: impl Into<PathBuf>, password: Option<SecretString>) -> Self {
        self.tls = TlsSelection::TrustStore {
            path: path.into(),
            password,
        };
        self
    }

    /// Hostname verification applied when a custom trust store is used
    pub fn hostname_verification(mut self, verification: HostnameVerification) -> Self {
        self.hostname_verification = verification;
        self
    }

    /// Select a registered encoder by id
    pub fn encoder(mut self, id: impl Into<String>) -> Self {
        self.encoder_id = id.into();
        self.encoder = None;
        self
    }

    /// Use a caller-provided encoder
    pub fn with_encoder(mut self, encoder: Arc<dyn EntityEncoder>) -> Self {
        self.encoder_id = encoder.id().to_owned();
        self.encoder = Some(encoder);
        self
    }

    /// Select a registered decoder by id
    pub fn decoder(mut self, id: impl Into<String>) -> Self {
        self.decoder_id = id.into();
        self.decoder = None;
        self
    }

    /// Use a caller-provided decoder
    pub fn with_decoder(mut self, decoder: Arc<dyn EntityDecoder>) -> Self {
        self.decoder_id = decoder.id().to_owned();
        self.decoder = Some(decoder);
        self
    }

    /// Validate settings, load the trust store and produce the configuration
    ///
    /// Performs local file I/O when a trust store is configured, never
    /// network I/O.
    ///
    /// # Errors
    /// Returns `ConfigError` if a value is out of range, the proxy or user
    /// agent is malformed, a codec id is unknown, or the trust store cannot
    /// be loaded.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "must be greater than zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid("read_timeout", "must be greater than zero"));
        }
        if self.max_connections_per_host == 0 {
            return Err(invalid("max_connections_per_host", "must be at least 1"));
        }
        if self.max_total_connections == 0 {
            return Err(invalid("max_total_connections", "must be at least 1"));
        }
        if self.max_connections_per_host > self.max_total_connections {
            return Err(invalid(
                "max_connections_per_host",
                format!(
                    "{} exceeds max_total_connections {}",
                    self.max_connections_per_host, self.max_total_connections
                ),
            ));
        }
        if self.max_body_size == 0 {
            return Err(invalid("max_body_size", "must be at least 1"));
        }

        let client_name = self
            .client_name
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_owned());
        let agent_base = self.user_agent.as_deref().unwrap_or(&client_name);
        let user_agent = format!("{agent_base}/v{BUILD_VERSION}");
        http::HeaderValue::from_str(&user_agent).map_err(|source| ConfigError::InvalidHeader {
            name: http::header::USER_AGENT.to_string(),
            source,
        })?;

        let proxy = self
            .proxy
            .map(|p| ProxyConfig::new(p.host, p.port, p.username, p.password))
            .transpose()?;

        let encoder = match self.encoder {
            Some(encoder) => encoder,
            None => codec::resolve_encoder(&self.encoder_id)?,
        };
        let decoder = match self.decoder {
            Some(decoder) => decoder,
            None => codec::resolve_decoder(&self.decoder_id)?,
        };

        let tls = match self.tls {
            TlsSelection::Default => TlsMode::Default,
            TlsSelection::System => TlsMode::SystemTrust,
            TlsSelection::TrustStore { path, password } => TlsMode::CustomTrustStore(
                tls::load_trust_store(path, password.as_ref(), self.hostname_verification)?,
            ),
        };

        Ok(TransportConfig {
            client_name,
            user_agent,
            tls,
            proxy,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            idle_connection_timeout: self.idle_connection_timeout,
            max_connections_per_host: self.max_connections_per_host,
            max_total_connections: self.max_total_connections,
            max_body_size: self.max_body_size,
            codecs: Codecs { encoder, decoder },
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
