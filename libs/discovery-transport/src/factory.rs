//! Endpoint client factories.

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use std::sync::Arc;

use crate::client::{EndpointClient, RegistryHttpClient};
use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::error::ConfigError;
use crate::identity::{ClientIdentity, IdentityHeaderFilter};
use crate::layers::RequestFilter;
use crate::metrics::{MetricsClientFactory, MetricsRecorder};
use crate::settings::TransportSettings;
use crate::transport::TransportClient;

/// Header telling the server this client accepts redirects
pub const ALLOW_REDIRECT_HEADER: &str = "X-Discovery-AllowRedirect";
/// Header carrying the compact data accept preference
pub const CLIENT_ACCEPT_HEADER: &str = "X-Eureka-Accept";

const ALLOW_REDIRECT_KEY: HeaderName = HeaderName::from_static("x-discovery-allowredirect");
const CLIENT_ACCEPT_KEY: HeaderName = HeaderName::from_static("x-eureka-accept");

/// Preferred shape of registry payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAccept {
    #[default]
    Full,
    Compact,
}

impl ClientAccept {
    /// Parse a settings value; anything but `compact` means `Full`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("compact") {
            Self::Compact
        } else {
            Self::Full
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Compact => "compact",
        }
    }
}

/// Produces clients bound to registry endpoints.
///
/// Clients are cheap handles; the factory owns the transport resources and
/// releases them in [`shutdown`](Self::shutdown).
pub trait TransportClientFactory: Send + Sync {
    fn new_client(&self, endpoint: &Endpoint) -> Arc<dyn RegistryHttpClient>;

    /// Release transport resources. Idempotent.
    fn shutdown(&self);
}

/// Factory backed by one pooled [`TransportClient`].
///
/// Every client it hands out shares the same pool and carries the same
/// fixed extra headers.
#[derive(Debug)]
pub struct HttpTransportClientFactory {
    transport: Arc<TransportClient>,
    extra_headers: Arc<HeaderMap>,
}

impl HttpTransportClientFactory {
    #[must_use]
    pub fn builder(config: TransportConfig) -> HttpTransportClientFactoryBuilder {
        HttpTransportClientFactoryBuilder::new(config)
    }

    /// Underlying transport, for pool introspection
    #[must_use]
    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    #[must_use]
    pub fn extra_headers(&self) -> &HeaderMap {
        &self.extra_headers
    }

    /// Concrete client for `endpoint`
    #[must_use]
    pub fn endpoint_client(&self, endpoint: &Endpoint) -> EndpointClient {
        let config = self.transport.config();
        EndpointClient::new(
            endpoint.clone(),
            self.transport.service(),
            Arc::clone(&self.extra_headers),
            config.codecs().clone(),
            config.read_timeout(),
            config.max_body_size(),
        )
    }
}

impl TransportClientFactory for HttpTransportClientFactory {
    fn new_client(&self, endpoint: &Endpoint) -> Arc<dyn RegistryHttpClient> {
        Arc::new(self.endpoint_client(endpoint))
    }

    fn shutdown(&self) {
        self.transport.shutdown();
    }
}

/// Builder for [`HttpTransportClientFactory`]
#[must_use]
pub struct HttpTransportClientFactoryBuilder {
    config: TransportConfig,
    identity: Option<ClientIdentity>,
    instance_ip: Option<String>,
    allow_redirect: bool,
    client_accept: ClientAccept,
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl HttpTransportClientFactoryBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            identity: None,
            instance_ip: None,
            allow_redirect: false,
            client_accept: ClientAccept::Full,
            filters: Vec::new(),
        }
    }

    /// Identity stamped on every request; defaults to the default client identity
    pub fn identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Local instance address used as the default identity's id
    pub fn instance_ip(mut self, ip: impl Into<String>) -> Self {
        self.instance_ip = Some(ip.into());
        self
    }

    pub fn allow_redirect(mut self, allow: bool) -> Self {
        self.allow_redirect = allow;
        self
    }

    pub fn client_accept(mut self, accept: ClientAccept) -> Self {
        self.client_accept = accept;
        self
    }

    /// Add a request filter; filters run after the identity filter, in order
    pub fn filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Arc<dyn RequestFilter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Build the transport and start its idle reaper.
    ///
    /// The reaper only starts when called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `ConfigError` if the identity headers are invalid or the
    /// transport cannot be created.
    pub fn build(self) -> Result<HttpTransportClientFactory, ConfigError> {
        let identity = self
            .identity
            .unwrap_or_else(|| ClientIdentity::default_client(self.instance_ip));

        let mut filters: Vec<Arc<dyn RequestFilter>> =
            Vec::with_capacity(self.filters.len() + 1);
        filters.push(Arc::new(IdentityHeaderFilter::try_new(Some(&identity))?));
        filters.extend(self.filters);

        let mut extra_headers = HeaderMap::new();
        if self.allow_redirect {
            extra_headers.insert(ALLOW_REDIRECT_KEY, HeaderValue::from_static("true"));
        }
        if self.client_accept == ClientAccept::Compact {
            extra_headers.insert(
                CLIENT_ACCEPT_KEY,
                HeaderValue::from_static(ClientAccept::Compact.as_str()),
            );
        }

        let transport = TransportClient::with_filters(self.config, filters)?;
        if !transport.start_reaper() && transport.config().idle_connection_timeout().is_some() {
            tracing::debug!(
                client_name = transport.config().client_name(),
                "idle connection reaper not started"
            );
        }

        tracing::debug!(
            client_name = transport.config().client_name(),
            identity = identity.name(),
            allow_redirect = self.allow_redirect,
            client_accept = self.client_accept.as_str(),
            "transport client factory created"
        );

        Ok(HttpTransportClientFactory {
            transport: Arc::new(transport),
            extra_headers: Arc::new(extra_headers),
        })
    }
}

/// Build the transport client factory from settings and wrap it with the
/// metrics decorator.
///
/// `instance_ip` keys the default identity when the settings carry none.
///
/// # Errors
/// Returns `ConfigError` if the settings are invalid, the trust store cannot
/// be loaded or TLS setup fails.
pub fn new_transport_client_factory(
    settings: &TransportSettings,
    filters: Vec<Arc<dyn RequestFilter>>,
    instance_ip: Option<String>,
    recorder: Arc<dyn MetricsRecorder>,
) -> Result<Arc<dyn TransportClientFactory>, ConfigError> {
    let mut builder = HttpTransportClientFactory::builder(settings.to_config()?)
        .allow_redirect(settings.allow_redirects)
        .client_accept(settings.client_accept())
        .filters(filters);
    if let Some(identity) = settings.identity() {
        builder = builder.identity(identity);
    }
    if let Some(ip) = instance_ip {
        builder = builder.instance_ip(ip);
    }

    let factory = builder.build()?;
    Ok(Arc::new(MetricsClientFactory::new(factory, recorder)))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::BUILD_VERSION;
    use crate::error::TransportError;
    use crate::metrics::tests::CollectingRecorder;
    use crate::request::TransportRequest;
    use http::StatusCode;
    use http::request::Parts;
    use httpmock::prelude::*;
    use std::io::Write;
    use std::time::Duration;

    fn config() -> TransportConfig {
        TransportConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .read_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    fn endpoint(server: &MockServer) -> Endpoint {
        Endpoint::new(server.url("/eureka/v2/")).unwrap()
    }

    async fn wait_for_idle(transport: &TransportClient, idle: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.pool_stats().idle != idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection was not returned to the pool");
    }

    #[derive(Debug)]
    struct TraceFilter;

    impl RequestFilter for TraceFilter {
        fn filter(&self, request: &mut Parts) {
            // overwrites the identity name, proving identity runs first
            request.headers.insert(
                "discoveryidentity-name",
                HeaderValue::from_static("Filtered"),
            );
            request
                .headers
                .insert("x-trace", HeaderValue::from_static("on"));
        }
    }

    #[test]
    fn test_client_accept_parse() {
        assert_eq!(ClientAccept::parse("compact"), ClientAccept::Compact);
        assert_eq!(ClientAccept::parse(" COMPACT "), ClientAccept::Compact);
        assert_eq!(ClientAccept::parse("full"), ClientAccept::Full);
        assert_eq!(ClientAccept::parse("brief"), ClientAccept::Full);
        assert_eq!(ClientAccept::parse(""), ClientAccept::Full);
    }

    #[test]
    fn test_extra_headers() {
        let factory = HttpTransportClientFactory::builder(config())
            .allow_redirect(true)
            .client_accept(ClientAccept::Compact)
            .build()
            .unwrap();
        let headers = factory.extra_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[ALLOW_REDIRECT_HEADER], "true");
        assert_eq!(headers[CLIENT_ACCEPT_HEADER], "compact");

        let plain = HttpTransportClientFactory::builder(config()).build().unwrap();
        assert!(plain.extra_headers().is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_identity_user_agent_and_extra_headers() {
        let server = MockServer::start_async().await;
        let user_agent = format!("DiscoveryClient-HTTPClient/v{BUILD_VERSION}");
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/eureka/v2/apps/")
                    .header("user-agent", user_agent.as_str())
                    .header("discoveryidentity-name", "DefaultClient")
                    .header("discoveryidentity-version", "1.4")
                    .header("discoveryidentity-id", "10.0.0.7")
                    .header("x-discovery-allowredirect", "true")
                    .header("x-eureka-accept", "compact")
                    .header("accept", "application/json");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"applications":{"application":[]}}"#);
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config())
            .instance_ip("10.0.0.7")
            .allow_redirect(true)
            .client_accept(ClientAccept::Compact)
            .build()
            .unwrap();
        let client = factory.new_client(&endpoint(&server));

        let response = client.get("apps/").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.entity().unwrap();
        assert!(body["applications"]["application"].is_array());
        mock.assert_async().await;

        factory.shutdown();
    }

    #[tokio::test]
    async fn test_additional_filters_run_after_identity() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/eureka/v2/apps/BILLING")
                    .header("discoveryidentity-name", "Filtered")
                    .header("discoveryidentity-version", "2.0")
                    .header("x-trace", "on");
                then.status(200);
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config())
            .identity(ClientIdentity::new("EurekaClient", "2.0", None))
            .filter(Arc::new(TraceFilter))
            .build()
            .unwrap();
        let client = factory.new_client(&endpoint(&server));

        let response = client.get("apps/BILLING").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_redirect_returned_not_followed() {
        let server = MockServer::start_async().await;
        let target = server
            .mock_async(|when, then| {
                when.path("/elsewhere/apps/");
                then.status(200);
            })
            .await;
        let redirect = server
            .mock_async(|when, then| {
                when.path("/eureka/v2/apps/");
                then.status(302).header("location", "/elsewhere/apps/");
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config()).build().unwrap();
        let client = factory.new_client(&endpoint(&server));

        let response = client.get("apps/").await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.redirect_location(), Some("/elsewhere/apps/"));
        redirect.assert_async().await;
        assert_eq!(target.calls(), 0);
    }

    #[tokio::test]
    async fn test_gzip_response_decoded() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(br#"{"instance":{"app":"BILLING"}}"#)
            .unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/eureka/v2/apps/BILLING/i-42")
                    .header_exists("accept-encoding");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("content-encoding", "gzip")
                    .body(compressed);
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config()).build().unwrap();
        let client = factory.new_client(&endpoint(&server));

        let response = client.get("apps/BILLING/i-42").await.unwrap();
        let body: serde_json::Value = response.entity().unwrap();
        assert_eq!(body["instance"]["app"], "BILLING");
    }

    #[tokio::test]
    async fn test_clients_share_one_pool() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).body("{}");
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config()).build().unwrap();
        let first = factory.new_client(&endpoint(&server));
        let second = factory.new_client(&Endpoint::new(server.url("/other/")).unwrap());

        first.get("apps/").await.unwrap();
        wait_for_idle(factory.transport(), 1).await;
        second.get("apps/").await.unwrap();
        wait_for_idle(factory.transport(), 1).await;

        let stats = factory.transport().pool_stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_fails_later_requests() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200);
            })
            .await;

        let factory = HttpTransportClientFactory::builder(config()).build().unwrap();
        assert!(factory.transport().is_reaper_running());
        let client = factory.new_client(&endpoint(&server));
        client.get("apps/").await.unwrap();

        factory.shutdown();
        factory.shutdown();

        assert!(factory.transport().is_shut_down());
        assert!(!factory.transport().is_reaper_running());
        let err = client.get("apps/").await.unwrap_err();
        assert!(matches!(err, TransportError::PoolShutdown), "{err}");
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_new_transport_client_factory_records_calls() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/eureka/v2/apps/BILLING/i-42");
                then.status(404);
            })
            .await;

        let settings = TransportSettings::from_json(serde_json::json!({
            "client_data_accept": "compact",
            "identity": {"name": "EurekaClient", "version": "1.0", "id": "i-1"}
        }))
        .unwrap();
        let recorder = Arc::new(CollectingRecorder::default());
        let factory =
            new_transport_client_factory(&settings, Vec::new(), None, recorder.clone()).unwrap();

        let client = factory.new_client(&endpoint(&server));
        let response = client
            .execute(TransportRequest::delete("apps/BILLING/i-42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let observations = recorder.observations();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].status(), Some(StatusCode::NOT_FOUND));

        factory.shutdown();
    }

    #[test]
    fn test_new_transport_client_factory_rejects_bad_settings() {
        let settings = TransportSettings {
            max_connections_per_host: 0,
            ..TransportSettings::default()
        };
        let recorder = Arc::new(CollectingRecorder::default());
        let err = new_transport_client_factory(&settings, Vec::new(), None, recorder)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
