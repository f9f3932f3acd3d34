#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Outbound HTTP transport for service-discovery registry clients
//!
//! This crate turns transport settings into pooled HTTP clients bound to
//! registry endpoints:
//! - Connection pooling with per-host and total caps
//! - Connect and read timeouts, idle connection reaping
//! - TLS via rustls with bundled, system or file-based trust roots
//! - HTTP proxy routing with basic credentials
//! - Client identity and fixed extra headers on every request
//! - Per-call metrics through a pluggable recorder
//!
//! Redirects are never followed and failed calls are never retried; both are
//! decisions of the registry protocol layer above this crate.
//!
//! # Example
//!
//! ```ignore
//! use discovery_transport::{
//!     Endpoint, TracingMetricsRecorder, TransportSettings, new_transport_client_factory,
//! };
//! use std::sync::Arc;
//!
//! let settings = TransportSettings::from_json(config_value)?;
//! let factory = new_transport_client_factory(
//!     &settings,
//!     Vec::new(),
//!     Some("10.0.0.7".to_owned()),
//!     Arc::new(TracingMetricsRecorder),
//! )?;
//!
//! let client = factory.new_client(&Endpoint::new("http://registry-1:8761/eureka/v2")?);
//! let response = client.get("apps/").await?;
//!
//! factory.shutdown();
//! ```

mod client;
mod codec;
mod config;
mod connector;
mod endpoint;
mod error;
mod factory;
mod identity;
mod layers;
mod metrics;
mod pool;
mod proxy;
mod reaper;
mod request;
mod response;
mod settings;
mod tls;
mod transport;

pub use client::{EndpointClient, RegistryHttpClient};
pub use codec::{
    CodecError, Codecs, EntityDecoder, EntityEncoder, JSON_CODEC, JsonCodec, resolve_decoder,
    resolve_encoder,
};
pub use config::{
    BUILD_VERSION, DEFAULT_CLIENT_NAME, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_CONNECTION_TIMEOUT,
    DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_MAX_TOTAL_CONNECTIONS,
    DEFAULT_READ_TIMEOUT, HostnameVerification, TlsMode, TransportConfig, TransportConfigBuilder,
    TrustStore,
};
pub use connector::RouteKey;
pub use endpoint::Endpoint;
pub use error::{BoxError, ConfigError, TransportError};
pub use factory::{
    ALLOW_REDIRECT_HEADER, CLIENT_ACCEPT_HEADER, ClientAccept, HttpTransportClientFactory,
    HttpTransportClientFactoryBuilder, TransportClientFactory, new_transport_client_factory,
};
pub use identity::{
    ClientIdentity, DEFAULT_IDENTITY_NAME, DEFAULT_IDENTITY_VERSION, IDENTITY_ID_HEADER,
    IDENTITY_NAME_HEADER, IDENTITY_VERSION_HEADER, IdentityHeaderFilter,
};
pub use layers::{RequestFilter, RequestFilterLayer, RequestFilterService, UserAgentFilter};
pub use metrics::{
    CallObservation, CallOutcome, MetricsClientFactory, MetricsCollectingClient, MetricsRecorder,
    TracingMetricsRecorder,
};
pub use pool::{ConnectionPool, PoolControl, PoolStats};
pub use proxy::{PLACEHOLDER_PROXY_PASSWORD, PLACEHOLDER_PROXY_USER, ProxyConfig};
pub use reaper::{IdleConnectionReaper, sweep_interval};
pub use request::TransportRequest;
pub use response::{ResponseBody, TransportResponse};
pub use settings::{
    IdentitySettings, PROXY_CLIENT_NAME, ProxySettings, SYSTEM_SSL_CLIENT_NAME,
    TransportSettings, TrustStoreSettings,
};
pub use transport::{TransportClient, TransportService};
