use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use crate::config::TransportConfig;
use crate::error::{ConfigError, TransportError};
use crate::layers::{RequestFilter, RequestFilterLayer, UserAgentFilter};
use crate::pool::{ConnectionPool, PoolControl, PoolStats};
use crate::reaper::IdleConnectionReaper;
use crate::response::ResponseBody;

/// Type-erased request service shared by every endpoint client
pub type TransportService =
    BoxCloneSyncService<Request<Full<Bytes>>, Response<ResponseBody>, TransportError>;

/// Pooled HTTP transport for one logical registry target.
///
/// Owns the connection pool and the idle reaper exclusively. Endpoint
/// clients share its request service and therefore its pool.
///
/// The reaper is not started by [`new`](Self::new); call
/// [`start_reaper`](Self::start_reaper) from within a tokio runtime.
/// [`shutdown`](Self::shutdown) stops the reaper and closes the pool
/// together, once.
pub struct TransportClient {
    config: TransportConfig,
    pool: ConnectionPool,
    reaper: IdleConnectionReaper,
    shut_down: AtomicBool,
    service: TransportService,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("client_name", &self.config.client_name())
            .field("pool", &self.pool)
            .field("reaper", &self.reaper)
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    /// # Errors
    /// Returns `ConfigError` if TLS setup fails or the user agent is invalid.
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        Self::with_filters(config, Vec::new())
    }

    /// Create a transport whose requests pass through `filters` in order.
    ///
    /// # Errors
    /// Returns `ConfigError` if TLS setup fails or the user agent is invalid.
    pub fn with_filters(
        config: TransportConfig,
        filters: Vec<Arc<dyn RequestFilter>>,
    ) -> Result<Self, ConfigError> {
        let pool = ConnectionPool::new(&config)?;
        let reaper = IdleConnectionReaper::new(
            Arc::new(pool.clone()),
            config.idle_connection_timeout(),
        );

        let read_timeout = config.read_timeout();
        let mut chain: Vec<Arc<dyn RequestFilter>> = Vec::with_capacity(filters.len() + 1);
        chain.push(Arc::new(UserAgentFilter::try_new(config.user_agent())?));
        chain.extend(filters);

        // Request flow (outer -> inner):
        //   Timeout -> RequestFilters (user agent first) -> Decompression -> pool
        //
        // Redirects are never followed: 3xx responses go back to the caller,
        // which keeps each client pinned to its endpoint.
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(read_timeout))
            .layer(RequestFilterLayer::new(chain))
            .layer(DecompressionLayer::new())
            .service(pool.clone())
            .map_response(map_decompression_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, read_timeout));

        tracing::debug!(
            client_name = config.client_name(),
            max_per_host = config.max_connections_per_host(),
            max_total = config.max_total_connections(),
            proxied = config.proxy().is_some(),
            "transport client created"
        );

        Ok(Self {
            config,
            pool,
            reaper,
            shut_down: AtomicBool::new(false),
            service: BoxCloneSyncService::new(service),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Shared request service
    #[must_use]
    pub fn service(&self) -> TransportService {
        self.service.clone()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close connections idle for at least `idle`
    pub fn close_idle_connections(&self, idle: Duration) -> usize {
        self.pool.close_idle(idle)
    }

    /// Start the idle reaper; returns whether it is running.
    ///
    /// Does nothing when reaping is disabled or after shutdown; the reaper
    /// itself refuses to start once shut down, so a concurrent `shutdown`
    /// cannot leave a sweep task behind.
    pub fn start_reaper(&self) -> bool {
        self.reaper.start()
    }

    #[must_use]
    pub fn is_reaper_running(&self) -> bool {
        self.reaper.is_running()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the reaper and close the pool. Safe to call repeatedly and
    /// concurrently with in-flight requests; only the first call acts.
    pub fn shutdown(&self) {
        if shutdown_once(&self.shut_down, &self.reaper, &self.pool) {
            tracing::info!(client_name = self.config.client_name(), "transport client shut down");
        }
    }
}

/// Stop `reaper` and close `pool` if `flag` was not yet set.
fn shutdown_once(flag: &AtomicBool, reaper: &IdleConnectionReaper, pool: &dyn PoolControl) -> bool {
    if flag.swap(true, Ordering::AcqRel) {
        return false;
    }
    reaper.shutdown();
    pool.close();
    true
}

/// Map tower errors back to `TransportError` with the read timeout duration
fn map_tower_error(err: tower::BoxError, read_timeout: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::ReadTimeout(read_timeout);
    }
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(other) => TransportError::Transport(other),
    }
}

/// Box the (possibly gzip-decoding) body into [`ResponseBody`]
fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, body)
}
