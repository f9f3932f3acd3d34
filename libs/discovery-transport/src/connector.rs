//! Connection establishment: direct, through a forward proxy, or tunnelled.

use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{Empty, Full};
use hyper::client::conn::http1::SendRequest;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tower::ServiceExt;

use crate::config::TransportConfig;
use crate::error::{BoxError, ConfigError, TransportError};
use crate::proxy::ProxyConfig;
use crate::tls;

/// Request sender for one HTTP/1.1 connection
pub(crate) type Sender = SendRequest<Full<Bytes>>;

/// Byte stream a connection runs over
trait ConnIo: hyper::rt::Read + hyper::rt::Write + Send + Unpin {}

impl<T> ConnIo for T where T: hyper::rt::Read + hyper::rt::Write + Send + Unpin {}

/// Pool key: one scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl RouteKey {
    /// Route of an absolute request URI; default ports are made explicit.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidUri` for relative URIs and schemes
    /// other than `http`/`https`.
    pub fn from_uri(uri: &Uri) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUri {
            url: uri.to_string(),
            reason: reason.to_owned(),
        };
        let scheme = uri.scheme().ok_or_else(|| invalid("missing scheme"))?;
        let default_port = if *scheme == Scheme::HTTPS {
            443
        } else if *scheme == Scheme::HTTP {
            80
        } else {
            return Err(invalid("scheme must be http or https"));
        };
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            scheme: scheme.clone(),
            host: host.to_ascii_lowercase(),
            port: uri.port_u16().unwrap_or(default_port),
        })
    }

    #[must_use]
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn default_port(&self) -> bool {
        (self.is_https() && self.port == 443) || (!self.is_https() && self.port == 80)
    }

    /// `host:port`, the CONNECT target
    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` header; the port is omitted when it is the default
    fn host_header(&self) -> String {
        if self.default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    fn uri(&self) -> Result<Uri, TransportError> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority())
            .path_and_query("/")
            .build()
            .map_err(TransportError::from)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Opens HTTP/1.1 connections for the pool.
#[derive(Clone)]
pub(crate) struct Connector {
    https: HttpsConnector<HttpConnector>,
    tunnel_tls: TlsConnector,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// # Errors
    /// Returns `ConfigError::Tls` if the TLS client configuration cannot be built.
    pub(crate) fn new(config: &TransportConfig) -> Result<Self, ConfigError> {
        let tls_config = tls::client_config(config.tls())?;

        let mut tunnel_config = tls_config.clone();
        tunnel_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout()));

        // hyper-rustls rejects configurations with ALPN already set
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Ok(Self {
            https,
            tunnel_tls: TlsConnector::from(Arc::new(tunnel_config)),
            proxy: config.proxy().cloned(),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// Rewrite a request for the wire.
    ///
    /// Requests sent through a forward proxy keep the absolute URI and carry
    /// the proxy credentials; everything else is sent in origin form.
    pub(crate) fn prepare_request(&self, route: &RouteKey, parts: &mut Parts) {
        if !parts.headers.contains_key(HOST)
            && let Ok(host) = HeaderValue::from_str(&route.host_header())
        {
            parts.headers.insert(HOST, host);
        }

        match &self.proxy {
            Some(proxy) if !route.is_https() => {
                parts
                    .headers
                    .insert(PROXY_AUTHORIZATION, proxy.authorization().clone());
            }
            _ => {
                let path = parts
                    .uri
                    .path_and_query()
                    .cloned()
                    .unwrap_or_else(|| PathAndQuery::from_static("/"));
                parts.uri = Uri::from(path);
            }
        }
    }

    /// Open a connection for `route` and complete the HTTP/1.1 handshake.
    ///
    /// # Errors
    /// `ConnectTimeout` when the whole sequence exceeds the connect timeout,
    /// otherwise `Connect`, `Tls` or `ProxyTunnel`.
    pub(crate) async fn connect(&self, route: &RouteKey) -> Result<Sender, TransportError> {
        match tokio::time::timeout(self.connect_timeout, self.connect_inner(route)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout(self.connect_timeout)),
        }
    }

    async fn connect_inner(&self, route: &RouteKey) -> Result<Sender, TransportError> {
        let io: Box<dyn ConnIo> = match &self.proxy {
            None => self.open(route.uri()?).await?,
            Some(proxy) if !route.is_https() => self.open(proxy.uri().clone()).await?,
            Some(proxy) => self.tunnel(proxy, route).await?,
        };

        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;

        let route_name = route.to_string();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(route = %route_name, error = %err, "connection closed with error");
            }
        });

        tracing::debug!(route = %route, proxied = self.proxy.is_some(), "opened connection");
        Ok(sender)
    }

    async fn open(&self, uri: Uri) -> Result<Box<dyn ConnIo>, TransportError> {
        let stream = self
            .https
            .clone()
            .oneshot(uri)
            .await
            .map_err(classify_connect_error)?;
        Ok(Box::new(stream))
    }

    async fn tunnel(
        &self,
        proxy: &ProxyConfig,
        route: &RouteKey,
    ) -> Result<Box<dyn ConnIo>, TransportError> {
        let stream = self.open(proxy.uri().clone()).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(stream)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                tracing::debug!(error = %err, "proxy tunnel connection failed");
            }
        });

        let target = route.authority();
        let authority: Authority = target.parse().map_err(|_| TransportError::InvalidUri {
            url: target.clone(),
            reason: "invalid tunnel target".to_owned(),
        })?;
        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(Uri::from(authority))
            .header(HOST, target.as_str())
            .header(PROXY_AUTHORIZATION, proxy.authorization().clone())
            .body(Empty::<Bytes>::new())?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::ProxyTunnel {
                status: response.status(),
            });
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| TransportError::Connect(Box::new(e)))?;

        let host = route.host().trim_start_matches('[').trim_end_matches(']');
        let server_name =
            ServerName::try_from(host.to_owned()).map_err(|e| TransportError::InvalidUri {
                url: route.to_string(),
                reason: e.to_string(),
            })?;
        let tls = self
            .tunnel_tls
            .connect(server_name, TokioIo::new(upgraded))
            .await
            .map_err(|e| classify_connect_error(Box::new(e)))?;

        Ok(Box::new(TokioIo::new(tls)))
    }
}

/// Split connector failures into TLS and plain connect errors.
fn classify_connect_error(err: BoxError) -> TransportError {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err.as_ref());
    while let Some(e) = current {
        if e.is::<rustls::Error>() {
            return TransportError::Tls(err);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>())
        {
            return TransportError::Tls(err);
        }
        current = e.source();
    }
    TransportError::Connect(err)
}
