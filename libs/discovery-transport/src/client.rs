use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Request, Uri};
use http_body_util::Full;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use crate::codec::Codecs;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::request::TransportRequest;
use crate::response::{TransportResponse, collect_body};
use crate::transport::TransportService;

/// Client bound to one registry endpoint.
///
/// This is the surface the registry protocol layer talks to. Failures are
/// reported, never retried; retry and failover across endpoints happen above
/// this layer.
#[async_trait]
pub trait RegistryHttpClient: Send + Sync {
    /// Endpoint every request of this client is sent to
    fn endpoint(&self) -> &Endpoint;

    /// Execute a request relative to the endpoint.
    ///
    /// # Errors
    /// Returns `TransportError` for connection, timeout, TLS, encoding and
    /// request-assembly failures. HTTP error statuses are not errors.
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// `GET` a path relative to the endpoint
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    async fn get(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.execute(TransportRequest::get(path)).await
    }

    /// `DELETE` a path relative to the endpoint
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    async fn delete(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.execute(TransportRequest::delete(path)).await
    }
}

/// Lightweight handle sharing its transport client's pool.
///
/// Holds no resources of its own; dropping it releases nothing but a
/// reference to the shared service.
#[derive(Clone)]
pub struct EndpointClient {
    endpoint: Endpoint,
    service: TransportService,
    extra_headers: Arc<HeaderMap>,
    codecs: Codecs,
    read_timeout: Duration,
    max_body_size: usize,
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("endpoint", &self.endpoint)
            .field("extra_headers", &self.extra_headers)
            .finish_non_exhaustive()
    }
}

impl EndpointClient {
    pub(crate) fn new(
        endpoint: Endpoint,
        service: TransportService,
        extra_headers: Arc<HeaderMap>,
        codecs: Codecs,
        read_timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        Self {
            endpoint,
            service,
            extra_headers,
            codecs,
            read_timeout,
            max_body_size,
        }
    }

    /// Headers added to every request of this client
    #[must_use]
    pub fn extra_headers(&self) -> &HeaderMap {
        &self.extra_headers
    }

    fn build_request(&self, request: TransportRequest) -> Result<Request<Full<Bytes>>, TransportError> {
        let parts = request.into_parts()?;

        let mut url = self.endpoint.resolve(&parts.path);
        if !parts.query.is_empty() {
            let query = serde_urlencoded::to_string(&parts.query)?;
            url.push('?');
            url.push_str(&query);
        }
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| TransportError::InvalidUri {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let body = parts
            .entity
            .as_ref()
            .map(|entity| self.codecs.encoder.encode(entity))
            .transpose()?;

        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                self.extra_headers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            for (name, value) in parts.headers {
                headers.insert(name, value);
            }
            if let Some(authorization) = self.endpoint.authorization() {
                headers
                    .entry(AUTHORIZATION)
                    .or_insert_with(|| authorization.clone());
            }
            if !headers.contains_key(ACCEPT)
                && let Ok(accept) = HeaderValue::from_str(self.codecs.decoder.accept())
            {
                headers.insert(ACCEPT, accept);
            }
            if body.is_some()
                && !headers.contains_key(CONTENT_TYPE)
                && let Ok(content_type) = HeaderValue::from_str(self.codecs.encoder.content_type())
            {
                headers.insert(CONTENT_TYPE, content_type);
            }
        }

        Ok(builder.body(Full::new(body.unwrap_or_default()))?)
    }
}

#[async_trait]
impl RegistryHttpClient for EndpointClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let method = request.method().clone();
        let request = self.build_request(request)?;
        tracing::trace!(endpoint = %self.endpoint, %method, uri = %request.uri(), "sending registry request");

        let response = self.service.clone().oneshot(request).await?;
        let (parts, body) = response.into_parts();
        let body = collect_body(body, self.max_body_size, self.read_timeout).await?;

        Ok(TransportResponse::new(
            parts.status,
            parts.headers,
            body,
            self.codecs.clone(),
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use http::{Response, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::BoxCloneSyncService;

    /// Service answering with the request's method, URI and headers as JSON
    fn echo_service() -> TransportService {
        BoxCloneSyncService::new(tower::service_fn(|req: Request<Full<Bytes>>| async move {
            let headers: serde_json::Map<String, serde_json::Value> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().into()))
                .collect();
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let echo = serde_json::json!({
                "method": method,
                "uri": uri,
                "headers": headers,
                "body": String::from_utf8_lossy(&body),
            });
            let body: ResponseBody = Full::new(Bytes::from(echo.to_string()))
                .map_err(|never| match never {})
                .boxed();
            Ok::<_, TransportError>(Response::builder().status(StatusCode::OK).body(body).unwrap())
        }))
    }

    fn client(extra: HeaderMap) -> EndpointClient {
        client_for("http://registry-1:8761/eureka/v2/", extra)
    }

    fn client_for(url: &str, extra: HeaderMap) -> EndpointClient {
        EndpointClient::new(
            Endpoint::new(url).unwrap(),
            echo_service(),
            Arc::new(extra),
            Codecs::default(),
            Duration::from_secs(1),
            1024 * 1024,
        )
    }

    #[tokio::test]
    async fn test_request_assembly() {
        let mut extra = HeaderMap::new();
        extra.insert("x-eureka-accept", HeaderValue::from_static("compact"));
        let client = client(extra);

        let response = client
            .execute(
                TransportRequest::put("apps/BILLING/i-42/status")
                    .query("value", "OUT_OF_SERVICE")
                    .query("note", "a b&c")
                    .header("x-request-id", "r-1")
                    .entity(&serde_json::json!({"status": "DOWN"})),
            )
            .await
            .unwrap();
        let echo: serde_json::Value = response.entity().unwrap();

        assert_eq!(echo["method"], "PUT");
        assert_eq!(
            echo["uri"],
            "http://registry-1:8761/eureka/v2/apps/BILLING/i-42/status?value=OUT_OF_SERVICE&note=a+b%26c"
        );
        assert_eq!(echo["headers"]["x-eureka-accept"], "compact");
        assert_eq!(echo["headers"]["x-request-id"], "r-1");
        assert_eq!(echo["headers"]["accept"], "application/json");
        assert_eq!(echo["headers"]["content-type"], "application/json");
        assert_eq!(echo["body"], r#"{"status":"DOWN"}"#);
    }

    #[tokio::test]
    async fn test_request_headers_override_fixed_headers() {
        let mut extra = HeaderMap::new();
        extra.insert(ACCEPT, HeaderValue::from_static("application/xml"));
        let client = client(extra);

        let response = client
            .execute(TransportRequest::get("apps").header("accept", "text/plain"))
            .await
            .unwrap();
        let echo: serde_json::Value = response.entity().unwrap();
        assert_eq!(echo["headers"]["accept"], "text/plain");
        assert!(echo["headers"].get("content-type").is_none());
    }

    #[tokio::test]
    async fn test_get_and_delete_helpers() {
        let client = client(HeaderMap::new());

        let echo: serde_json::Value = client.get("/apps/").await.unwrap().entity().unwrap();
        assert_eq!(echo["method"], "GET");
        assert_eq!(echo["uri"], "http://registry-1:8761/eureka/v2/apps/");

        let echo: serde_json::Value = client
            .delete("apps/BILLING/i-42")
            .await
            .unwrap()
            .entity()
            .unwrap();
        assert_eq!(echo["method"], "DELETE");
    }

    #[tokio::test]
    async fn test_endpoint_credentials_sent_as_basic_auth() {
        let client = client_for("http://user:pw@registry-1:8761/eureka/v2/", HeaderMap::new());

        let echo: serde_json::Value = client.get("apps/").await.unwrap().entity().unwrap();
        assert_eq!(echo["uri"], "http://registry-1:8761/eureka/v2/apps/");
        assert_eq!(echo["headers"]["authorization"], "Basic dXNlcjpwdw==");

        // an explicit request header wins
        let echo: serde_json::Value = client
            .execute(TransportRequest::get("apps").header("authorization", "Bearer t0ken"))
            .await
            .unwrap()
            .entity()
            .unwrap();
        assert_eq!(echo["headers"]["authorization"], "Bearer t0ken");
    }

    #[tokio::test]
    async fn test_deferred_request_error_surfaces() {
        let client = client(HeaderMap::new());
        let err = client
            .execute(TransportRequest::get("apps").header("bad header", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidHeaderName(_)));
        assert!(!err.is_connection_error());
    }
}
