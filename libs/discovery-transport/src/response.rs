use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::codec::Codecs;
use crate::error::{BoxError, TransportError};

/// Type-erased response body, after gzip decoding.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Read a whole response body, bounded in size and time.
///
/// The size limit applies to decoded bytes. Reading stops at the first data
/// frame that crosses it; trailers are skipped.
pub(crate) async fn collect_body(
    body: ResponseBody,
    limit: usize,
    read_timeout: Duration,
) -> Result<Bytes, TransportError> {
    match tokio::time::timeout(read_timeout, read_limited(body, limit)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ReadTimeout(read_timeout)),
    }
}

async fn read_limited(mut body: ResponseBody, limit: usize) -> Result<Bytes, TransportError> {
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(TransportError::Transport)?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buf.len() + data.len() > limit {
            return Err(TransportError::BodyTooLarge { limit });
        }
        buf.extend_from_slice(&data);
    }
    Ok(Bytes::from(buf))
}

/// A fully read response from a registry endpoint.
///
/// Every HTTP status is a successful exchange at this layer, including 3xx
/// (redirects are never followed) and 4xx/5xx. Interpreting the status is
/// up to the caller.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    codecs: Codecs,
}

impl TransportResponse {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes, codecs: Codecs) -> Self {
        Self {
            status,
            headers,
            body,
            codecs,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Target of a redirect response, for callers that pin endpoints
    #[must_use]
    pub fn redirect_location(&self) -> Option<&str> {
        if !self.status.is_redirection() {
            return None;
        }
        self.headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }

    /// Decode the body with the client's decoder.
    ///
    /// An empty body decodes as JSON `null`, so `Option<T>` reads it as `None`.
    ///
    /// # Errors
    /// Returns `TransportError::Codec` if the body does not decode into `T`.
    pub fn entity<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(self.codecs.decode(&self.body)?)
    }

    /// Body as UTF-8 text, lossy
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::{Full, StreamBody};
    use http_body::Frame;

    fn boxed(body: &'static [u8]) -> ResponseBody {
        Full::new(Bytes::from_static(body))
            .map_err(|never| match never {})
            .boxed()
    }

    #[tokio::test]
    async fn test_collect_within_limit() {
        let bytes = collect_body(boxed(b"{\"applications\":[]}"), 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"{\"applications\":[]}");
    }

    #[tokio::test]
    async fn test_collect_over_limit_fails() {
        let err = collect_body(boxed(&[b'x'; 64]), 16, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_limit_counts_across_frames() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"12345678"))),
            Ok(Frame::trailers(HeaderMap::new())),
            Ok(Frame::data(Bytes::from_static(b"12345678"))),
        ];
        let exact: ResponseBody = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        let bytes = collect_body(exact, 16, Duration::from_secs(1)).await.unwrap();
        assert_eq!(bytes.len(), 16);

        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"12345678"))),
            Ok(Frame::data(Bytes::from_static(b"123456789"))),
        ];
        let over: ResponseBody = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        let err = collect_body(over, 16, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge { limit: 16 }));
    }

    #[tokio::test]
    async fn test_body_error_surfaces_as_transport_error() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"{\"app"))),
            Err("connection reset mid-body".into()),
        ];
        let body: ResponseBody = StreamBody::new(futures_util::stream::iter(frames)).boxed();
        let err = collect_body(body, 1024, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Transport(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_times_out() {
        let stream = futures_util::stream::pending::<Result<Frame<Bytes>, BoxError>>();
        let body: ResponseBody = StreamBody::new(stream).boxed();
        let err = collect_body(body, 1024, Duration::from_secs(8)).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadTimeout(d) if d == Duration::from_secs(8)));
    }

    #[test]
    fn test_redirect_location_only_for_3xx() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::LOCATION,
            http::HeaderValue::from_static("http://other-registry:8761/eureka/"),
        );
        let redirect = TransportResponse::new(
            StatusCode::FOUND,
            headers.clone(),
            Bytes::new(),
            Codecs::default(),
        );
        assert_eq!(
            redirect.redirect_location(),
            Some("http://other-registry:8761/eureka/")
        );

        let ok = TransportResponse::new(StatusCode::OK, headers, Bytes::new(), Codecs::default());
        assert_eq!(ok.redirect_location(), None);
    }

    #[test]
    fn test_entity_decoding() {
        let response = TransportResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(br#"{"name":"BILLING"}"#),
            Codecs::default(),
        );
        let value: serde_json::Value = response.entity().unwrap();
        assert_eq!(value["name"], "BILLING");

        let empty = TransportResponse::new(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            Bytes::new(),
            Codecs::default(),
        );
        let none: Option<serde_json::Value> = empty.entity().unwrap();
        assert!(none.is_none());
        assert!(empty.is_success());
    }
}
