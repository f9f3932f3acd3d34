use http::Method;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;

use crate::codec::CodecError;
use crate::error::TransportError;

/// A request against an endpoint, relative to its base URL.
///
/// Invalid headers or entities do not fail immediately; the first error is
/// kept and reported when the request is executed.
///
/// ```ignore
/// let request = TransportRequest::put("apps/BILLING/i-0042")
///     .query("status", "UP")
///     .query("lastDirtyTimestamp", "1700000000000")
///     .header("x-request-id", "abc123");
/// let response = client.execute(request).await?;
/// ```
#[derive(Debug)]
#[must_use = "TransportRequest does nothing until it is executed"]
pub struct TransportRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(HeaderName, HeaderValue)>,
    entity: Option<serde_json::Value>,
    error: Option<TransportError>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            entity: None,
            error: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a header; request headers override the client's fixed headers
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(TransportError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(TransportError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Append a query parameter (percent-encoded when sent)
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Attach an entity; it is encoded by the client's encoder when sent
    pub fn entity<T: Serialize + ?Sized>(mut self, entity: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_value(entity) {
            Ok(value) => self.entity = Some(value),
            Err(source) => {
                self.error = Some(TransportError::Codec(CodecError::Encode {
                    codec: "serde".to_owned(),
                    source,
                }));
            }
        }
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    #[must_use]
    pub fn has_entity(&self) -> bool {
        self.entity.is_some()
    }

    pub(crate) fn into_parts(self) -> Result<RequestParts, TransportError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(RequestParts {
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            entity: self.entity,
        })
    }
}

/// Validated request pieces
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) entity: Option<serde_json::Value>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_request_accumulates_parts() {
        let request = TransportRequest::put("apps/BILLING/i-1")
            .query("status", "UP")
            .header("x-request-id", "abc")
            .entity(&serde_json::json!({"status": "UP"}));

        assert_eq!(*request.method(), Method::PUT);
        assert_eq!(request.path(), "apps/BILLING/i-1");
        assert_eq!(request.query_pairs().len(), 1);
        assert!(request.has_entity());

        let parts = request.into_parts().unwrap();
        assert_eq!(parts.headers.len(), 1);
    }

    #[test]
    fn test_first_error_is_deferred() {
        let request = TransportRequest::get("apps")
            .header("bad header", "v")
            .header("x-ok", "bad\nvalue");
        let err = request.into_parts().err().unwrap();
        assert!(matches!(err, TransportError::InvalidHeaderName(_)));

        let request = TransportRequest::get("apps").header("x-ok", "bad\nvalue");
        assert!(matches!(
            request.into_parts(),
            Err(TransportError::InvalidHeaderValue(_))
        ));
    }

    #[test]
    fn test_unserializable_entity_is_codec_error() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "non-string key");
        let request = TransportRequest::post("apps").entity(&map);
        assert!(matches!(
            request.into_parts(),
            Err(TransportError::Codec(CodecError::Encode { .. }))
        ));
    }
}
