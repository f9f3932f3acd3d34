//! Entity codecs.
//!
//! The transport does not know the registry's payload schema. It only needs
//! to turn an entity into bytes with a content type, and bytes back into an
//! entity. Encoders and decoders are selected by id at configuration time so
//! the wire format can change without touching the transport.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::error::ConfigError;

/// Id of the built-in JSON codec.
pub const JSON_CODEC: &str = "json";

/// Entity encoding/decoding failure
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CodecError {
    #[error("failed to encode entity with codec '{codec}': {source}")]
    Encode {
        codec: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode entity with codec '{codec}': {source}")]
    Decode {
        codec: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serializes request entities.
pub trait EntityEncoder: Send + Sync + fmt::Debug {
    /// Registry id of this encoder
    fn id(&self) -> &str;

    /// Value sent as `Content-Type`
    fn content_type(&self) -> &str;

    /// Encode an entity into the request body
    ///
    /// # Errors
    /// Returns `CodecError::Encode` if the entity cannot be represented.
    fn encode(&self, entity: &serde_json::Value) -> Result<Bytes, CodecError>;
}

/// Deserializes response entities.
pub trait EntityDecoder: Send + Sync + fmt::Debug {
    /// Registry id of this decoder
    fn id(&self) -> &str;

    /// Value sent as `Accept`
    fn accept(&self) -> &str;

    /// Decode a response body into an entity
    ///
    /// # Errors
    /// Returns `CodecError::Decode` if the body is not a valid entity.
    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EntityEncoder for JsonCodec {
    fn id(&self) -> &str {
        JSON_CODEC
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, entity: &serde_json::Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(entity)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode {
                codec: JSON_CODEC.to_owned(),
                source,
            })
    }
}

impl EntityDecoder for JsonCodec {
    fn id(&self) -> &str {
        JSON_CODEC
    }

    fn accept(&self) -> &str {
        "application/json"
    }

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, CodecError> {
        // An empty body decodes to null so status-only responses stay readable
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(body).map_err(|source| CodecError::Decode {
            codec: JSON_CODEC.to_owned(),
            source,
        })
    }
}

/// Encoder/decoder pair registered on a transport client.
#[derive(Debug, Clone)]
pub struct Codecs {
    pub encoder: Arc<dyn EntityEncoder>,
    pub decoder: Arc<dyn EntityDecoder>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            encoder: Arc::new(JsonCodec),
            decoder: Arc::new(JsonCodec),
        }
    }
}

impl Codecs {
    /// Serialize a typed entity through the configured encoder.
    ///
    /// # Errors
    /// Returns `CodecError::Encode` if the entity cannot be serialized.
    pub fn encode<T: Serialize>(&self, entity: &T) -> Result<Bytes, CodecError> {
        let value = serde_json::to_value(entity).map_err(|source| CodecError::Encode {
            codec: self.encoder.id().to_owned(),
            source,
        })?;
        self.encoder.encode(&value)
    }

    /// Deserialize a typed entity through the configured decoder.
    ///
    /// # Errors
    /// Returns `CodecError::Decode` if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        let value = self.decoder.decode(body)?;
        serde_json::from_value(value).map_err(|source| CodecError::Decode {
            codec: self.decoder.id().to_owned(),
            source,
        })
    }
}

/// Look up a built-in encoder by id (case-insensitive).
///
/// # Errors
/// Returns `ConfigError::UnknownCodec` for ids that are not registered.
pub fn resolve_encoder(id: &str) -> Result<Arc<dyn EntityEncoder>, ConfigError> {
    if id.eq_ignore_ascii_case(JSON_CODEC) {
        Ok(Arc::new(JsonCodec))
    } else {
        Err(ConfigError::UnknownCodec(id.to_owned()))
    }
}

/// Look up a built-in decoder by id (case-insensitive).
///
/// # Errors
/// Returns `ConfigError::UnknownCodec` for ids that are not registered.
pub fn resolve_decoder(id: &str) -> Result<Arc<dyn EntityDecoder>, ConfigError> {
    if id.eq_ignore_ascii_case(JSON_CODEC) {
        Ok(Arc::new(JsonCodec))
    } else {
        Err(ConfigError::UnknownCodec(id.to_owned()))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Instance {
        app: String,
        port: u16,
    }

    #[test]
    fn test_resolve_known_codecs() {
        assert_eq!(resolve_encoder("json").unwrap().id(), JSON_CODEC);
        assert_eq!(resolve_decoder("JSON").unwrap().id(), JSON_CODEC);
    }

    #[test]
    fn test_resolve_unknown_codec_fails() {
        let err = resolve_encoder("xstream-xml").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCodec(ref id) if id == "xstream-xml"));
        assert!(resolve_decoder("").is_err());
    }

    #[test]
    fn test_typed_entity_through_codecs() {
        let codecs = Codecs::default();
        let body = codecs
            .encode(&Instance {
                app: "billing".to_owned(),
                port: 8080,
            })
            .unwrap();
        assert_eq!(&body[..], br#"{"app":"billing","port":8080}"#);

        let decoded: Instance = codecs.decode(&body).unwrap();
        assert_eq!(decoded.app, "billing");
    }

    #[test]
    fn test_empty_body_decodes_to_null() {
        let value = JsonCodec.decode(b"").unwrap();
        assert!(value.is_null());
        let unit: Option<Instance> = Codecs::default().decode(b"").unwrap();
        assert!(unit.is_none());
    }

    #[test]
    fn test_decode_error_names_codec() {
        let err = Codecs::default().decode::<Instance>(b"{not json").unwrap_err();
        assert!(err.to_string().contains("'json'"));
    }
}
