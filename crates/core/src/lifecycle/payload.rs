//! The in-flight body value threaded through the pipeline

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt;

use crate::error::HttpError;

pub type PayloadStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// A request or reply body at some point in the lifecycle.
///
/// `Null`, `Text`, `Bytes` and `Stream` are wire-ready; `Json` is a
/// structured value that still needs serializing.
#[derive(Default)]
pub enum Payload {
    #[default]
    Null,
    Text(String),
    Bytes(Bytes),
    Stream(PayloadStream),
    Json(Value),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
            Payload::Stream(_) => "stream",
            Payload::Json(_) => "json",
        }
    }

    /// True for the kinds that can be written to the transport as-is
    pub fn is_wire_ready(&self) -> bool {
        !matches!(self, Payload::Json(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn json<T: serde::Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn stream(stream: PayloadStream) -> Self {
        Payload::Stream(stream)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Collect the payload into bytes, failing with 413 past `limit`.
    ///
    /// `Json` is encoded with `serde_json`; `Null` becomes an empty body.
    pub async fn into_bytes(self, limit: Option<usize>) -> anyhow::Result<Bytes> {
        let bytes = match self {
            Payload::Null => Bytes::new(),
            Payload::Text(s) => Bytes::from(s),
            Payload::Bytes(b) => b,
            Payload::Json(v) => Bytes::from(serde_json::to_vec(&v)?),
            Payload::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    if let Some(limit) = limit {
                        if buf.len() + chunk.len() > limit {
                            return Err(too_large(limit).into());
                        }
                    }
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            }
        };
        if let Some(limit) = limit {
            if bytes.len() > limit {
                return Err(too_large(limit).into());
            }
        }
        Ok(bytes)
    }
}

fn too_large(limit: usize) -> HttpError {
    HttpError::payload_too_large(format!("Request body is larger than {} bytes", limit))
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Null => f.write_str("Null"),
            Payload::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Payload::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
            Payload::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(b))
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Payload::Null,
            other => Payload::Json(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_ready_kinds() {
        assert!(Payload::Null.is_wire_ready());
        assert!(Payload::from("hi").is_wire_ready());
        assert!(Payload::from(vec![1u8, 2]).is_wire_ready());
        assert!(Payload::stream(futures::stream::empty().boxed()).is_wire_ready());
        assert!(!Payload::from(json!({"a": 1})).is_wire_ready());
    }

    #[test]
    fn test_json_null_maps_to_null() {
        assert!(Payload::from(Value::Null).is_null());
    }

    #[tokio::test]
    async fn test_stream_collects_in_order() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let payload = Payload::stream(futures::stream::iter(chunks).boxed());
        let bytes = payload.into_bytes(None).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_limit_applies_to_streams_and_buffers() {
        let chunks = vec![Ok(Bytes::from_static(b"0123")), Ok(Bytes::from_static(b"4567"))];
        let err = Payload::stream(futures::stream::iter(chunks).boxed())
            .into_bytes(Some(6))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<HttpError>().map(|e| e.status), Some(413));

        assert!(Payload::from("0123456789").into_bytes(Some(4)).await.is_err());
        assert!(Payload::from("0123").into_bytes(Some(4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_json_encodes() {
        let bytes = Payload::from(json!({"ok": true}))
            .into_bytes(None)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"ok":true}"#);
    }
}
