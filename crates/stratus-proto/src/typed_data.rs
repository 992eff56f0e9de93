//! The closed value vocabulary of the wire.

use rkyv::{Archive, Deserialize, Serialize};

/// A value as the host understands it.
///
/// Every input delivered to a function and every output produced by one is
/// expressed as exactly one of these shapes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub enum WireValue {
    /// No value.
    #[default]
    None,
    /// UTF-8 text.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// JSON text.
    Json(String),
    /// Structured HTTP request or response.
    Http(RpcHttp),
    /// Homogeneous collection of strings.
    CollectionString(Vec<String>),
    /// Homogeneous collection of byte arrays.
    CollectionBytes(Vec<Vec<u8>>),
    /// Homogeneous collection of doubles.
    CollectionDouble(Vec<f64>),
    /// Homogeneous collection of signed 64-bit integers.
    CollectionSint64(Vec<i64>),
}

impl WireValue {
    /// Returns a stable lowercase name for this value's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::CollectionString(_) => "collection_string",
            Self::CollectionBytes(_) => "collection_bytes",
            Self::CollectionDouble(_) => "collection_double",
            Self::CollectionSint64(_) => "collection_sint64",
        }
    }

    /// Checks if this is the absent value.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the textual content of string or JSON values.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Json(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw content of string, JSON or byte values.
    #[must_use]
    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) | Self::Json(s) => Some(s.as_bytes()),
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// HTTP request or response as carried on the wire.
///
/// Bodies are always raw bytes; the worker advertises the raw-body
/// capability during the handshake.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RpcHttp {
    /// HTTP method (requests only).
    pub method: String,

    /// Request URL (requests only).
    pub url: String,

    /// Header pairs, in arrival order.
    pub headers: Vec<(String, String)>,

    /// Query parameters (requests only).
    pub query: Vec<(String, String)>,

    /// Status code (responses only).
    pub status_code: Option<String>,

    /// Raw body.
    pub body: Option<Vec<u8>>,
}

/// A named input or output value.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterBinding {
    /// Binding name as declared in function metadata.
    pub name: String,

    /// The bound value.
    pub data: WireValue,
}

impl ParameterBinding {
    /// Creates a new parameter binding.
    #[must_use]
    pub fn new(name: impl Into<String>, data: WireValue) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(WireValue::None.kind(), "none");
        assert_eq!(WireValue::from("x").kind(), "string");
        assert_eq!(WireValue::CollectionSint64(vec![1]).kind(), "collection_sint64");
        assert_eq!(WireValue::Http(RpcHttp::default()).kind(), "http");
    }

    #[test]
    fn raw_access() {
        assert_eq!(WireValue::Json("{}".into()).as_text(), Some("{}"));
        assert_eq!(WireValue::Bytes(vec![1, 2]).as_raw(), Some(&[1u8, 2][..]));
        assert!(WireValue::CollectionDouble(vec![]).as_raw().is_none());
        assert!(WireValue::default().is_none());
    }
}
