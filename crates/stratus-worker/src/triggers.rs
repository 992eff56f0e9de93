//! HTTP trigger types.
//!
//! Functions bound to an HTTP trigger receive an [`HttpRequestData`] and
//! may return an [`HttpResponseData`], either as their return value or
//! through an output binding.
//!
//! # Example
//!
//! ```ignore
//! let echo = handler_fn(|mut args| async move {
//!     let req: HttpRequestData = args.take(0)?;
//!     let order: Order = req.body_json()?;
//!     Ok::<_, FunctionError>(HttpResponseData::json(201, &order)?)
//! });
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use stratus_proto::RpcHttp;

/// HTTP request delivered to a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestData {
    /// HTTP method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Headers, in arrival order.
    pub headers: Vec<(String, String)>,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpRequestData {
    /// Create a new request with the given method and URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Gets a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Gets a query parameter by name.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the body as UTF-8 text.
    pub fn body_string(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Deserialises the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl From<RpcHttp> for HttpRequestData {
    fn from(http: RpcHttp) -> Self {
        Self {
            method: http.method,
            url: http.url,
            headers: http.headers,
            query: http.query,
            body: http.body.unwrap_or_default(),
        }
    }
}

/// HTTP response produced by a function.
///
/// # Example
///
/// ```ignore
/// HttpResponseData::ok("done")
/// HttpResponseData::created(order_id)
/// HttpResponseData::new(404, "missing").with_header("Cache-Control", "no-store")
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseData {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponseData {
    /// Create a response with a custom status code.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Create a 200 OK response.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    /// Create a 201 Created response.
    pub fn created(body: impl Into<Vec<u8>>) -> Self {
        Self::new(201, body)
    }

    /// Create a JSON response.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(body)?;
        Ok(Self::new(status, body).with_header("Content-Type", "application/json"))
    }

    /// Add a header to the response.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub(crate) fn into_rpc(self) -> RpcHttp {
        RpcHttp {
            status_code: Some(self.status.to_string()),
            headers: self.headers,
            body: Some(self.body),
            ..RpcHttp::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Deserialize, Serialize)]
    struct Order {
        id: u32,
    }

    #[test]
    fn request_from_wire() {
        let request = HttpRequestData::from(RpcHttp {
            method: "POST".into(),
            url: "https://example.test/orders?x=1".into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            query: vec![("x".into(), "1".into())],
            status_code: None,
            body: Some(br#"{"id":7}"#.to_vec()),
        });

        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.query_param("x"), Some("1"));
        assert_eq!(request.body_json::<Order>().unwrap(), Order { id: 7 });
    }

    #[test]
    fn missing_body_is_empty() {
        let request = HttpRequestData::from(RpcHttp::default());
        assert!(request.body.is_empty());
        assert_eq!(request.body_string().unwrap(), "");
    }

    #[test]
    fn json_response() {
        let response = HttpResponseData::json(201, &Order { id: 3 }).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, br#"{"id":3}"#.to_vec());

        let rpc = response.into_rpc();
        assert_eq!(rpc.status_code.as_deref(), Some("201"));
        assert!(rpc.headers.iter().any(|(k, _)| k == "Content-Type"));
    }
}
