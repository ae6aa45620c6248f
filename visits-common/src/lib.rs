use {
    serde::{Serialize, Deserialize},
    thiserror::Error,
    http::{HeaderMap, header::{self, IntoHeaderName, HeaderValue}, StatusCode, Method as HttpMethod, Uri},
};

/// Key of the single counter record, unless overridden in configuration.
pub const COUNTER_KEY_DEFAULT: &str = "visits";

/// Text shown by the companion client when the count cannot be fetched.
pub const COUNT_PLACEHOLDER: &str = "N/A";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const ALLOW_ORIGIN_ANY: &str = "*";
pub const ALLOWED_METHODS: &str = "GET";

/// Body returned by the counter endpoint. `count` is the total after the increment.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

impl CountResponse {
    pub fn new(count: u64) -> Self {
        Self { count }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Uri,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: HttpMethod::GET,
            url: Uri::from_static("/"),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Result<Self, HttpRequestError> {
        self.url = url.into().parse()
            .map_err(|err| HttpRequestError::InvalidRequest { reason: format!("failed to parse url: {err:?}") })?;
        Ok(self)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> From<&http::Request<B>> for HttpRequest {
    fn from(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            url: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: vec![],
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn with_header<K: IntoHeaderName>(mut self, header_name: K, header_value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(header_name, header_value.into());
        self
    }

    pub fn with_body(mut self, body: impl HttpResponseBody) -> Self {
        self.body = body.into_bytes();
        self
    }

    /// Plain text body, used for every non-success response.
    pub fn with_text(self, text: &str) -> Self {
        self.with_header(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT))
            .with_body(text)
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON))
            .with_body(body))
    }

    /// Marks the response as readable from any origin.
    pub fn with_cors(self) -> Self {
        self.with_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(ALLOW_ORIGIN_ANY))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum HttpRequestError {
    #[error("http request is invalid: {reason}")]
    InvalidRequest { reason: String },
}

pub trait HttpResponseBody {
    fn into_bytes(self) -> Vec<u8>;
}

impl HttpResponseBody for Vec<u8> {
    fn into_bytes(self) -> Vec<u8> { self }
}

impl HttpResponseBody for String {
    fn into_bytes(self) -> Vec<u8> { self.into_bytes() }
}

impl HttpResponseBody for &str {
    fn into_bytes(self) -> Vec<u8> { self.as_bytes().to_vec() }
}
