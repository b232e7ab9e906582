use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use http::header::{HeaderName, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use hyper::Body;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::config::{BodySource, RequestConfig};
use crate::error::{Error, Result};
use crate::multipart::MultipartBuilder;

/// Default `User-Agent`
pub const DEFAULT_USER_AGENT: &str = concat!("tpx/", env!("CARGO_PKG_VERSION"));

/// Streaming body source
pub type BodyReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Request body types
pub enum RequestBody {
    /// Empty body
    Empty,
    /// In-memory body, cheap to clone
    Bytes(Bytes),
    /// Body read on demand; can only be sent once unless buffered
    Reader(BodyReader),
}

impl RequestBody {
    /// Check if the body is empty
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// In-memory bytes, if the body has them
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RequestBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn try_clone(&self) -> Option<Self> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(bytes) => Some(RequestBody::Bytes(bytes.clone())),
            RequestBody::Reader(_) => None,
        }
    }

    fn into_hyper(self) -> Body {
        match self {
            RequestBody::Empty => Body::empty(),
            RequestBody::Bytes(bytes) => Body::from(bytes),
            RequestBody::Reader(reader) => Body::wrap_stream(tokio_util::io::ReaderStream::new(reader)),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Bytes(bytes)
        }
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        RequestBody::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::from(Bytes::from(s))
    }
}

/// HTTP request representation
///
/// A wire-level request: method, absolute URL, headers and body.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Get the HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the URL
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Replace the body
    pub fn set_body(&mut self, body: impl Into<RequestBody>) {
        self.body = body.into();
    }

    /// Set the body, builder style
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.set_body(body);
        self
    }

    /// Add a header, builder style
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Copy of this request with the same method, URL, headers and body
    /// bytes; `None` while the body is an unbuffered reader
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
        })
    }

    /// Read a streaming body into memory so the request can be replayed.
    /// A no-op for bodies that are already in memory.
    pub async fn buffer_body(&mut self) -> Result<()> {
        if let RequestBody::Reader(reader) = &mut self.body {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            self.body = RequestBody::from(Bytes::from(buf));
        }
        Ok(())
    }

    /// Convert into an `http::Request` ready for the transport
    pub fn into_http(self) -> Result<http::Request<Body>> {
        let uri: http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e| Error::invalid_request(format!("invalid URI {}: {}", self.url, e)))?;
        let mut request = http::Request::builder()
            .method(self.method)
            .uri(uri)
            .body(self.body.into_hyper())?;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

/// Materialize a wire-level request from a request description
pub async fn build_request(config: &RequestConfig) -> Result<Request> {
    let method = if config.method.is_empty() {
        Method::GET
    } else {
        Method::from_str(&config.method.to_ascii_uppercase())?
    };
    let url = Url::parse(&config.url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::config(format!("unsupported URL scheme '{}'", url.scheme())));
    }

    let mut request = Request::new(method, url);
    for line in &config.headers {
        let (name, value) = parse_header_line(line)?;
        request.headers.append(name, value);
    }

    if !request.headers.contains_key(USER_AGENT) {
        let agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        request.headers.insert(USER_AGENT, HeaderValue::from_str(agent)?);
    }
    if let Some(encodings) = config.accept_encoding() {
        if !request.headers.contains_key(ACCEPT_ENCODING) {
            request.headers.insert(ACCEPT_ENCODING, HeaderValue::from_str(&encodings)?);
        }
    }

    match &config.body {
        Some(BodySource::Text(text)) => request.set_body(text.clone()),
        Some(BodySource::File(path)) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| Error::invalid_request(format!("Failed to open {}: {}", path.display(), e)))?;
            let len = file.metadata().await?.len();
            request.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            request.set_body(RequestBody::Reader(Box::pin(file)));
        }
        None if !config.multipart.is_empty() => {
            let form = MultipartBuilder::from_fields(&config.multipart)?.encode().await?;
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_str(&form.content_type())?);
            request.set_body(form.into_body());
        }
        None => {}
    }

    Ok(request)
}

fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::invalid_request(format!("header '{}' is missing ':'", line)))?;
    let name = HeaderName::from_str(name.trim())?;
    let value = HeaderValue::from_str(value.trim())?;
    Ok((name, value))
}
