use std::fmt;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use hyper::body::HttpBody;
use hyper::Body;
use serde::de::DeserializeOwned;
use url::Url;

use crate::decompress::DecodedBody;
use crate::error::{Error, Result};
use crate::pool::{buffer_pool, READ_BUFFER_CAPACITY};

/// Largest allocation made up front from a `Content-Length` hint
const MAX_PREALLOCATION: usize = 8 * 1024 * 1024;

/// Response body states
pub enum ResponseBody {
    /// No body, or the body was discarded
    Empty,
    /// Body as received from the connection
    Raw(Body),
    /// Body decoded through a pooled decoder
    Decoded(DecodedBody),
    /// Captured body; yields its bytes once
    Buffered(Option<Bytes>),
}

impl ResponseBody {
    /// Next chunk of the body, `None` at the end
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            ResponseBody::Empty => Ok(None),
            ResponseBody::Raw(body) => loop {
                match body.data().await {
                    None => return Ok(None),
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => return Ok(Some(chunk)),
                    Some(Err(err)) => return Err(Error::from_hyper(err)),
                }
            },
            ResponseBody::Decoded(body) => body.chunk().await,
            ResponseBody::Buffered(bytes) => Ok(bytes.take()),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Raw(_) => f.write_str("Raw"),
            ResponseBody::Decoded(body) => body.fmt(f),
            ResponseBody::Buffered(Some(bytes)) => write!(f, "Buffered({} bytes)", bytes.len()),
            ResponseBody::Buffered(None) => f.write_str("Buffered(consumed)"),
        }
    }
}

/// HTTP response representation
///
/// This type represents an HTTP response received from a server.
/// It provides methods for accessing response properties and reading the body.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: ResponseBody,
    uncompressed: bool,
    attempts: u32,
}

impl Response {
    /// Create a response from the transport's response for `url`
    pub fn from_http(response: http::Response<Body>, url: Url) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            url,
            body: ResponseBody::Raw(body),
            uncompressed: false,
            attempts: 1,
        }
    }

    /// Create a response from its parts
    pub fn from_parts(status: StatusCode, headers: HeaderMap, url: Url, body: ResponseBody) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            url,
            body,
            uncompressed: false,
            attempts: 1,
        }
    }

    /// Get the HTTP status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get a specific header value
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Get the content type
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Get the content length
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Get the URL that produced this response
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Check if the response is successful (2xx status code)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response indicates a redirect
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    /// Check if the body was decoded by the engine; sizes must then be taken
    /// from the decoded stream
    pub fn is_uncompressed(&self) -> bool {
        self.uncompressed
    }

    pub(crate) fn set_uncompressed(&mut self, uncompressed: bool) {
        self.uncompressed = uncompressed;
    }

    /// Number of attempts made to obtain this response
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    /// Get the body
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Take the body, leaving [`ResponseBody::Empty`]
    pub fn take_body(&mut self) -> ResponseBody {
        std::mem::replace(&mut self.body, ResponseBody::Empty)
    }

    /// Replace the body
    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// Next chunk of the body
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Read the whole body
    pub async fn bytes(mut self) -> Result<Bytes> {
        read_body(&mut self, None).await
    }

    /// Read the body as text
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read the body as JSON
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Read the response body, enforcing an optional size ceiling.
///
/// At most `limit + 1` bytes are ever held; crossing the limit discards the
/// body and fails with [`Error::SizeExceeded`]. On success the body is replaced
/// with an in-memory copy so the response can be consumed once more.
pub async fn read_body(response: &mut Response, limit: Option<u64>) -> Result<Bytes> {
    let hint = response.content_length().map(|len| len.min(usize::MAX as u64) as usize);
    let ceiling = limit.map(|limit| limit.saturating_add(1).min(usize::MAX as u64) as usize);

    let result = match hint {
        // Large declared bodies get one exact allocation; everything else
        // goes through a pooled buffer.
        Some(len) if len > READ_BUFFER_CAPACITY => {
            let capacity = ceiling.map_or(len, |c| c.min(len)).min(MAX_PREALLOCATION);
            let mut buf = Vec::with_capacity(capacity);
            fill(&mut response.body, &mut buf, limit).await.map(|_| Bytes::from(buf))
        }
        _ => {
            let mut buf = buffer_pool().checkout();
            fill(&mut response.body, &mut buf.0, limit)
                .await
                .map(|_| Bytes::copy_from_slice(&buf.0))
        }
    };

    match result {
        Ok(bytes) => {
            response.body = ResponseBody::Buffered(Some(bytes.clone()));
            Ok(bytes)
        }
        Err(err) => {
            response.body = ResponseBody::Empty;
            Err(err)
        }
    }
}

async fn fill(body: &mut ResponseBody, buf: &mut Vec<u8>, limit: Option<u64>) -> Result<()> {
    while let Some(chunk) = body.chunk().await? {
        match limit {
            None => buf.extend_from_slice(&chunk),
            Some(limit) => {
                let allowance = limit.saturating_add(1).saturating_sub(buf.len() as u64);
                let take = (chunk.len() as u64).min(allowance) as usize;
                buf.extend_from_slice(&chunk[..take]);
                if buf.len() as u64 > limit {
                    return Err(Error::SizeExceeded {
                        limit,
                        read: buf.len() as u64,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: Body) -> Response {
        Response::from_parts(
            StatusCode::OK,
            HeaderMap::new(),
            Url::parse("http://example.com/").unwrap(),
            ResponseBody::Raw(body),
        )
    }

    #[tokio::test]
    async fn test_read_without_limit() {
        let mut resp = response(Body::from("hello"));
        assert_eq!(read_body(&mut resp, None).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_exact_limit_succeeds() {
        let mut resp = response(Body::from(vec![b'a'; 100]));
        let body = read_body(&mut resp, Some(100)).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn test_limit_plus_one_fails() {
        let mut resp = response(Body::from(vec![b'a'; 101]));
        let err = read_body(&mut resp, Some(100)).await.unwrap_err();
        match err {
            Error::SizeExceeded { limit, read } => {
                assert_eq!(limit, 100);
                assert_eq!(read, 101);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(resp.body(), ResponseBody::Empty));
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_not_buffered_whole() {
        // A single 1 MiB chunk against a 10 byte limit reads only 11 bytes.
        let mut resp = response(Body::from(vec![0u8; 1024 * 1024]));
        let err = read_body(&mut resp, Some(10)).await.unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { read: 11, .. }));
    }

    #[tokio::test]
    async fn test_largest_limit_reads_whole_body() {
        let mut resp = response(Body::from("hello"));
        assert_eq!(read_body(&mut resp, Some(u64::MAX)).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_body_readable_again_after_read() {
        let mut resp = response(Body::from("again"));
        read_body(&mut resp, Some(1024)).await.unwrap();
        assert_eq!(resp.chunk().await.unwrap().unwrap(), "again");
        assert!(resp.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_streamed_chunks_and_length_hint() {
        let (mut sender, body) = Body::channel();
        let mut resp = response(body);
        resp.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(200_000u64));
        tokio::spawn(async move {
            for _ in 0..4 {
                sender.send_data(Bytes::from(vec![7u8; 50_000])).await.unwrap();
            }
        });
        let body = read_body(&mut resp, None).await.unwrap();
        assert_eq!(body.len(), 200_000);
    }

    #[tokio::test]
    async fn test_json() {
        let resp = response(Body::from(r#"{"ok": true}"#));
        let value: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(value["ok"], true);
    }
}
