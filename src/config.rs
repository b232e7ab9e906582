//! The request description consumed by the engine.
//!
//! Everything here is plain data: deserializable from JSON with every field
//! optional, and never mutated once an execution starts.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::multipart::MultipartField;
use crate::proxy::ProxyTarget;
use crate::retry::RetryPolicy;
use crate::timeout::{TimeoutConfig, DEFAULT_CONNECT_TIMEOUT};
use crate::tls::TlsConfig;

/// Hop limit applied when redirects are followed
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Encodings advertised when compression is requested
pub const DEFAULT_COMPRESSION_METHODS: &[&str] = &["gzip", "deflate", "br"];

/// Request body source
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySource {
    /// Inline text
    Text(String),
    /// File streamed from disk
    File(PathBuf),
}

/// Everything needed to execute one request
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// HTTP method, `GET` when empty
    pub method: String,
    pub url: String,
    /// Header lines in `Name: value` form
    pub headers: Vec<String>,
    pub body: Option<BodySource>,
    pub multipart: Vec<MultipartField>,
    /// Proxy URL (`http://`, `socks5://`, `socks5h://`)
    pub proxy: Option<String>,
    /// Hosts that bypass the proxy
    pub no_proxy: Vec<String>,
    /// Read the proxy from the environment when `proxy` is unset
    pub proxy_from_env: bool,
    pub tls: TlsConfig,
    /// Fallback request timeout; ignored when the context has a deadline
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
    /// Response body ceiling in bytes
    pub max_response_size: Option<u64>,
    /// Send `Accept-Encoding`
    pub compressed: bool,
    pub compression_methods: Vec<String>,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub verbose: bool,
    /// Offer HTTP/2 via ALPN on TLS connections
    pub http2: bool,
    pub user_agent: Option<String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: String::new(),
            url: String::new(),
            headers: Vec::new(),
            body: None,
            multipart: Vec::new(),
            proxy: None,
            no_proxy: Vec::new(),
            proxy_from_env: false,
            tls: TlsConfig::default(),
            timeout_ms: None,
            connect_timeout_ms: None,
            retry: RetryPolicy::default(),
            max_response_size: None,
            compressed: false,
            compression_methods: Vec::new(),
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            verbose: false,
            http2: false,
            user_agent: None,
        }
    }
}

impl RequestConfig {
    /// Create a GET description for `url`
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Parse a description from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the method
    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// Add a `Name: value` header line
    pub fn header(mut self, line: &str) -> Self {
        self.headers.push(line.to_string());
        self
    }

    /// Set an inline text body
    pub fn text_body(mut self, body: &str) -> Self {
        self.body = Some(BodySource::Text(body.to_string()));
        self
    }

    /// Set the proxy URL
    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    /// Set the fallback request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the response size ceiling
    pub fn max_response_size(mut self, limit: u64) -> Self {
        self.max_response_size = Some(limit);
        self
    }

    /// Request compressed responses
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Follow redirects
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Set the TLS options
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Timeouts described by this request
    pub fn timeouts(&self) -> TimeoutConfig {
        let mut timeouts = TimeoutConfig::default();
        if let Some(ms) = self.timeout_ms.filter(|ms| *ms > 0) {
            timeouts = timeouts.timeout(Duration::from_millis(ms));
        }
        let connect = self
            .connect_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        timeouts.connect_timeout(connect)
    }

    /// Proxy target for this request.
    ///
    /// An explicit proxy wins over the environment; `no_proxy` entries are
    /// appended to whatever the environment supplied.
    pub fn proxy_target(&self) -> Result<ProxyTarget> {
        let target = match self.proxy.as_deref() {
            Some(raw) => ProxyTarget::from_url(raw)?,
            None if self.proxy_from_env => {
                let scheme = self.url.split_once("://").map(|(s, _)| s).unwrap_or("http");
                ProxyTarget::from_env(scheme)?
            }
            None => ProxyTarget::none(),
        };
        if self.no_proxy.is_empty() {
            return Ok(target);
        }
        let mut patterns = target.get_no_proxy().to_vec();
        patterns.extend(self.no_proxy.iter().cloned());
        Ok(target.no_proxy(patterns))
    }

    /// `Accept-Encoding` value, if compression was requested
    pub fn accept_encoding(&self) -> Option<String> {
        if !self.compressed {
            return None;
        }
        if self.compression_methods.is_empty() {
            Some(DEFAULT_COMPRESSION_METHODS.join(", "))
        } else {
            Some(self.compression_methods.join(", "))
        }
    }

    /// Reject option combinations that can never work
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::config("request URL is empty"));
        }
        if self.body.is_some() && !self.multipart.is_empty() {
            return Err(Error::config("a request cannot have both a body and multipart fields"));
        }
        if self.follow_redirects && self.max_redirects == 0 {
            return Err(Error::config("max_redirects must be positive when following redirects"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = RequestConfig::from_json(r#"{"url": "http://example.com"}"#).unwrap();
        assert_eq!(config.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert!(!config.follow_redirects);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.timeouts().get_timeout(), None);
        assert_eq!(config.timeouts().get_connect_timeout(), Some(DEFAULT_CONNECT_TIMEOUT));
    }

    #[test]
    fn test_full_json() {
        let config = RequestConfig::from_json(
            r#"{
                "method": "POST",
                "url": "https://api.example.com/items",
                "headers": ["Content-Type: application/json"],
                "body": {"text": "{}"},
                "proxy": "socks5h://127.0.0.1:1080",
                "no_proxy": ["localhost"],
                "tls": {"pinned_fingerprints": ["aa"], "min_version": "1.3"},
                "timeout_ms": 5000,
                "retry": {"max_retries": 3, "retry_on_http": [503]},
                "max_response_size": 1024,
                "compressed": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.body, Some(BodySource::Text("{}".to_string())));
        assert_eq!(config.timeouts().get_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.accept_encoding().as_deref(), Some("gzip, deflate, br"));

        let proxy = config.proxy_target().unwrap();
        assert_eq!(proxy.kind(), ProxyKind::Socks5 { remote_dns: true });
        assert_eq!(proxy.get_no_proxy(), &["localhost".to_string()]);
    }

    #[test]
    fn test_validate() {
        assert!(RequestConfig::default().validate().unwrap_err().is_config());
        let mut both = RequestConfig::get("http://x/").text_body("a");
        both.multipart.push(MultipartField::text("f", "v"));
        assert!(both.validate().is_err());
        assert!(RequestConfig::get("http://x/").validate().is_ok());
    }

    #[test]
    fn test_custom_compression_methods() {
        let mut config = RequestConfig::get("http://x/").compressed(true);
        config.compression_methods = vec!["gzip".to_string()];
        assert_eq!(config.accept_encoding().as_deref(), Some("gzip"));
        assert_eq!(RequestConfig::get("http://x/").accept_encoding(), None);
    }
}
