use thiserror::Error;

use crate::context::CancelReason;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for request execution
#[derive(Error, Debug)]
pub enum Error {
    /// Errors surfaced by the HTTP engine after a connection was established
    #[error("Network error: {0}")]
    Network(#[from] hyper::Error),

    /// TCP dial failures (refused, reset, unreachable)
    #[error("Connection error: {0}")]
    Connect(String),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client-level fallback timeout
    #[error("Request timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// The execution context was canceled or its deadline passed
    #[error("Request aborted: {0}")]
    Cancelled(#[from] CancelReason),

    /// SSL/TLS errors, including certificate pin mismatches
    #[error("SSL/TLS error: {0}")]
    Tls(String),

    /// Proxy handshake errors (CONNECT rejected, SOCKS5 failure)
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Invalid options detected before any network attempt
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content-Encoding decoding errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Response body larger than the configured ceiling
    #[error("Response body exceeds the limit of {limit} bytes (read {read} bytes before aborting)")]
    SizeExceeded { limit: u64, read: u64 },

    /// Redirect hop limit exceeded
    #[error("Stopped after {max} redirects")]
    TooManyRedirects { max: usize },

    /// A request hook refused the request
    #[error("Middleware '{name}' failed: {message}")]
    Middleware { name: String, message: String },

    /// Multipart form data errors
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// Cookie errors
    #[error("Cookie error: {0}")]
    Cookie(String),

    /// Invalid request configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Local I/O errors (reading bodies from disk, writing output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error annotated with the failing operation and a sanitized target
    #[error("{operation} {target}: {source}")]
    Context {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<Error>,
    },
}

/// Failure families surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Tls,
    Cancellation,
    SizeExceeded,
    Decompression,
    Network,
    Timeout,
    Proxy,
    Redirect,
    Middleware,
    InvalidRequest,
    Io,
}

impl Error {
    /// Create a new timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Error::Timeout { duration }
    }

    /// Create a new TLS error
    pub fn tls(message: impl Into<String>) -> Self {
        Error::Tls(message.into())
    }

    /// Create a new proxy error
    pub fn proxy(message: impl Into<String>) -> Self {
        Error::Proxy(message.into())
    }

    /// Create a new connection error
    pub fn connect(message: impl Into<String>) -> Self {
        Error::Connect(message.into())
    }

    /// Create a new decompression error
    pub fn decompression(message: impl Into<String>) -> Self {
        Error::Decompression(message.into())
    }

    /// Create a new multipart error
    pub fn multipart(message: impl Into<String>) -> Self {
        Error::Multipart(message.into())
    }

    /// Create a new cookie error
    pub fn cookie(message: impl Into<String>) -> Self {
        Error::Cookie(message.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a new middleware error
    pub fn middleware(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Middleware {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with the operation that failed and an already sanitized target
    pub fn context(self, operation: &'static str, target: impl Into<String>) -> Self {
        Error::Context {
            operation,
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::Network(_) | Error::Connect(_) => ErrorKind::Network,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancellation,
            Error::Tls(_) => ErrorKind::Tls,
            Error::Proxy(_) => ErrorKind::Proxy,
            Error::Config(_) | Error::Url(_) => ErrorKind::Configuration,
            Error::Decompression(_) => ErrorKind::Decompression,
            Error::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Error::TooManyRedirects { .. } => ErrorKind::Redirect,
            Error::Middleware { .. } => ErrorKind::Middleware,
            Error::Http(_)
            | Error::Json(_)
            | Error::Multipart(_)
            | Error::Cookie(_)
            | Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { .. } => unreachable!("root() never returns a context wrapper"),
        }
    }

    /// Check if this is a cancellation error
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Error::Cancelled(_))
    }

    /// The cancellation reason, if this error was caused by the context
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self.root() {
            Error::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Check if this is a client-level timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }

    /// Check if this is a TLS error
    pub fn is_tls(&self) -> bool {
        matches!(self.root(), Error::Tls(_))
    }

    /// Check if this is a configuration error
    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Check if the response body exceeded the size ceiling
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self.root(), Error::SizeExceeded { .. })
    }

    /// Whether another attempt may succeed. Only transport hiccups qualify.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Connect(_) | Error::Timeout { .. } => true,
            Error::Network(e) => !e.is_user() && !e.is_parse(),
            _ => false,
        }
    }

    /// Recover a typed error from the hyper error chain.
    ///
    /// Connector failures are boxed by hyper; the dial error inside keeps its
    /// kind so TLS and proxy failures are not flattened into network errors.
    pub fn from_hyper(err: hyper::Error) -> Self {
        let mut source = std::error::Error::source(&err);
        while let Some(inner) = source {
            if let Some(dial) = inner.downcast_ref::<crate::tunnel::DialError>() {
                return dial.to_error();
            }
            source = inner.source();
        }
        Error::Network(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout {
            duration: std::time::Duration::from_secs(0), // We don't have the original duration
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Error::InvalidRequest(format!("Invalid header name: {}", err))
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Error::InvalidRequest(format!("Invalid header value: {}", err))
    }
}

impl From<http::method::InvalidMethod> for Error {
    fn from(err: http::method::InvalidMethod) -> Self {
        Error::InvalidRequest(format!("Invalid method: {}", err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}
