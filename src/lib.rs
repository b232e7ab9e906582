//! tpx-runtime - request execution engine for curl-style HTTP clients
//!
//! Takes a validated request description and turns it into one response:
//! proxy tunnelling (HTTP CONNECT, SOCKS5), TLS with certificate pinning,
//! idempotent retries, pooled decompression and a bounded body read, all
//! under a cancellation [`Context`] whose deadline always beats the
//! client's own fallback timeout.
//!
//! ## Features
//!
//! - **Context-priority timeouts**: a caller deadline disables the fallback timer
//! - **HTTP/1.1 and HTTP/2** over hyper, every connection dialed through the proxy layer
//! - **Proxy support** for `http://`, `socks5://` and `socks5h://`, with no-proxy bypass lists
//! - **TLS pinning** by SHA-256 leaf fingerprint, custom CAs and client certificates
//! - **Safe retries** replaying the same body bytes, with exponential backoff
//! - **Pooled gzip, deflate and brotli decoders**
//! - **Response size ceiling** that never buffers more than one byte past the limit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tpx_runtime::{Context, Engine, RequestConfig, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> tpx_runtime::Result<()> {
//!     let ctx = Context::background().with_timeout(Duration::from_secs(5));
//!     let config = RequestConfig::get("https://httpbin.org/json")
//!         .compressed(true)
//!         .retry(RetryPolicy::new().max_retries(2))
//!         .max_response_size(1024 * 1024);
//!
//!     let execution = Engine::new().execute(&ctx, &config).await?;
//!     println!("Status: {}", execution.status());
//!     println!("Body: {}", execution.text());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod cookies;
pub mod decompress;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod multipart;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod retry;
pub mod timeout;
pub mod tls;
pub mod transport;
pub mod tunnel;

// Re-export main types for convenience
pub use client::{build_client, Client, ClientBuilder, RedirectPolicy};
pub use config::{BodySource, RequestConfig};
pub use context::{CancelReason, Context};
pub use cookies::{CookieJar, CookieStore};
pub use decompress::decompress;
pub use diagnostics::{DiagnosticSink, Diagnostics};
pub use engine::{Engine, EngineBuilder, Execution};
pub use error::{Error, ErrorKind, Result};
pub use middleware::{Middleware, MiddlewareChain};
pub use proxy::{should_bypass, ProxyKind, ProxyTarget};
pub use request::{build_request, Request, RequestBody};
pub use response::{read_body, Response, ResponseBody};
pub use retry::{execute_with_retries, RetryPolicy};
pub use timeout::TimeoutConfig;
pub use tls::{TlsConfig, TlsContext};

// Re-export common HTTP types
pub use http::{HeaderMap, HeaderValue, Method, StatusCode};

// Re-export URL types
pub use url::Url;
