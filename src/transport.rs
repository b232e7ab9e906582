use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http::header::PROXY_AUTHORIZATION;
use http::{HeaderValue, Uri};
use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::tunnel::{DialError, MaybeTlsStream, ProxyDialer};

/// Transport trait for HTTP operations
///
/// This trait abstracts the layer that moves one request over the wire and
/// returns the response head with an unread body. Redirects, cookies and
/// retries live above it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the response
    async fn send(&self, request: http::Request<Body>) -> Result<http::Response<Body>>;

    /// Get the transport name/type
    fn name(&self) -> &str;
}

/// Connection handed to hyper by [`ProxyConnector`]
#[derive(Debug)]
pub struct Conn {
    inner: MaybeTlsStream,
    via_http_proxy: bool,
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        // Marking the connection as proxied makes hyper keep absolute-form URIs.
        let connected = Connected::new().proxy(self.via_http_proxy);
        if self.inner.negotiated_h2() {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// hyper connector that opens every connection through a [`ProxyDialer`]
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    dialer: Arc<ProxyDialer>,
}

impl ProxyConnector {
    /// Create a new connector
    pub fn new(dialer: Arc<ProxyDialer>) -> Self {
        Self { dialer }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = Conn;
    type Error = Box<dyn StdError + Send + Sync>;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Conn, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        Box::pin(async move {
            match dialer.dial(&uri).await {
                Ok(dialed) => Ok(Conn {
                    inner: dialed.stream,
                    via_http_proxy: dialed.via_http_proxy,
                }),
                Err(err) => Err(Box::new(DialError::from(err)) as Self::Error),
            }
        })
    }
}

/// Default transport: a pooled hyper client over a [`ProxyConnector`]
pub struct HttpTransport {
    client: hyper::Client<ProxyConnector, Body>,
    dialer: Arc<ProxyDialer>,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(dialer: Arc<ProxyDialer>, pool_idle_timeout: Option<Duration>) -> Self {
        let client = hyper::Client::builder()
            .pool_idle_timeout(pool_idle_timeout)
            .build(ProxyConnector::new(Arc::clone(&dialer)));
        Self { client, dialer }
    }

    /// Get the dial strategy
    pub fn dialer(&self) -> &ProxyDialer {
        &self.dialer
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, mut request: http::Request<Body>) -> Result<http::Response<Body>> {
        // Plain requests through an HTTP proxy carry their own credentials;
        // tunnelled ones authenticated on CONNECT.
        if self.dialer.uses_http_proxy_for(request.uri()) && !request.headers().contains_key(PROXY_AUTHORIZATION) {
            if let Some(auth) = self.dialer.http_proxy_auth() {
                let value = HeaderValue::from_str(&auth.basic_header())?;
                request.headers_mut().insert(PROXY_AUTHORIZATION, value);
            }
        }
        self.client.request(request).await.map_err(Error::from_hyper)
    }

    fn name(&self) -> &str {
        if self.dialer.is_proxied() {
            "HTTP (proxied)"
        } else {
            "HTTP"
        }
    }
}
