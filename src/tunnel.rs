//! Connection strategies: direct, HTTP CONNECT tunnel, SOCKS5.
//!
//! A [`ProxyDialer`] is chosen once from the [`ProxyTarget`] and holds only
//! construction parameters, so one dialer serves any number of concurrent
//! connections. Each dial consults the no-proxy list before touching the
//! proxy, and secure targets get a TLS handshake over whatever stream the
//! strategy produced.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};
use crate::proxy::{ProxyAuth, ProxyKind, ProxyTarget};
use crate::tls::TlsContext;

/// Longest CONNECT response head accepted from a proxy
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_NONE: u8 = 0x00;
const SOCKS_AUTH_PASSWORD: u8 = 0x02;
const SOCKS_AUTH_UNACCEPTABLE: u8 = 0xff;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_V4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_V6: u8 = 0x04;

/// Connector failure carried through hyper's boxed error.
///
/// Keeps the failure family so [`Error::from_hyper`] can rebuild a typed
/// error on the other side.
#[derive(Debug)]
pub(crate) struct DialError {
    kind: DialErrorKind,
    message: String,
}

#[derive(Debug, Clone, Copy)]
enum DialErrorKind {
    Connect,
    Timeout(Duration),
    Tls,
    Proxy,
    Config,
}

impl DialError {
    pub(crate) fn to_error(&self) -> Error {
        match self.kind {
            DialErrorKind::Connect => Error::connect(self.message.clone()),
            DialErrorKind::Timeout(duration) => Error::timeout(duration),
            DialErrorKind::Tls => Error::tls(self.message.clone()),
            DialErrorKind::Proxy => Error::proxy(self.message.clone()),
            DialErrorKind::Config => Error::config(self.message.clone()),
        }
    }
}

impl From<Error> for DialError {
    fn from(err: Error) -> Self {
        let kind = match err.root() {
            Error::Timeout { duration } => DialErrorKind::Timeout(*duration),
            Error::Tls(_) => DialErrorKind::Tls,
            Error::Proxy(_) => DialErrorKind::Proxy,
            Error::Config(_) => DialErrorKind::Config,
            _ => DialErrorKind::Connect,
        };
        let message = match err.root() {
            Error::Connect(m) | Error::Tls(m) | Error::Proxy(m) | Error::Config(m) => m.clone(),
            other => other.to_string(),
        };
        DialError { kind, message }
    }
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DialErrorKind::Timeout(d) => write!(f, "connect timed out after {:?}", d),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DialError {}

/// A dialed connection, plain or TLS
pub enum MaybeTlsStream {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP (possibly over a proxy tunnel)
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    /// Check if the stream is encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    /// Check if ALPN selected HTTP/2
    pub fn negotiated_h2(&self) -> bool {
        match self {
            MaybeTlsStream::Tls(tls) => tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice()),
            MaybeTlsStream::Plain(_) => false,
        }
    }
}

impl fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of one dial
#[derive(Debug)]
pub struct Dialed {
    /// The connected stream
    pub stream: MaybeTlsStream,
    /// Plain HTTP through an HTTP proxy; requests must use absolute-form
    pub via_http_proxy: bool,
}

#[derive(Debug, Clone)]
enum Strategy {
    Direct,
    HttpProxy {
        address: String,
        auth: Option<ProxyAuth>,
        no_proxy: Vec<String>,
    },
    Socks5 {
        address: String,
        auth: Option<ProxyAuth>,
        remote_dns: bool,
        no_proxy: Vec<String>,
    },
}

/// Connection strategy built from a [`ProxyTarget`]
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    strategy: Strategy,
    tls: TlsContext,
    connect_timeout: Option<Duration>,
}

impl ProxyDialer {
    /// Build the strategy for `proxy`.
    ///
    /// Fails before any network activity when the proxy is unusable: SOCKS5
    /// without an address or with credentials longer than 255 bytes.
    pub fn new(proxy: &ProxyTarget, tls: TlsContext, connect_timeout: Option<Duration>) -> Result<Self> {
        let connect_timeout = proxy.get_timeout().or(connect_timeout);
        let strategy = match proxy.kind() {
            ProxyKind::None => Strategy::Direct,
            ProxyKind::Http => Strategy::HttpProxy {
                address: proxy.address().to_string(),
                auth: proxy.get_auth().cloned(),
                no_proxy: proxy.get_no_proxy().to_vec(),
            },
            ProxyKind::Socks5 { remote_dns } => {
                if proxy.address().is_empty() {
                    return Err(Error::config("SOCKS5 proxy address is empty"));
                }
                if let Some(auth) = proxy.get_auth() {
                    if auth.username().len() > 255 || auth.password().len() > 255 {
                        return Err(Error::config(
                            "SOCKS5 username and password must be at most 255 bytes",
                        ));
                    }
                }
                Strategy::Socks5 {
                    address: proxy.address().to_string(),
                    auth: proxy.get_auth().cloned(),
                    remote_dns,
                    no_proxy: proxy.get_no_proxy().to_vec(),
                }
            }
        };
        Ok(Self {
            strategy,
            tls,
            connect_timeout,
        })
    }

    /// Check if this dialer goes through a proxy at all
    pub fn is_proxied(&self) -> bool {
        !matches!(self.strategy, Strategy::Direct)
    }

    /// Credentials for plain requests sent through an HTTP proxy
    pub fn http_proxy_auth(&self) -> Option<&ProxyAuth> {
        match &self.strategy {
            Strategy::HttpProxy { auth, .. } => auth.as_ref(),
            _ => None,
        }
    }

    /// Check if a plain-HTTP request to `uri` goes through the HTTP proxy
    pub fn uses_http_proxy_for(&self, uri: &Uri) -> bool {
        match (&self.strategy, Target::from_uri(uri)) {
            (Strategy::HttpProxy { no_proxy, .. }, Ok(target)) => {
                !target.secure && !crate::proxy::should_bypass(&target.host_port(), no_proxy)
            }
            _ => false,
        }
    }

    /// Open a connection suitable for sending a request to `uri`
    pub async fn dial(&self, uri: &Uri) -> Result<Dialed> {
        let target = Target::from_uri(uri)?;
        let host_port = target.host_port();

        let (stream, via_http_proxy) = match &self.strategy {
            Strategy::HttpProxy {
                address,
                auth,
                no_proxy,
            } if !crate::proxy::should_bypass(&host_port, no_proxy) => {
                tracing::debug!(proxy = %address, target = %host_port, "dialing through HTTP proxy");
                let connect = async {
                    let mut tcp = TcpStream::connect(address.as_str())
                        .await
                        .map_err(|e| Error::connect(format!("proxy {}: {}", address, e)))?;
                    if target.secure {
                        connect_tunnel(&mut tcp, &host_port, auth.as_ref()).await?;
                    }
                    Ok::<_, Error>(tcp)
                };
                let tcp = crate::timeout::with_timeout(connect, self.connect_timeout).await?;
                (tcp, !target.secure)
            }
            Strategy::Socks5 {
                address,
                auth,
                remote_dns,
                no_proxy,
            } if !crate::proxy::should_bypass(&host_port, no_proxy) => {
                tracing::debug!(proxy = %address, target = %host_port, "dialing through SOCKS5 proxy");
                let address = address.clone();
                let auth = auth.clone();
                let (host, port, remote_dns) = (target.host.clone(), target.port, *remote_dns);
                let dial = async move {
                    let socks_target = if remote_dns {
                        SocksTarget::from_host(&host, port)
                    } else {
                        SocksTarget::resolve(&host, port).await?
                    };
                    let mut tcp = TcpStream::connect(address.as_str())
                        .await
                        .map_err(|e| Error::connect(format!("SOCKS5 proxy {}: {}", address, e)))?;
                    socks5_handshake(&mut tcp, &socks_target, auth.as_ref()).await?;
                    Ok::<_, Error>(tcp)
                };
                (race_dial(dial, self.connect_timeout).await?, false)
            }
            _ => {
                tracing::debug!(target = %host_port, "dialing directly");
                let connect = async {
                    TcpStream::connect((target.host.as_str(), target.port))
                        .await
                        .map_err(|e| Error::connect(format!("{}: {}", host_port, e)))
                };
                (crate::timeout::with_timeout(connect, self.connect_timeout).await?, false)
            }
        };
        let _ = stream.set_nodelay(true);

        let stream = if target.secure {
            MaybeTlsStream::Tls(Box::new(tls_handshake(&self.tls, &target.host, stream).await?))
        } else {
            MaybeTlsStream::Plain(stream)
        };
        Ok(Dialed {
            stream,
            via_http_proxy,
        })
    }
}

struct Target {
    host: String,
    port: u16,
    secure: bool,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(other) => {
                return Err(Error::config(format!("Unsupported URL scheme '{}'", other)))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::config(format!("URL has no host: {}", uri)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        Ok(Self { host, port, secure })
    }

    fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

async fn tls_handshake(tls: &TlsContext, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let name = tls.server_name(host)?;
    let stream = tls.connector().connect(name, tcp).await.map_err(|e| {
        let from_rustls = e
            .get_ref()
            .map(|inner| inner.is::<rustls::Error>())
            .unwrap_or(false);
        if from_rustls {
            Error::tls(format!("handshake with {} failed: {}", host, e))
        } else {
            Error::connect(format!("connection to {} lost during TLS handshake: {}", host, e))
        }
    })?;
    tracing::debug!(
        host,
        alpn = ?stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
        "TLS handshake complete"
    );
    Ok(stream)
}

/// Run `dial` on its own task and give up once `timeout` passes.
///
/// The task is aborted when the timer wins or the caller goes away, so a
/// proxy that never answers cannot pin a socket.
async fn race_dial<F>(dial: F, timeout: Option<Duration>) -> Result<TcpStream>
where
    F: Future<Output = Result<TcpStream>> + Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(dial));
    let joined = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                task.0.abort();
                return Err(Error::timeout(timeout));
            }
        },
        None => (&mut task.0).await,
    };
    joined.map_err(|e| Error::connect(format!("dial task failed: {}", e)))?
}

struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Ask an HTTP proxy to open a tunnel to `host_port`.
///
/// Reads the response head byte by byte so nothing after it is consumed.
pub async fn connect_tunnel<S>(stream: &mut S, host_port: &str, auth: Option<&ProxyAuth>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", host_port);
    if let Some(auth) = auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth.basic_header()));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::proxy(format!("failed to send CONNECT: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::proxy(format!("failed to send CONNECT: {}", e)))?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(Error::proxy("CONNECT response head too large"));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::proxy(format!("failed to read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(Error::proxy("proxy closed the connection during CONNECT"));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status = parts.next().and_then(|s| s.parse::<u16>().ok());
    match status {
        Some(code) if version.starts_with("HTTP/") && (200..300).contains(&code) => {
            tracing::debug!(target = host_port, status = code, "CONNECT tunnel established");
            Ok(())
        }
        Some(407) => Err(Error::proxy(format!(
            "proxy authentication required for CONNECT {}",
            host_port
        ))),
        Some(code) => Err(Error::proxy(format!(
            "CONNECT {} rejected with status {}",
            host_port, code
        ))),
        None => Err(Error::proxy(format!(
            "malformed CONNECT response: {}",
            status_line.trim()
        ))),
    }
}

/// Destination as sent to a SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksTarget {
    /// Literal address, resolved locally
    Ip(IpAddr, u16),
    /// Host name resolved by the proxy
    Domain(String, u16),
}

impl SocksTarget {
    /// Target passed to the proxy as given (`socks5h`)
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => SocksTarget::Ip(ip, port),
            Err(_) => SocksTarget::Domain(host.to_string(), port),
        }
    }

    /// Target resolved on this machine (`socks5`)
    pub async fn resolve(host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocksTarget::Ip(ip, port));
        }
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::connect(format!("failed to resolve {}: {}", host, e)))?;
        addrs
            .next()
            .map(|addr| SocksTarget::Ip(addr.ip(), port))
            .ok_or_else(|| Error::connect(format!("no addresses for {}", host)))
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let port = match self {
            SocksTarget::Ip(IpAddr::V4(ip), port) => {
                out.push(SOCKS_ATYP_V4);
                out.extend_from_slice(&ip.octets());
                port
            }
            SocksTarget::Ip(IpAddr::V6(ip), port) => {
                out.push(SOCKS_ATYP_V6);
                out.extend_from_slice(&ip.octets());
                port
            }
            SocksTarget::Domain(host, port) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| Error::config("host name too long for SOCKS5"))?;
                out.push(SOCKS_ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(host.as_bytes());
                port
            }
        };
        out.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }
}

/// Negotiate a SOCKS5 CONNECT over an open stream to the proxy
pub async fn socks5_handshake<S>(stream: &mut S, target: &SocksTarget, auth: Option<&ProxyAuth>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_err = |stage: &'static str| move |e: io::Error| Error::proxy(format!("SOCKS5 {}: {}", stage, e));

    let greeting: &[u8] = match auth {
        Some(_) => &[SOCKS_VERSION, 2, SOCKS_AUTH_NONE, SOCKS_AUTH_PASSWORD],
        None => &[SOCKS_VERSION, 1, SOCKS_AUTH_NONE],
    };
    stream.write_all(greeting).await.map_err(io_err("greeting"))?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(io_err("greeting"))?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::proxy(format!(
            "proxy answered with SOCKS version {}",
            choice[0]
        )));
    }
    match (choice[1], auth) {
        (SOCKS_AUTH_NONE, _) => {}
        (SOCKS_AUTH_PASSWORD, Some(auth)) => {
            let user = auth.username().as_bytes();
            let pass = auth.password().as_bytes();
            let (Ok(ulen), Ok(plen)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
                return Err(Error::config("SOCKS5 username and password must be at most 255 bytes"));
            };
            let mut request = Vec::with_capacity(3 + user.len() + pass.len());
            request.push(0x01);
            request.push(ulen);
            request.extend_from_slice(user);
            request.push(plen);
            request.extend_from_slice(pass);
            stream.write_all(&request).await.map_err(io_err("authentication"))?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await.map_err(io_err("authentication"))?;
            if status[1] != 0x00 {
                return Err(Error::proxy("SOCKS5 authentication failed"));
            }
        }
        (SOCKS_AUTH_UNACCEPTABLE, _) => {
            return Err(Error::proxy("SOCKS5 proxy accepted none of the offered authentication methods"))
        }
        (method, _) => {
            return Err(Error::proxy(format!(
                "SOCKS5 proxy selected unsupported method {:#04x}",
                method
            )))
        }
    }

    let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
    target.encode(&mut request)?;
    stream.write_all(&request).await.map_err(io_err("connect"))?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(io_err("connect"))?;
    if reply[1] != 0x00 {
        return Err(Error::proxy(format!(
            "SOCKS5 connect failed: {}",
            socks_reply_message(reply[1])
        )));
    }
    let bound_len = match reply[3] {
        SOCKS_ATYP_V4 => 4,
        SOCKS_ATYP_V6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err("connect"))?;
            len[0] as usize
        }
        other => {
            return Err(Error::proxy(format!(
                "SOCKS5 reply has unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await.map_err(io_err("connect"))?;
    tracing::debug!(target = ?target, "SOCKS5 tunnel established");
    Ok(())
}

fn socks_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::tls::TlsConfig;
    use tokio_test::io::Builder;

    fn tls() -> TlsContext {
        TlsConfig::builder()
            .insecure(true)
            .suppress_insecure_warning()
            .build()
            .build(&Diagnostics::disabled())
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_tunnel_success() {
        let mut mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\nVia: proxy\r\n\r\n")
            .build();
        connect_tunnel(&mut mock, "example.com:443", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel_sends_basic_auth() {
        let auth = ProxyAuth::new("user", "pass");
        let mut mock = Builder::new()
            .write(
                b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
            )
            .read(b"HTTP/1.0 200 OK\r\n\r\n")
            .build();
        connect_tunnel(&mut mock, "example.com:443", Some(&auth)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected() {
        let mut mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();
        let err = connect_tunnel(&mut mock, "example.com:443", None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Proxy);
        assert!(err.to_string().contains("authentication required"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_tunnel_eof() {
        let mut mock = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 200")
            .build();
        let err = connect_tunnel(&mut mock, "example.com:443", None).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_socks5_no_auth_domain() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&[
                0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c',
                b'o', b'm', 0x01, 0xbb,
            ])
            .read(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90])
            .build();
        let target = SocksTarget::from_host("example.com", 443);
        socks5_handshake(&mut mock, &target, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_password_auth() {
        let auth = ProxyAuth::new("u", "pw");
        let mut mock = Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 1, b'u', 2, b'p', b'w'])
            .read(&[0x01, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .read(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();
        let target = SocksTarget::from_host("127.0.0.1", 80);
        socks5_handshake(&mut mock, &target, Some(&auth)).await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_auth_rejected() {
        let auth = ProxyAuth::new("u", "bad");
        let mut mock = Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&[0x01, 1, b'u', 3, b'b', b'a', b'd'])
            .read(&[0x01, 0x01])
            .build();
        let target = SocksTarget::from_host("127.0.0.1", 80);
        let err = socks5_handshake(&mut mock, &target, Some(&auth)).await.unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_socks5_connect_refused() {
        let mut mock = Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 2, 0x00, 0x16])
            .read(&[0x05, 0x05, 0x00, 0x01])
            .build();
        let target = SocksTarget::from_host("10.0.0.2", 22);
        let err = socks5_handshake(&mut mock, &target, None).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_socks5_oversized_credentials_are_config_error() {
        let proxy = ProxyTarget::from_url("socks5://proxy.local").unwrap();
        assert!(ProxyDialer::new(&proxy, tls(), None).is_ok());

        let long = "x".repeat(300);
        let proxy = ProxyTarget::from_url("socks5://proxy.local")
            .unwrap()
            .auth(ProxyAuth::new(&long, "pw"));
        assert!(ProxyDialer::new(&proxy, tls(), None).unwrap_err().is_config());
    }

    #[test]
    fn test_dial_error_round_trip() {
        let dial = DialError::from(Error::tls("pin mismatch"));
        assert!(dial.to_error().is_tls());
        let dial = DialError::from(Error::timeout(Duration::from_secs(2)));
        assert!(dial.to_error().is_timeout());
        let dial = DialError::from(Error::proxy("CONNECT rejected").context("dial", "x"));
        assert_eq!(dial.to_error().kind(), crate::error::ErrorKind::Proxy);
    }

    #[tokio::test]
    async fn test_race_dial_times_out() {
        let never = async {
            std::future::pending::<()>().await;
            Err(Error::connect("unreachable"))
        };
        let err = race_dial(never, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_socks5_local_resolution_is_bounded_by_connect_timeout() {
        let proxy = ProxyTarget::from_url("socks5://127.0.0.1:9").unwrap();
        let dialer = ProxyDialer::new(&proxy, tls(), Some(Duration::from_millis(200))).unwrap();
        let started = std::time::Instant::now();
        let err = match dialer.dial(&"http://host.invalid/".parse().unwrap()).await {
            Ok(_) => panic!("dial to an unresolvable host succeeded"),
            Err(err) => err,
        };
        assert!(err.is_timeout() || err.kind() == crate::error::ErrorKind::Network);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_http_proxy_absolute_form_decision() {
        let proxy = ProxyTarget::from_url("http://proxy.local:3128")
            .unwrap()
            .no_proxy(vec!["internal".to_string()]);
        let dialer = ProxyDialer::new(&proxy, tls(), None).unwrap();
        assert!(dialer.uses_http_proxy_for(&"http://example.com/".parse().unwrap()));
        assert!(!dialer.uses_http_proxy_for(&"https://example.com/".parse().unwrap()));
        assert!(!dialer.uses_http_proxy_for(&"http://api.internal/".parse().unwrap()));
    }
}
