use std::sync::Arc;
use std::time::Duration;

use http::header::{
    HeaderName, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, SET_COOKIE, TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use url::Url;

use crate::config::RequestConfig;
use crate::context::Context;
use crate::cookies::CookieStore;
use crate::diagnostics::{sanitize, Diagnostics};
use crate::error::{Error, Result};
use crate::proxy::ProxyTarget;
use crate::request::{Request, RequestBody};
use crate::response::Response;
use crate::timeout::{with_timeout, TimeoutConfig};
use crate::tls::TlsConfig;
use crate::transport::{HttpTransport, Transport};
use crate::tunnel::ProxyDialer;

/// What to do with 3xx responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Surface the first redirect response as-is
    #[default]
    None,
    /// Follow up to this many hops, then fail
    Limited(usize),
}

/// HTTP client
///
/// Immutable once built; one client can serve any number of concurrent
/// executions.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    request_timeout: Option<Duration>,
    redirect: RedirectPolicy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    diagnostics: Diagnostics,
}

impl Client {
    /// Create a new client builder
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Fallback timeout applied per attempt; `None` when the build context
    /// carried a deadline
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Get the redirect policy
    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect
    }

    /// Get the transport name
    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Send `request`, following redirects per policy.
    ///
    /// The context always wins: its cancellation or deadline aborts the
    /// attempt with [`Error::Cancelled`]. The fallback timeout only exists when
    /// the context had no deadline at build time.
    pub async fn execute(&self, ctx: &Context, request: Request) -> Result<Response> {
        let send = with_timeout(self.send_with_redirects(request), self.request_timeout);
        match ctx.run(send).await {
            Ok(result) => result,
            Err(reason) => Err(Error::Cancelled(reason)),
        }
    }

    async fn send_with_redirects(&self, mut request: Request) -> Result<Response> {
        let max = match self.redirect {
            RedirectPolicy::None => return self.send_once(request).await,
            RedirectPolicy::Limited(max) => max,
        };

        let mut hops = 0;
        loop {
            let replay = request.try_clone();
            let previous = request.url().clone();
            let response = self.send_once(request).await?;

            let Some(location) = redirect_location(&response) else {
                return Ok(response);
            };
            let Some(mut next) = replay else {
                tracing::debug!("not following redirect for a streaming body");
                return Ok(response);
            };
            if hops >= max {
                return Err(Error::TooManyRedirects { max });
            }
            hops += 1;

            let target = previous
                .join(location)
                .map_err(|e| Error::invalid_request(format!("invalid redirect location: {}", e)))?;
            if !matches!(target.scheme(), "http" | "https") {
                return Err(Error::invalid_request(format!(
                    "redirect to unsupported scheme '{}'",
                    target.scheme()
                )));
            }
            self.diagnostics.trace(format!("* Following redirect to {}", sanitize(&target)));
            prepare_redirect(&mut next, response.status(), &previous, target);
            request = next;
        }
    }

    async fn send_once(&self, mut request: Request) -> Result<Response> {
        if let Some(store) = &self.cookie_store {
            if !request.headers().contains_key(COOKIE) {
                if let Some(cookies) = store.cookies(request.url()) {
                    request.headers_mut().insert(COOKIE, cookies);
                }
            }
        }

        let url = request.url().clone();
        if self.diagnostics.is_verbose() {
            let target = match url.query() {
                Some(_) => sanitize(&url),
                None => url.path().to_string(),
            };
            self.diagnostics.trace(format!("> {} {}", request.method(), target));
            self.diagnostics.trace_headers(">", request.headers());
        }
        tracing::debug!(method = %request.method(), url = %sanitize(&url), "sending request");

        let response = self.transport.send(request.into_http()?).await?;
        let response = Response::from_http(response, url);

        if self.diagnostics.is_verbose() {
            self.diagnostics
                .trace(format!("< {:?} {}", response.version(), response.status()));
            self.diagnostics.trace_headers("<", response.headers());
        }
        if let Some(store) = &self.cookie_store {
            store.set_cookies(response.url(), &mut response.headers().get_all(SET_COOKIE).iter());
        }
        Ok(response)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport.name())
            .field("request_timeout", &self.request_timeout)
            .field("redirect", &self.redirect)
            .field("cookie_store", &self.cookie_store.is_some())
            .finish()
    }
}

fn redirect_location(response: &Response) -> Option<&str> {
    match response.status() {
        StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => response.headers().get(LOCATION)?.to_str().ok(),
        _ => None,
    }
}

/// Rewrite `request` for the hop to `target`
fn prepare_redirect(request: &mut Request, status: StatusCode, previous: &Url, target: Url) {
    let rewrite_to_get = matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    ) && request.method() != Method::HEAD;
    if rewrite_to_get {
        *request.method_mut() = Method::GET;
        request.set_body(RequestBody::Empty);
        for name in [CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING] {
            request.headers_mut().remove(name);
        }
    }

    let same_origin = previous.host_str() == target.host_str()
        && previous.port_or_known_default() == target.port_or_known_default();
    if !same_origin {
        let stripped: [HeaderName; 3] = [AUTHORIZATION, COOKIE, HOST];
        for name in stripped {
            request.headers_mut().remove(name);
        }
    }
    *request.url_mut() = target;
}

/// Builder for creating HTTP clients with custom configuration
///
/// # Examples
///
/// ```rust,no_run
/// use tpx_runtime::{Client, Context};
/// use std::time::Duration;
///
/// # fn main() -> tpx_runtime::Result<()> {
/// let client = Client::builder()
///     .timeout(Duration::from_secs(30))
///     .build(&Context::background())?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    timeouts: TimeoutConfig,
    proxy: ProxyTarget,
    tls: TlsConfig,
    redirect: RedirectPolicy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    diagnostics: Diagnostics,
    http2: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            proxy: ProxyTarget::none(),
            tls: TlsConfig::default(),
            redirect: RedirectPolicy::None,
            cookie_store: None,
            diagnostics: Diagnostics::disabled(),
            http2: false,
            transport: None,
        }
    }

    /// Set the fallback request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeouts = self.timeouts.timeout(timeout);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts = self.timeouts.connect_timeout(timeout);
        self
    }

    /// Replace all timeouts
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Route connections through `proxy`
    pub fn proxy(mut self, proxy: ProxyTarget) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the TLS options
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set the redirect policy
    pub fn redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = policy;
        self
    }

    /// Attach a cookie store
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Set the diagnostic sink
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Offer HTTP/2 through ALPN
    pub fn http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    /// Use a custom transport instead of dialing with the proxy and TLS options
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client for executions under `ctx`.
    ///
    /// When `ctx` carries a deadline the fallback timeout is dropped so the
    /// deadline is the only timer.
    pub fn build(self, ctx: &Context) -> Result<Client> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let tls = self.tls.build(&self.diagnostics)?;
                let tls = if self.http2 && cfg!(feature = "http2") {
                    tls.with_alpn(&[b"h2".as_slice(), b"http/1.1".as_slice()])
                } else {
                    tls
                };
                let dialer = ProxyDialer::new(&self.proxy, tls, self.timeouts.get_connect_timeout())?;
                if dialer.is_proxied() {
                    self.diagnostics.trace(format!(
                        "* Using {} proxy {}",
                        self.proxy.kind().scheme(),
                        self.proxy.address()
                    ));
                }
                Arc::new(HttpTransport::new(
                    Arc::new(dialer),
                    self.timeouts.get_pool_idle_timeout(),
                ))
            }
        };

        let request_timeout = self.timeouts.effective_request_timeout(ctx);
        if ctx.deadline().is_some() && self.timeouts.get_timeout().is_some() {
            tracing::debug!("context deadline present; fallback request timeout disabled");
        }

        Ok(Client {
            transport,
            request_timeout,
            redirect: self.redirect,
            cookie_store: self.cookie_store,
            diagnostics: self.diagnostics,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the client for one request description.
///
/// Configuration problems (bad proxy URL, unloadable certificates, invalid
/// TLS options) fail here, before any network activity.
pub fn build_client(
    ctx: &Context,
    config: &RequestConfig,
    diagnostics: &Diagnostics,
    cookie_store: Option<Arc<dyn CookieStore>>,
) -> Result<Client> {
    config.validate()?;
    let redirect = if config.follow_redirects {
        RedirectPolicy::Limited(config.max_redirects)
    } else {
        RedirectPolicy::None
    };
    let mut builder = ClientBuilder::new()
        .timeouts(config.timeouts())
        .proxy(config.proxy_target()?)
        .tls(config.tls.clone())
        .redirect(redirect)
        .http2(config.http2)
        .diagnostics(diagnostics.clone());
    if let Some(store) = cookie_store {
        builder = builder.cookie_store(store);
    }
    builder.build(ctx)
}
