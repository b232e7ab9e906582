//! Whole-request execution.
//!
//! [`Engine::execute`] runs one request description end to end: build the
//! client and the request, apply middleware, send with retries, decode and read
//! the body under the size ceiling. Every failure is wrapped with the step that
//! failed and the sanitized URL.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::client::build_client;
use crate::config::RequestConfig;
use crate::context::Context;
use crate::cookies::CookieStore;
use crate::decompress::decompress;
use crate::diagnostics::{sanitize_url, DiagnosticSink, Diagnostics, StderrSink};
use crate::error::{Error, Result};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::request::build_request;
use crate::response::{read_body, Response};
use crate::retry::execute_with_retries;

/// Executes request descriptions
///
/// Holds only collaborators (middleware, cookie store, diagnostic sink); a
/// fresh client is built per execution from its description, so one engine can
/// run any number of executions concurrently.
#[derive(Clone)]
pub struct Engine {
    middleware: MiddlewareChain,
    cookie_store: Option<Arc<dyn CookieStore>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl Engine {
    /// Engine with no middleware, no cookie store, diagnostics to stderr
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Execute `config` under `ctx`
    pub async fn execute(&self, ctx: &Context, config: &RequestConfig) -> Result<Execution> {
        let target = sanitize_url(&config.url);
        let started = Instant::now();
        let diagnostics = Diagnostics::new(self.sink.clone(), config.verbose);

        let client = build_client(ctx, config, &diagnostics, self.cookie_store.clone())
            .map_err(|e| e.context("building client for", target.clone()))?;
        let request = build_request(config)
            .await
            .map_err(|e| e.context("building request for", target.clone()))?;
        let request = self
            .middleware
            .process_request(request)
            .await
            .map_err(|e| e.context("preparing request for", target.clone()))?;

        // One budget covers the retried exchange and the body read.
        let deadline = client.request_timeout().map(|total| (Instant::now() + total, total));
        let mut response = execute_with_retries(&client, ctx, request, &config.retry)
            .await
            .map_err(|e| e.context("requesting", target.clone()))?;
        decompress(&mut response).map_err(|e| e.context("decoding", target.clone()))?;

        let limit = config.max_response_size;
        let read = read_within(read_body(&mut response, limit), deadline);
        let body = match ctx.run(read).await {
            Ok(result) => result,
            Err(reason) => Err(Error::Cancelled(reason)),
        }
        .map_err(|e| e.context("reading response from", target.clone()))?;

        let elapsed = started.elapsed();
        tracing::debug!(
            status = %response.status(),
            attempts = response.attempts(),
            bytes = body.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "request complete"
        );
        diagnostics.trace(format!(
            "* Received {} bytes in {:?} after {} attempt(s)",
            body.len(),
            elapsed,
            response.attempts()
        ));

        Ok(Execution {
            response,
            body,
            elapsed,
        })
    }
}

/// Run `read` until the request deadline, if any, reporting the full budget on expiry
async fn read_within<F>(read: F, deadline: Option<(Instant, Duration)>) -> Result<Bytes>
where
    F: std::future::Future<Output = Result<Bytes>>,
{
    match deadline {
        Some((at, total)) => {
            if Instant::now() >= at {
                return Err(Error::timeout(total));
            }
            tokio::time::timeout_at(at.into(), read)
                .await
                .unwrap_or_else(|_| Err(Error::timeout(total)))
        }
        None => read.await,
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    middleware: MiddlewareChain,
    cookie_store: Option<Arc<dyn CookieStore>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            middleware: MiddlewareChain::new(),
            cookie_store: None,
            sink: Arc::new(StderrSink),
        }
    }

    /// Append a request hook
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware = self.middleware.add(middleware);
        self
    }

    /// Replace the whole hook chain
    pub fn middleware_chain(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self
    }

    /// Attach a cookie store to every client the engine builds
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Where verbose traces and security warnings go
    pub fn diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            middleware: self.middleware,
            cookie_store: self.cookie_store,
            sink: self.sink,
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a successful execution
#[derive(Debug)]
pub struct Execution {
    response: Response,
    body: Bytes,
    elapsed: Duration,
}

impl Execution {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn version(&self) -> Version {
        self.response.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// URL of the final hop
    pub fn url(&self) -> &Url {
        self.response.url()
    }

    /// Fully read (and decoded) body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text, lossy on invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Attempts the retry executor made
    pub fn attempts(&self) -> u32 {
        self.response.attempts()
    }

    /// Wall time from client construction to the last body byte
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The response; its body can be read once more
    pub fn into_response(self) -> Response {
        self.response
    }

    /// Write the body to `writer`
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Persist the body to `path`, replacing any existing file
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        self.write_to(&mut file).await?;
        file.sync_all().await?;
        Ok(())
    }
}
