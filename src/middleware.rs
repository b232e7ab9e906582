use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderName, AUTHORIZATION};
use http::HeaderValue;

use crate::error::{Error, Result};
use crate::request::Request;

/// Middleware trait for processing requests before they are sent
///
/// Hooks run once per execution, after the request is built and before the
/// first attempt, so every retry sends what the chain produced. A hook may
/// rewrite headers or the body; returning an error aborts the execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process a request before it is sent
    async fn process_request(&self, request: Request) -> Result<Request>;

    /// Get the name of this middleware
    fn name(&self) -> &str {
        "Unknown"
    }
}

/// Middleware chain for processing multiple middleware
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create a new middleware chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Add shared middleware to the chain
    pub fn add_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Process a request through all middleware, in insertion order
    pub async fn process_request(&self, mut request: Request) -> Result<Request> {
        for middleware in &self.middlewares {
            tracing::trace!(middleware = middleware.name(), "applying middleware");
            request = middleware.process_request(request).await.map_err(|err| match err {
                Error::Middleware { .. } => err,
                other => Error::middleware(middleware.name(), other.to_string()),
            })?;
        }
        Ok(request)
    }

    /// Get the number of middleware in the chain
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if the chain is empty
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// Sets fixed headers, replacing any existing value
pub struct HeaderMiddleware {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderMiddleware {
    pub fn new() -> Self {
        Self { headers: Vec::new() }
    }

    /// Add a header to set
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.push((name, value));
        Ok(self)
    }
}

impl Default for HeaderMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for HeaderMiddleware {
    async fn process_request(&self, mut request: Request) -> Result<Request> {
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(request)
    }

    fn name(&self) -> &str {
        "Headers"
    }
}

/// Authentication middleware
pub struct AuthMiddleware {
    auth_header: HeaderValue,
}

impl AuthMiddleware {
    /// Create a new authentication middleware
    pub fn new(auth_header: &str) -> Result<Self> {
        let mut auth_header = auth_header.parse::<HeaderValue>()?;
        auth_header.set_sensitive(true);
        Ok(Self { auth_header })
    }

    /// Create middleware with bearer token
    pub fn bearer(token: &str) -> Result<Self> {
        Self::new(&format!("Bearer {}", token))
    }

    /// Create middleware with basic auth
    pub fn basic(username: &str, password: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let credentials = format!("{}:{}", username, password);
        let encoded = BASE64.encode(credentials.as_bytes());
        Self::new(&format!("Basic {}", encoded))
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn process_request(&self, mut request: Request) -> Result<Request> {
        request.headers_mut().insert(AUTHORIZATION, self.auth_header.clone());
        Ok(request)
    }

    fn name(&self) -> &str {
        "Authentication"
    }
}

/// Middleware from a closure
pub struct CustomMiddleware<F> {
    request_processor: F,
    name: String,
}

impl<F> CustomMiddleware<F>
where
    F: Fn(Request) -> Result<Request> + Send + Sync + 'static,
{
    /// Create a new custom middleware
    pub fn new(request_processor: F, name: &str) -> Self {
        Self {
            request_processor,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<F> Middleware for CustomMiddleware<F>
where
    F: Fn(Request) -> Result<Request> + Send + Sync + 'static,
{
    async fn process_request(&self, request: Request) -> Result<Request> {
        (self.request_processor)(request)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use url::Url;

    fn request() -> Request {
        Request::new(Method::GET, Url::parse("http://example.com").unwrap())
    }

    #[tokio::test]
    async fn test_middleware_chain() {
        let chain = MiddlewareChain::new()
            .add(HeaderMiddleware::new().header("X-Trace", "1").unwrap())
            .add(AuthMiddleware::bearer("token").unwrap());

        assert_eq!(chain.len(), 2);
        assert!(!chain.is_empty());

        let processed = chain.process_request(request()).await.unwrap();
        assert_eq!(processed.headers().get("x-trace").unwrap(), "1");
        assert_eq!(processed.headers().get(AUTHORIZATION).unwrap(), "Bearer token");
    }

    #[tokio::test]
    async fn test_basic_auth_middleware() {
        let middleware = AuthMiddleware::basic("user", "pass").unwrap();
        let processed = middleware.process_request(request()).await.unwrap();
        let value = processed.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(value, "Basic dXNlcjpwYXNz");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_may_rewrite_body() {
        let chain = MiddlewareChain::new()
            .add(CustomMiddleware::new(|req: Request| Ok(req.with_body("first")), "first"))
            .add(CustomMiddleware::new(
                |req: Request| {
                    let seen = req.body().as_bytes().cloned().unwrap_or_default();
                    assert_eq!(seen, "first");
                    Ok(req.with_body("second"))
                },
                "second",
            ));

        let processed = chain.process_request(request()).await.unwrap();
        assert_eq!(processed.body().as_bytes().unwrap(), "second");
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_chain() {
        let chain = MiddlewareChain::new()
            .add(CustomMiddleware::new(
                |_req: Request| Err(Error::invalid_request("signing key missing")),
                "Signer",
            ))
            .add(CustomMiddleware::new(|_req: Request| panic!("must not run"), "After"));

        let err = chain.process_request(request()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Middleware);
        assert!(err.to_string().contains("Signer"));
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let chain = MiddlewareChain::default();
        assert!(chain.is_empty());
        let processed = chain.process_request(request()).await.unwrap();
        assert!(processed.headers().is_empty());
    }
}
