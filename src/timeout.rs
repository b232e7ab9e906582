use std::future::Future;
use std::time::Duration;

use crate::context::Context;
use crate::error::{Error, Result};

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of an idle pooled connection
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Timeout settings for one client
///
/// `timeout` is only a fallback: when the execution [`Context`] carries a
/// deadline, that deadline is the single authority and the client-level
/// timeout is disabled. See [`TimeoutConfig::effective_request_timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Fallback per-attempt request timeout
    pub timeout: Option<Duration>,
    /// Connection establishment timeout (TCP dial and proxy handshake)
    pub connect_timeout: Option<Duration>,
    /// Pool idle timeout
    pub pool_idle_timeout: Option<Duration>,
}

impl TimeoutConfig {
    /// Create a new timeout configuration with a fallback request timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Set the fallback request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the pool idle timeout
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Get the fallback request timeout
    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Get the connection timeout
    pub fn get_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Get the pool idle timeout
    pub fn get_pool_idle_timeout(&self) -> Option<Duration> {
        self.pool_idle_timeout
    }

    /// Request timeout the client should apply under `ctx`.
    ///
    /// Returns `None` whenever the context has a deadline; the configured
    /// fallback only applies to contexts without one. A zero fallback means
    /// unbounded.
    pub fn effective_request_timeout(&self, ctx: &Context) -> Option<Duration> {
        if ctx.deadline().is_some() {
            return None;
        }
        self.timeout.filter(|t| !t.is_zero())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            pool_idle_timeout: Some(DEFAULT_POOL_IDLE_TIMEOUT),
        }
    }
}

/// Apply an optional timeout to a future, mapping expiry to [`Error::Timeout`]
pub async fn with_timeout<F, T>(future: F, duration: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(duration)),
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_config_default() {
        let config = TimeoutConfig::default();
        assert_eq!(config.get_timeout(), None);
        assert_eq!(config.get_connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.get_pool_idle_timeout(), Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_context_deadline_disables_fallback() {
        let config = TimeoutConfig::new(Duration::from_secs(10));
        let background = Context::background();
        assert_eq!(
            config.effective_request_timeout(&background),
            Some(Duration::from_secs(10))
        );

        let bounded = background.with_timeout(Duration::from_millis(500));
        assert_eq!(config.effective_request_timeout(&bounded), None);
    }

    #[tokio::test]
    async fn test_zero_fallback_is_unbounded() {
        let config = TimeoutConfig::new(Duration::ZERO);
        assert_eq!(config.effective_request_timeout(&Context::background()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let err = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());

        let ok = with_timeout(async { Ok(3) }, None).await.unwrap();
        assert_eq!(ok, 3);
    }
}
