//! Retry executor.
//!
//! Attempts are strictly sequential. The request body is captured once before
//! the first attempt and every resend replays those same bytes. The context is
//! checked before the first attempt, between attempts and during every
//! backoff wait, and a fired context is never retried.

use std::time::Duration;

use http::StatusCode;
use serde::Deserialize;

use crate::client::Client;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// Statuses retried when the policy names none
pub const DEFAULT_RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// First exponential backoff step
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Longest single backoff wait
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Fixed delay between attempts; zero selects exponential backoff
    pub delay_ms: u64,
    /// Statuses that trigger a retry; empty selects the defaults
    pub retry_on_http: Vec<u16>,
    /// First exponential backoff step
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            retry_on_http: Vec::new(),
            backoff_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Wait a fixed delay between attempts
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Retry on these statuses instead of the defaults
    pub fn retry_on(mut self, statuses: &[u16]) -> Self {
        self.retry_on_http = statuses.to_vec();
        self
    }

    /// Set the first exponential backoff step
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    /// Check if `status` triggers a retry
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        if self.retry_on_http.is_empty() {
            DEFAULT_RETRY_STATUSES.contains(&status.as_u16())
        } else {
            self.retry_on_http.contains(&status.as_u16())
        }
    }

    /// Wait before the attempt following attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.delay_ms > 0 {
            return Duration::from_millis(self.delay_ms);
        }
        let base = Duration::from_millis(self.backoff_base_ms);
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Send `request` until it succeeds, fails terminally, or the policy runs out.
///
/// A response with a retryable status is returned as-is once attempts are
/// exhausted. The returned response records how many attempts were made.
pub async fn execute_with_retries(
    client: &Client,
    ctx: &Context,
    mut request: Request,
    policy: &RetryPolicy,
) -> Result<Response> {
    if let Some(reason) = ctx.err() {
        return Err(Error::Cancelled(reason));
    }
    match ctx.run(request.buffer_body()).await {
        Ok(buffered) => buffered?,
        Err(reason) => return Err(Error::Cancelled(reason)),
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let replay = request
            .try_clone()
            .ok_or_else(|| Error::invalid_request("request body cannot be replayed"))?;
        tracing::debug!(attempt, url = %crate::diagnostics::sanitize(request.url()), "sending attempt");

        let can_retry = attempt < policy.max_attempts();
        match client.execute(ctx, replay).await {
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) if can_retry && err.is_retryable() => {
                tracing::warn!(attempt, error = %err, "attempt failed, retrying");
            }
            Err(err) => return Err(err),
            Ok(response) if can_retry && policy.is_retryable_status(response.status()) => {
                tracing::warn!(attempt, status = %response.status(), "retryable status, retrying");
                // Dropping the response closes its body.
                drop(response);
            }
            Ok(mut response) => {
                response.set_attempts(attempt);
                return Ok(response);
            }
        }

        if let Some(reason) = ctx.err() {
            return Err(Error::Cancelled(reason));
        }
        let wait = policy.delay_for(attempt);
        tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "backing off");
        if let Err(reason) = ctx.run(tokio::time::sleep(wait)).await {
            return Err(Error::Cancelled(reason));
        }
    }
}
