//! Bounded retry for the three fallible operation classes of the run-loop.

use std::future::Future;

use async_trait::async_trait;

use crate::errors::{PilotError, PilotResult};

/// Maximum retries per operation class. An operation runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RetryLimits {
    pub model: u32,
    pub screenshot: u32,
    /// Kept low: re-executing a destructive action is unsafe.
    pub execute: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self { model: 5, screenshot: 5, execute: 1 }
    }
}

/// Hook between attempts. The default is an immediate retry; substitute a
/// backoff/jitter strategy here without touching call sites.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Called before re-attempt number `attempt` (1-based).
    async fn pause_before(&self, attempt: u32);
}

/// Retries with no delay between attempts.
pub struct Immediate;

#[async_trait]
impl RetryStrategy for Immediate {
    async fn pause_before(&self, _attempt: u32) {}
}

/// Runs `op`, retrying on failure up to `max_retries` additional times.
///
/// Cancellation is never retried: a cancelled run must unwind, not spin.
/// Successful results carrying terminal agent outcomes pass straight
/// through; only the call's own failure triggers a retry.
pub async fn with_retry<T, Fut, F>(
    max_retries: u32,
    strategy: &dyn RetryStrategy,
    what: &str,
    mut op: F,
) -> PilotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PilotResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(PilotError::Cancelled) => return Err(PilotError::Cancelled),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    what,
                    attempt,
                    max_retries,
                    error = %e,
                    "operation failed, retrying"
                );
                strategy.pause_before(attempt).await;
            }
            Err(e) => {
                tracing::error!(what, attempts = attempt + 1, error = %e, "retries exhausted");
                return Err(e);
            }
        }
    }
}
