pub mod browser;
pub mod computer;
pub mod coords;
pub mod types;

use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::operator::types::{ExecuteParams, ExecutionResult, ScreenshotOutput};

/// The capability that turns a resolved action into a real effect on a
/// target surface. Two variants ship: `ComputerOperator` (OS display and
/// input) and `BrowserOperator` (page viewport and in-page input). Shared
/// logic — coordinate mapping, retry — is composed around this trait, not
/// inherited into it.
#[async_trait]
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    /// Captures the current surface. Fails with `PilotError::Capture` when
    /// no capture source is available.
    async fn screenshot(&self) -> PilotResult<ScreenshotOutput>;

    /// Whether `fallback_screenshot` is worth calling after `screenshot`
    /// has failed its retries.
    fn has_capture_fallback(&self) -> bool {
        false
    }

    /// Secondary capture strategy (e.g. another display). Default: none.
    async fn fallback_screenshot(&self) -> PilotResult<ScreenshotOutput> {
        Err(crate::errors::PilotError::Capture(
            "no fallback capture source".into(),
        ))
    }

    /// Performs one action against the surface. Fails with
    /// `PilotError::Execution` when the surface rejects it.
    async fn execute(&self, params: ExecuteParams) -> PilotResult<ExecutionResult>;

    /// Annotation attached to subsequently tracked actions.
    /// Fire-and-forget; no return value.
    fn set_user_intent(&self, intent: &str);

    fn user_intent(&self) -> Option<String>;
}
