use serde::{Deserialize, Serialize};

use crate::agent::state::Action;
use crate::errors::{PilotError, PilotResult};

/// Relative mismatch allowed between `physical` and `logical × scale`.
/// Rounding of logical sizes on fractional-DPI displays produces off-by-one
/// physical dimensions.
const SIZE_TOLERANCE: f64 = 0.01;

/// Metadata describing how a screenshot relates to its source surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotContext {
    pub logical_width: u32,
    pub logical_height: u32,
    pub physical_width: u32,
    pub physical_height: u32,
    pub scale_factor: f64,
    /// Which display or page produced the capture.
    pub source_id: String,
}

impl ScreenshotContext {
    /// Checks the scale invariant: physical = logical × scale within a
    /// small tolerance, scale strictly positive.
    pub fn validate(&self) -> PilotResult<()> {
        if self.scale_factor <= 0.0 {
            return Err(PilotError::Capture(format!(
                "non-positive scale factor: {}",
                self.scale_factor
            )));
        }
        if self.physical_width == 0 || self.physical_height == 0 {
            return Err(PilotError::Capture("zero-sized capture".into()));
        }
        let expect_w = self.logical_width as f64 * self.scale_factor;
        let expect_h = self.logical_height as f64 * self.scale_factor;
        let off_w = (self.physical_width as f64 - expect_w).abs() / expect_w.max(1.0);
        let off_h = (self.physical_height as f64 - expect_h).abs() / expect_h.max(1.0);
        if off_w > SIZE_TOLERANCE || off_h > SIZE_TOLERANCE {
            return Err(PilotError::Capture(format!(
                "inconsistent screenshot metadata: physical {}x{} vs logical {}x{} at scale {}",
                self.physical_width,
                self.physical_height,
                self.logical_width,
                self.logical_height,
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Screenshot payload handed to the predictor.
#[derive(Debug, Clone)]
pub struct ScreenshotOutput {
    pub base64: String,
    pub context: ScreenshotContext,
}

/// A coordinate in the target surface's native pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

/// An action plus its pre-resolved pixel coordinates, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub action: Action,
    pub start: Option<PixelPoint>,
    pub end: Option<PixelPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self { success: true, message: None }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(lw: u32, lh: u32, pw: u32, ph: u32, scale: f64) -> ScreenshotContext {
        ScreenshotContext {
            logical_width: lw,
            logical_height: lh,
            physical_width: pw,
            physical_height: ph,
            scale_factor: scale,
            source_id: "test".into(),
        }
    }

    #[test]
    fn validate_accepts_exact_and_near_scale() {
        assert!(ctx(1280, 800, 2560, 1600, 2.0).validate().is_ok());
        // off-by-one physical width from fractional DPI rounding
        assert!(ctx(1097, 617, 1645, 926, 1.5).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_metadata() {
        assert!(ctx(1000, 800, 1000, 800, 0.0).validate().is_err());
        assert!(ctx(1000, 800, 2000, 800, 1.0).validate().is_err());
        assert!(ctx(1000, 800, 0, 0, 1.0).validate().is_err());
    }
}
