use std::collections::HashMap;

use async_trait::async_trait;

use crate::agent::state::{Action, ConversationEntry};
use crate::errors::PilotResult;
use crate::operator::types::ScreenshotContext;

/// Everything the vision model needs to predict the next action.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub instructions: String,
    pub history: Vec<ConversationEntry>,
    pub screenshot_base64: String,
    pub screenshot_context: ScreenshotContext,
    /// Extra headers for the model endpoint (e.g. proxy auth), passed
    /// through untouched.
    pub auth_headers: HashMap<String, String>,
}

/// Parsed outcome of one predictor call.
#[derive(Debug, Clone)]
pub struct PredictionResponse {
    pub actions: Vec<Action>,
    pub thought: Option<String>,
    /// The unparsed prediction text, kept for observers and history.
    pub raw: String,
    /// Quantization factors the predictor applies to its coordinates,
    /// when it applies any.
    pub factors: Option<[f64; 2]>,
}

/// The vision-model boundary. An opaque remote call from the run-loop's
/// perspective, subject to the retry policy.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: PredictionRequest) -> PilotResult<PredictionResponse>;
}
