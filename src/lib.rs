pub mod agent;
pub mod config;
pub mod errors;
pub mod operator;
pub mod predictor;
pub mod tracking;

pub use agent::controller::{AgentConfig, AgentController, AgentHandle};
pub use agent::history::SessionHistory;
pub use agent::retry::{with_retry, Immediate, RetryLimits, RetryStrategy};
pub use agent::state::{Action, AgentError, AgentUpdate, Box2, ConversationEntry, RunState};
pub use config::{load_config, save_config, AppConfig};
pub use errors::{PilotError, PilotResult};
pub use operator::browser::BrowserOperator;
pub use operator::computer::ComputerOperator;
pub use operator::coords::CoordinateSpace;
pub use operator::types::{ExecuteParams, ExecutionResult, ScreenshotContext, ScreenshotOutput};
pub use operator::Operator;
pub use predictor::client::{VlmClient, VlmConfig};
pub use predictor::types::{PredictionRequest, PredictionResponse, Predictor};
pub use tracking::tracker::ActionTracker;
pub use tracking::types::TrackerConfig;

/// Installs the `tracing` subscriber and loads `.env`, the way the host
/// process is expected to bootstrap. Call once at startup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env if present (ignore error if not found)
    let _ = dotenvy::dotenv();
}
