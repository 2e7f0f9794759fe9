use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agent::controller::AgentConfig;
use crate::agent::retry::RetryLimits;
use crate::errors::{PilotError, PilotResult};
use crate::predictor::client::VlmConfig;
use crate::tracking::types::TrackerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: VlmConfig,
    #[serde(default)]
    pub agent: LoopSettings,
    #[serde(default)]
    pub retry: RetryLimits,
    #[serde(default)]
    pub tracking: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSettings {
    #[serde(default = "default_max_loop_count")]
    pub max_loop_count: u32,
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    /// Persist the conversation of each run as JSONL.
    #[serde(default)]
    pub record_history: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_loop_count: default_max_loop_count(),
            loop_interval_ms: default_loop_interval_ms(),
            record_history: false,
        }
    }
}

fn default_max_loop_count() -> u32 {
    25
}

fn default_loop_interval_ms() -> u64 {
    500
}

impl AppConfig {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_loop_count: self.agent.max_loop_count,
            loop_interval_ms: self.agent.loop_interval_ms,
            retry: self.retry,
        }
    }
}

fn resolve_config_path() -> PilotResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(PilotError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Loads `config.toml`, with API keys overridable from `SCREENPILOT_API_KEY`
/// and `SCREENPILOT_TRACKING_API_KEY`.
pub fn load_config() -> PilotResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let mut config: AppConfig = toml::from_str(&content)?;

    if let Ok(key) = std::env::var("SCREENPILOT_API_KEY") {
        config.model.api_key = Some(key);
    }
    if let Ok(key) = std::env::var("SCREENPILOT_TRACKING_API_KEY") {
        config.tracking.api_key = Some(key);
    }

    tracing::info!(path = %path.display(), model = %config.model.model, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig) -> PilotResult<()> {
    let path = resolve_config_path()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [model]
            base_url = "https://example.test/v1/chat/completions"
            model = "vlm-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.max_loop_count, 25);
        assert_eq!(config.retry.model, 5);
        assert_eq!(config.retry.execute, 1);
        assert!(!config.tracking.enabled);
        assert_eq!(config.tracking.max_batch, 10);
        assert_eq!(config.model.temperature, 0.0);
        assert!(config.model.coordinate_factors.is_none());
    }

    #[test]
    fn full_config_round_trips() {
        let config: AppConfig = toml::from_str(
            r#"
            [model]
            base_url = "https://example.test/v1/chat/completions"
            model = "vlm-test"
            temperature = 0.2
            coordinate_factors = [1000.0, 1000.0]

            [agent]
            max_loop_count = 10
            loop_interval_ms = 250
            record_history = true

            [retry]
            model = 3
            screenshot = 2
            execute = 0

            [tracking]
            enabled = true
            service_url = "http://localhost:8100"
            flush_interval_ms = 500
            max_batch = 5
            max_delivery_attempts = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.model.coordinate_factors, Some([1000.0, 1000.0]));
        assert_eq!(config.agent_config().retry.screenshot, 2);
        let text = toml::to_string_pretty(&config).unwrap();
        let reparsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed.agent.max_loop_count, 10);
        assert!(reparsed.tracking.enabled);
    }
}
