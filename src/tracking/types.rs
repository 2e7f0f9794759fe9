use serde::{Deserialize, Serialize};

/// A logical grouping of tracked actions. One session is active at a time
/// per tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl Session {
    pub fn open(user_id: Option<String>, goal: Option<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            start_time: chrono::Utc::now(),
            end_time: None,
            goal,
        }
    }
}

/// Descriptor of the UI element an action targeted, when known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetElement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// The start record of one dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedAction {
    /// Locally generated; links this record to its eventual result.
    pub correlation_id: String,
    pub action_type: String,
    pub action_inputs: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_element: Option<TargetElement>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
}

/// The completion record matching a `TrackedAction` by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResultRecord {
    pub correlation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_after: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Tracking sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub service_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub flush_interval_ms: u64,
    /// Records delivered per drain tick.
    pub max_batch: usize,
    /// A record is dropped (with a warning) after this many failed
    /// delivery attempts.
    pub max_delivery_attempts: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_url: "http://localhost:8100".into(),
            api_key: None,
            flush_interval_ms: 1000,
            max_batch: 10,
            max_delivery_attempts: 50,
        }
    }
}
