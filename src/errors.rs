use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Prediction error: {0}")]
    Prediction(String),

    #[error("Execution error [{action}]: {message}")]
    Execution {
        action: String,
        message: String,
        /// Set when the target surface is gone (disconnected page, no
        /// monitor); the run-loop treats these as fatal instead of
        /// skipping the iteration.
        unrecoverable: bool,
    },

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl PilotError {
    /// Execution error helper with the action kind attached.
    pub fn execution(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            action: action.into(),
            message: message.into(),
            unrecoverable: false,
        }
    }

    pub fn is_unrecoverable_execution(&self) -> bool {
        matches!(self, Self::Execution { unrecoverable: true, .. })
    }
}

impl serde::Serialize for PilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type PilotResult<T> = Result<T, PilotError>;
