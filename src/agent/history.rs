use std::io::Write;
use std::path::PathBuf;

use crate::agent::state::ConversationEntry;
use crate::errors::PilotResult;

/// Append-only JSONL log of one run's conversation.
pub struct SessionHistory {
    pub session_id: String,
    entries: Vec<ConversationEntry>,
    file_path: PathBuf,
}

impl SessionHistory {
    pub fn new() -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let file_path = sessions_dir().join(format!("session_{session_id}.jsonl"));
        Self { session_id, entries: Vec::new(), file_path }
    }

    /// History rooted at a specific directory (tests, portable installs).
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = dir.into();
        let _ = std::fs::create_dir_all(&dir);
        let file_path = dir.join(format!("session_{session_id}.jsonl"));
        Self { session_id, entries: Vec::new(), file_path }
    }

    pub fn push(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    /// Append the latest entry to the JSONL file.
    pub fn flush(&self) -> PilotResult<()> {
        if let Some(last) = self.entries.last() {
            let line = serde_json::to_string(last)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            writeln!(file, "{line}")?;
            tracing::debug!(path = %self.file_path.display(), "history entry flushed");
        }
        Ok(())
    }
}

impl Default for SessionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// `~/.local/share/screenpilot/sessions` (or the platform equivalent),
/// falling back to the working directory.
fn sessions_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("screenpilot").join("sessions");
    let _ = std::fs::create_dir_all(&dir);
    dir
}
