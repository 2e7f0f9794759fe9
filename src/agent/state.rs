use crate::operator::types::ScreenshotContext;

/// Lifecycle states of one agent run.
///
/// Owned by the controller through a `watch` channel; `AgentHandle` methods
/// are the only external writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Finished,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Finished)
    }
}

/// One action predicted by the vision model.
///
/// Box coordinates are in model space: normalized [0,1] unless the
/// predictor applies quantization factors, which the coordinate mapper
/// inverts before scaling to pixels.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click { start_box: Box2 },
    DoubleClick { start_box: Box2 },
    RightClick { start_box: Box2 },
    Drag { start_box: Box2, end_box: Box2 },
    Hotkey { key: String },
    Type { content: String },
    Scroll { start_box: Option<Box2>, direction: ScrollDirection },
    Wait,
    Finished { content: Option<String> },
    CallUser,
    Error { message: String },
}

impl Action {
    /// Wire name of the variant, used for tracking records and error context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::DoubleClick { .. } => "double_click",
            Self::RightClick { .. } => "right_click",
            Self::Drag { .. } => "drag",
            Self::Hotkey { .. } => "hotkey",
            Self::Type { .. } => "type",
            Self::Scroll { .. } => "scroll",
            Self::Wait => "wait",
            Self::Finished { .. } => "finished",
            Self::CallUser => "call_user",
            Self::Error { .. } => "error",
        }
    }

    /// Terminal outcomes end the run instead of being dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::CallUser)
    }

    /// The box the action is anchored to, when it has one.
    pub fn start_box(&self) -> Option<&Box2> {
        match self {
            Self::Click { start_box }
            | Self::DoubleClick { start_box }
            | Self::RightClick { start_box }
            | Self::Drag { start_box, .. } => Some(start_box),
            Self::Scroll { start_box, .. } => start_box.as_ref(),
            _ => None,
        }
    }
}

/// Axis-aligned box as two corner points in model coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Box2 {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Box2 {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// A degenerate box from a single point.
    pub fn point(x: f64, y: f64) -> Self {
        Self { x1: x, y1: y, x2: x, y2: y }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl std::str::FromStr for ScrollDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(format!("unknown scroll direction: {other}")),
        }
    }
}

/// One entry of the accumulated conversation shown to observers and
/// appended to the session history file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationEntry {
    /// "user", "assistant" or "screenshot".
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_context: Option<ScreenshotContext>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            thought: None,
            actions: None,
            screenshot_context: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn screenshot(context: ScreenshotContext) -> Self {
        Self {
            role: "screenshot".into(),
            content: None,
            thought: None,
            actions: None,
            screenshot_context: Some(context),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn assistant(
        content: Option<String>,
        thought: Option<String>,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            role: "assistant".into(),
            content,
            thought,
            actions: Some(actions),
            screenshot_context: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Per-iteration observer payload: current status plus the conversation
/// entries added since the previous update.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentUpdate {
    pub status: RunState,
    pub conversations: Vec<ConversationEntry>,
}

/// Structured error delivered to `on_error`, at most once per run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentError {
    pub status: RunState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}
