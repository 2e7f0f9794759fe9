//! OpenAI-compatible vision-model client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};
use crate::predictor::parser::parse_prediction;
use crate::predictor::types::{PredictionRequest, PredictionResponse, Predictor};

const SYSTEM_PROMPT: &str = "\
You are ScreenPilot, a GUI automation agent. You are given a task, the \
conversation so far and a screenshot of the current screen. Decide the \
single next action to take.

## Output Format
Thought: one short paragraph of reasoning
Action: one action call from the action space below

## Action Space
click(start_box='[x1, y1, x2, y2]')
left_double(start_box='[x1, y1, x2, y2]')
right_single(start_box='[x1, y1, x2, y2]')
drag(start_box='[x1, y1, x2, y2]', end_box='[x3, y3, x4, y4]')
hotkey(key='')
type(content='') # If you want to submit your input, use \"\\n\" at the end of `content`.
scroll(start_box='[x1, y1, x2, y2]', direction='down or up or right or left')
wait() # Sleep for 5s and take a screenshot to check for any changes.
finished()
call_user() # Submit the task and call the user when the task is unsolvable, or when you need the user's help.

Coordinates are normalized to [0,1] relative to the screenshot.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Full chat-completions endpoint URL.
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Quantization factors this model applies to its coordinate output,
    /// if any. Forwarded to the coordinate mapper.
    #[serde(default)]
    pub coordinate_factors: Option<[f64; 2]>,
}

fn default_temperature() -> f64 {
    0.0
}

fn default_max_tokens() -> u32 {
    500
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

pub struct VlmClient {
    config: VlmConfig,
    client: reqwest::Client,
}

impl VlmClient {
    pub fn new(config: VlmConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    fn build_messages(request: &PredictionRequest) -> Vec<ChatMessage> {
        let mut messages = vec![
            ChatMessage {
                role: "system",
                content: MessageContent::Text(SYSTEM_PROMPT.into()),
            },
            ChatMessage {
                role: "user",
                content: MessageContent::Text(request.instructions.clone()),
            },
        ];

        // Prior turns go in as plain text; only the latest screenshot is
        // sent as an image.
        for entry in &request.history {
            match entry.role.as_str() {
                "assistant" => {
                    if let Some(content) = entry.content.clone().or_else(|| entry.thought.clone()) {
                        messages.push(ChatMessage {
                            role: "assistant",
                            content: MessageContent::Text(content),
                        });
                    }
                }
                "user" => {
                    if let Some(content) = entry.content.clone() {
                        messages.push(ChatMessage {
                            role: "user",
                            content: MessageContent::Text(content),
                        });
                    }
                }
                _ => {}
            }
        }

        messages.push(ChatMessage {
            role: "user",
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!(
                            "data:image/jpeg;base64,{}",
                            request.screenshot_base64
                        ),
                    },
                },
                ContentPart::Text {
                    text: "Here is the current screen. Reply with your Thought and the next Action."
                        .into(),
                },
            ]),
        });
        messages
    }
}

#[async_trait]
impl Predictor for VlmClient {
    async fn predict(&self, request: PredictionRequest) -> PilotResult<PredictionResponse> {
        let messages = Self::build_messages(&request);
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        tracing::debug!(
            model = %self.config.model,
            history = request.history.len(),
            "sending prediction request"
        );

        let mut http = self.client.post(&self.config.base_url).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }
        for (name, value) in &request.auth_headers {
            http = http.header(name.as_str(), value.as_str());
        }

        let response = http.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(PilotError::Prediction(format!("{status}: {err_body}")));
        }

        let json: serde_json::Value = response.json().await?;
        let raw = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                PilotError::Prediction("response carries no message content".into())
            })?
            .to_string();

        let (thought, actions) = parse_prediction(&raw)?;
        tracing::info!(
            actions = actions.len(),
            kinds = ?actions.iter().map(|a| a.kind()).collect::<Vec<_>>(),
            "prediction parsed"
        );

        Ok(PredictionResponse {
            actions,
            thought,
            raw,
            factors: self.config.coordinate_factors,
        })
    }
}
