use async_trait::async_trait;

use crate::errors::{PilotError, PilotResult};
use crate::tracking::types::{
    ActionResultRecord, QueryRequest, Session, TrackedAction, TrackerConfig,
};

/// Delivery seam between the queue and the remote recorder. The drain loop
/// only sees this trait, so tests run against an in-memory implementation.
#[async_trait]
pub trait RecordDelivery: Send + Sync {
    async fn deliver_action(&self, action: &TrackedAction) -> PilotResult<()>;
    async fn deliver_result(&self, result: &ActionResultRecord) -> PilotResult<()>;
    async fn start_session(&self, session: &Session) -> PilotResult<()>;
    async fn end_session(&self, session_id: &str) -> PilotResult<()>;
    async fn query(&self, request: &QueryRequest) -> PilotResult<serde_json::Value>;
    async fn health_check(&self) -> bool;
}

/// HTTP client for the remote action recorder.
pub struct RecorderClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RecorderClient {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            base_url: config.service_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<B: serde::Serialize>(
        &self,
        endpoint: &str,
        body: Option<&B>,
    ) -> PilotResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PilotError::Tracking(format!(
                "{endpoint}: HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl RecordDelivery for RecorderClient {
    async fn deliver_action(&self, action: &TrackedAction) -> PilotResult<()> {
        self.post("/actions/track", Some(action)).await?;
        Ok(())
    }

    async fn deliver_result(&self, result: &ActionResultRecord) -> PilotResult<()> {
        self.post("/actions/result", Some(result)).await?;
        Ok(())
    }

    async fn start_session(&self, session: &Session) -> PilotResult<()> {
        self.post("/sessions/start", Some(session)).await?;
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> PilotResult<()> {
        let endpoint = format!("/sessions/end?session_id={session_id}");
        self.post::<()>(&endpoint, None).await?;
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> PilotResult<serde_json::Value> {
        self.post("/query", Some(request)).await
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                body["status"].as_str() == Some("healthy")
            }
            _ => false,
        }
    }
}
