//! Best-effort, order-preserving action tracking.
//!
//! Enqueue calls are synchronous and never touch the network; a background
//! task drains the queue to the remote recorder in bounded batches. Failed
//! deliveries go back to the front of the queue, so delivery order always
//! equals enqueue order. Nothing here is ever allowed to fail the run-loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::errors::PilotResult;
use crate::tracking::client::{RecordDelivery, RecorderClient};
use crate::tracking::types::{
    ActionResultRecord, QueryRequest, Session, TargetElement, TrackedAction, TrackerConfig,
};

#[derive(Debug, Clone)]
enum QueuedRecord {
    SessionStart(Session),
    SessionEnd { session_id: String },
    ActionStart(TrackedAction),
    ActionResult(ActionResultRecord),
}

impl QueuedRecord {
    fn describe(&self) -> String {
        match self {
            Self::SessionStart(s) => format!("session_start {}", s.session_id),
            Self::SessionEnd { session_id } => format!("session_end {session_id}"),
            Self::ActionStart(a) => format!("action_start {}", a.correlation_id),
            Self::ActionResult(r) => format!("action_result {}", r.correlation_id),
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    record: QueuedRecord,
    attempts: u32,
}

struct TrackerInner {
    config: TrackerConfig,
    delivery: Arc<dyn RecordDelivery>,
    queue: Mutex<VecDeque<Pending>>,
    session: Mutex<Option<Session>>,
}

/// Cloneable handle to the tracking sink.
#[derive(Clone)]
pub struct ActionTracker {
    inner: Arc<TrackerInner>,
}

impl ActionTracker {
    /// Tracker wired to the HTTP recorder, with the drain task running.
    pub fn start(config: TrackerConfig) -> Self {
        let client = Arc::new(RecorderClient::new(&config));
        Self::with_delivery(config, client)
    }

    /// Tracker over an arbitrary delivery implementation. Spawns the drain
    /// task when tracking is enabled.
    pub fn with_delivery(config: TrackerConfig, delivery: Arc<dyn RecordDelivery>) -> Self {
        let enabled = config.enabled;
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                config,
                delivery,
                queue: Mutex::new(VecDeque::new()),
                session: Mutex::new(None),
            }),
        };
        if enabled {
            tracker.spawn_drain();
        }
        tracker
    }

    /// Inert tracker: everything is a no-op, `is_active` is always false.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config: TrackerConfig { enabled: false, ..TrackerConfig::default() },
                delivery: Arc::new(NullDelivery),
                queue: Mutex::new(VecDeque::new()),
                session: Mutex::new(None),
            }),
        }
    }

    fn spawn_drain(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval_ms = self.inner.config.flush_interval_ms.max(10);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Drain stops when the last tracker handle is gone.
                let Some(inner) = weak.upgrade() else { break };
                inner.drain_once().await;
            }
            tracing::debug!("tracking drain task exited");
        });
    }

    /// Whether a tracking session is currently open. The controller gates
    /// before/after screenshot capture on this, so disabled tracking costs
    /// nothing.
    pub fn is_active(&self) -> bool {
        self.inner.config.enabled && self.inner.session.lock().unwrap().is_some()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Opens a session and queues its start record. Returns the session id,
    /// or `None` when tracking is disabled.
    pub fn start_session(&self, user_id: Option<String>, goal: Option<String>) -> Option<String> {
        if !self.inner.config.enabled {
            return None;
        }
        let session = Session::open(user_id, goal);
        let id = session.session_id.clone();
        {
            let mut current = self.inner.session.lock().unwrap();
            if let Some(previous) = current.take() {
                tracing::warn!(session = %previous.session_id, "session still open, closing it");
                self.enqueue(QueuedRecord::SessionEnd { session_id: previous.session_id });
            }
            *current = Some(session.clone());
        }
        self.enqueue(QueuedRecord::SessionStart(session));
        tracing::info!(session = %id, "tracking session started");
        Some(id)
    }

    /// Closes the current session, queueing its end record.
    pub fn end_session(&self) {
        let Some(session) = self.inner.session.lock().unwrap().take() else {
            return;
        };
        tracing::info!(session = %session.session_id, "tracking session ended");
        self.enqueue(QueuedRecord::SessionEnd { session_id: session.session_id });
    }

    /// Queues an action-start record and returns its correlation id.
    /// Synchronous, O(1), never blocks on I/O. Opens a session on first use.
    pub fn track_action_start(
        &self,
        action_type: &str,
        action_inputs: serde_json::Value,
        target_element: Option<TargetElement>,
        user_intent: Option<String>,
    ) -> Option<String> {
        if !self.inner.config.enabled {
            return None;
        }
        let session_id = match self.current_session_id() {
            Some(id) => id,
            None => self.start_session(None, None)?,
        };
        let action = TrackedAction {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.to_string(),
            action_inputs,
            target_element,
            timestamp: chrono::Utc::now(),
            session_id,
            user_intent,
        };
        let id = action.correlation_id.clone();
        self.enqueue(QueuedRecord::ActionStart(action));
        Some(id)
    }

    /// Queues the result record for a previously tracked action.
    #[allow(clippy::too_many_arguments)]
    pub fn track_action_result(
        &self,
        correlation_id: &str,
        success: bool,
        execution_time_ms: u64,
        error_message: Option<String>,
        screenshot_before: Option<String>,
        screenshot_after: Option<String>,
    ) {
        if !self.inner.config.enabled {
            return;
        }
        if !success {
            tracing::warn!(
                correlation_id,
                error = error_message.as_deref().unwrap_or("unknown"),
                "tracked action failed"
            );
        }
        self.enqueue(QueuedRecord::ActionResult(ActionResultRecord {
            correlation_id: correlation_id.to_string(),
            success,
            error_message,
            screenshot_before,
            screenshot_after,
            execution_time_ms,
        }));
    }

    /// Best-effort query against the recorder. Failures are logged and
    /// return `None`.
    pub async fn query(&self, query: &str, limit: u32) -> Option<serde_json::Value> {
        if !self.inner.config.enabled {
            return None;
        }
        let request = QueryRequest {
            query: query.to_string(),
            session_id: self.current_session_id(),
            limit: Some(limit),
        };
        match self.inner.delivery.query(&request).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "recorder query failed");
                None
            }
        }
    }

    pub fn queued_records(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) async fn drain_now(&self) {
        self.inner.drain_once().await;
    }

    fn enqueue(&self, record: QueuedRecord) {
        self.inner
            .queue
            .lock()
            .unwrap()
            .push_back(Pending { record, attempts: 0 });
    }
}

impl TrackerInner {
    async fn drain_once(&self) {
        let mut batch: VecDeque<Pending> = {
            let mut queue = self.queue.lock().unwrap();
            let take = self.config.max_batch.min(queue.len());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }

        while let Some(mut pending) = batch.pop_front() {
            match self.deliver(&pending.record).await {
                Ok(()) => {
                    tracing::debug!(record = %pending.record.describe(), "record delivered");
                }
                Err(e) => {
                    pending.attempts += 1;
                    if pending.attempts >= self.config.max_delivery_attempts {
                        tracing::warn!(
                            record = %pending.record.describe(),
                            attempts = pending.attempts,
                            error = %e,
                            "record dropped after repeated delivery failures"
                        );
                    } else {
                        tracing::warn!(
                            record = %pending.record.describe(),
                            attempts = pending.attempts,
                            error = %e,
                            "record delivery failed, requeueing"
                        );
                        batch.push_front(pending);
                    }
                    // Put the unsent remainder back in original order and
                    // wait for the next tick.
                    let mut queue = self.queue.lock().unwrap();
                    while let Some(p) = batch.pop_back() {
                        queue.push_front(p);
                    }
                    break;
                }
            }
        }
    }

    async fn deliver(&self, record: &QueuedRecord) -> PilotResult<()> {
        match record {
            QueuedRecord::SessionStart(session) => self.delivery.start_session(session).await,
            QueuedRecord::SessionEnd { session_id } => self.delivery.end_session(session_id).await,
            QueuedRecord::ActionStart(action) => self.delivery.deliver_action(action).await,
            QueuedRecord::ActionResult(result) => self.delivery.deliver_result(result).await,
        }
    }
}

/// Delivery for the disabled tracker; nothing should ever reach it.
struct NullDelivery;

#[async_trait::async_trait]
impl RecordDelivery for NullDelivery {
    async fn deliver_action(&self, _action: &TrackedAction) -> PilotResult<()> {
        Ok(())
    }
    async fn deliver_result(&self, _result: &ActionResultRecord) -> PilotResult<()> {
        Ok(())
    }
    async fn start_session(&self, _session: &Session) -> PilotResult<()> {
        Ok(())
    }
    async fn end_session(&self, _session_id: &str) -> PilotResult<()> {
        Ok(())
    }
    async fn query(&self, _request: &QueryRequest) -> PilotResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    async fn health_check(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::test_support::MemoryDelivery;

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            enabled: true,
            // long interval so tests drive draining manually
            flush_interval_ms: 3_600_000,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_never_blocks_while_unreachable() {
        let delivery = MemoryDelivery::new(false);
        let tracker = ActionTracker::with_delivery(test_config(), delivery.clone());

        for i in 0..200 {
            let id = tracker.track_action_start(
                "click",
                serde_json::json!({ "n": i }),
                None,
                None,
            );
            assert!(id.is_some());
        }
        // 200 starts + the auto-opened session record
        assert_eq!(tracker.queued_records(), 201);

        tracker.drain_now().await;
        // nothing delivered, nothing lost
        assert_eq!(tracker.queued_records(), 201);
        assert!(delivery.tags().is_empty());
    }

    #[tokio::test]
    async fn all_records_delivered_in_enqueue_order_after_recovery() {
        let delivery = MemoryDelivery::new(false);
        let tracker = ActionTracker::with_delivery(test_config(), delivery.clone());

        let mut expected = vec!["session_start".to_string()];
        for i in 0..15 {
            let kind = format!("kind{i}");
            let id = tracker
                .track_action_start(&kind, serde_json::Value::Null, None, None)
                .unwrap();
            tracker.track_action_result(&id, true, 5, None, None, None);
            expected.push(format!("start:{kind}"));
            expected.push("result:true".to_string());
        }

        tracker.drain_now().await;
        assert!(delivery.tags().is_empty());

        delivery.set_reachable(true);
        for _ in 0..5 {
            tracker.drain_now().await;
        }
        assert_eq!(tracker.queued_records(), 0);
        assert_eq!(delivery.tags(), expected);
    }

    #[tokio::test]
    async fn record_dropped_after_bounded_attempts() {
        let delivery = MemoryDelivery::new(false);
        let config = TrackerConfig {
            max_delivery_attempts: 3,
            ..test_config()
        };
        let tracker = ActionTracker::with_delivery(config, delivery.clone());
        tracker.start_session(None, None);
        assert_eq!(tracker.queued_records(), 1);

        for _ in 0..3 {
            tracker.drain_now().await;
        }
        assert_eq!(tracker.queued_records(), 0);
        assert!(delivery.tags().is_empty());
    }

    #[tokio::test]
    async fn session_lifecycle_drives_is_active() {
        let tracker =
            ActionTracker::with_delivery(test_config(), MemoryDelivery::new(true));
        assert!(!tracker.is_active());

        // first tracked action auto-opens a session
        tracker.track_action_start("click", serde_json::Value::Null, None, None);
        assert!(tracker.is_active());

        tracker.end_session();
        assert!(!tracker.is_active());
    }

    #[tokio::test]
    async fn disabled_tracker_is_inert() {
        let tracker = ActionTracker::disabled();
        assert!(!tracker.is_active());
        assert!(tracker
            .track_action_start("click", serde_json::Value::Null, None, None)
            .is_none());
        tracker.track_action_result("x", true, 1, None, None, None);
        assert_eq!(tracker.queued_records(), 0);
        assert!(tracker.query("anything", 10).await.is_none());
    }
}
