//! The agent run-loop: capture → predict → execute → record, under a
//! pause/resume/stop control surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent::history::SessionHistory;
use crate::agent::retry::{with_retry, Immediate, RetryLimits, RetryStrategy};
use crate::agent::state::{Action, AgentError, AgentUpdate, ConversationEntry, RunState};
use crate::errors::{PilotError, PilotResult};
use crate::operator::coords::{resolve_box_center, CoordinateSpace};
use crate::operator::types::{ExecuteParams, ExecutionResult, PixelPoint, ScreenshotOutput};
use crate::operator::Operator;
use crate::predictor::types::{PredictionRequest, PredictionResponse, Predictor};
use crate::tracking::tracker::ActionTracker;

/// `wait()` sleeps this long before the next screenshot.
const WAIT_ACTION_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_loop_count: u32,
    pub loop_interval_ms: u64,
    pub retry: RetryLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_loop_count: 25,
            loop_interval_ms: 500,
            retry: RetryLimits::default(),
        }
    }
}

pub type DataCallback = Box<dyn Fn(AgentUpdate) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(AgentError) + Send + Sync>;

struct ControlState {
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
}

/// Cloneable control surface for one run. Explicitly handed out by the
/// controller; there is no process-wide agent registry.
#[derive(Clone)]
pub struct AgentHandle {
    control: Arc<ControlState>,
}

impl AgentHandle {
    pub fn state(&self) -> RunState {
        *self.control.state.borrow()
    }

    /// Suspends the loop at the next iteration boundary. Accepted only
    /// while `Running`; anything else is a no-op.
    pub fn pause(&self) {
        let changed = self.control.state.send_if_modified(|s| {
            if *s == RunState::Running {
                *s = RunState::Paused;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("agent paused");
        } else {
            tracing::debug!(state = ?self.state(), "pause ignored");
        }
    }

    /// Continues a paused loop exactly where it suspended. Accepted only
    /// while `Paused`.
    pub fn resume(&self) {
        let changed = self.control.state.send_if_modified(|s| {
            if *s == RunState::Paused {
                *s = RunState::Running;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("agent resumed");
        } else {
            tracing::debug!(state = ?self.state(), "resume ignored");
        }
    }

    /// Requests cancellation. After this returns no further operator action
    /// is dispatched; an in-flight dispatch is allowed to complete.
    /// Terminal: a stopped run cannot be resumed.
    pub fn stop(&self) {
        let changed = self.control.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = RunState::Stopping;
                true
            }
        });
        if changed {
            self.control.cancel.cancel();
            tracing::info!("agent stop requested");
        }
    }
}

enum CaptureOutcome {
    Shot(Box<ScreenshotOutput>),
    Skip,
    Stopped,
    Fatal(PilotError),
}

pub struct AgentController {
    config: AgentConfig,
    operator: Arc<dyn Operator>,
    predictor: Arc<dyn Predictor>,
    tracker: ActionTracker,
    strategy: Arc<dyn RetryStrategy>,
    control: Arc<ControlState>,
    on_data: DataCallback,
    on_error: ErrorCallback,
    history: Option<SessionHistory>,
    conversations: Vec<ConversationEntry>,
    error_emitted: bool,
}

impl AgentController {
    pub fn new(
        config: AgentConfig,
        operator: Arc<dyn Operator>,
        predictor: Arc<dyn Predictor>,
        tracker: ActionTracker,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            operator,
            predictor,
            tracker,
            strategy: Arc::new(Immediate),
            control: Arc::new(ControlState { state, cancel: CancellationToken::new() }),
            on_data,
            on_error,
            history: None,
            conversations: Vec::new(),
            error_emitted: false,
        }
    }

    /// Substitutes the between-attempt strategy for all retry classes.
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enables JSONL conversation persistence for this run.
    pub fn with_history(mut self, history: SessionHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle { control: self.control.clone() }
    }

    pub fn state(&self) -> RunState {
        *self.control.state.borrow()
    }

    pub fn conversations(&self) -> &[ConversationEntry] {
        &self.conversations
    }

    /// Runs the loop to a terminal state. One controller drives one run;
    /// create a fresh controller to run again.
    pub async fn run(
        &mut self,
        instructions: &str,
        prior_history: Vec<ConversationEntry>,
        auth_headers: HashMap<String, String>,
    ) -> PilotResult<()> {
        if instructions.trim().is_empty() {
            let err = PilotError::InvalidInput("instructions must not be empty".into());
            self.fail(&err);
            return Err(err);
        }
        if self.state() != RunState::Idle {
            let err = PilotError::InvalidInput(format!(
                "run requires an idle controller (state: {:?})",
                self.state()
            ));
            self.fail(&err);
            return Err(err);
        }

        self.conversations = prior_history;
        self.control.state.send_if_modified(|s| {
            if *s == RunState::Idle {
                *s = RunState::Running;
                true
            } else {
                false
            }
        });
        tracing::info!(operator = self.operator.name(), "agent run started");

        let mut first_delta = Vec::new();
        self.push_entry(&mut first_delta, ConversationEntry::user(instructions));

        let mut iteration = 0u32;
        let mut fatal: Option<PilotError> = None;
        let final_state = 'run: loop {
            if !self.boundary_wait().await {
                break RunState::Stopped;
            }
            if iteration >= self.config.max_loop_count {
                tracing::warn!(
                    max_loop_count = self.config.max_loop_count,
                    "maximum iteration count reached"
                );
                self.emit_data(RunState::Finished, Vec::new());
                break RunState::Finished;
            }
            iteration += 1;

            let mut delta = std::mem::take(&mut first_delta);

            // ── capture ───────────────────────────────────────────────
            let shot = match self.capture().await {
                CaptureOutcome::Shot(shot) => *shot,
                CaptureOutcome::Skip => {
                    self.push_entry(
                        &mut delta,
                        note_entry("screenshot unavailable, skipping iteration"),
                    );
                    self.emit_data(RunState::Running, delta);
                    if !self.interval_sleep().await {
                        break RunState::Stopped;
                    }
                    continue;
                }
                CaptureOutcome::Stopped => break RunState::Stopped,
                CaptureOutcome::Fatal(e) => {
                    fatal = Some(e);
                    break RunState::Error;
                }
            };
            self.push_entry(&mut delta, ConversationEntry::screenshot(shot.context.clone()));

            // ── predict ───────────────────────────────────────────────
            let request = PredictionRequest {
                instructions: instructions.to_string(),
                history: self.conversations.clone(),
                screenshot_base64: shot.base64.clone(),
                screenshot_context: shot.context.clone(),
                auth_headers: auth_headers.clone(),
            };
            let response = match self.predict(request).await {
                Ok(response) => response,
                Err(PilotError::Cancelled) => break RunState::Stopped,
                Err(e) => {
                    fatal = Some(e);
                    break RunState::Error;
                }
            };
            tracing::info!(
                iteration,
                actions = response.actions.len(),
                kinds = ?response.actions.iter().map(|a| a.kind()).collect::<Vec<_>>(),
                "prediction received"
            );
            self.push_entry(
                &mut delta,
                ConversationEntry::assistant(
                    Some(response.raw.clone()),
                    response.thought.clone(),
                    response.actions.clone(),
                ),
            );

            // ── dispatch ──────────────────────────────────────────────
            let space = CoordinateSpace { factors: response.factors };
            let mut iteration_state: Option<RunState> = None;
            for action in &response.actions {
                // pause/stop take effect before the next dispatch, never
                // mid-action
                if !self.boundary_wait().await {
                    iteration_state = Some(RunState::Stopped);
                    break;
                }
                match action {
                    Action::Finished { content } => {
                        self.record_terminal(action);
                        tracing::info!(summary = content.as_deref().unwrap_or(""), "task finished");
                        iteration_state = Some(RunState::Finished);
                        break;
                    }
                    Action::CallUser => {
                        self.record_terminal(action);
                        tracing::info!("model handed control back to the user");
                        iteration_state = Some(RunState::Finished);
                        break;
                    }
                    Action::Error { message } => {
                        fatal = Some(PilotError::Prediction(message.clone()));
                        iteration_state = Some(RunState::Error);
                        break;
                    }
                    Action::Wait => {
                        if !self.wait_action().await {
                            iteration_state = Some(RunState::Stopped);
                            break;
                        }
                    }
                    action => {
                        let start = action
                            .start_box()
                            .map(|b| resolve_box_center(b, &space, &shot.context));
                        let end = match action {
                            Action::Drag { end_box, .. } => {
                                Some(resolve_box_center(end_box, &space, &shot.context))
                            }
                            _ => None,
                        };
                        match self.dispatch(action, start, end).await {
                            Ok(result) => {
                                if !result.success {
                                    tracing::warn!(
                                        kind = action.kind(),
                                        message = result.message.as_deref().unwrap_or(""),
                                        "action reported failure"
                                    );
                                }
                            }
                            Err(PilotError::Cancelled) => {
                                iteration_state = Some(RunState::Stopped);
                                break;
                            }
                            Err(e) if e.is_unrecoverable_execution() => {
                                fatal = Some(e);
                                iteration_state = Some(RunState::Error);
                                break;
                            }
                            Err(e) => {
                                // reported, then on to the next prediction:
                                // the remaining actions are stale
                                tracing::warn!(kind = action.kind(), error = %e, "action failed");
                                self.push_entry(
                                    &mut delta,
                                    note_entry(format!("action {} failed: {e}", action.kind())),
                                );
                                break;
                            }
                        }
                    }
                }
            }

            let status = iteration_state.unwrap_or(RunState::Running);
            self.emit_data(status, delta);

            if let Some(state) = iteration_state {
                break 'run state;
            }
            if !self.interval_sleep().await {
                break RunState::Stopped;
            }
        };

        self.tracker.end_session();
        match fatal {
            Some(e) => {
                self.fail(&e);
                tracing::error!(error = %e, iterations = iteration, "agent run failed");
                Err(e)
            }
            None => {
                self.control.state.send_replace(final_state);
                tracing::info!(state = ?final_state, iterations = iteration, "agent run ended");
                Ok(())
            }
        }
    }

    /// Waits out a pause at an iteration boundary. Returns false when the
    /// run was cancelled instead of resumed.
    async fn boundary_wait(&self) -> bool {
        let mut rx = self.control.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Paused => {
                    tokio::select! {
                        _ = self.control.cancel.cancelled() => return false,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
                RunState::Stopping | RunState::Stopped => return false,
                _ => return true,
            }
        }
    }

    async fn capture(&self) -> CaptureOutcome {
        let operator = self.operator.clone();
        let cancel = self.control.cancel.clone();
        let result = with_retry(
            self.config.retry.screenshot,
            self.strategy.as_ref(),
            "screenshot",
            || {
                let operator = operator.clone();
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(PilotError::Cancelled),
                        r = operator.screenshot() => r,
                    }
                }
            },
        )
        .await;

        match result {
            Ok(shot) => CaptureOutcome::Shot(Box::new(shot)),
            Err(PilotError::Cancelled) => CaptureOutcome::Stopped,
            Err(e) if self.operator.has_capture_fallback() => {
                tracing::warn!(error = %e, "capture failed, trying fallback source");
                tokio::select! {
                    _ = self.control.cancel.cancelled() => CaptureOutcome::Stopped,
                    r = self.operator.fallback_screenshot() => match r {
                        Ok(shot) => CaptureOutcome::Shot(Box::new(shot)),
                        Err(e2) => {
                            tracing::warn!(error = %e2, "fallback capture failed too");
                            CaptureOutcome::Skip
                        }
                    },
                }
            }
            Err(e) => CaptureOutcome::Fatal(e),
        }
    }

    async fn predict(&self, request: PredictionRequest) -> PilotResult<PredictionResponse> {
        let predictor = self.predictor.clone();
        let cancel = self.control.cancel.clone();
        with_retry(
            self.config.retry.model,
            self.strategy.as_ref(),
            "predict",
            || {
                let predictor = predictor.clone();
                let request = request.clone();
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(PilotError::Cancelled),
                        r = predictor.predict(request) => r,
                    }
                }
            },
        )
        .await
    }

    /// One tracked dispatch. The execute future is awaited to completion:
    /// cancellation never kills an in-flight injection.
    async fn dispatch(
        &self,
        action: &Action,
        start: Option<PixelPoint>,
        end: Option<PixelPoint>,
    ) -> PilotResult<ExecutionResult> {
        let started = Instant::now();

        let mut screenshot_before = None;
        if self.tracker.is_active() {
            match self.operator.screenshot().await {
                Ok(shot) => screenshot_before = Some(shot.base64),
                Err(e) => tracing::warn!(error = %e, "before-action capture failed"),
            }
        }

        let correlation_id = self.tracker.track_action_start(
            action.kind(),
            serde_json::to_value(action).unwrap_or_default(),
            None,
            self.operator.user_intent(),
        );

        let params = ExecuteParams { action: action.clone(), start, end };
        let cancel = self.control.cancel.clone();
        let result = with_retry(
            self.config.retry.execute,
            self.strategy.as_ref(),
            "execute",
            || {
                let operator = self.operator.clone();
                let params = params.clone();
                let cancel = cancel.clone();
                async move {
                    // no new dispatch once stop() has returned; an
                    // already-running injection still completes
                    if cancel.is_cancelled() {
                        return Err(PilotError::Cancelled);
                    }
                    operator.execute(params).await
                }
            },
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(id) = correlation_id {
            match &result {
                Ok(outcome) => {
                    let mut screenshot_after = None;
                    if self.tracker.is_active() {
                        match self.operator.screenshot().await {
                            Ok(shot) => screenshot_after = Some(shot.base64),
                            Err(e) => tracing::warn!(error = %e, "after-action capture failed"),
                        }
                    }
                    let error_message = if outcome.success {
                        None
                    } else {
                        outcome.message.clone()
                    };
                    self.tracker.track_action_result(
                        &id,
                        outcome.success,
                        elapsed_ms,
                        error_message,
                        screenshot_before,
                        screenshot_after,
                    );
                }
                Err(e) => self.tracker.track_action_result(
                    &id,
                    false,
                    elapsed_ms,
                    Some(e.to_string()),
                    screenshot_before,
                    None,
                ),
            }
        }
        result
    }

    fn record_terminal(&self, action: &Action) {
        if let Some(id) = self.tracker.track_action_start(
            action.kind(),
            serde_json::to_value(action).unwrap_or_default(),
            None,
            self.operator.user_intent(),
        ) {
            self.tracker.track_action_result(&id, true, 0, None, None, None);
        }
    }

    /// Tracked `wait()` sleep. Returns false when cancelled mid-sleep.
    async fn wait_action(&self) -> bool {
        let started = Instant::now();
        let id = self.tracker.track_action_start(
            "wait",
            serde_json::json!({ "milliseconds": WAIT_ACTION_SLEEP.as_millis() as u64 }),
            None,
            self.operator.user_intent(),
        );
        let cancelled = tokio::select! {
            _ = self.control.cancel.cancelled() => true,
            _ = tokio::time::sleep(WAIT_ACTION_SLEEP) => false,
        };
        if let Some(id) = id {
            self.tracker.track_action_result(
                &id,
                !cancelled,
                started.elapsed().as_millis() as u64,
                cancelled.then(|| "cancelled".to_string()),
                None,
                None,
            );
        }
        !cancelled
    }

    /// Inter-iteration delay. Returns false when cancelled while sleeping.
    async fn interval_sleep(&self) -> bool {
        if self.config.loop_interval_ms == 0 {
            return true;
        }
        tokio::select! {
            _ = self.control.cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(self.config.loop_interval_ms)) => true,
        }
    }

    fn push_entry(&mut self, delta: &mut Vec<ConversationEntry>, entry: ConversationEntry) {
        if let Some(history) = &mut self.history {
            history.push(entry.clone());
            if let Err(e) = history.flush() {
                tracing::warn!(error = %e, "history flush failed");
            }
        }
        self.conversations.push(entry.clone());
        delta.push(entry);
    }

    fn emit_data(&self, status: RunState, conversations: Vec<ConversationEntry>) {
        (self.on_data)(AgentUpdate { status, conversations });
    }

    fn fail(&mut self, error: &PilotError) {
        self.control.state.send_replace(RunState::Error);
        if !self.error_emitted {
            self.error_emitted = true;
            let cause = std::error::Error::source(error).map(|s| s.to_string());
            (self.on_error)(AgentError {
                status: RunState::Error,
                message: error.to_string(),
                cause,
            });
        }
    }
}

fn note_entry(message: impl Into<String>) -> ConversationEntry {
    ConversationEntry {
        role: "note".into(),
        content: Some(message.into()),
        thought: None,
        actions: None,
        screenshot_context: None,
        timestamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::agent::state::Box2;
    use crate::operator::types::ScreenshotContext;
    use crate::tracking::test_support::MemoryDelivery;
    use crate::tracking::types::TrackerConfig;

    fn test_context() -> ScreenshotContext {
        ScreenshotContext {
            logical_width: 1000,
            logical_height: 800,
            physical_width: 1000,
            physical_height: 800,
            scale_factor: 1.0,
            source_id: "mock".into(),
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum ExecBehavior {
        Succeed,
        FailRecoverable,
        FailUnrecoverable,
    }

    struct MockOperator {
        executed: Mutex<Vec<ExecuteParams>>,
        primary_fails: bool,
        fallback_available: bool,
        fallback_fails: bool,
        screenshot_delay: Duration,
        execute_delay: Duration,
        behavior: ExecBehavior,
        execute_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
        user_intent: Mutex<Option<String>>,
    }

    impl MockOperator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
                primary_fails: false,
                fallback_available: false,
                fallback_fails: false,
                screenshot_delay: Duration::ZERO,
                execute_delay: Duration::from_millis(5),
                behavior: ExecBehavior::Succeed,
                execute_hook: Mutex::new(None),
                user_intent: Mutex::new(None),
            })
        }

        fn executed(&self) -> Vec<ExecuteParams> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Operator for MockOperator {
        fn name(&self) -> &str {
            "mock"
        }

        async fn screenshot(&self) -> PilotResult<ScreenshotOutput> {
            if !self.screenshot_delay.is_zero() {
                tokio::time::sleep(self.screenshot_delay).await;
            }
            if self.primary_fails {
                return Err(PilotError::Capture("no capture source available".into()));
            }
            Ok(ScreenshotOutput { base64: "c2hvdA==".into(), context: test_context() })
        }

        fn has_capture_fallback(&self) -> bool {
            self.fallback_available
        }

        async fn fallback_screenshot(&self) -> PilotResult<ScreenshotOutput> {
            if self.fallback_fails {
                return Err(PilotError::Capture("no secondary display".into()));
            }
            Ok(ScreenshotOutput { base64: "c2hvdA==".into(), context: test_context() })
        }

        async fn execute(&self, params: ExecuteParams) -> PilotResult<ExecutionResult> {
            if !self.execute_delay.is_zero() {
                tokio::time::sleep(self.execute_delay).await;
            }
            self.executed.lock().unwrap().push(params.clone());
            if let Some(hook) = &*self.execute_hook.lock().unwrap() {
                hook();
            }
            match self.behavior {
                ExecBehavior::Succeed => Ok(ExecutionResult::ok()),
                ExecBehavior::FailRecoverable => {
                    Err(PilotError::execution(params.action.kind(), "element not interactable"))
                }
                ExecBehavior::FailUnrecoverable => Err(PilotError::Execution {
                    action: params.action.kind().to_string(),
                    message: "target surface disconnected".into(),
                    unrecoverable: true,
                }),
            }
        }

        fn set_user_intent(&self, intent: &str) {
            *self.user_intent.lock().unwrap() = Some(intent.to_string());
        }

        fn user_intent(&self) -> Option<String> {
            self.user_intent.lock().unwrap().clone()
        }
    }

    struct ScriptedPredictor {
        responses: Mutex<VecDeque<PredictionResponse>>,
        fail_all: bool,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedPredictor {
        fn new(responses: Vec<PredictionResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                fail_all: false,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                fail_all: true,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Predictor for ScriptedPredictor {
        async fn predict(&self, _request: PredictionRequest) -> PilotResult<PredictionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_all {
                return Err(PilotError::Prediction("model unreachable".into()));
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| PilotError::Prediction("script exhausted".into()))
        }
    }

    fn click_response() -> PredictionResponse {
        PredictionResponse {
            actions: vec![Action::Click { start_box: Box2::new(0.1, 0.1, 0.2, 0.2) }],
            thought: Some("clicking the settings icon".into()),
            raw: "Thought: clicking the settings icon\nAction: click(start_box='[0.1,0.1,0.2,0.2]')"
                .into(),
            factors: None,
        }
    }

    fn finished_response() -> PredictionResponse {
        PredictionResponse {
            actions: vec![Action::Finished { content: None }],
            thought: None,
            raw: "Action: finished()".into(),
            factors: None,
        }
    }

    fn multi_click_response(n: usize) -> PredictionResponse {
        PredictionResponse {
            actions: (0..n)
                .map(|_| Action::Click { start_box: Box2::new(0.4, 0.4, 0.6, 0.6) })
                .collect(),
            thought: None,
            raw: "Action: click(...)".into(),
            factors: None,
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            max_loop_count: 5,
            loop_interval_ms: 0,
            retry: RetryLimits { model: 1, screenshot: 1, execute: 1 },
        }
    }

    fn test_tracker() -> (ActionTracker, Arc<MemoryDelivery>) {
        let delivery = MemoryDelivery::new(true);
        let config = TrackerConfig {
            enabled: true,
            flush_interval_ms: 3_600_000,
            ..TrackerConfig::default()
        };
        (ActionTracker::with_delivery(config, delivery.clone()), delivery)
    }

    type Observed = (Arc<Mutex<Vec<AgentUpdate>>>, Arc<Mutex<Vec<AgentError>>>);

    fn build(
        operator: Arc<MockOperator>,
        predictor: Arc<ScriptedPredictor>,
        tracker: ActionTracker,
        config: AgentConfig,
    ) -> (AgentController, Observed) {
        let updates: Arc<Mutex<Vec<AgentUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<AgentError>>> = Arc::new(Mutex::new(Vec::new()));
        let updates_cb = updates.clone();
        let errors_cb = errors.clone();
        let controller = AgentController::new(
            config,
            operator,
            predictor,
            tracker,
            Box::new(move |update| updates_cb.lock().unwrap().push(update)),
            Box::new(move |error| errors_cb.lock().unwrap().push(error)),
        );
        (controller, (updates, errors))
    }

    #[tokio::test]
    async fn click_scenario_resolves_center_and_records_tracking() {
        let operator = MockOperator::new();
        operator.set_user_intent("open settings");
        let predictor = ScriptedPredictor::new(vec![click_response(), finished_response()]);
        let (tracker, delivery) = test_tracker();
        let (mut controller, (updates, errors)) =
            build(operator.clone(), predictor.clone(), tracker.clone(), test_config());

        controller
            .run("open settings", Vec::new(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(controller.state(), RunState::Finished);
        assert!(errors.lock().unwrap().is_empty());

        // box [0.1,0.1,0.2,0.2] on 1000x800: each axis scales by its own
        // physical dimension
        let executed = operator.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].start, Some(PixelPoint { x: 150, y: 120 }));

        let updates = updates.lock().unwrap();
        assert!(!updates.is_empty());
        assert_eq!(updates[0].status, RunState::Running);
        assert_eq!(updates.last().unwrap().status, RunState::Finished);

        tracker.drain_now().await;
        let tags = delivery.tags();
        assert!(tags.contains(&"session_start".to_string()));
        assert!(tags.contains(&"start:click".to_string()));
        assert!(tags.contains(&"result:true".to_string()));
        assert_eq!(tags.last().unwrap(), "session_end");

        let actions = delivery.actions.lock().unwrap();
        assert_eq!(actions[0].action_type, "click");
        assert_eq!(actions[0].user_intent.as_deref(), Some("open settings"));
        let results = delivery.results.lock().unwrap();
        assert!(results[0].success);
        assert!(results[0].execution_time_ms > 0);
    }

    #[tokio::test]
    async fn finished_prediction_ends_run_without_further_calls() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::new(vec![finished_response()]);
        let (mut controller, (_, errors)) = build(
            operator.clone(),
            predictor.clone(),
            ActionTracker::disabled(),
            test_config(),
        );

        controller.run("do a thing", Vec::new(), HashMap::new()).await.unwrap();

        assert_eq!(controller.state(), RunState::Finished);
        assert_eq!(predictor.calls(), 1);
        assert!(operator.executed().is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_instructions_fail_fast_before_any_io() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::new(vec![]);
        let (mut controller, (_, errors)) = build(
            operator.clone(),
            predictor.clone(),
            ActionTracker::disabled(),
            test_config(),
        );

        let result = controller.run("   ", Vec::new(), HashMap::new()).await;
        assert!(matches!(result, Err(PilotError::InvalidInput(_))));
        assert_eq!(controller.state(), RunState::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(predictor.calls(), 0);
        assert!(operator.executed().is_empty());
    }

    #[tokio::test]
    async fn controller_refuses_second_run() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::new(vec![finished_response()]);
        let (mut controller, _) = build(
            operator,
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();
        let again = controller.run("task", Vec::new(), HashMap::new()).await;
        assert!(matches!(again, Err(PilotError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn capture_failure_without_fallback_is_fatal_and_untracked() {
        let mut operator = MockOperator::new();
        Arc::get_mut(&mut operator).unwrap().primary_fails = true;
        let predictor = ScriptedPredictor::new(vec![]);
        let (tracker, delivery) = test_tracker();
        let (mut controller, (_, errors)) =
            build(operator, predictor.clone(), tracker.clone(), test_config());

        let result = controller.run("task", Vec::new(), HashMap::new()).await;
        assert!(matches!(result, Err(PilotError::Capture(_))));
        assert_eq!(controller.state(), RunState::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(predictor.calls(), 0);

        // the action never got attempted, so the sink saw no start record
        tracker.drain_now().await;
        assert!(delivery.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn capture_fallback_keeps_the_run_alive() {
        let mut operator = MockOperator::new();
        {
            let op = Arc::get_mut(&mut operator).unwrap();
            op.primary_fails = true;
            op.fallback_available = true;
        }
        let predictor = ScriptedPredictor::new(vec![finished_response()]);
        let (mut controller, (_, errors)) = build(
            operator,
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();
        assert_eq!(controller.state(), RunState::Finished);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn capture_skip_degrades_until_loop_bound() {
        let mut operator = MockOperator::new();
        {
            let op = Arc::get_mut(&mut operator).unwrap();
            op.primary_fails = true;
            op.fallback_available = true;
            op.fallback_fails = true;
        }
        let predictor = ScriptedPredictor::new(vec![]);
        let (mut controller, (updates, errors)) = build(
            operator,
            predictor.clone(),
            ActionTracker::disabled(),
            test_config(),
        );

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();

        // every iteration skipped with a warning, then the loop bound ends
        // the run without an error
        assert_eq!(controller.state(), RunState::Finished);
        assert_eq!(predictor.calls(), 0);
        assert!(errors.lock().unwrap().is_empty());
        let skip_notes = updates
            .lock()
            .unwrap()
            .iter()
            .flat_map(|u| u.conversations.iter())
            .filter(|e| e.role == "note")
            .count();
        assert_eq!(skip_notes, 5);
    }

    #[tokio::test]
    async fn execution_failure_is_reported_and_loop_continues() {
        let mut operator = MockOperator::new();
        Arc::get_mut(&mut operator).unwrap().behavior = ExecBehavior::FailRecoverable;
        let predictor = ScriptedPredictor::new(vec![click_response(), finished_response()]);
        let (mut controller, (updates, errors)) = build(
            operator.clone(),
            predictor.clone(),
            ActionTracker::disabled(),
            test_config(),
        );

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();

        assert_eq!(controller.state(), RunState::Finished);
        assert!(errors.lock().unwrap().is_empty());
        // execute retried once (limit 1), then the loop moved on
        assert_eq!(operator.executed().len(), 2);
        assert_eq!(predictor.calls(), 2);
        let failure_noted = updates
            .lock()
            .unwrap()
            .iter()
            .flat_map(|u| u.conversations.iter())
            .any(|e| e.role == "note" && e.content.as_deref().unwrap_or("").contains("failed"));
        assert!(failure_noted);
    }

    #[tokio::test]
    async fn unrecoverable_execution_failure_is_fatal() {
        let mut operator = MockOperator::new();
        Arc::get_mut(&mut operator).unwrap().behavior = ExecBehavior::FailUnrecoverable;
        let predictor = ScriptedPredictor::new(vec![click_response()]);
        let (mut controller, (_, errors)) = build(
            operator,
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );

        let result = controller.run("task", Vec::new(), HashMap::new()).await;
        assert!(matches!(result, Err(PilotError::Execution { unrecoverable: true, .. })));
        assert_eq!(controller.state(), RunState::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn predictor_failure_exhausts_retries_then_errors_once() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::failing();
        let (mut controller, (_, errors)) = build(
            operator,
            predictor.clone(),
            ActionTracker::disabled(),
            test_config(),
        );

        let result = controller.run("task", Vec::new(), HashMap::new()).await;
        assert!(matches!(result, Err(PilotError::Prediction(_))));
        assert_eq!(controller.state(), RunState::Error);
        // model retry limit 1: two attempts total
        assert_eq!(predictor.calls(), 2);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_unblocks_a_long_capture_promptly() {
        let mut operator = MockOperator::new();
        Arc::get_mut(&mut operator).unwrap().screenshot_delay = Duration::from_secs(30);
        let predictor = ScriptedPredictor::new(vec![]);
        let (mut controller, _) = build(
            operator.clone(),
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );
        let handle = controller.handle();

        let task = tokio::spawn(async move {
            let _ = controller.run("task", Vec::new(), HashMap::new()).await;
            controller.state()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();

        let state = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stop must unblock the capture")
            .unwrap();
        assert_eq!(state, RunState::Stopped);
        assert!(operator.executed().is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_are_rejected_outside_their_states() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::new(vec![finished_response()]);
        let (mut controller, _) = build(
            operator,
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );
        let handle = controller.handle();

        handle.pause();
        assert_eq!(handle.state(), RunState::Idle);
        handle.resume();
        assert_eq!(handle.state(), RunState::Idle);

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();
        handle.pause();
        assert_eq!(handle.state(), RunState::Finished);
    }

    #[tokio::test]
    async fn stop_from_paused_reaches_stopped_without_dispatch() {
        let operator = MockOperator::new();
        let mut predictor = ScriptedPredictor::new(vec![click_response()]);
        Arc::get_mut(&mut predictor).unwrap().delay = Duration::from_millis(200);
        let (mut controller, _) = build(
            operator.clone(),
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );
        let handle = controller.handle();

        let task = tokio::spawn(async move {
            let _ = controller.run("task", Vec::new(), HashMap::new()).await;
            controller.state()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.pause();
        assert_eq!(handle.state(), RunState::Paused);

        // prediction lands while paused; the loop must hold at the gate
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(operator.executed().is_empty());

        handle.stop();
        let state = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, RunState::Stopped);
        assert!(operator.executed().is_empty());
    }

    #[tokio::test]
    async fn pause_then_resume_continues_at_the_boundary() {
        let operator = MockOperator::new();
        let mut predictor = ScriptedPredictor::new(vec![click_response(), finished_response()]);
        Arc::get_mut(&mut predictor).unwrap().delay = Duration::from_millis(100);
        let (mut controller, _) = build(
            operator.clone(),
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );
        let handle = controller.handle();

        let task = tokio::spawn(async move {
            let _ = controller.run("task", Vec::new(), HashMap::new()).await;
            controller.state()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.pause();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(operator.executed().is_empty());

        handle.resume();
        let state = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, RunState::Finished);
        assert_eq!(operator.executed().len(), 1);
    }

    #[tokio::test]
    async fn stop_during_dispatch_prevents_queued_actions() {
        let operator = MockOperator::new();
        let predictor = ScriptedPredictor::new(vec![multi_click_response(3)]);
        let (mut controller, _) = build(
            operator.clone(),
            predictor,
            ActionTracker::disabled(),
            test_config(),
        );
        let handle = controller.handle();
        *operator.execute_hook.lock().unwrap() = Some(Box::new({
            let handle = handle.clone();
            move || handle.stop()
        }));

        controller.run("task", Vec::new(), HashMap::new()).await.unwrap();

        // the in-flight click completed; the two queued ones never ran
        assert_eq!(operator.executed().len(), 1);
        assert_eq!(controller.state(), RunState::Stopped);
    }
}
