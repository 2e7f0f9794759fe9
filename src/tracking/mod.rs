pub mod client;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::errors::{PilotError, PilotResult};
    use crate::tracking::client::RecordDelivery;
    use crate::tracking::types::{ActionResultRecord, QueryRequest, Session, TrackedAction};

    /// In-memory recorder that can be switched unreachable.
    pub(crate) struct MemoryDelivery {
        pub reachable: AtomicBool,
        /// One tag per delivered record, in delivery order.
        pub tags: Mutex<Vec<String>>,
        pub actions: Mutex<Vec<TrackedAction>>,
        pub results: Mutex<Vec<ActionResultRecord>>,
    }

    impl MemoryDelivery {
        pub fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                reachable: AtomicBool::new(reachable),
                tags: Mutex::new(Vec::new()),
                actions: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
            })
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        pub fn tags(&self) -> Vec<String> {
            self.tags.lock().unwrap().clone()
        }

        fn record(&self, tag: String) -> PilotResult<()> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(PilotError::Tracking("recorder unreachable".into()));
            }
            self.tags.lock().unwrap().push(tag);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RecordDelivery for MemoryDelivery {
        async fn deliver_action(&self, action: &TrackedAction) -> PilotResult<()> {
            self.record(format!("start:{}", action.action_type))?;
            self.actions.lock().unwrap().push(action.clone());
            Ok(())
        }

        async fn deliver_result(&self, result: &ActionResultRecord) -> PilotResult<()> {
            self.record(format!("result:{}", result.success))?;
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }

        async fn start_session(&self, _session: &Session) -> PilotResult<()> {
            self.record("session_start".into())
        }

        async fn end_session(&self, _session_id: &str) -> PilotResult<()> {
            self.record("session_end".into())
        }

        async fn query(&self, _request: &QueryRequest) -> PilotResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn health_check(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }
}
