use async_trait::async_trait;

/// Boundary to the frontend event transport.
///
/// The transport itself (Decky's event channel) lives outside this crate;
/// components only ever need "push a status string" or "push a named payload".
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish a coarse status change ("enabled", "disabled", "error", ...).
    async fn emit_status(&self, status: &str);

    /// Publish a named event with a structured payload.
    async fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Sink used when no frontend is attached; events land in the log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit_status(&self, status: &str) {
        log::info!("status: {}", status);
    }

    async fn emit(&self, event: &str, payload: serde_json::Value) {
        log::debug!("event {}: {}", event, payload);
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records everything emitted, for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub statuses: Mutex<Vec<String>>,
        pub events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit_status(&self, status: &str) {
            self.statuses.lock().unwrap().push(status.to_string());
        }

        async fn emit(&self, event: &str, payload: serde_json::Value) {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }
    }
}
