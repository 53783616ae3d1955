use std::fmt;
use std::sync::Arc;

use tracing::debug;

/// Sink for the named events emitted while routing a request or maintaining
/// an ip source.
pub trait Recorder: Send + Sync {
    fn record_event(&self, message: &str);

    fn record_error(&self, message: &str, cause: &dyn fmt::Display);
}

pub type SharedRecorder = Arc<dyn Recorder>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session,
    Source,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Session => "session",
            Scope::Source => "source",
        }
    }
}

/// Forwards every event to `tracing` at debug level, tagged with the scope
/// and the key of the owning session or source.
pub struct TracingRecorder {
    scope: Scope,
    key: String,
}

impl TracingRecorder {
    pub fn shared(scope: Scope, key: impl Into<String>) -> SharedRecorder {
        Arc::new(Self {
            scope,
            key: key.into(),
        })
    }
}

impl Recorder for TracingRecorder {
    fn record_event(&self, message: &str) {
        debug!(scope = self.scope.as_str(), key = %self.key, "{}", message);
    }

    fn record_error(&self, message: &str, cause: &dyn fmt::Display) {
        debug!(
            scope = self.scope.as_str(),
            key = %self.key,
            error = %cause,
            "{}",
            message
        );
    }
}

struct NopRecorder;

impl Recorder for NopRecorder {
    fn record_event(&self, _message: &str) {}

    fn record_error(&self, _message: &str, _cause: &dyn fmt::Display) {}
}

/// Recorder that discards everything, used by background maintenance tasks.
pub fn nop() -> SharedRecorder {
    Arc::new(NopRecorder)
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryRecorder;
    use super::*;

    #[test]
    fn memory_recorder_keeps_events_and_causes() {
        let recorder = MemoryRecorder::shared();
        recorder.record_event("allocate ip");
        recorder.record_error("handshake failed", &"timeout");

        assert_eq!(
            recorder.events(),
            vec!["allocate ip".to_string(), "handshake failed: timeout".to_string()]
        );
    }

    #[test]
    fn nop_recorder_accepts_everything() {
        let recorder = nop();
        recorder.record_event("ignored");
        recorder.record_error("ignored", &"cause");
    }
}
