use serde::{Deserialize, Serialize};

/// Summary of one finished stream session, handed to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionTrace {
    pub session_id: u64,

    /// "lesson", "presentation" or "worksheet".
    pub kind: Option<String>,

    /// "generate" or "edit".
    pub mode: Option<String>,

    /// Terminal state name: "completed", "failed" or "cancelled".
    pub outcome: Option<String>,

    pub events_folded: u64,
    pub frames_dropped: u64,
    pub images_received: u64,

    pub latency_ms: Option<u64>,

    /// Failure metadata, if the session failed.
    pub failure_kind: Option<String>,
    pub failure_code: Option<String>,
}

impl SessionTrace {
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(mode.to_string());
        self
    }

    pub fn outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }

    pub fn counts(mut self, events: u64, dropped: u64, images: u64) -> Self {
        self.events_folded = events;
        self.frames_dropped = dropped;
        self.images_received = images;
        self
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn failure_opt(mut self, kind: Option<&str>, code: Option<&str>) -> Self {
        self.failure_kind = kind.map(str::to_string);
        self.failure_code = code.map(str::to_string);
        self
    }
}
