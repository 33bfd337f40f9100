//! Session telemetry. Every session logs through `tracing` under a
//! `stream_session` span; a `SessionTrace` summary additionally goes to the
//! process-wide sink, if one was installed with `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Receives one `SessionTrace` per finished session, on the session's task.
/// Must not block or panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: SessionTrace);
}

/// Writes each summary as an `info` event on the `doodlepad::session` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, t: SessionTrace) {
        tracing::info!(
            target: "doodlepad::session",
            session_id = t.session_id,
            kind = t.kind.as_deref().unwrap_or("-"),
            mode = t.mode.as_deref().unwrap_or("-"),
            outcome = t.outcome.as_deref().unwrap_or("-"),
            events = t.events_folded,
            images = t.images_received,
            dropped = t.frames_dropped,
            latency_ms = t.latency_ms,
            failure_code = t.failure_code.as_deref(),
            "session summary"
        );
    }
}

static SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

/// Install the process-wide sink. Only the first call wins; returns whether
/// this one did.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    SINK.set(sink).is_ok()
}

#[cfg(test)]
thread_local! {
    // Tests share the global sink; only threads that opt in emit.
    static CAPTURE_ON_THIS_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

fn active_sink() -> Option<&'static Arc<dyn TelemetrySink>> {
    #[cfg(test)]
    if !CAPTURE_ON_THIS_THREAD.with(|c| c.get()) {
        return None;
    }
    SINK.get()
}

#[inline]
pub(crate) fn emit(trace: SessionTrace) {
    if let Some(sink) = active_sink() {
        sink.record(trace);
    }
}

/// Let sessions run on the current thread reach the installed sink.
#[cfg(test)]
pub fn test_set_capture_enabled(enabled: bool) {
    CAPTURE_ON_THIS_THREAD.with(|c| c.set(enabled));
}
