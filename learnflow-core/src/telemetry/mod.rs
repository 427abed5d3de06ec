//! Telemetry hooks for flow transitions and chat streams.
//! By default, nothing is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive telemetry events.
///
/// Implementations must be thread-safe and should not panic; `record_*` may be
/// called from any runtime thread.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_transition(&self, log: FlowTransitionLog);

    fn record_stream(&self, _log: StreamLog) {}
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[inline]
fn enabled() -> bool {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return false;
        }
    }
    true
}

#[inline]
pub(crate) fn emit_transition(log: FlowTransitionLog) {
    tracing::info!(
        paragraph.id = log.paragraph_id,
        flow.from = %log.from,
        flow.to = %log.to,
        flow.round = log.round,
        "learning flow advanced"
    );
    if !enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_transition(log);
    }
}

#[inline]
pub(crate) fn emit_stream(log: StreamLog) {
    let session = log.session_id.as_deref().unwrap_or_default();
    match (&log.error_kind, &log.error_message) {
        (None, None) => tracing::info!(
            chat.session_id = session,
            chat.deltas = log.deltas,
            "chat stream finished"
        ),
        (kind, message) => tracing::warn!(
            chat.session_id = session,
            chat.deltas = log.deltas,
            error.kind = kind.as_deref().unwrap_or_default(),
            error.message = message.as_deref().unwrap_or_default(),
            "chat stream failed"
        ),
    }
    if !enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_stream(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
