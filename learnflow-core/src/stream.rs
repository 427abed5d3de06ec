//! Chat streaming primitives.
//!
//! Contract:
//! - A response carries at most one `UserMessage`, then 0..n `Delta` events.
//! - The stream **must** terminate with exactly one terminal event: `Done` or `Error`.
//! - After a terminal event, nothing further is dispatched even if bytes remain.
//! - Concatenating every `Delta` in arrival order yields the `Done` message content.
//!
//! Only lines starting with the literal `data: ` prefix are considered. A line
//! whose payload is not a valid event is skipped silently; keep-alive noise and
//! partial records are expected on this channel.

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::http_client::SseStream;
use crate::model::{ChatMessage, Citation, SessionSummary};
use crate::telemetry::{self, StreamLog};

const DATA_PREFIX: &str = "data: ";

/// One decoded record of the chat stream, discriminated by its `type` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Echo of the persisted user message.
    UserMessage { message: ChatMessage },
    /// Next fragment of the assistant reply (not cumulative).
    Delta { content: String },
    /// Final assistant message; ends the stream.
    Done {
        message: ChatMessage,
        session: SessionSummary,
        #[serde(default)]
        citations: Vec<Citation>,
    },
    /// Server-side failure; ends the stream.
    Error { error: String },
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Convenience accessor for `Delta` contents.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::Delta { content } => Some(content.as_str()),
            _ => None,
        }
    }
}

/// Boxed stream of decoded events; ends right after the first terminal event.
pub type BoxStreamEv = futures::stream::BoxStream<'static, CoreResult<StreamEvent>>;

/// Decode one SSE line. Returns `None` for anything that is not a well-formed event record.
pub fn parse_data_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(ev) => Some(ev),
        Err(e) => {
            tracing::debug!(error = %e, len = payload.len(), "skipping undecodable stream record");
            None
        }
    }
}

/// Turn a line stream into an event stream. The underlying line stream (and
/// with it the response body) is dropped as soon as a terminal event is seen.
pub fn event_stream(lines: SseStream) -> BoxStreamEv {
    futures::stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            match lines.next().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), None)),
                Some(Ok(line)) => {
                    if let Some(ev) = parse_data_line(&line.line) {
                        let rest = if ev.is_terminal() { None } else { Some(lines) };
                        return Some((Ok(ev), rest));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Caller-supplied callbacks driven by [`consume_events`].
pub trait StreamHandler: Send {
    fn on_user_message(&mut self, _message: ChatMessage) {}
    /// Receives only the new fragment; accumulation is up to the handler.
    fn on_delta(&mut self, fragment: &str);
    fn on_complete(&mut self, message: ChatMessage, session: SessionSummary, citations: Vec<Citation>);
    fn on_error(&mut self, error: String);
}

/// How a consumption loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `done` event was dispatched.
    Completed,
    /// An `error` event was dispatched, or the request was rejected up front.
    Failed,
    /// The body ended without any terminal event.
    Ended,
}

/// Drive `handler` from a line stream until a terminal event or end of body.
///
/// Transport errors after streaming began are returned as `Err` and are not
/// routed through `on_error`.
pub async fn consume_events<H: StreamHandler + ?Sized>(
    lines: SseStream,
    handler: &mut H,
) -> CoreResult<StreamOutcome> {
    let mut events = event_stream(lines);
    let mut log = StreamLog::default();

    let outcome = loop {
        let ev = match events.next().await {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                log.error_kind = Some(e.kind().to_string());
                log.error_message = Some(e.to_string());
                log.outcome = Some("transport_error".into());
                telemetry::emit_stream(log);
                return Err(e);
            }
            None => break StreamOutcome::Ended,
        };
        match ev {
            StreamEvent::UserMessage { message } => handler.on_user_message(message),
            StreamEvent::Delta { content } => {
                log.deltas += 1;
                log.delta_bytes += content.len() as u64;
                handler.on_delta(&content);
            }
            StreamEvent::Done {
                message,
                session,
                citations,
            } => {
                log.session_id = Some(session.id.clone());
                log.citations = citations.len() as u32;
                handler.on_complete(message, session, citations);
                break StreamOutcome::Completed;
            }
            StreamEvent::Error { error } => {
                log.error_kind = Some("server".into());
                log.error_message = Some(error.clone());
                handler.on_error(error);
                break StreamOutcome::Failed;
            }
        }
    };

    if outcome == StreamOutcome::Ended {
        tracing::warn!(deltas = log.deltas, "chat stream ended without a terminal event");
    }
    log.outcome = Some(format!("{outcome:?}").to_lowercase());
    telemetry::emit_stream(log);
    Ok(outcome)
}

/// Handler that keeps everything it receives; handy for non-interactive callers.
#[derive(Debug, Default, Clone)]
pub struct DeltaAccumulator {
    pub user_message: Option<ChatMessage>,
    pub text: String,
    pub deltas: usize,
    pub final_message: Option<ChatMessage>,
    pub session: Option<SessionSummary>,
    pub citations: Vec<Citation>,
    pub error: Option<String>,
}

impl DeltaAccumulator {
    /// True once `done` arrived and the streamed fragments add up to the final content.
    pub fn matches_final(&self) -> bool {
        self.final_message
            .as_ref()
            .is_some_and(|m| m.content == self.text)
    }
}

impl StreamHandler for DeltaAccumulator {
    fn on_user_message(&mut self, message: ChatMessage) {
        self.user_message = Some(message);
    }

    fn on_delta(&mut self, fragment: &str) {
        self.deltas += 1;
        self.text.push_str(fragment);
    }

    fn on_complete(&mut self, message: ChatMessage, session: SessionSummary, citations: Vec<Citation>) {
        self.final_message = Some(message);
        self.session = Some(session);
        self.citations = citations;
    }

    fn on_error(&mut self, error: String) {
        self.error = Some(error);
    }
}
