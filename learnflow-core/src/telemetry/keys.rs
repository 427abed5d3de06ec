/// Span/Log attribute keys for portal calls and flow transitions.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_PARAGRAPH_ID: &str = "paragraph.id";
pub const KEY_SESSION_ID: &str = "chat.session_id";
pub const KEY_PHASE_FROM: &str = "flow.from";
pub const KEY_PHASE_TO: &str = "flow.to";
pub const KEY_ROUND: &str = "flow.round";
pub const KEY_STEP: &str = "progress.step";
pub const KEY_TIME_SPENT: &str = "progress.time_spent";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
