use serde::{Deserialize, Serialize};

/// One learning-flow transition, emitted after the phase actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowTransitionLog {
    pub paragraph_id: i64,
    /// Phase names in their wire spelling, e.g. "assessment".
    pub from: String,
    pub to: String,
    /// Assessment round at the time of the transition (0 = first assessment).
    pub round: u32,
    /// Persisted step, if the transition wrote one.
    pub step: Option<String>,
    pub time_spent: Option<u64>,
}

impl FlowTransitionLog {
    pub fn new(paragraph_id: i64, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            paragraph_id,
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    pub fn round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    pub fn step_opt(mut self, step: Option<&str>) -> Self {
        self.step = step.map(|s| s.to_string());
        self
    }

    pub fn time_spent_opt(mut self, secs: Option<u64>) -> Self {
        self.time_spent = secs;
        self
    }
}

/// Summary of one chat stream consumption.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamLog {
    pub session_id: Option<String>,
    pub deltas: u64,
    pub delta_bytes: u64,
    pub citations: u32,
    /// "completed", "failed", "ended" or "transport_error".
    pub outcome: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}
