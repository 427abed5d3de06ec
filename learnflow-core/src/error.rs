use thiserror::Error;

use crate::flow::FlowError;

/// Core error type for learnflow.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum EduError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited by backend")]
    RateLimited { retry_after: Option<u64> },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {status} {message}")]
    Http { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream idle for {idle_ms}ms without data")]
    StreamIdle { idle_ms: u64 },

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EduError {
    /// Short stable label for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Http { .. } => "http",
            Self::Decode(_) => "decode",
            Self::Stream(_) => "stream",
            Self::StreamIdle { .. } => "stream_idle",
            Self::Flow(_) => "flow",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, EduError>;
