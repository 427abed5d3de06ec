use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiCfg {
    /// Base URL of the learning backend, without a trailing slash.
    pub base_url: String,
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for non-streaming requests in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Upper bound for a single buffered SSE line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// A stream that produces no bytes for this long is abandoned.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProgressCfg {
    /// Cap applied to `time_spent` on every progress/assessment call.
    #[serde(default = "default_max_time_spent_secs")]
    pub max_time_spent_secs: u64,
}

impl Default for ProgressCfg {
    fn default() -> Self {
        Self {
            max_time_spent_secs: default_max_time_spent_secs(),
        }
    }
}

fn default_max_time_spent_secs() -> u64 {
    3_600
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LimitsCfg {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_max_message_chars() -> usize {
    4_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct AuthCfg {
    /// JSON file holding the access/refresh token pair. None keeps tokens in memory only.
    #[serde(default)]
    pub token_file: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub progress: ProgressCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
    #[serde(default)]
    pub auth: AuthCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::EduError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::EduError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::EduError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::EduError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::EduError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| crate::error::EduError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::error::CoreResult<()> {
        use crate::error::EduError;
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(EduError::Validation(format!(
                "api.base_url must be an http(s) URL, got '{}'",
                self.api.base_url
            )));
        }
        if self.stream.max_line_bytes == 0 {
            return Err(EduError::Validation(
                "stream.max_line_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api.base_url.trim_end_matches('/')
    }
}
