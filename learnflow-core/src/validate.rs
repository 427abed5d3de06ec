//! Input checks applied before anything reaches the network layer.

use unicode_normalization::UnicodeNormalization;

use crate::config::LimitsCfg;
use crate::error::{CoreResult, EduError};

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + CRLF -> LF, then trim whitespace and any BOM
    let mut t = s.nfc().collect::<String>();
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}')
        .to_string()
}

/// Normalize a chat message and enforce the configured length cap (in chars).
pub fn chat_content(raw: &str, limits: &LimitsCfg) -> CoreResult<String> {
    let content = clean_text(raw);
    if content.is_empty() {
        return Err(EduError::Validation("message must not be empty".into()));
    }
    let chars = content.chars().count();
    if chars > limits.max_message_chars {
        return Err(EduError::Validation(format!(
            "message is {chars} characters, limit is {}",
            limits.max_message_chars
        )));
    }
    Ok(content)
}

/// Normalize a practice answer; blank answers are rejected.
pub fn answer(raw: &str) -> CoreResult<String> {
    let a = clean_text(raw);
    if a.is_empty() {
        return Err(EduError::Validation("answer must not be empty".into()));
    }
    Ok(a)
}

pub fn session_id(id: &str) -> CoreResult<&str> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(id)
    } else {
        Err(EduError::Validation(format!("invalid chat session id '{id}'")))
    }
}
