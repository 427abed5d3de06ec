use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub role: Role,
    pub content: String,
    /// RFC 3339 timestamp as sent by the backend.
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    #[serde(default)]
    pub paragraph_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Citation {
    #[serde(default)]
    pub paragraph_id: Option<i64>,
    #[serde(default)]
    pub chapter_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

/// Body of the streaming chat POST.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreateSessionRequest {
    pub paragraph_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SelfAssessmentRating {
    Understood,
    Questions,
    Difficult,
}

impl SelfAssessmentRating {
    pub fn is_understood(self) -> bool {
        matches!(self, Self::Understood)
    }
}

/// Step names persisted by the progress endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParagraphStep {
    Content,
    Practice,
    Summary,
    Completed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StepUpdateRequest {
    pub step: ParagraphStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SelfAssessmentRequest {
    pub rating: SelfAssessmentRating,
    /// Percentage of correct practice answers, `null` when the paragraph has none.
    pub practice_score: Option<f64>,
    pub time_spent: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ParagraphProgress {
    pub paragraph_id: i64,
    pub current_step: ParagraphStep,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub time_spent: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SelfAssessmentResult {
    pub id: i64,
    pub rating: SelfAssessmentRating,
    #[serde(default)]
    pub practice_score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EmbeddedQuestion {
    pub id: i64,
    pub prompt: String,
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnswerRequest {
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnswerResult {
    pub is_correct: bool,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
