use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing_futures::Instrument;

use crate::auth::AuthSessionManager;
use crate::config::{Config, LimitsCfg};
use crate::error::{CoreResult, EduError};
use crate::flow::LearningBackend;
use crate::http_client::{HttpClient, RequestCtx, SseResponse};
use crate::model::{
    AnswerRequest, AnswerResult, CreateSessionRequest, EmbeddedQuestion, ParagraphProgress,
    SelfAssessmentRequest, SelfAssessmentResult, SendMessageRequest, SessionSummary,
    StepUpdateRequest,
};
use crate::stream::{StreamHandler, StreamOutcome, consume_events};
use crate::validate;

/// Authenticated client for the learning portal backend.
#[derive(Debug, Clone)]
pub struct PortalClient {
    http: HttpClient,
    base: String,
    auth: Arc<AuthSessionManager>,
    limits: LimitsCfg,
}

impl PortalClient {
    pub fn new(
        http: HttpClient,
        base: impl Into<String>,
        auth: Arc<AuthSessionManager>,
        limits: LimitsCfg,
    ) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self {
            http,
            base,
            auth,
            limits,
        }
    }

    pub fn from_config(cfg: &Config, auth: Arc<AuthSessionManager>) -> CoreResult<Self> {
        let http = HttpClient::from_config(&cfg.http, &cfg.stream)?;
        Ok(Self::new(http, cfg.base_url(), auth, cfg.limits.clone()))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str, auth: Arc<AuthSessionManager>) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            server_base,
            auth,
            LimitsCfg::default(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    /// Run `call` with the current bearer token; on 401 refresh once and replay.
    async fn authorized<R, F, Fut>(&self, call: F) -> CoreResult<R>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = CoreResult<R>>,
    {
        let cred = self.auth.credential();
        let generation = cred.as_ref().map(|c| c.generation);
        let first = call(cred.map(|c| c.bearer().to_string())).await;
        match (first, generation) {
            (Err(EduError::Unauthorized(msg)), Some(generation)) => {
                tracing::debug!(reason = %msg, "401 received; refreshing session");
                let fresh = self.auth.refresh_after_unauthorized(generation).await?;
                call(Some(fresh.bearer().to_string())).await
            }
            (other, _) => other,
        }
    }

    pub async fn update_step(
        &self,
        paragraph_id: i64,
        req: &StepUpdateRequest,
    ) -> CoreResult<ParagraphProgress> {
        let url = &self.url(&format!("/paragraphs/{paragraph_id}/progress"));
        self.authorized(|bearer| async move {
            let ctx = RequestCtx {
                bearer: bearer.as_deref(),
                ..Default::default()
            };
            self.http.post_json(url, req, &[], &ctx).await
        })
        .instrument(tracing::info_span!("portal.update_step", paragraph.id = paragraph_id))
        .await
    }

    pub async fn submit_self_assessment(
        &self,
        paragraph_id: i64,
        req: &SelfAssessmentRequest,
    ) -> CoreResult<SelfAssessmentResult> {
        let url = &self.url(&format!("/paragraphs/{paragraph_id}/self-assessment"));
        self.authorized(|bearer| async move {
            let ctx = RequestCtx {
                bearer: bearer.as_deref(),
                ..Default::default()
            };
            self.http.post_json(url, req, &[], &ctx).await
        })
        .instrument(tracing::info_span!(
            "portal.self_assessment",
            paragraph.id = paragraph_id
        ))
        .await
    }

    pub async fn list_questions(&self, paragraph_id: i64) -> CoreResult<Vec<EmbeddedQuestion>> {
        let url = &self.url(&format!("/paragraphs/{paragraph_id}/questions"));
        self.authorized(|bearer| async move {
            let ctx = RequestCtx {
                bearer: bearer.as_deref(),
                ..Default::default()
            };
            self.http.get_json(url, &[], &ctx).await
        })
        .instrument(tracing::info_span!("portal.list_questions", paragraph.id = paragraph_id))
        .await
    }

    pub async fn answer_question(&self, question_id: i64, answer: &str) -> CoreResult<AnswerResult> {
        let body = &AnswerRequest {
            answer: validate::answer(answer)?,
        };
        let url = &self.url(&format!("/questions/{question_id}/answer"));
        self.authorized(|bearer| async move {
            let ctx = RequestCtx {
                bearer: bearer.as_deref(),
                ..Default::default()
            };
            self.http.post_json(url, body, &[], &ctx).await
        })
        .instrument(tracing::info_span!("portal.answer_question", question.id = question_id))
        .await
    }

    pub async fn create_chat_session(&self, paragraph_id: i64) -> CoreResult<SessionSummary> {
        let body = &CreateSessionRequest {
            paragraph_id,
            title: None,
        };
        let url = &self.url("/chat/sessions");
        self.authorized(|bearer| async move {
            let ctx = RequestCtx {
                bearer: bearer.as_deref(),
                ..Default::default()
            };
            self.http.post_json(url, body, &[], &ctx).await
        })
        .instrument(tracing::info_span!("portal.create_session", paragraph.id = paragraph_id))
        .await
    }

    /// Send `content` to a chat session and stream the reply into `handler`.
    ///
    /// A non-2xx response is reported through `handler.on_error` as
    /// `"<status>: <body>"` and yields [`StreamOutcome::Failed`]; a 401 is first
    /// retried once with a refreshed token. Read failures after streaming began
    /// are returned as `Err`.
    pub async fn stream_chat_message<H: StreamHandler + ?Sized>(
        &self,
        session_id: &str,
        content: &str,
        handler: &mut H,
    ) -> CoreResult<StreamOutcome> {
        let session_id = validate::session_id(session_id)?;
        let body = SendMessageRequest {
            content: validate::chat_content(content, &self.limits)?,
        };
        let url = self.url(&format!("/chat/sessions/{session_id}/messages/stream"));
        let span = tracing::info_span!("portal.chat_stream", chat.session_id = session_id);

        async {
            let cred = self.auth.credential();
            let ctx = RequestCtx {
                bearer: cred.as_ref().map(|c| c.bearer()),
                ..Default::default()
            };
            let mut resp = self.http.post_sse(&url, &body, &[], &ctx).await?;

            let unauthorized = matches!(resp, SseResponse::Rejected { status: 401, .. });
            if unauthorized && let Some(cred) = &cred {
                let fresh = self.auth.refresh_after_unauthorized(cred.generation).await?;
                let ctx = RequestCtx {
                    bearer: Some(fresh.bearer()),
                    ..Default::default()
                };
                resp = self.http.post_sse(&url, &body, &[], &ctx).await?;
            }

            match resp {
                SseResponse::Open(lines) => consume_events(lines, handler).await,
                SseResponse::Rejected { status, body } => {
                    handler.on_error(format!("{status}: {body}"));
                    Ok(StreamOutcome::Failed)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl LearningBackend for PortalClient {
    async fn update_step(
        &self,
        paragraph_id: i64,
        req: StepUpdateRequest,
    ) -> CoreResult<ParagraphProgress> {
        PortalClient::update_step(self, paragraph_id, &req).await
    }

    async fn submit_self_assessment(
        &self,
        paragraph_id: i64,
        req: SelfAssessmentRequest,
    ) -> CoreResult<SelfAssessmentResult> {
        PortalClient::submit_self_assessment(self, paragraph_id, &req).await
    }

    async fn answer_question(&self, question_id: i64, answer: &str) -> CoreResult<AnswerResult> {
        PortalClient::answer_question(self, question_id, answer).await
    }
}
