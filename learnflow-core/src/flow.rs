//! Paragraph learning flow.
//!
//! A student moves through one paragraph as
//! `reading → questions → assessment → (chat → reassessment)* → completed`.
//! The transition table lives in [`transition`]; [`FlowNavigator`] drives it
//! against a [`LearningBackend`] and only changes phase once the backing call
//! succeeded.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::error::CoreResult;
use crate::model::{
    AnswerResult, EmbeddedQuestion, ParagraphProgress, ParagraphStep, SelfAssessmentRating,
    SelfAssessmentRequest, SelfAssessmentResult, StepUpdateRequest,
};
use crate::telemetry::{self, FlowTransitionLog};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LearningFlowPhase {
    Reading,
    Questions,
    Assessment,
    Chat,
    Reassessment,
    Completed,
}

impl LearningFlowPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Questions => "questions",
            Self::Assessment => "assessment",
            Self::Chat => "chat",
            Self::Reassessment => "reassessment",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for LearningFlowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User actions that may move the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    FinishReading { has_questions: bool },
    LastQuestionAnswered,
    Rated(SelfAssessmentRating),
    ChatClosed,
}

impl Trigger {
    fn name(self) -> &'static str {
        match self {
            Self::FinishReading { .. } => "finish_reading",
            Self::LastQuestionAnswered => "last_question_answered",
            Self::Rated(_) => "rated",
            Self::ChatClosed => "chat_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenChat,
    IncrementRound,
    ShowCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: LearningFlowPhase,
    /// Step that must be persisted before the phase may change.
    pub persist: Option<ParagraphStep>,
    pub effect: Option<Effect>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("'{trigger}' is not allowed in phase {from}")]
    InvalidTransition {
        from: LearningFlowPhase,
        trigger: &'static str,
    },
    #[error("another action is still in flight")]
    Busy,
    #[error("paragraph was left while the request was in flight")]
    Stale,
    #[error("no paragraph is open")]
    NoParagraph,
    #[error("paragraph is not completed yet")]
    NotCompleted,
}

/// The transition table. Anything not listed is a guard violation.
pub fn transition(from: LearningFlowPhase, trigger: Trigger) -> Result<Transition, FlowError> {
    use LearningFlowPhase as P;
    let t = |to, persist, effect| Ok(Transition { to, persist, effect });
    match (from, trigger) {
        (P::Reading, Trigger::FinishReading { has_questions: true }) => {
            t(P::Questions, Some(ParagraphStep::Practice), None)
        }
        (P::Reading, Trigger::FinishReading { has_questions: false }) => {
            t(P::Assessment, Some(ParagraphStep::Summary), None)
        }
        (P::Questions, Trigger::LastQuestionAnswered) => {
            t(P::Assessment, Some(ParagraphStep::Summary), None)
        }
        (P::Assessment | P::Reassessment, Trigger::Rated(r)) if r.is_understood() => t(
            P::Completed,
            Some(ParagraphStep::Completed),
            Some(Effect::ShowCompletion),
        ),
        (P::Assessment | P::Reassessment, Trigger::Rated(_)) => {
            t(P::Chat, None, Some(Effect::OpenChat))
        }
        (P::Chat, Trigger::ChatClosed) => t(P::Reassessment, None, Some(Effect::IncrementRound)),
        (from, trigger) => Err(FlowError::InvalidTransition {
            from,
            trigger: trigger.name(),
        }),
    }
}

/// Calls the flow needs from the backend.
#[async_trait]
pub trait LearningBackend: Send + Sync {
    async fn update_step(
        &self,
        paragraph_id: i64,
        req: StepUpdateRequest,
    ) -> CoreResult<ParagraphProgress>;

    async fn submit_self_assessment(
        &self,
        paragraph_id: i64,
        req: SelfAssessmentRequest,
    ) -> CoreResult<SelfAssessmentResult>;

    async fn answer_question(&self, question_id: i64, answer: &str) -> CoreResult<AnswerResult>;
}

/// Wall-clock time since the last successful send, in whole seconds, capped.
#[derive(Debug, Clone)]
pub struct StudyClock {
    since: Instant,
    cap_secs: u64,
}

impl StudyClock {
    pub fn start(cap_secs: u64) -> Self {
        Self {
            since: Instant::now(),
            cap_secs,
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.since.elapsed().as_secs().min(self.cap_secs)
    }

    pub fn reset(&mut self) {
        self.since = Instant::now();
    }
}

/// Rendering-facing view of a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub paragraph_id: i64,
    pub phase: LearningFlowPhase,
    pub question_index: usize,
    pub questions_total: usize,
    pub questions_correct: usize,
    pub round: u32,
    pub last_rating: Option<SelfAssessmentRating>,
    pub chat_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSummary {
    pub paragraph_id: i64,
    pub questions_correct: usize,
    pub questions_total: usize,
    /// Number of chat remediation rounds the student went through.
    pub rounds: u32,
    pub ratings: Vec<SelfAssessmentRating>,
}

/// State of one paragraph pass.
#[derive(Debug)]
struct ParagraphFlow {
    paragraph_id: i64,
    phase: LearningFlowPhase,
    questions: Vec<EmbeddedQuestion>,
    question_index: usize,
    correct: usize,
    round: u32,
    /// (round, rating); at most one entry per round.
    ratings: Vec<(u32, SelfAssessmentRating)>,
    clock: StudyClock,
}

impl ParagraphFlow {
    fn new(paragraph_id: i64, questions: Vec<EmbeddedQuestion>, cap_secs: u64) -> Self {
        Self {
            paragraph_id,
            phase: LearningFlowPhase::Reading,
            questions,
            question_index: 0,
            correct: 0,
            round: 0,
            ratings: Vec::new(),
            clock: StudyClock::start(cap_secs),
        }
    }

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            paragraph_id: self.paragraph_id,
            phase: self.phase,
            question_index: self.question_index,
            questions_total: self.questions.len(),
            questions_correct: self.correct,
            round: self.round,
            last_rating: self.ratings.last().map(|(_, r)| *r),
            chat_open: self.phase == LearningFlowPhase::Chat,
        }
    }

    fn practice_score(&self) -> Option<f64> {
        if self.questions.is_empty() {
            None
        } else {
            Some(self.correct as f64 / self.questions.len() as f64 * 100.0)
        }
    }

    fn rating_for_round(&self) -> Option<SelfAssessmentRating> {
        self.ratings
            .iter()
            .find(|(round, _)| *round == self.round)
            .map(|(_, r)| *r)
    }

    fn all_answered(&self) -> bool {
        self.question_index >= self.questions.len()
    }

    fn require(&self, phases: &[LearningFlowPhase], trigger: &'static str) -> Result<(), FlowError> {
        if phases.contains(&self.phase) {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: self.phase,
                trigger,
            })
        }
    }
}

#[derive(Debug, Default)]
struct NavState {
    epoch: u64,
    flow: Option<ParagraphFlow>,
    in_flight: bool,
}

/// Holds the in-flight slot for one operation; releases it if the
/// operation's future is dropped before settling.
struct Ticket<'a> {
    state: &'a Mutex<NavState>,
    epoch: u64,
    paragraph_id: i64,
    armed: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut st = lock(self.state);
            if st.epoch == self.epoch {
                st.in_flight = false;
            }
        }
    }
}

fn lock(m: &Mutex<NavState>) -> MutexGuard<'_, NavState> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Owns the flow of the paragraph currently on screen.
///
/// Opening another paragraph discards the current flow; results of requests
/// issued for the old paragraph are dropped with [`FlowError::Stale`].
pub struct FlowNavigator {
    backend: Arc<dyn LearningBackend>,
    state: Mutex<NavState>,
    snapshots: watch::Sender<Option<FlowSnapshot>>,
    max_time_spent_secs: u64,
}

impl FlowNavigator {
    pub fn new(backend: Arc<dyn LearningBackend>, max_time_spent_secs: u64) -> Self {
        Self {
            backend,
            state: Mutex::new(NavState::default()),
            snapshots: watch::Sender::new(None),
            max_time_spent_secs,
        }
    }

    /// Start a fresh pass over `paragraph_id` in `reading`.
    pub fn open(&self, paragraph_id: i64, questions: Vec<EmbeddedQuestion>) -> FlowSnapshot {
        let flow = ParagraphFlow::new(paragraph_id, questions, self.max_time_spent_secs);
        let snap = flow.snapshot();
        {
            let mut st = lock(&self.state);
            st.epoch += 1;
            st.in_flight = false;
            st.flow = Some(flow);
        }
        tracing::debug!(paragraph.id = paragraph_id, "paragraph opened");
        self.snapshots.send_replace(Some(snap.clone()));
        snap
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<FlowSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Option<FlowSnapshot> {
        lock(&self.state).flow.as_ref().map(ParagraphFlow::snapshot)
    }

    pub fn current_question(&self) -> Option<EmbeddedQuestion> {
        let st = lock(&self.state);
        let flow = st.flow.as_ref()?;
        if flow.phase != LearningFlowPhase::Questions {
            return None;
        }
        flow.questions.get(flow.question_index).cloned()
    }

    pub fn completion_summary(&self) -> Result<CompletionSummary, FlowError> {
        let st = lock(&self.state);
        let flow = st.flow.as_ref().ok_or(FlowError::NoParagraph)?;
        if flow.phase != LearningFlowPhase::Completed {
            return Err(FlowError::NotCompleted);
        }
        Ok(CompletionSummary {
            paragraph_id: flow.paragraph_id,
            questions_correct: flow.correct,
            questions_total: flow.questions.len(),
            rounds: flow.round,
            ratings: flow.ratings.iter().map(|(_, r)| *r).collect(),
        })
    }

    /// Reserve the in-flight slot and compute what the operation will send.
    fn begin<T>(
        &self,
        plan: impl FnOnce(&ParagraphFlow) -> Result<T, FlowError>,
    ) -> Result<(Ticket<'_>, T), FlowError> {
        let mut st = lock(&self.state);
        if st.in_flight {
            return Err(FlowError::Busy);
        }
        let flow = st.flow.as_ref().ok_or(FlowError::NoParagraph)?;
        let paragraph_id = flow.paragraph_id;
        let planned = plan(flow)?;
        st.in_flight = true;
        let epoch = st.epoch;
        Ok((
            Ticket {
                state: &self.state,
                epoch,
                paragraph_id,
                armed: true,
            },
            planned,
        ))
    }

    /// Release the slot and hand back the state if the paragraph is still current.
    fn settle(&self, mut ticket: Ticket<'_>) -> Result<MutexGuard<'_, NavState>, FlowError> {
        ticket.armed = false;
        let mut st = lock(&self.state);
        if st.epoch != ticket.epoch {
            tracing::debug!(
                paragraph.id = ticket.paragraph_id,
                "discarding result for a paragraph that is no longer open"
            );
            return Err(FlowError::Stale);
        }
        st.in_flight = false;
        Ok(st)
    }

    fn advance(&self, flow: &mut ParagraphFlow, tr: Transition, time_spent: Option<u64>) -> FlowSnapshot {
        let from = flow.phase;
        flow.phase = tr.to;
        if tr.effect == Some(Effect::IncrementRound) {
            flow.round += 1;
        }
        if time_spent.is_some() {
            flow.clock.reset();
        }
        telemetry::emit_transition(
            FlowTransitionLog::new(flow.paragraph_id, from.as_str(), tr.to.as_str())
                .round(flow.round)
                .step_opt(tr.persist.map(step_name))
                .time_spent_opt(time_spent),
        );
        let snap = flow.snapshot();
        self.snapshots.send_replace(Some(snap.clone()));
        snap
    }

    async fn persist(&self, paragraph_id: i64, step: ParagraphStep, time_spent: Option<u64>) -> CoreResult<()> {
        let span = tracing::info_span!(
            "flow.persist_step",
            paragraph.id = paragraph_id,
            progress.step = step_name(step),
            progress.time_spent = time_spent.unwrap_or(0)
        );
        self.backend
            .update_step(paragraph_id, StepUpdateRequest { step, time_spent })
            .instrument(span)
            .await
            .map(|_| ())
            .inspect_err(|e| tracing::warn!(paragraph.id = paragraph_id, error = %e, "step update failed"))
    }

    /// `reading → questions | assessment`.
    pub async fn finish_reading(&self) -> CoreResult<FlowSnapshot> {
        let (ticket, (tr, secs)) = self.begin(|flow| {
            let tr = transition(
                flow.phase,
                Trigger::FinishReading {
                    has_questions: !flow.questions.is_empty(),
                },
            )?;
            Ok((tr, flow.clock.elapsed_secs()))
        })?;
        let pid = ticket.paragraph_id;
        let result = match tr.persist {
            Some(step) => self.persist(pid, step, Some(secs)).await,
            None => Ok(()),
        };
        let mut st = self.settle(ticket)?;
        result?;
        let flow = st.flow.as_mut().ok_or(FlowError::NoParagraph)?;
        Ok(self.advance(flow, tr, Some(secs)))
    }

    /// Answer the current practice question. Answering the last one moves to
    /// `assessment` once the summary step is persisted; if that persist fails
    /// the answer is kept and [`Self::complete_questions`] retries the step.
    pub async fn answer_question(&self, answer: &str) -> CoreResult<(AnswerResult, FlowSnapshot)> {
        let answer = crate::validate::answer(answer)?;
        let (ticket, question_id) = self.begin(|flow| {
            flow.require(&[LearningFlowPhase::Questions], "answer_question")?;
            flow.questions
                .get(flow.question_index)
                .map(|q| q.id)
                .ok_or(FlowError::InvalidTransition {
                    from: flow.phase,
                    trigger: "answer_question",
                })
        })?;
        let pid = ticket.paragraph_id;
        let result = self
            .backend
            .answer_question(question_id, &answer)
            .instrument(tracing::info_span!("flow.answer_question", paragraph.id = pid, question.id = question_id))
            .await;

        let (answered, all_answered, secs) = {
            let mut st = self.settle(ticket)?;
            let answered = result.inspect_err(|e| {
                tracing::warn!(paragraph.id = pid, error = %e, "answer submission failed")
            })?;
            let flow = st.flow.as_mut().ok_or(FlowError::NoParagraph)?;
            if answered.is_correct {
                flow.correct += 1;
            }
            flow.question_index += 1;
            self.snapshots.send_replace(Some(flow.snapshot()));
            (answered, flow.all_answered(), flow.clock.elapsed_secs())
        };

        if !all_answered {
            let snap = self.snapshot().ok_or(FlowError::NoParagraph)?;
            return Ok((answered, snap));
        }
        let snap = self.complete_questions_with(secs).await?;
        Ok((answered, snap))
    }

    /// Retry the `questions → assessment` step after a failed persist.
    pub async fn complete_questions(&self) -> CoreResult<FlowSnapshot> {
        let secs = {
            let st = lock(&self.state);
            let flow = st.flow.as_ref().ok_or(FlowError::NoParagraph)?;
            flow.clock.elapsed_secs()
        };
        self.complete_questions_with(secs).await
    }

    async fn complete_questions_with(&self, secs: u64) -> CoreResult<FlowSnapshot> {
        let (ticket, tr) = self.begin(|flow| {
            if !flow.all_answered() {
                return Err(FlowError::InvalidTransition {
                    from: flow.phase,
                    trigger: "last_question_answered",
                });
            }
            transition(flow.phase, Trigger::LastQuestionAnswered)
        })?;
        let pid = ticket.paragraph_id;
        let result = match tr.persist {
            Some(step) => self.persist(pid, step, Some(secs)).await,
            None => Ok(()),
        };
        let mut st = self.settle(ticket)?;
        result?;
        let flow = st.flow.as_mut().ok_or(FlowError::NoParagraph)?;
        Ok(self.advance(flow, tr, Some(secs)))
    }

    /// Submit the self-assessment for the current round.
    ///
    /// `understood` persists the `completed` step and ends the flow; any other
    /// rating opens the remediation chat. A rating already accepted for this
    /// round is not sent again, so a failed completion persist can be retried
    /// by calling this again with the same rating.
    pub async fn submit_rating(&self, rating: SelfAssessmentRating) -> CoreResult<FlowSnapshot> {
        let (ticket, (tr, already_rated, score, secs, round)) = self.begin(|flow| {
            let tr = transition(flow.phase, Trigger::Rated(rating))?;
            let already = flow.rating_for_round();
            if let Some(prev) = already
                && prev != rating
            {
                return Err(FlowError::InvalidTransition {
                    from: flow.phase,
                    trigger: "rated",
                });
            }
            Ok((
                tr,
                already.is_some(),
                flow.practice_score(),
                flow.clock.elapsed_secs(),
                flow.round,
            ))
        })?;
        let pid = ticket.paragraph_id;
        let span = tracing::info_span!("flow.submit_rating", paragraph.id = pid, flow.round = round);

        let submitted: CoreResult<()> = if already_rated {
            Ok(())
        } else {
            self.backend
                .submit_self_assessment(
                    pid,
                    SelfAssessmentRequest {
                        rating,
                        practice_score: score,
                        time_spent: Some(secs),
                    },
                )
                .instrument(span)
                .await
                .map(|_| ())
        };
        let persisted = match (&submitted, tr.persist) {
            (Ok(()), Some(step)) => Some(self.persist(pid, step, None).await),
            _ => None,
        };

        let mut st = self.settle(ticket)?;
        submitted.inspect_err(|e| {
            tracing::warn!(paragraph.id = pid, error = %e, "self-assessment submission failed")
        })?;
        let flow = st.flow.as_mut().ok_or(FlowError::NoParagraph)?;
        if !already_rated {
            flow.ratings.push((flow.round, rating));
            flow.clock.reset();
        }
        if let Some(p) = persisted {
            p?;
        }
        Ok(self.advance(flow, tr, (!already_rated).then_some(secs)))
    }

    /// `chat → reassessment`; bumps the round counter. No network call.
    pub fn close_chat(&self) -> Result<FlowSnapshot, FlowError> {
        let mut st = lock(&self.state);
        if st.in_flight {
            return Err(FlowError::Busy);
        }
        let flow = st.flow.as_mut().ok_or(FlowError::NoParagraph)?;
        let tr = transition(flow.phase, Trigger::ChatClosed)?;
        Ok(self.advance(flow, tr, None))
    }
}

fn step_name(step: ParagraphStep) -> &'static str {
    match step {
        ParagraphStep::Content => "content",
        ParagraphStep::Practice => "practice",
        ParagraphStep::Summary => "summary",
        ParagraphStep::Completed => "completed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EduError;
    use crate::telemetry::test_span::install_capture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    use LearningFlowPhase as P;
    use SelfAssessmentRating as R;

    #[derive(Default)]
    struct FakeBackend {
        steps: Mutex<Vec<(i64, StepUpdateRequest)>>,
        assessments: Mutex<Vec<SelfAssessmentRequest>>,
        answers: Mutex<Vec<(i64, String)>>,
        fail_next_steps: AtomicUsize,
        fail_next_assessments: AtomicUsize,
        gated: AtomicBool,
        gate: Notify,
    }

    impl FakeBackend {
        fn steps(&self) -> Vec<ParagraphStep> {
            self.steps.lock().unwrap().iter().map(|(_, r)| r.step).collect()
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl LearningBackend for FakeBackend {
        async fn update_step(
            &self,
            paragraph_id: i64,
            req: StepUpdateRequest,
        ) -> CoreResult<ParagraphProgress> {
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if Self::take_failure(&self.fail_next_steps) {
                return Err(EduError::Unavailable("status 503".into()));
            }
            self.steps.lock().unwrap().push((paragraph_id, req.clone()));
            Ok(ParagraphProgress {
                paragraph_id,
                current_step: req.step,
                is_completed: req.step == ParagraphStep::Completed,
                time_spent: req.time_spent.unwrap_or(0),
            })
        }

        async fn submit_self_assessment(
            &self,
            _paragraph_id: i64,
            req: SelfAssessmentRequest,
        ) -> CoreResult<SelfAssessmentResult> {
            if Self::take_failure(&self.fail_next_assessments) {
                return Err(EduError::Http {
                    status: 422,
                    message: "invalid".into(),
                });
            }
            let n = {
                let mut a = self.assessments.lock().unwrap();
                a.push(req.clone());
                a.len()
            };
            Ok(SelfAssessmentResult {
                id: n as i64,
                rating: req.rating,
                practice_score: req.practice_score,
            })
        }

        async fn answer_question(&self, question_id: i64, answer: &str) -> CoreResult<AnswerResult> {
            self.answers
                .lock()
                .unwrap()
                .push((question_id, answer.to_string()));
            Ok(AnswerResult {
                is_correct: answer == "right",
                correct_answer: Some("right".into()),
                explanation: None,
            })
        }
    }

    fn questions(n: i64) -> Vec<EmbeddedQuestion> {
        (1..=n)
            .map(|id| EmbeddedQuestion {
                id,
                prompt: format!("question {id}"),
                options: None,
            })
            .collect()
    }

    fn navigator() -> (FlowNavigator, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        (FlowNavigator::new(backend.clone(), 3_600), backend)
    }

    const ALL_PHASES: [LearningFlowPhase; 6] =
        [P::Reading, P::Questions, P::Assessment, P::Chat, P::Reassessment, P::Completed];

    fn all_triggers() -> Vec<Trigger> {
        vec![
            Trigger::FinishReading { has_questions: true },
            Trigger::FinishReading { has_questions: false },
            Trigger::LastQuestionAnswered,
            Trigger::Rated(R::Understood),
            Trigger::Rated(R::Questions),
            Trigger::Rated(R::Difficult),
            Trigger::ChatClosed,
        ]
    }

    #[test]
    fn chat_and_completed_are_reachable_only_through_ratings() {
        for from in ALL_PHASES {
            for trigger in all_triggers() {
                let Ok(tr) = transition(from, trigger) else {
                    continue;
                };
                match tr.to {
                    P::Chat => {
                        assert!(matches!(from, P::Assessment | P::Reassessment));
                        assert!(matches!(trigger, Trigger::Rated(r) if !r.is_understood()));
                    }
                    P::Completed => {
                        assert!(matches!(from, P::Assessment | P::Reassessment));
                        assert_eq!(trigger, Trigger::Rated(R::Understood));
                        assert_eq!(tr.persist, Some(ParagraphStep::Completed));
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn completed_is_terminal() {
        for trigger in all_triggers() {
            assert!(matches!(
                transition(P::Completed, trigger),
                Err(FlowError::InvalidTransition { from: P::Completed, .. })
            ));
        }
    }

    #[test]
    fn reading_persists_practice_or_summary() {
        let with = transition(P::Reading, Trigger::FinishReading { has_questions: true }).unwrap();
        assert_eq!((with.to, with.persist), (P::Questions, Some(ParagraphStep::Practice)));
        let without =
            transition(P::Reading, Trigger::FinishReading { has_questions: false }).unwrap();
        assert_eq!((without.to, without.persist), (P::Assessment, Some(ParagraphStep::Summary)));
    }

    #[tokio::test]
    async fn two_question_paragraph_with_one_remediation_round() {
        let (nav, backend) = navigator();
        let opened = nav.open(7, questions(2));
        assert_eq!(opened.phase, P::Reading);

        let snap = nav.finish_reading().await.unwrap();
        assert_eq!(snap.phase, P::Questions);
        assert_eq!(nav.current_question().map(|q| q.id), Some(1));

        let (first, snap) = nav.answer_question("right").await.unwrap();
        assert!(first.is_correct);
        assert_eq!((snap.phase, snap.question_index), (P::Questions, 1));

        let (second, snap) = nav.answer_question("  wrong ").await.unwrap();
        assert!(!second.is_correct);
        assert_eq!(snap.phase, P::Assessment);

        let snap = nav.submit_rating(R::Difficult).await.unwrap();
        assert_eq!(snap.phase, P::Chat);
        assert!(snap.chat_open);

        let snap = nav.close_chat().unwrap();
        assert_eq!((snap.phase, snap.round), (P::Reassessment, 1));

        let snap = nav.submit_rating(R::Understood).await.unwrap();
        assert_eq!(snap.phase, P::Completed);

        let summary = nav.completion_summary().unwrap();
        assert_eq!(summary.questions_correct, 1);
        assert_eq!(summary.questions_total, 2);
        assert_eq!(summary.rounds, 1);
        assert_eq!(summary.ratings, vec![R::Difficult, R::Understood]);

        assert_eq!(
            backend.steps(),
            vec![ParagraphStep::Practice, ParagraphStep::Summary, ParagraphStep::Completed]
        );
        let assessments = backend.assessments.lock().unwrap().clone();
        assert_eq!(assessments.len(), 2);
        assert_eq!(assessments[0].practice_score, Some(50.0));
        assert_eq!(assessments[1].rating, R::Understood);
        assert_eq!(
            backend.answers.lock().unwrap().clone(),
            vec![(1, "right".to_string()), (2, "wrong".to_string())]
        );
    }

    #[tokio::test]
    async fn paragraph_without_questions_skips_practice() {
        let (nav, backend) = navigator();
        nav.open(3, vec![]);
        let snap = nav.finish_reading().await.unwrap();
        assert_eq!(snap.phase, P::Assessment);
        assert_eq!(backend.steps(), vec![ParagraphStep::Summary]);

        nav.submit_rating(R::Understood).await.unwrap();
        let a = backend.assessments.lock().unwrap().clone();
        assert_eq!(a[0].practice_score, None);
        assert_eq!(nav.snapshot().unwrap().phase, P::Completed);
    }

    #[tokio::test]
    async fn failed_step_persist_keeps_phase_and_allows_retry() {
        let (nav, backend) = navigator();
        nav.open(1, questions(1));
        backend.fail_next_steps.store(1, Ordering::SeqCst);

        let err = nav.finish_reading().await.unwrap_err();
        assert!(matches!(err, EduError::Unavailable(_)));
        assert_eq!(nav.snapshot().unwrap().phase, P::Reading);

        assert_eq!(nav.finish_reading().await.unwrap().phase, P::Questions);
    }

    #[tokio::test]
    async fn failed_summary_persist_is_retried_without_reanswering() {
        let (nav, backend) = navigator();
        nav.open(1, questions(1));
        nav.finish_reading().await.unwrap();
        backend.fail_next_steps.store(1, Ordering::SeqCst);

        assert!(nav.answer_question("right").await.is_err());
        let snap = nav.snapshot().unwrap();
        assert_eq!((snap.phase, snap.question_index, snap.questions_correct), (P::Questions, 1, 1));
        assert!(nav.current_question().is_none());

        assert_eq!(nav.complete_questions().await.unwrap().phase, P::Assessment);
        assert_eq!(backend.answers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_assessment_keeps_rating_ui_open() {
        let (nav, backend) = navigator();
        nav.open(1, vec![]);
        nav.finish_reading().await.unwrap();
        backend.fail_next_assessments.store(1, Ordering::SeqCst);

        let err = nav.submit_rating(R::Questions).await.unwrap_err();
        assert!(matches!(err, EduError::Http { status: 422, .. }));
        let snap = nav.snapshot().unwrap();
        assert_eq!((snap.phase, snap.last_rating), (P::Assessment, None));

        assert_eq!(nav.submit_rating(R::Questions).await.unwrap().phase, P::Chat);
    }

    #[tokio::test]
    async fn completion_persist_retry_does_not_resubmit_rating() {
        let (nav, backend) = navigator();
        nav.open(1, vec![]);
        nav.finish_reading().await.unwrap();
        backend.fail_next_steps.store(1, Ordering::SeqCst);

        assert!(nav.submit_rating(R::Understood).await.is_err());
        assert_eq!(nav.snapshot().unwrap().phase, P::Assessment);

        let other = nav.submit_rating(R::Difficult).await.unwrap_err();
        assert!(matches!(other, EduError::Flow(FlowError::InvalidTransition { .. })));

        assert_eq!(nav.submit_rating(R::Understood).await.unwrap().phase, P::Completed);
        assert_eq!(backend.assessments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn round_counter_grows_by_one_per_closed_chat() {
        let (nav, _backend) = navigator();
        nav.open(1, vec![]);
        nav.finish_reading().await.unwrap();

        let mut last_round = 0;
        for expected in 1..=3 {
            nav.submit_rating(R::Difficult).await.unwrap();
            let snap = nav.close_chat().unwrap();
            assert_eq!(snap.round, expected);
            assert!(snap.round >= last_round);
            last_round = snap.round;
        }
        nav.submit_rating(R::Understood).await.unwrap();
        assert_eq!(nav.completion_summary().unwrap().rounds, 3);
    }

    #[tokio::test]
    async fn guard_violations_are_rejected() {
        let (nav, _backend) = navigator();
        assert!(matches!(
            nav.finish_reading().await,
            Err(EduError::Flow(FlowError::NoParagraph))
        ));
        nav.open(1, questions(1));
        assert!(matches!(
            nav.close_chat(),
            Err(FlowError::InvalidTransition { from: P::Reading, .. })
        ));
        assert!(matches!(
            nav.submit_rating(R::Difficult).await,
            Err(EduError::Flow(FlowError::InvalidTransition { .. }))
        ));
        assert!(matches!(
            nav.answer_question("x").await,
            Err(EduError::Flow(FlowError::InvalidTransition { .. }))
        ));
        assert!(matches!(nav.completion_summary(), Err(FlowError::NotCompleted)));
        assert!(matches!(
            nav.answer_question("   ").await,
            Err(EduError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn second_action_while_in_flight_is_busy() {
        let (nav, backend) = navigator();
        nav.open(1, vec![]);
        backend.gated.store(true, Ordering::SeqCst);

        let (first, second) = tokio::join!(nav.finish_reading(), async {
            let r = nav.finish_reading().await;
            backend.gate.notify_one();
            r
        });
        assert_eq!(first.unwrap().phase, P::Assessment);
        assert!(matches!(second, Err(EduError::Flow(FlowError::Busy))));
        assert_eq!(backend.steps().len(), 1);
    }

    #[tokio::test]
    async fn result_for_abandoned_paragraph_is_ignored() {
        let (nav, backend) = navigator();
        nav.open(1, vec![]);
        backend.gated.store(true, Ordering::SeqCst);

        let (old, _) = tokio::join!(nav.finish_reading(), async {
            tokio::task::yield_now().await;
            nav.open(2, questions(1));
            backend.gate.notify_one();
        });
        assert!(matches!(old, Err(EduError::Flow(FlowError::Stale))));
        let snap = nav.snapshot().unwrap();
        assert_eq!((snap.paragraph_id, snap.phase), (2, P::Reading));

        backend.gated.store(false, Ordering::SeqCst);
        assert_eq!(nav.finish_reading().await.unwrap().phase, P::Questions);
    }

    #[tokio::test]
    async fn dropped_operation_releases_in_flight_slot() {
        let (nav, backend) = navigator();
        nav.open(1, vec![]);
        backend.gated.store(true, Ordering::SeqCst);
        {
            let pending = nav.finish_reading();
            tokio::pin!(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
        }
        backend.gated.store(false, Ordering::SeqCst);
        assert_eq!(nav.finish_reading().await.unwrap().phase, P::Assessment);
    }

    #[tokio::test(start_paused = true)]
    async fn time_spent_is_capped_and_reset_after_send() {
        let (nav, backend) = navigator();
        nav.open(1, questions(1));
        tokio::time::advance(std::time::Duration::from_secs(2 * 3_600)).await;
        nav.finish_reading().await.unwrap();

        tokio::time::advance(std::time::Duration::from_secs(42)).await;
        nav.answer_question("right").await.unwrap();

        let steps = backend.steps.lock().unwrap().clone();
        assert_eq!(steps[0].1.time_spent, Some(3_600));
        assert_eq!(steps[1].1.time_spent, Some(42));
    }

    #[tokio::test]
    async fn subscribers_see_every_transition() {
        let (nav, _backend) = navigator();
        let mut rx = nav.subscribe();
        assert!(rx.borrow().is_none());
        nav.open(5, vec![]);
        nav.finish_reading().await.unwrap();
        nav.submit_rating(R::Questions).await.unwrap();
        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone().unwrap();
        assert_eq!((seen.paragraph_id, seen.phase), (5, P::Chat));
    }

    #[tokio::test]
    async fn persist_span_carries_paragraph_and_step() {
        let (store, _guard) = install_capture();
        let (nav, _backend) = navigator();
        nav.open(7, questions(1));
        nav.finish_reading().await.unwrap();

        let spans = store.named("flow.persist_step");
        assert_eq!(spans.len(), 1);
        let fields = &spans[0].fields;
        assert_eq!(fields.get(telemetry::KEY_PARAGRAPH_ID).map(String::as_str), Some("7"));
        assert_eq!(fields.get(telemetry::KEY_STEP).map(String::as_str), Some("practice"));
    }

    #[tokio::test(start_paused = true)]
    async fn persist_span_reports_time_spent() {
        let (store, _guard) = install_capture();
        let (nav, _backend) = navigator();
        nav.open(3, vec![]);
        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        nav.finish_reading().await.unwrap();

        let spans = store.named("flow.persist_step");
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].fields.get(telemetry::KEY_TIME_SPENT).map(String::as_str),
            Some("30")
        );
    }

    #[tokio::test]
    async fn transition_event_names_both_phases_and_round() {
        let (store, _guard) = install_capture();
        let (nav, _backend) = navigator();
        nav.open(4, vec![]);
        nav.finish_reading().await.unwrap();
        nav.submit_rating(R::Difficult).await.unwrap();

        let events = store.events("learning flow advanced");
        assert_eq!(events.len(), 2);
        let last = &events[1].fields;
        assert_eq!(last.get(telemetry::KEY_PARAGRAPH_ID).map(String::as_str), Some("4"));
        assert_eq!(last.get(telemetry::KEY_PHASE_FROM).map(String::as_str), Some("assessment"));
        assert_eq!(last.get(telemetry::KEY_PHASE_TO).map(String::as_str), Some("chat"));
        assert!(last.contains_key(telemetry::KEY_ROUND));
    }

    struct TransitionSink(Mutex<Vec<FlowTransitionLog>>);

    impl telemetry::TelemetrySink for TransitionSink {
        fn record_transition(&self, log: FlowTransitionLog) {
            self.0.lock().unwrap().push(log);
        }
    }

    #[tokio::test]
    async fn transitions_reach_the_telemetry_sink() {
        static SINK: once_cell::sync::Lazy<Arc<TransitionSink>> =
            once_cell::sync::Lazy::new(|| Arc::new(TransitionSink(Mutex::new(Vec::new()))));
        let _ = telemetry::set_telemetry_sink(SINK.clone());
        telemetry::test_set_capture_enabled(true);

        let (nav, _backend) = navigator();
        nav.open(99, vec![]);
        nav.finish_reading().await.unwrap();
        nav.submit_rating(R::Difficult).await.unwrap();
        nav.close_chat().unwrap();
        telemetry::test_set_capture_enabled(false);

        let logs: Vec<_> = SINK
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.paragraph_id == 99)
            .cloned()
            .collect();
        let path: Vec<_> = logs.iter().map(|l| (l.from.as_str(), l.to.as_str())).collect();
        assert_eq!(
            path,
            vec![("reading", "assessment"), ("assessment", "chat"), ("chat", "reassessment")]
        );
        assert_eq!(logs[0].step.as_deref(), Some("summary"));
        assert_eq!(logs[2].round, 1);
    }
}
