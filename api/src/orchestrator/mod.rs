//! The dispatch loop.
//!
//! One call to [`Orchestrator::handle_turn`] appends the user's message and
//! then drains a FIFO work queue. Each queue item goes through the input
//! guard, the planner, and every planned specialist in order; a specialist's
//! handoff text becomes a new user message and a new queue item, processed
//! only after the current item has finished. The per-conversation mutex is
//! held for the whole turn, so turns for one conversation never interleave.

pub mod ports;
pub mod specialists;
pub mod store;

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::json;
use switchyard_core::conversation::{
    AudioPayload, Conversation, GUARDRAIL_RESPONDER, Message, TurnResponse, TurnSource,
};
use switchyard_core::dispatch::{Attachment, PlannedAction, SpecialistResult, responders};
use switchyard_core::guard::{EvaluationStatus, GuardEvaluation, RecoveryStrategy};
use switchyard_core::usage::{LimitDecision, UsageEvent, UsageKeys};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::{AppConfig, OrchestratorConfig};
use crate::guard::{InputGuard, InputGuardRequest, ResponseGuard, ResponseGuardRequest};
use crate::persist::SnapshotError;
use crate::usage::UsageLimiter;

use self::ports::{
    Moderator, PlanRequest, Planner, ResponseEvaluator, Specialist, SpecialistContext,
    SpeechSynthesizer, UpstreamError, with_timeout,
};
use self::specialists::SpecialistRegistry;
use self::store::{ConversationHandle, ConversationStore};

const DEFAULT_GUARD_FEEDBACK: &str = "I can't process that message. Please try again.";
const DEFAULT_CLARIFICATION: &str =
    "I'm not sure I understood what you need. Could you rephrase or add a bit more detail?";

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("conversation {0} belongs to another session")]
    Forbidden(Uuid),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("{0}")]
    Internal(String),
}

impl From<SnapshotError> for TurnError {
    fn from(err: SnapshotError) -> Self {
        TurnError::Internal(err.to_string())
    }
}

/// External capabilities the orchestrator drives.
pub struct Capabilities {
    pub planner: Arc<dyn Planner>,
    pub specialists: SpecialistRegistry,
    pub evaluator: Option<Arc<dyn ResponseEvaluator>>,
    pub moderator: Option<Arc<dyn Moderator>>,
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
}

/// Who is asking, and how the turn entered the system.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: Uuid,
    pub origin_key: Option<String>,
    pub source: TurnSource,
    /// Limiter decision that admitted this turn, kept for the audit trail
    pub admission: Option<LimitDecision>,
}

impl TurnContext {
    pub fn new(session_id: Uuid, origin_key: Option<String>, source: TurnSource) -> Self {
        Self {
            session_id,
            origin_key,
            source,
            admission: None,
        }
    }

    pub fn with_admission(mut self, decision: LimitDecision) -> Self {
        self.admission = Some(decision);
        self
    }

    pub fn usage_keys(&self) -> UsageKeys {
        UsageKeys::new(self.session_id.to_string(), self.origin_key.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOrigin {
    Initial,
    Handoff,
}

impl ItemOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Handoff => "handoff",
        }
    }
}

struct WorkItem {
    text: String,
    attachments: Vec<Attachment>,
    source: TurnSource,
    origin: ItemOrigin,
}

enum Delivery {
    Deliver(SpecialistResult),
    Clarify(String),
}

/// Mutable state of one `handle_turn` invocation.
struct TurnRun<'a> {
    conversation: &'a mut Conversation,
    ctx: &'a TurnContext,
    keys: UsageKeys,
    queue: VecDeque<WorkItem>,
    responses: Vec<Message>,
    notes: Option<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: ConversationStore,
    planner: Arc<dyn Planner>,
    specialists: SpecialistRegistry,
    input_guard: InputGuard,
    response_guard: ResponseGuard,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    limiter: Arc<UsageLimiter>,
    audit: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        capabilities: Capabilities,
        store: ConversationStore,
        limiter: Arc<UsageLimiter>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config: config.orchestrator.clone(),
            store,
            planner: capabilities.planner,
            specialists: capabilities.specialists,
            input_guard: InputGuard::new(
                config.input_guard.clone(),
                capabilities.moderator,
                audit.clone(),
            ),
            response_guard: ResponseGuard::new(
                config.response_guard.clone(),
                capabilities.evaluator,
                audit.clone(),
            ),
            speech: capabilities.speech,
            limiter,
            audit,
        }
    }

    pub async fn create_conversation(&self, session_id: Uuid) -> Result<Conversation, TurnError> {
        let conversation = Conversation::new(session_id);
        self.store.insert(conversation.clone()).await?;
        self.audit
            .append(AuditEntry::new("conversation_created", conversation.id).session(session_id));
        tracing::info!(conversation_id = %conversation.id, session_id = %session_id, "conversation created");
        Ok(conversation)
    }

    async fn owned(&self, id: Uuid, session_id: Uuid) -> Result<ConversationHandle, TurnError> {
        let handle = self.store.get(id).await?.ok_or(TurnError::NotFound(id))?;
        if handle.lock().await.session_id != session_id {
            return Err(TurnError::Forbidden(id));
        }
        Ok(handle)
    }

    /// Fails unless `id` exists and belongs to `session_id`.
    pub async fn authorize(&self, id: Uuid, session_id: Uuid) -> Result<(), TurnError> {
        self.owned(id, session_id).await.map(|_| ())
    }

    pub async fn conversation(&self, id: Uuid, session_id: Uuid) -> Result<Conversation, TurnError> {
        let handle = self.owned(id, session_id).await?;
        let conversation = handle.lock().await;
        Ok(conversation.clone())
    }

    pub async fn handle_turn(
        &self,
        conversation_id: Uuid,
        text: String,
        attachments: Vec<Attachment>,
        ctx: TurnContext,
    ) -> Result<TurnResponse, TurnError> {
        let handle = self
            .store
            .get(conversation_id)
            .await?
            .ok_or(TurnError::NotFound(conversation_id))?;
        let mut conversation = handle.lock().await;
        if conversation.session_id != ctx.session_id {
            return Err(TurnError::Forbidden(conversation_id));
        }

        let infos: Vec<_> = attachments.iter().map(|a| a.info.clone()).collect();
        self.append(
            &mut conversation,
            Message::user(text.clone(), ctx.source).with_attachments(infos.clone()),
        )
        .await?;
        self.audit.append(
            AuditEntry::new("user_message", conversation_id)
                .session(ctx.session_id)
                .payload(json!({
                    "content": text,
                    "source": ctx.source.as_str(),
                    "attachments": infos,
                    "admission": ctx.admission,
                })),
        );

        let mut run = TurnRun {
            conversation: &mut *conversation,
            ctx: &ctx,
            keys: ctx.usage_keys(),
            queue: VecDeque::from([WorkItem {
                text,
                attachments,
                source: ctx.source,
                origin: ItemOrigin::Initial,
            }]),
            responses: Vec::new(),
            notes: None,
        };

        let mut processed = 0usize;
        while let Some(item) = run.queue.pop_front() {
            if processed >= self.config.max_turn_items {
                let dropped = run.queue.len() + 1;
                tracing::warn!(
                    conversation_id = %conversation_id,
                    dropped,
                    limit = self.config.max_turn_items,
                    "handoff limit reached"
                );
                self.audit.append(
                    AuditEntry::new("handoff_limit_reached", conversation_id)
                        .session(ctx.session_id)
                        .payload(json!({
                            "limit": self.config.max_turn_items,
                            "dropped": dropped,
                        })),
                );
                break;
            }
            processed += 1;
            self.process_item(&mut run, item).await?;
        }

        let TurnRun {
            responses, notes, ..
        } = run;
        tracing::debug!(
            conversation_id = %conversation_id,
            items = processed,
            responses = responses.len(),
            "turn complete"
        );
        Ok(TurnResponse {
            conversation: conversation.clone(),
            responses,
            notes,
        })
    }

    async fn append(&self, conversation: &mut Conversation, message: Message) -> Result<Message, TurnError> {
        conversation.messages.push(message.clone());
        self.store.save(conversation).await?;
        Ok(message)
    }

    async fn process_item(&self, run: &mut TurnRun<'_>, item: WorkItem) -> Result<(), TurnError> {
        let conversation_id = run.conversation.id;
        let timeout = self.config.upstream_timeout;

        let decision = with_timeout(
            "input_guard",
            timeout,
            self.input_guard.evaluate(InputGuardRequest {
                conversation_id,
                session_id: run.ctx.session_id,
                message: &item.text,
                attachments: &item.attachments,
                source: item.source,
                origin: run.ctx.origin_key.as_deref(),
            }),
        )
        .await?;
        if !decision.is_allowed() {
            let feedback = decision
                .user_feedback
                .clone()
                .unwrap_or_else(|| DEFAULT_GUARD_FEEDBACK.to_string());
            let message = self.append(
                run.conversation,
                Message::assistant(GUARDRAIL_RESPONDER, feedback),
            )
            .await?;
            self.audit.append(
                AuditEntry::new("agent_response", conversation_id)
                    .session(run.ctx.session_id)
                    .responder(GUARDRAIL_RESPONDER)
                    .payload(json!({
                        "stage": "input",
                        "disposition": decision.status.as_str(),
                        "reason": decision.reason.as_str(),
                        "content": message.content,
                    })),
            );
            run.responses.push(message);
            return Ok(());
        }

        let input = planner_input(&item);
        let descriptors = self.specialists.descriptors();
        let plan = with_timeout(
            "planner",
            timeout,
            self.planner.plan(PlanRequest {
                conversation: &*run.conversation,
                input: &input,
                responders: &descriptors,
            }),
        )
        .await?;

        let fallback = plan.actions.is_empty();
        let actions = if fallback {
            fallback_actions(&item.attachments)
        } else {
            plan.actions
        };
        if let Some(notes) = plan.notes.filter(|notes| !notes.trim().is_empty()) {
            run.notes = Some(notes);
        }
        self.audit.append(
            AuditEntry::new("plan", conversation_id)
                .session(run.ctx.session_id)
                .payload(json!({
                    "item": item.origin.as_str(),
                    "source": item.source.as_str(),
                    "actions": actions,
                    "fallback": fallback,
                    "notes": run.notes,
                })),
        );

        let mut handoffs = Vec::new();
        for action in actions {
            if item.source == TurnSource::VoiceTranscription && action.responder == responders::VOICE {
                tracing::debug!(conversation_id = %conversation_id, "skipping voice responder for transcribed input");
                continue;
            }
            let Some(specialist) = self.specialists.get(&action.responder) else {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    responder = %action.responder,
                    "planner chose an unknown responder"
                );
                self.audit.append(
                    AuditEntry::new("unknown_responder", conversation_id)
                        .session(run.ctx.session_id)
                        .responder(&action.responder),
                );
                continue;
            };

            let delivery = self
                .dispatch_guarded(run, &item, specialist.as_ref(), action.instructions.as_deref())
                .await?;
            match delivery {
                Delivery::Deliver(result) => {
                    if let Some(handoff) = result.handoff.clone().filter(|h| !h.trim().is_empty()) {
                        handoffs.push((specialist.tag().to_string(), handoff));
                    }
                    self.deliver(run, specialist.tag(), result).await?;
                }
                Delivery::Clarify(text) => {
                    let message = self.append(
                        run.conversation,
                        Message::assistant(GUARDRAIL_RESPONDER, text),
                    )
                    .await?;
                    self.audit.append(
                        AuditEntry::new("agent_response", conversation_id)
                            .session(run.ctx.session_id)
                            .responder(GUARDRAIL_RESPONDER)
                            .payload(json!({
                                "stage": "response",
                                "replaced": specialist.tag(),
                                "content": message.content,
                            })),
                    );
                    run.responses.push(message);
                }
            }
        }

        for (from, text) in handoffs {
            self.append(
                run.conversation,
                Message::user(text.clone(), TurnSource::VoiceTranscription),
            )
            .await?;
            self.audit.append(
                AuditEntry::new("handoff", conversation_id)
                    .session(run.ctx.session_id)
                    .responder(&from)
                    .payload(json!({ "content": text })),
            );
            run.queue.push_back(WorkItem {
                text,
                attachments: Vec::new(),
                source: TurnSource::VoiceTranscription,
                origin: ItemOrigin::Handoff,
            });
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        run: &TurnRun<'_>,
        item: &WorkItem,
        specialist: &dyn Specialist,
        instructions: Option<&str>,
    ) -> Result<SpecialistResult, TurnError> {
        let result = with_timeout(
            "specialist",
            self.config.upstream_timeout,
            specialist.handle(SpecialistContext {
                conversation: &*run.conversation,
                message: &item.text,
                instructions,
                attachments: &item.attachments,
                source: item.source,
            }),
        )
        .await?;
        if let Some(usage) = result.usage.filter(|usage| !usage.is_empty()) {
            self.limiter.ledger().record_tokens(&run.keys, &usage);
        }
        Ok(result)
    }

    /// Dispatch and, when the responder is guarded, run the recovery state
    /// machine: pass, retry once, clarify, or log only.
    async fn dispatch_guarded(
        &self,
        run: &TurnRun<'_>,
        item: &WorkItem,
        specialist: &dyn Specialist,
        instructions: Option<&str>,
    ) -> Result<Delivery, TurnError> {
        let tag = specialist.tag();
        let result = self.dispatch(run, item, specialist, instructions).await?;
        if !self.response_guard.should_evaluate(tag) {
            return Ok(Delivery::Deliver(result));
        }

        let first = self.evaluate_response(run, item, tag, &result, 1).await?;
        match first.status {
            EvaluationStatus::Ok => Ok(Delivery::Deliver(result)),
            EvaluationStatus::Error => {
                self.record_recovery(run, tag, "pass_through", &first);
                Ok(Delivery::Deliver(result))
            }
            EvaluationStatus::Mismatch => match self.response_guard.strategy() {
                RecoveryStrategy::LogOnly => {
                    self.record_recovery(run, tag, "delivered_unmodified", &first);
                    Ok(Delivery::Deliver(result))
                }
                RecoveryStrategy::Clarify => {
                    self.record_recovery(run, tag, "clarify", &first);
                    Ok(Delivery::Clarify(clarification(&first, None)))
                }
                RecoveryStrategy::Retry => {
                    let corrective = corrective_instructions(instructions, &first);
                    let retried = self
                        .dispatch(run, item, specialist, Some(&corrective))
                        .await?;
                    let second = self.evaluate_response(run, item, tag, &retried, 2).await?;
                    match second.status {
                        EvaluationStatus::Ok => {
                            self.record_recovery(run, tag, "retry_ok", &second);
                            Ok(Delivery::Deliver(retried))
                        }
                        EvaluationStatus::Error => {
                            self.record_recovery(run, tag, "retry_unverified", &second);
                            Ok(Delivery::Deliver(retried))
                        }
                        EvaluationStatus::Mismatch => {
                            self.record_recovery(run, tag, "escalate", &second);
                            Ok(Delivery::Clarify(clarification(&second, Some(&first))))
                        }
                    }
                }
            },
        }
    }

    async fn evaluate_response(
        &self,
        run: &TurnRun<'_>,
        item: &WorkItem,
        tag: &str,
        result: &SpecialistResult,
        attempt: u32,
    ) -> Result<GuardEvaluation, TurnError> {
        let evaluation = with_timeout(
            "response_guard",
            self.config.upstream_timeout,
            self.response_guard.evaluate(ResponseGuardRequest {
                conversation_id: run.conversation.id,
                responder: tag,
                user_message: &item.text,
                agent_response: &result.content,
                attempt,
            }),
        )
        .await?;
        Ok(evaluation)
    }

    fn record_recovery(&self, run: &TurnRun<'_>, tag: &str, outcome: &str, evaluation: &GuardEvaluation) {
        tracing::info!(
            conversation_id = %run.conversation.id,
            responder = tag,
            outcome,
            status = evaluation.status.as_str(),
            "response guard recovery"
        );
        self.audit.append(
            AuditEntry::new("guard_recovery", run.conversation.id)
                .session(run.ctx.session_id)
                .responder(tag)
                .payload(json!({
                    "strategy": self.response_guard.strategy().as_str(),
                    "outcome": outcome,
                    "status": evaluation.status.as_str(),
                    "reason": evaluation.reason,
                })),
        );
    }

    async fn deliver(&self, run: &mut TurnRun<'_>, tag: &str, result: SpecialistResult) -> Result<(), TurnError> {
        let audio = match result.audio {
            Some(audio) => Some(audio),
            None => self.synthesize(run, tag, &result.content).await,
        };
        let message = self.append(
            run.conversation,
            Message::assistant(tag, result.content.clone()).with_audio(audio),
        )
        .await?;
        self.audit.append(
            AuditEntry::new("agent_response", run.conversation.id)
                .session(run.ctx.session_id)
                .responder(tag)
                .payload(json!({
                    "content": message.content,
                    "has_audio": message.audio.is_some(),
                    "usage": result.usage,
                    "debug": result.debug,
                    "handoff": result.handoff.is_some(),
                })),
        );
        run.responses.push(message);
        Ok(())
    }

    /// Best effort: a missing synthesizer, a quota denial or a failed call
    /// all leave the message without audio.
    async fn synthesize(&self, run: &TurnRun<'_>, tag: &str, text: &str) -> Option<AudioPayload> {
        let speech = self.speech.as_ref()?;
        if !self.config.tts_responders.contains(tag) || text.trim().is_empty() {
            return None;
        }

        let decision = self.limiter.consume(UsageEvent::Tts, &run.keys, 1);
        if !decision.allowed {
            self.audit.append(
                AuditEntry::new("tts_skipped", run.conversation.id)
                    .session(run.ctx.session_id)
                    .responder(tag)
                    .payload(json!({ "limit": decision })),
            );
            return None;
        }

        match with_timeout("speech", self.config.upstream_timeout, speech.synthesize(text)).await {
            Ok(audio) => Some(audio),
            Err(err) => {
                tracing::warn!(
                    conversation_id = %run.conversation.id,
                    responder = tag,
                    error = %err,
                    "speech synthesis failed"
                );
                self.audit.append(
                    AuditEntry::new("tts_failed", run.conversation.id)
                        .session(run.ctx.session_id)
                        .responder(tag)
                        .payload(json!({ "error": err.to_string() })),
                );
                None
            }
        }
    }
}

fn planner_input(item: &WorkItem) -> String {
    let mut input = item.text.clone();
    if !item.attachments.is_empty() {
        input.push_str("\n\n[attachments]");
        for attachment in &item.attachments {
            input.push_str(&format!(
                "\n- {} ({}, {} bytes)",
                attachment.info.filename, attachment.info.mime_type, attachment.info.size_bytes
            ));
        }
    }
    if item.source == TurnSource::VoiceTranscription {
        input.push_str(
            "\n\n[already transcribed from speech; do not route to the voice responder]",
        );
    }
    input
}

/// Used when the planner returns nothing: greet, or route each attachment
/// kind to its specialist in order of first appearance.
fn fallback_actions(attachments: &[Attachment]) -> Vec<PlannedAction> {
    if attachments.is_empty() {
        return vec![PlannedAction::new(responders::GREETER)];
    }
    let mut actions: Vec<PlannedAction> = Vec::new();
    for attachment in attachments {
        let tag = if attachment.info.is_audio() {
            responders::VOICE
        } else {
            responders::DOCUMENT
        };
        if !actions.iter().any(|action| action.responder == tag) {
            actions.push(PlannedAction::new(tag));
        }
    }
    actions
}

fn corrective_instructions(original: Option<&str>, evaluation: &GuardEvaluation) -> String {
    let reason = evaluation
        .reason
        .as_deref()
        .unwrap_or("it did not address the request");
    let correction = format!(
        "Your previous reply was rejected because {reason}. Answer exactly what the user asked."
    );
    match original {
        Some(original) if !original.trim().is_empty() => format!("{original}\n\n{correction}"),
        _ => correction,
    }
}

fn clarification(latest: &GuardEvaluation, earlier: Option<&GuardEvaluation>) -> String {
    latest
        .follow_up
        .clone()
        .or_else(|| earlier.and_then(|e| e.follow_up.clone()))
        .unwrap_or_else(|| DEFAULT_CLARIFICATION.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{InputGuardConfig, ResponseGuardConfig};
    use crate::usage::UsageLedger;
    use crate::usage::ledger::utc_day_clock;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use switchyard_core::conversation::Role;
    use switchyard_core::dispatch::{Plan, TokenUsage};

    #[derive(Default)]
    pub(crate) struct ScriptedPlanner {
        plans: Mutex<VecDeque<Plan>>,
        pub(crate) inputs: Mutex<Vec<String>>,
    }

    impl ScriptedPlanner {
        pub(crate) fn new(plans: Vec<Plan>) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(plans.into()),
                inputs: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.inputs.lock().expect("inputs lock").len()
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan, UpstreamError> {
            self.inputs
                .lock()
                .expect("inputs lock")
                .push(request.input.to_string());
            Ok(self
                .plans
                .lock()
                .expect("plans lock")
                .pop_front()
                .unwrap_or_default())
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Call {
        pub(crate) message: String,
        pub(crate) instructions: Option<String>,
        pub(crate) source: TurnSource,
    }

    pub(crate) struct ScriptedSpecialist {
        tag: &'static str,
        replies: Mutex<VecDeque<SpecialistResult>>,
        pub(crate) calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl ScriptedSpecialist {
        pub(crate) fn new(tag: &'static str, replies: Vec<SpecialistResult>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(tag: &'static str) -> Arc<Self> {
            Arc::new(Self {
                tag,
                replies: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl Specialist for ScriptedSpecialist {
        fn tag(&self) -> &str {
            self.tag
        }

        fn description(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
            self.calls.lock().expect("calls lock").push(Call {
                message: ctx.message.to_string(),
                instructions: ctx.instructions.map(str::to_string),
                source: ctx.source,
            });
            if self.fail {
                return Err(UpstreamError::Status {
                    capability: "specialist",
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| SpecialistResult::text(format!("{} reply", self.tag))))
        }
    }

    struct ScriptedEvaluator {
        answers: Mutex<VecDeque<String>>,
    }

    impl ScriptedEvaluator {
        fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl ResponseEvaluator for ScriptedEvaluator {
        async fn judge(&self, _instructions: &str, _prompt: &str) -> Result<String, UpstreamError> {
            Ok(self
                .answers
                .lock()
                .expect("answers lock")
                .pop_front()
                .unwrap_or_else(|| "{\"status\":\"ok\"}".to_string()))
        }
    }

    struct FakeSpeech;

    #[async_trait]
    impl SpeechSynthesizer for FakeSpeech {
        async fn synthesize(&self, _text: &str) -> Result<AudioPayload, UpstreamError> {
            Ok(AudioPayload {
                mime_type: "audio/mpeg".to_string(),
                data_base64: "AAAA".to_string(),
                description: None,
            })
        }
    }

    pub(crate) struct Harness {
        pub(crate) orchestrator: Arc<Orchestrator>,
        pub(crate) audit: Arc<AuditLog>,
        pub(crate) limiter: Arc<UsageLimiter>,
        _dir: tempfile::TempDir,
    }

    pub(crate) fn harness(config: AppConfig, capabilities: Capabilities) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(AuditLog::open(dir.path().join("audit")).expect("audit log"));
        let ledger = Arc::new(UsageLedger::in_memory(utc_day_clock()));
        let limiter = Arc::new(UsageLimiter::new(ledger, config.usage.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            capabilities,
            ConversationStore::in_memory(),
            limiter.clone(),
            audit.clone(),
        ));
        Harness {
            orchestrator,
            audit,
            limiter,
            _dir: dir,
        }
    }

    pub(crate) fn capabilities(planner: Arc<dyn Planner>, specialists: Vec<Arc<dyn Specialist>>) -> Capabilities {
        let mut registry = SpecialistRegistry::new();
        for specialist in specialists {
            registry.register(specialist);
        }
        Capabilities {
            planner,
            specialists: registry,
            evaluator: None,
            moderator: None,
            speech: None,
        }
    }

    fn guarded_config(strategy: RecoveryStrategy) -> AppConfig {
        AppConfig {
            response_guard: ResponseGuardConfig {
                enabled: true,
                strategy,
                ..ResponseGuardConfig::default()
            },
            ..AppConfig::default()
        }
    }

    fn plan(tags: &[&str]) -> Plan {
        Plan {
            actions: tags.iter().map(|tag| PlannedAction::new(*tag)).collect(),
            notes: None,
        }
    }

    async fn start(h: &Harness) -> (Uuid, TurnContext) {
        let session = Uuid::now_v7();
        let conversation = h
            .orchestrator
            .create_conversation(session)
            .await
            .expect("create conversation");
        (
            conversation.id,
            TurnContext::new(session, Some("org_test".to_string()), TurnSource::Text),
        )
    }

    fn assistant_contents(conversation: &Conversation) -> Vec<String> {
        conversation
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .collect()
    }

    #[tokio::test]
    async fn empty_plan_without_attachments_greets() {
        let planner = ScriptedPlanner::new(vec![Plan::default()]);
        let greeter = ScriptedSpecialist::new(responders::GREETER, vec![SpecialistResult::text("hello!")]);
        let h = harness(AppConfig::default(), capabilities(planner, vec![greeter.clone()]));
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "hi".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(turn.responses.len(), 1);
        assert_eq!(turn.responses[0].content, "hello!");
        assert_eq!(turn.responses[0].responder.as_deref(), Some(responders::GREETER));
        assert_eq!(turn.conversation.messages.len(), 2);
    }

    #[test]
    fn fallback_routes_attachments_by_kind_in_order() {
        let attachments = vec![
            Attachment::new("notes.pdf", "application/pdf", vec![1]),
            Attachment::new("memo.webm", "audio/webm", vec![1]),
            Attachment::new("more.txt", "text/plain", vec![1]),
        ];
        let tags: Vec<_> = fallback_actions(&attachments)
            .into_iter()
            .map(|a| a.responder)
            .collect();
        assert_eq!(tags, vec![responders::DOCUMENT, responders::VOICE]);
    }

    #[tokio::test]
    async fn actions_run_in_planner_order_and_last_notes_win() {
        let first = Plan {
            actions: vec![PlannedAction::new("b"), PlannedAction::new("a")],
            notes: Some("first notes".to_string()),
        };
        let second = Plan {
            actions: vec![PlannedAction::new("a")],
            notes: Some("second notes".to_string()),
        };
        let planner = ScriptedPlanner::new(vec![first, second]);
        let a = ScriptedSpecialist::new("a", vec![]);
        let b = ScriptedSpecialist::new(
            "b",
            vec![SpecialistResult::text("b reply").with_handoff("follow up")],
        );
        let h = harness(AppConfig::default(), capabilities(planner, vec![a.clone(), b.clone()]));
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "go".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        let contents: Vec<_> = turn.responses.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b reply", "a reply", "a reply"]);
        assert_eq!(turn.notes.as_deref(), Some("second notes"));
    }

    #[tokio::test]
    async fn blocked_input_never_reaches_planner() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new("general", vec![]);
        let config = AppConfig {
            input_guard: InputGuardConfig {
                max_attachment_bytes: 100,
                ..InputGuardConfig::default()
            },
            ..AppConfig::default()
        };
        let h = harness(config, capabilities(planner.clone(), vec![general.clone()]));
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(
                id,
                "read this".to_string(),
                vec![Attachment::new("big.txt", "text/plain", vec![b'x'; 256])],
                ctx,
            )
            .await
            .expect("turn");

        assert_eq!(planner.calls(), 0);
        assert!(general.calls().is_empty());
        assert_eq!(turn.responses.len(), 1);
        assert!(turn.responses[0].is_guardrail());
        assert!(turn.responses[0].content.contains("too large"));
    }

    #[tokio::test]
    async fn short_transcript_asks_for_confirmation() {
        let planner = ScriptedPlanner::new(vec![]);
        let h = harness(AppConfig::default(), capabilities(planner.clone(), vec![]));
        let (id, ctx) = start(&h).await;
        let ctx = TurnContext {
            source: TurnSource::VoiceTranscription,
            ..ctx
        };

        let turn = h
            .orchestrator
            .handle_turn(id, "yo".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(planner.calls(), 0);
        assert!(turn.responses[0].is_guardrail());
        assert_eq!(turn.conversation.messages[0].source, TurnSource::VoiceTranscription);
    }

    #[tokio::test]
    async fn retry_success_delivers_only_retried_content() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new(
            "general",
            vec![
                SpecialistResult::text("a bread recipe"),
                SpecialistResult::text("it is sunny"),
            ],
        );
        let mut caps = capabilities(planner, vec![general.clone()]);
        caps.evaluator = Some(ScriptedEvaluator::new(&[
            r#"{"status":"mismatch","reason":"the reply is about bread"}"#,
            r#"{"status":"ok"}"#,
        ]));
        let h = harness(guarded_config(RecoveryStrategy::Retry), caps);
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "weather?".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");

        assert_eq!(assistant_contents(&turn.conversation), vec!["it is sunny"]);
        let calls = general.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].instructions.is_none());
        assert!(
            calls[1]
                .instructions
                .as_deref()
                .is_some_and(|i| i.contains("the reply is about bread"))
        );
    }

    #[tokio::test]
    async fn retry_that_still_mismatches_escalates_to_clarification() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new(
            "general",
            vec![SpecialistResult::text("wrong one"), SpecialistResult::text("wrong two")],
        );
        let mut caps = capabilities(planner, vec![general]);
        caps.evaluator = Some(ScriptedEvaluator::new(&[
            r#"{"status":"mismatch","follow_up":"Which city?"}"#,
            r#"{"status":"mismatch"}"#,
        ]));
        let h = harness(guarded_config(RecoveryStrategy::Retry), caps);
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "weather?".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(assistant_contents(&turn.conversation), vec!["Which city?"]);
        assert!(turn.responses[0].is_guardrail());
    }

    #[tokio::test]
    async fn clarify_suppresses_original_content() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new("general", vec![SpecialistResult::text("off topic")]);
        let mut caps = capabilities(planner, vec![general.clone()]);
        caps.evaluator = Some(ScriptedEvaluator::new(&[
            r#"{"status":"mismatch","follow_up":"Do you mean today's forecast?"}"#,
        ]));
        let h = harness(guarded_config(RecoveryStrategy::Clarify), caps);
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "weather?".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(
            assistant_contents(&turn.conversation),
            vec!["Do you mean today's forecast?"]
        );
        assert_eq!(general.calls().len(), 1);
    }

    #[tokio::test]
    async fn log_only_delivers_original_and_records_mismatch() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new("general", vec![SpecialistResult::text("off topic")]);
        let mut caps = capabilities(planner, vec![general]);
        caps.evaluator = Some(ScriptedEvaluator::new(&[r#"{"status":"mismatch"}"#]));
        let h = harness(guarded_config(RecoveryStrategy::LogOnly), caps);
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "weather?".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(assistant_contents(&turn.conversation), vec!["off topic"]);
        let kinds: Vec<_> = h
            .audit
            .recent(id, 50)
            .expect("audit")
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"guard_recovery".to_string()));
    }

    #[tokio::test]
    async fn unparseable_evaluation_delivers_original() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let general = ScriptedSpecialist::new("general", vec![SpecialistResult::text("it is sunny")]);
        let mut caps = capabilities(planner, vec![general]);
        caps.evaluator = Some(ScriptedEvaluator::new(&["sure, looks good"]));
        let h = harness(guarded_config(RecoveryStrategy::Retry), caps);
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "weather?".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(assistant_contents(&turn.conversation), vec!["it is sunny"]);

        let entries = h.audit.recent(id, 50).expect("audit");
        let guard_entry = entries
            .iter()
            .find(|e| e.kind == "response_guard")
            .expect("response guard entry");
        assert_eq!(guard_entry.payload["reason"], "parse_failure");
    }

    #[tokio::test]
    async fn handoff_follows_all_messages_of_its_item() {
        let planner = ScriptedPlanner::new(vec![plan(&["voice", "general"]), plan(&["general"])]);
        let voice = ScriptedSpecialist::new(
            "voice",
            vec![SpecialistResult::text("Transcribed your note.").with_handoff("book a table for two")],
        );
        let general = ScriptedSpecialist::new(
            "general",
            vec![SpecialistResult::text("first answer"), SpecialistResult::text("booked")],
        );
        let h = harness(
            AppConfig::default(),
            capabilities(planner.clone(), vec![voice.clone(), general.clone()]),
        );
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(
                id,
                String::new(),
                vec![Attachment::new("note.webm", "audio/webm", vec![1, 2, 3])],
                ctx,
            )
            .await
            .expect("turn");

        let summary: Vec<_> = turn
            .conversation
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Role::User, ""),
                (Role::Assistant, "Transcribed your note."),
                (Role::Assistant, "first answer"),
                (Role::User, "book a table for two"),
                (Role::Assistant, "booked"),
            ]
        );
        assert_eq!(turn.conversation.messages[3].source, TurnSource::VoiceTranscription);

        let inputs = planner.inputs.lock().expect("inputs lock").clone();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].contains("note.webm"));
        assert!(inputs[1].starts_with("book a table for two"));
        assert!(inputs[1].contains("do not route to the voice responder"));
        let calls = general.calls();
        assert_eq!(calls[1].message, "book a table for two");
        assert_eq!(calls[1].source, TurnSource::VoiceTranscription);
    }

    #[tokio::test]
    async fn transcribed_items_skip_the_voice_responder() {
        let planner = ScriptedPlanner::new(vec![plan(&["voice", "general"])]);
        let voice = ScriptedSpecialist::new("voice", vec![]);
        let general = ScriptedSpecialist::new("general", vec![]);
        let h = harness(
            AppConfig::default(),
            capabilities(planner, vec![voice.clone(), general.clone()]),
        );
        let (id, ctx) = start(&h).await;
        let ctx = TurnContext {
            source: TurnSource::VoiceTranscription,
            ..ctx
        };

        h.orchestrator
            .handle_turn(id, "what time is it".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert!(voice.calls().is_empty());
        assert_eq!(general.calls().len(), 1);
    }

    #[tokio::test]
    async fn endless_handoffs_stop_at_item_limit() {
        let planner = ScriptedPlanner::new(vec![]);
        let looping = ScriptedSpecialist::new(
            responders::GREETER,
            (0..10)
                .map(|i| SpecialistResult::text(format!("reply {i}")).with_handoff("again please"))
                .collect(),
        );
        let mut config = AppConfig::default();
        config.orchestrator.max_turn_items = 3;
        let h = harness(config, capabilities(planner.clone(), vec![looping.clone()]));
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "hello there".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(planner.calls(), 3);
        assert_eq!(turn.responses.len(), 3);
        let entries = h.audit.recent(id, 100).expect("audit");
        let limit = entries
            .iter()
            .find(|e| e.kind == "handoff_limit_reached")
            .expect("limit entry");
        assert_eq!(limit.payload["dropped"], 1);
    }

    #[tokio::test]
    async fn unknown_responders_are_skipped() {
        let planner = ScriptedPlanner::new(vec![plan(&["weather", "general"])]);
        let general = ScriptedSpecialist::new("general", vec![]);
        let h = harness(AppConfig::default(), capabilities(planner, vec![general]));
        let (id, ctx) = start(&h).await;

        let turn = h
            .orchestrator
            .handle_turn(id, "forecast".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert_eq!(turn.responses.len(), 1);
        let entries = h.audit.recent(id, 50).expect("audit");
        assert!(
            entries
                .iter()
                .any(|e| e.kind == "unknown_responder" && e.responder.as_deref() == Some("weather"))
        );
    }

    #[tokio::test]
    async fn upstream_failure_keeps_partial_progress() {
        let planner = ScriptedPlanner::new(vec![plan(&["general", "broken"])]);
        let general = ScriptedSpecialist::new("general", vec![SpecialistResult::text("partial")]);
        let broken = ScriptedSpecialist::failing("broken");
        let h = harness(
            AppConfig::default(),
            capabilities(planner, vec![general, broken]),
        );
        let (id, ctx) = start(&h).await;
        let session = ctx.session_id;

        let err = h
            .orchestrator
            .handle_turn(id, "do both".to_string(), Vec::new(), ctx)
            .await
            .expect_err("broken specialist fails the turn");
        assert!(matches!(err, TurnError::Upstream(_)));

        let conversation = h.orchestrator.conversation(id, session).await.expect("conversation");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].content, "partial");
    }

    #[tokio::test]
    async fn unknown_and_foreign_conversations_are_rejected() {
        let planner = ScriptedPlanner::new(vec![]);
        let h = harness(AppConfig::default(), capabilities(planner, vec![]));
        let (id, ctx) = start(&h).await;

        let missing = h
            .orchestrator
            .handle_turn(Uuid::now_v7(), "hi".to_string(), Vec::new(), ctx.clone())
            .await
            .expect_err("unknown conversation");
        assert!(matches!(missing, TurnError::NotFound(_)));

        let stranger = TurnContext::new(Uuid::now_v7(), None, TurnSource::Text);
        let foreign = h
            .orchestrator
            .handle_turn(id, "hi".to_string(), Vec::new(), stranger)
            .await
            .expect_err("foreign session");
        assert!(matches!(foreign, TurnError::Forbidden(_)));
        let conversation = h
            .orchestrator
            .conversation(id, ctx.session_id)
            .await
            .expect("conversation");
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn enrolled_responders_get_speech_and_tokens_are_counted() {
        let planner = ScriptedPlanner::new(vec![plan(&["general"])]);
        let mut reply = SpecialistResult::text("spoken answer");
        reply.usage = Some(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        let general = ScriptedSpecialist::new("general", vec![reply]);
        let mut caps = capabilities(planner, vec![general]);
        caps.speech = Some(Arc::new(FakeSpeech));
        let mut config = AppConfig::default();
        config.orchestrator.tts_responders = BTreeSet::from(["general".to_string()]);
        let h = harness(config, caps);
        let (id, ctx) = start(&h).await;
        let keys = ctx.usage_keys();

        let turn = h
            .orchestrator
            .handle_turn(id, "say it".to_string(), Vec::new(), ctx)
            .await
            .expect("turn");
        assert!(turn.responses[0].audio.is_some());
        assert_eq!(h.limiter.ledger().get_count(UsageEvent::Tts, &keys).session, 1);
        assert_eq!(h.limiter.ledger().get_token_usage(&keys).session.total_tokens, 15);
    }
}
