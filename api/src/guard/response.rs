//! Post-dispatch check that a specialist's reply actually answers the user.
//!
//! The judgment itself is delegated to a [`ResponseEvaluator`]; this module
//! owns the prompt, the lenient parsing of the evaluator's answer, and the
//! audit trail. A malformed evaluator answer never aborts a turn: it becomes
//! an `error` evaluation with `reason = "parse_failure"`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use switchyard_core::guard::{EvaluationStatus, GuardEvaluation, RecoveryStrategy};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::ResponseGuardConfig;
use crate::orchestrator::ports::{ResponseEvaluator, UpstreamError};

pub const PARSE_FAILURE: &str = "parse_failure";

const EVALUATOR_INSTRUCTIONS: &str = "You review replies produced by an assistant for a user's request. \
Decide whether the reply addresses what the user asked for.\n\
Answer with a single JSON object and nothing else:\n\
{\"status\": \"ok\" | \"mismatch\", \"confidence\": number between 0 and 1, \"reason\": short string, \"follow_up\": optional question to ask the user}\n\
Rules:\n\
- \"ok\" when the reply answers the request, even partially or briefly.\n\
- \"ok\" when the reply asks the user for information it genuinely needs to answer, such as a location, a date or a missing file. A clarifying question is not a mismatch.\n\
- \"mismatch\" only when the reply is about something else, ignores the request, or answers a different question.\n\
- When returning \"mismatch\", put a short question in follow_up that would help the user restate the request.";

pub struct ResponseGuardRequest<'a> {
    pub conversation_id: Uuid,
    pub responder: &'a str,
    pub user_message: &'a str,
    pub agent_response: &'a str,
    /// 1 for the original dispatch, 2 for the single retry
    pub attempt: u32,
}

pub struct ResponseGuard {
    config: ResponseGuardConfig,
    evaluator: Option<Arc<dyn ResponseEvaluator>>,
    audit: Arc<AuditLog>,
}

impl ResponseGuard {
    pub fn new(
        config: ResponseGuardConfig,
        evaluator: Option<Arc<dyn ResponseEvaluator>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            evaluator,
            audit,
        }
    }

    /// True only when the guard is enabled, an evaluator exists and the
    /// responder is enrolled.
    pub fn should_evaluate(&self, responder: &str) -> bool {
        self.config.enabled && self.evaluator.is_some() && self.config.responders.contains(responder)
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.config.strategy
    }

    pub async fn evaluate(
        &self,
        request: ResponseGuardRequest<'_>,
    ) -> Result<GuardEvaluation, UpstreamError> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(GuardEvaluation::ok());
        };

        let prompt = build_prompt(&request);
        let raw = evaluator.judge(EVALUATOR_INSTRUCTIONS, &prompt).await?;
        let evaluation = match parse_evaluation(&raw) {
            Some(evaluation) => evaluation,
            None => {
                tracing::warn!(
                    conversation_id = %request.conversation_id,
                    responder = request.responder,
                    reason = PARSE_FAILURE,
                    "response evaluator returned unparseable output"
                );
                GuardEvaluation::error(PARSE_FAILURE)
            }
        };

        let mut payload = json!({
            "stage": "response",
            "disposition": evaluation.status.as_str(),
            "reason": evaluation.reason,
            "confidence": evaluation.confidence,
            "attempt": request.attempt,
            "strategy": self.config.strategy.as_str(),
        });
        if evaluation.reason.as_deref() == Some(PARSE_FAILURE) {
            payload["raw"] = json!(truncate(&raw, 500));
        }
        self.audit.append(
            AuditEntry::new("response_guard", request.conversation_id)
                .responder(request.responder)
                .payload(payload),
        );

        Ok(evaluation)
    }
}

fn build_prompt(request: &ResponseGuardRequest<'_>) -> String {
    format!(
        "Responder: {}\nAttempt: {}\n\nUser request:\n{}\n\nAssistant reply:\n{}",
        request.responder, request.attempt, request.user_message, request.agent_response
    )
}

#[derive(Deserialize)]
struct RawEvaluation {
    status: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, alias = "followUp")]
    follow_up: Option<String>,
}

/// Accepts bare JSON, fenced JSON, or JSON embedded in prose. Anything
/// without a recognizable status is rejected.
pub fn parse_evaluation(raw: &str) -> Option<GuardEvaluation> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: RawEvaluation = serde_json::from_str(&raw[start..=end]).ok()?;
    let status = match parsed.status.trim().to_ascii_lowercase().as_str() {
        "ok" | "pass" => EvaluationStatus::Ok,
        "mismatch" => EvaluationStatus::Mismatch,
        "error" => EvaluationStatus::Error,
        _ => return None,
    };
    Some(GuardEvaluation {
        status,
        confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
        reason: parsed.reason.filter(|r| !r.trim().is_empty()),
        follow_up: parsed.follow_up.filter(|f| !f.trim().is_empty()),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
