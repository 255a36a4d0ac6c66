use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Allow,
    Blocked,
    NeedsConfirmation,
}

impl GuardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Blocked => "blocked",
            Self::NeedsConfirmation => "needs_confirmation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    Ok,
    AttachmentSize,
    AttachmentType,
    Moderation,
    ShortTranscription,
}

impl GuardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AttachmentSize => "attachment_size",
            Self::AttachmentType => "attachment_type",
            Self::Moderation => "moderation",
            Self::ShortTranscription => "short_transcription",
        }
    }
}

/// Outcome of pre-dispatch input validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GuardDecision {
    pub status: GuardStatus,
    pub reason: GuardReason,
    /// Text suitable for direct display when the turn is not allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
}

impl GuardDecision {
    pub fn allow() -> Self {
        Self {
            status: GuardStatus::Allow,
            reason: GuardReason::Ok,
            user_feedback: None,
        }
    }

    pub fn blocked(reason: GuardReason, feedback: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::Blocked,
            reason,
            user_feedback: Some(feedback.into()),
        }
    }

    pub fn needs_confirmation(reason: GuardReason, feedback: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::NeedsConfirmation,
            reason,
            user_feedback: Some(feedback.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.status == GuardStatus::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Ok,
    Mismatch,
    Error,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Mismatch => "mismatch",
            Self::Error => "error",
        }
    }
}

/// Outcome of post-dispatch response validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GuardEvaluation {
    pub status: EvaluationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
}

impl GuardEvaluation {
    pub fn ok() -> Self {
        Self {
            status: EvaluationStatus::Ok,
            confidence: None,
            reason: None,
            follow_up: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: EvaluationStatus::Error,
            confidence: None,
            reason: Some(reason.into()),
            follow_up: None,
        }
    }

    pub fn mismatch(reason: impl Into<String>) -> Self {
        Self {
            status: EvaluationStatus::Mismatch,
            confidence: None,
            reason: Some(reason.into()),
            follow_up: None,
        }
    }
}

/// What to do when a guarded response does not satisfy the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    #[default]
    Clarify,
    LogOnly,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Clarify => "clarify",
            Self::LogOnly => "log_only",
        }
    }

    /// Unknown values fall back to `Clarify`.
    pub fn parse_or_default(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retry" => Self::Retry,
            "log_only" | "log" => Self::LogOnly,
            _ => Self::Clarify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_defaults_to_clarify() {
        assert_eq!(RecoveryStrategy::parse_or_default("retry"), RecoveryStrategy::Retry);
        assert_eq!(RecoveryStrategy::parse_or_default("LOG_ONLY"), RecoveryStrategy::LogOnly);
        assert_eq!(RecoveryStrategy::parse_or_default("shrug"), RecoveryStrategy::Clarify);
        assert_eq!(RecoveryStrategy::default(), RecoveryStrategy::Clarify);
    }

    #[test]
    fn evaluation_parses_evaluator_shape() {
        let eval: GuardEvaluation = serde_json::from_str(
            r#"{"status":"mismatch","confidence":0.8,"reason":"off topic","follow_up":"ask about X"}"#,
        )
        .expect("evaluation should parse");
        assert_eq!(eval.status, EvaluationStatus::Mismatch);
        assert_eq!(eval.follow_up.as_deref(), Some("ask about X"));
    }

    #[test]
    fn decision_serializes_snake_case() {
        let decision = GuardDecision::needs_confirmation(GuardReason::ShortTranscription, "again?");
        let value = serde_json::to_value(&decision).expect("decision should serialize");
        assert_eq!(value["status"], "needs_confirmation");
        assert_eq!(value["reason"], "short_transcription");
        assert!(!decision.is_allowed());
    }
}
