use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::dispatch::TokenUsage;

/// Metered event types. Each has its own per-day bucket per scope key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageEvent {
    Message,
    Upload,
    VoiceSession,
    Tts,
    Transcription,
}

impl UsageEvent {
    pub const ALL: [UsageEvent; 5] = [
        UsageEvent::Message,
        UsageEvent::Upload,
        UsageEvent::VoiceSession,
        UsageEvent::Tts,
        UsageEvent::Transcription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Upload => "upload",
            Self::VoiceSession => "voice_session",
            Self::Tts => "tts",
            Self::Transcription => "transcription",
        }
    }

    /// Wording used in denial messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Message => "messages",
            Self::Upload => "uploads",
            Self::VoiceSession => "voice sessions",
            Self::Tts => "spoken replies",
            Self::Transcription => "transcriptions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageScope {
    Session,
    Origin,
}

impl UsageScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Origin => "origin",
        }
    }
}

/// Keys a usage lookup is made against. The origin key is optional because
/// not every caller has a resolvable network origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKeys {
    pub session: String,
    pub origin: Option<String>,
}

impl UsageKeys {
    pub fn new(session: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            session: session.into(),
            origin,
        }
    }
}

/// Today's count for each scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UsageCounts {
    pub session: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<u64>,
}

/// Allow/deny outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LimitDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<UsageScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EventUsage {
    pub event: UsageEvent,
    pub counts: UsageCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_limit: Option<u64>,
}

/// Body of `GET /usage`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageReport {
    pub day: String,
    pub events: Vec<EventUsage>,
    pub session_tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_tokens: Option<TokenUsage>,
}
