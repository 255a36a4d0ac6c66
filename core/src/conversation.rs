use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Reserved responder tag for messages authored by either guard layer.
pub const GUARDRAIL_RESPONDER: &str = "guardrail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Where a turn's text came from. Voice transcriptions are never routed
/// back to the transcription specialist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    #[default]
    Text,
    Upload,
    VoiceTranscription,
}

impl TurnSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Upload => "upload",
            Self::VoiceTranscription => "voice_transcription",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "upload" => Some(Self::Upload),
            "voice_transcription" | "voice" => Some(Self::VoiceTranscription),
            _ => None,
        }
    }
}

/// Metadata about an uploaded attachment. The bytes themselves never leave
/// the request that carried them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AttachmentInfo {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl AttachmentInfo {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Synthesized or specialist-produced audio, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AudioPayload {
    pub mime_type: String,
    pub data_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single conversation message. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Tag of the responder that authored an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioPayload>,
    /// Set on user messages that entered the pipeline via voice transcription
    #[serde(default, skip_serializing_if = "is_text_source")]
    pub source: TurnSource,
}

fn is_text_source(source: &TurnSource) -> bool {
    *source == TurnSource::Text
}

impl Message {
    pub fn user(content: impl Into<String>, source: TurnSource) -> Self {
        Self {
            id: Uuid::now_v7(),
            role: Role::User,
            content: content.into(),
            responder: None,
            timestamp: Utc::now(),
            attachments: Vec::new(),
            audio: None,
            source,
        }
    }

    pub fn assistant(responder: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            role: Role::Assistant,
            content: content.into(),
            responder: Some(responder.into()),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            audio: None,
            source: TurnSource::Text,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentInfo>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_audio(mut self, audio: Option<AudioPayload>) -> Self {
        self.audio = audio;
        self
    }

    pub fn is_guardrail(&self) -> bool {
        self.responder.as_deref() == Some(GUARDRAIL_RESPONDER)
    }
}

/// A conversation owned by one session. Messages are append-only.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            session_id,
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateConversationResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// JSON body for posting a message. Multipart uploads carry the same fields
/// as form parts plus a binary `attachment`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TurnSource>,
}

/// Result of one turn: the conversation after the turn, the assistant
/// messages produced during it, and the planner's last operator notes.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TurnResponse {
    pub conversation: Conversation,
    pub responses: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_source_parses_known_values() {
        assert_eq!(TurnSource::parse("voice_transcription"), Some(TurnSource::VoiceTranscription));
        assert_eq!(TurnSource::parse(" Upload "), Some(TurnSource::Upload));
        assert_eq!(TurnSource::parse("carrier-pigeon"), None);
    }

    #[test]
    fn text_source_is_omitted_from_json() {
        let msg = Message::user("hello", TurnSource::Text);
        let value = serde_json::to_value(&msg).expect("message should serialize");
        assert!(value.get("source").is_none());
        assert_eq!(value["role"], "user");

        let voice = Message::user("hello", TurnSource::VoiceTranscription);
        let value = serde_json::to_value(&voice).expect("message should serialize");
        assert_eq!(value["source"], "voice_transcription");
    }

    #[test]
    fn guardrail_messages_are_recognized() {
        assert!(Message::assistant(GUARDRAIL_RESPONDER, "blocked").is_guardrail());
        assert!(!Message::assistant("general", "hi").is_guardrail());
        assert!(!Message::user("hi", TurnSource::Text).is_guardrail());
    }
}
