use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::conversation::{AttachmentInfo, AudioPayload};

/// Built-in responder tags.
pub mod responders {
    pub const GREETER: &str = "greeter";
    pub const GENERAL: &str = "general";
    pub const DOCUMENT: &str = "document";
    pub const VOICE: &str = "voice";
}

/// An uploaded file travelling with a turn. Bytes are held in memory for
/// the duration of the turn only.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub info: AttachmentInfo,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            info: AttachmentInfo {
                filename: filename.into(),
                mime_type: mime_type.into(),
                size_bytes: data.len() as u64,
            },
            data,
        }
    }
}

/// One step of a plan: which responder to invoke and optional extra instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PlannedAction {
    pub responder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl PlannedAction {
    pub fn new(responder: impl Into<String>) -> Self {
        Self {
            responder: responder.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// Ordered actions for one queue item, plus optional operator notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Plan {
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// What a specialist hands back after handling a message.
#[derive(Debug, Clone, Default)]
pub struct SpecialistResult {
    pub content: String,
    pub audio: Option<AudioPayload>,
    pub debug: Option<serde_json::Value>,
    pub usage: Option<TokenUsage>,
    /// Follow-up text that re-enters the pipeline as a new user turn
    pub handoff: Option<String>,
}

impl SpecialistResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_handoff(mut self, handoff: impl Into<String>) -> Self {
        self.handoff = Some(handoff.into());
        self
    }
}
