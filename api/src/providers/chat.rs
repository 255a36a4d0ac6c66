//! Chat-completion backed capabilities: the planner, the text specialists
//! and the response evaluator.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use switchyard_core::conversation::{Conversation, Role, TurnSource};
use switchyard_core::dispatch::{Attachment, Plan, SpecialistResult, responders};

use super::OpenAiClient;
use crate::orchestrator::ports::{
    PlanRequest, Planner, ResponderDescriptor, ResponseEvaluator, Specialist, SpecialistContext,
    Transcriber, UpstreamError,
};

/// Earlier messages sent along with each specialist call.
const HISTORY_WINDOW: usize = 20;
/// Text attachments are inlined up to this many characters.
const MAX_INLINE_CHARS: usize = 20_000;

const PLANNER_INSTRUCTIONS: &str = "You route user messages to responders. \
Reply with a JSON object of the form \
{\"actions\":[{\"responder\":\"<tag>\",\"instructions\":\"<optional extra guidance>\"}],\"notes\":\"<optional>\"}. \
Pick one or more responders from the list below, in the order they should answer. \
Only use tags from the list. Return an empty actions array if nothing fits.";

pub struct LlmPlanner {
    client: OpenAiClient,
    model: String,
}

impl LlmPlanner {
    pub fn new(client: OpenAiClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan, UpstreamError> {
        let messages = vec![
            json!({ "role": "system", "content": planner_system_prompt(request.responders) }),
            json!({ "role": "user", "content": request.input }),
        ];
        let completion = self.client.chat("planner", &self.model, messages, true).await?;
        Ok(parse_plan(&completion.content).unwrap_or_else(|| {
            tracing::warn!(
                conversation_id = %request.conversation.id,
                raw = %completion.content.chars().take(200).collect::<String>(),
                "planner returned an unparseable plan"
            );
            Plan::default()
        }))
    }
}

fn planner_system_prompt(responders: &[ResponderDescriptor]) -> String {
    let mut prompt = String::from(PLANNER_INSTRUCTIONS);
    prompt.push_str("\n\nResponders:");
    for responder in responders {
        prompt.push_str(&format!("\n- {}: {}", responder.tag, responder.description));
    }
    prompt
}

/// Accepts the plan object bare or wrapped in prose/code fences.
fn parse_plan(raw: &str) -> Option<Plan> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let mut plan: Plan = serde_json::from_str(&raw[start..=end]).ok()?;
    plan.actions.retain(|action| !action.responder.trim().is_empty());
    for action in &mut plan.actions {
        action.responder = action.responder.trim().to_string();
        if action.instructions.as_deref().is_some_and(|i| i.trim().is_empty()) {
            action.instructions = None;
        }
    }
    Some(plan)
}

/// Prior turns as chat messages, oldest first. The message currently being
/// answered is left out when it is the conversation's last entry.
fn history(conversation: &Conversation, current: &str) -> Vec<Value> {
    let mut messages: Vec<_> = conversation
        .messages
        .iter()
        .filter(|message| !message.is_guardrail())
        .collect();
    if messages
        .last()
        .is_some_and(|last| last.role == Role::User && last.content == current)
    {
        messages.pop();
    }
    let skip = messages.len().saturating_sub(HISTORY_WINDOW);
    messages
        .into_iter()
        .skip(skip)
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": message.content })
        })
        .collect()
}

fn system_prompt(base: &str, instructions: Option<&str>) -> Value {
    let content = match instructions {
        Some(extra) if !extra.trim().is_empty() => format!("{base}\n\nAdditional instructions: {extra}"),
        _ => base.to_string(),
    };
    json!({ "role": "system", "content": content })
}

fn result_from(completion: super::ChatCompletion) -> SpecialistResult {
    SpecialistResult {
        content: completion.content.trim().to_string(),
        usage: completion.usage,
        ..SpecialistResult::default()
    }
}

const GENERAL_PROMPT: &str = "You are a helpful assistant. Answer the user's latest message directly and concisely. \
If the request is missing information you need, ask one short clarifying question.";

/// General-purpose conversational answers.
pub struct ChatSpecialist {
    client: OpenAiClient,
    model: String,
}

impl ChatSpecialist {
    pub fn new(client: OpenAiClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl Specialist for ChatSpecialist {
    fn tag(&self) -> &str {
        responders::GENERAL
    }

    fn description(&self) -> &str {
        "Answers general questions and carries the conversation. The default for ordinary requests."
    }

    async fn handle(&self, ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
        let mut messages = vec![system_prompt(GENERAL_PROMPT, ctx.instructions)];
        messages.extend(history(ctx.conversation, ctx.message));
        messages.push(json!({ "role": "user", "content": ctx.message }));
        let completion = self.client.chat("general", &self.model, messages, false).await?;
        Ok(result_from(completion))
    }
}

const DOCUMENT_PROMPT: &str = "You analyse documents and images the user has attached. \
Summarise or answer questions about them. If a file could not be read, say so plainly.";

/// Reads attached documents and images.
pub struct DocumentSpecialist {
    client: OpenAiClient,
    model: String,
}

impl DocumentSpecialist {
    pub fn new(client: OpenAiClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl Specialist for DocumentSpecialist {
    fn tag(&self) -> &str {
        responders::DOCUMENT
    }

    fn description(&self) -> &str {
        "Reads attached documents, text files and images and answers questions about them."
    }

    async fn handle(&self, ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
        let documents: Vec<&Attachment> = ctx
            .attachments
            .iter()
            .filter(|attachment| !attachment.info.is_audio())
            .collect();
        if documents.is_empty() {
            return Ok(SpecialistResult::text(
                "I don't see a document attached to this message. Attach a file and I'll read it.",
            ));
        }

        let mut messages = vec![system_prompt(DOCUMENT_PROMPT, ctx.instructions)];
        messages.extend(history(ctx.conversation, ctx.message));
        messages.push(json!({ "role": "user", "content": document_parts(ctx.message, &documents) }));
        let completion = self.client.chat("document", &self.model, messages, false).await?;
        let mut result = result_from(completion);
        result.debug = Some(json!({
            "documents": documents
                .iter()
                .map(|d| json!({ "filename": d.info.filename, "mime_type": d.info.mime_type }))
                .collect::<Vec<_>>(),
        }));
        Ok(result)
    }
}

/// Multi-part user content: the question, then one part per file.
fn document_parts(message: &str, documents: &[&Attachment]) -> Vec<Value> {
    let question = if message.trim().is_empty() {
        "Please summarise the attached file."
    } else {
        message
    };
    let mut parts = vec![json!({ "type": "text", "text": question })];
    for document in documents {
        let info = &document.info;
        let mime = info.mime_type.to_ascii_lowercase();
        if mime.starts_with("image/") {
            let url = format!("data:{};base64,{}", mime, BASE64.encode(&document.data));
            parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
        } else if mime.starts_with("text/") || mime == "application/json" {
            let text = String::from_utf8_lossy(&document.data);
            let mut inlined: String = text.chars().take(MAX_INLINE_CHARS).collect();
            if text.chars().count() > MAX_INLINE_CHARS {
                inlined.push_str("\n[truncated]");
            }
            parts.push(json!({
                "type": "text",
                "text": format!("File {}:\n{}", info.filename, inlined),
            }));
        } else {
            parts.push(json!({
                "type": "text",
                "text": format!(
                    "File {} ({}, {} bytes) is attached but its contents could not be extracted.",
                    info.filename, info.mime_type, info.size_bytes
                ),
            }));
        }
    }
    parts
}

/// Transcribes voice notes and hands the transcript back to the pipeline
/// as a new user turn.
pub struct VoiceSpecialist {
    transcriber: Arc<dyn Transcriber>,
}

impl VoiceSpecialist {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl Specialist for VoiceSpecialist {
    fn tag(&self) -> &str {
        responders::VOICE
    }

    fn description(&self) -> &str {
        "Transcribes attached voice notes or audio files. Use whenever audio is attached."
    }

    async fn handle(&self, ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError> {
        if ctx.source == TurnSource::VoiceTranscription {
            return Ok(SpecialistResult::text("That message was already transcribed."));
        }

        let mut transcripts = Vec::new();
        for attachment in ctx.attachments.iter().filter(|a| a.info.is_audio()) {
            let text = self.transcriber.transcribe(attachment).await?;
            let text = text.trim();
            if !text.is_empty() {
                transcripts.push(text.to_string());
            }
        }

        if transcripts.is_empty() {
            return Ok(SpecialistResult::text(
                "I couldn't find any speech in that attachment.",
            ));
        }
        let transcript = transcripts.join(" ");
        Ok(SpecialistResult::text(format!("Transcript: \"{transcript}\"")).with_handoff(transcript))
    }
}

/// Asks a chat model to judge a response. Returns the raw model text.
pub struct LlmEvaluator {
    client: OpenAiClient,
    model: String,
}

impl LlmEvaluator {
    pub fn new(client: OpenAiClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl ResponseEvaluator for LlmEvaluator {
    async fn judge(&self, instructions: &str, prompt: &str) -> Result<String, UpstreamError> {
        let messages = vec![
            json!({ "role": "system", "content": instructions }),
            json!({ "role": "user", "content": prompt }),
        ];
        let completion = self.client.chat("response_evaluator", &self.model, messages, true).await?;
        Ok(completion.content)
    }
}
