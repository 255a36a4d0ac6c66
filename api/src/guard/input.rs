//! Pre-dispatch validation of an inbound turn.
//!
//! Checks run in a fixed order and the first failure wins: attachment size,
//! attachment type, content moderation, short-transcript confirmation.

use std::sync::Arc;

use serde_json::json;
use switchyard_core::conversation::TurnSource;
use switchyard_core::dispatch::Attachment;
use switchyard_core::guard::{GuardDecision, GuardReason};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::InputGuardConfig;
use crate::orchestrator::ports::{Moderator, UpstreamError};

pub struct InputGuardRequest<'a> {
    pub conversation_id: Uuid,
    pub session_id: Uuid,
    pub message: &'a str,
    pub attachments: &'a [Attachment],
    pub source: TurnSource,
    pub origin: Option<&'a str>,
}

pub struct InputGuard {
    config: InputGuardConfig,
    moderator: Option<Arc<dyn Moderator>>,
    audit: Arc<AuditLog>,
}

impl InputGuard {
    pub fn new(
        config: InputGuardConfig,
        moderator: Option<Arc<dyn Moderator>>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            moderator,
            audit,
        }
    }

    pub async fn evaluate(&self, request: InputGuardRequest<'_>) -> Result<GuardDecision, UpstreamError> {
        let (decision, moderation_score) = self.decide(&request).await?;

        self.audit.append(
            AuditEntry::new("input_guard", request.conversation_id)
                .session(request.session_id)
                .payload(json!({
                    "stage": "input",
                    "disposition": decision.status.as_str(),
                    "reason": decision.reason.as_str(),
                    "source": request.source.as_str(),
                    "attachments": request.attachments.len(),
                    "moderation_score": moderation_score,
                    "origin": request.origin,
                })),
        );
        if !decision.is_allowed() {
            tracing::info!(
                conversation_id = %request.conversation_id,
                disposition = decision.status.as_str(),
                reason = decision.reason.as_str(),
                "input guard stopped turn"
            );
        }
        Ok(decision)
    }

    async fn decide(
        &self,
        request: &InputGuardRequest<'_>,
    ) -> Result<(GuardDecision, Option<f64>), UpstreamError> {
        for attachment in request.attachments {
            if attachment.info.size_bytes > self.config.max_attachment_bytes {
                return Ok((
                    GuardDecision::blocked(
                        GuardReason::AttachmentSize,
                        format!(
                            "\"{}\" is too large ({} bytes). Attachments must be {} bytes or smaller.",
                            attachment.info.filename,
                            attachment.info.size_bytes,
                            self.config.max_attachment_bytes
                        ),
                    ),
                    None,
                ));
            }
        }

        for attachment in request.attachments {
            let mime = normalize_mime(&attachment.info.mime_type);
            if !self.config.allowed_mime_types.contains(&mime) {
                return Ok((
                    GuardDecision::blocked(
                        GuardReason::AttachmentType,
                        format!(
                            "Files of type \"{mime}\" aren't supported here. Try audio, a PDF, plain text or an image."
                        ),
                    ),
                    None,
                ));
            }
        }

        let mut moderation_score = None;
        if self.config.moderation_enabled && !request.message.trim().is_empty() {
            if let Some(moderator) = &self.moderator {
                let result = moderator.moderate(request.message).await?;
                let top = result.top_category();
                moderation_score = top.map(|(_, score)| score);
                if let Some((category, score)) = top
                    && result.flagged
                    && score >= self.config.moderation_threshold
                {
                    tracing::debug!(category, score, "moderation flagged message");
                    return Ok((
                        GuardDecision::blocked(
                            GuardReason::Moderation,
                            "I can't help with that request. Please rephrase it and try again.",
                        ),
                        moderation_score,
                    ));
                }
            } else {
                tracing::warn!("moderation enabled but no moderator is configured; skipping");
            }
        }

        if request.source == TurnSource::VoiceTranscription && self.config.confirm_short_transcripts {
            let trimmed = request.message.trim();
            if trimmed.chars().count() < self.config.min_transcript_chars {
                return Ok((
                    GuardDecision::needs_confirmation(
                        GuardReason::ShortTranscription,
                        format!(
                            "I only caught \"{trimmed}\". Could you repeat that or say a little more?"
                        ),
                    ),
                    moderation_score,
                ));
            }
        }

        Ok((GuardDecision::allow(), moderation_score))
    }
}

/// Lowercase and drop parameters: `Audio/WebM; codecs=opus` -> `audio/webm`.
fn normalize_mime(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
