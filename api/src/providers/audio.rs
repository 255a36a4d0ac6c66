//! Moderation, text-to-speech and speech-to-text adapters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use switchyard_core::conversation::AudioPayload;
use switchyard_core::dispatch::Attachment;

use super::OpenAiClient;
use crate::orchestrator::ports::{
    ModerationResult, Moderator, SpeechSynthesizer, Transcriber, UpstreamError,
};

const MODERATION_MODEL: &str = "omni-moderation-latest";
const SPEECH_MIME: &str = "audio/mpeg";

pub struct OpenAiModerator {
    client: OpenAiClient,
}

impl OpenAiModerator {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationEntry>,
}

#[derive(Deserialize)]
struct ModerationEntry {
    #[serde(default)]
    flagged: bool,
    #[serde(default)]
    category_scores: BTreeMap<String, f64>,
}

/// Multiple results (one per input chunk) fold into one: flagged if any is,
/// each category at its highest score.
fn merge_results(response: ModerationResponse) -> ModerationResult {
    let mut merged = ModerationResult::default();
    for entry in response.results {
        merged.flagged |= entry.flagged;
        for (category, score) in entry.category_scores {
            let slot = merged.category_scores.entry(category).or_insert(score);
            if score > *slot {
                *slot = score;
            }
        }
    }
    merged
}

#[async_trait]
impl Moderator for OpenAiModerator {
    async fn moderate(&self, text: &str) -> Result<ModerationResult, UpstreamError> {
        let body = json!({ "model": MODERATION_MODEL, "input": text });
        let response: ModerationResponse = self.client.post_json("moderation", "moderations", &body).await?;
        Ok(merge_results(response))
    }
}

pub struct OpenAiSpeech {
    client: OpenAiClient,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    pub fn new(client: OpenAiClient, model: String, voice: String) -> Self {
        Self { client, model, voice }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, UpstreamError> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "mp3",
        });
        let builder = self
            .client
            .authorize("speech", self.client.http().post(self.client.url("audio/speech")))?
            .json(&body);
        let response = self.client.send("speech", builder).await?;
        let bytes = response.bytes().await.map_err(|err| UpstreamError::Decode {
            capability: "speech",
            message: err.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(UpstreamError::Decode {
                capability: "speech",
                message: "empty audio body".to_string(),
            });
        }
        Ok(AudioPayload {
            mime_type: SPEECH_MIME.to_string(),
            data_base64: BASE64.encode(&bytes),
            description: Some(format!("{} voice", self.voice)),
        })
    }
}

pub struct OpenAiTranscriber {
    client: OpenAiClient,
    model: String,
}

impl OpenAiTranscriber {
    pub fn new(client: OpenAiClient, model: String) -> Self {
        Self { client, model }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, attachment: &Attachment) -> Result<String, UpstreamError> {
        let part = Part::bytes(attachment.data.clone())
            .file_name(attachment.info.filename.clone())
            .mime_str(&attachment.info.mime_type)
            .map_err(|err| UpstreamError::Request {
                capability: "transcription",
                message: err.to_string(),
            })?;
        let form = Form::new().text("model", self.model.clone()).part("file", part);
        let builder = self
            .client
            .authorize(
                "transcription",
                self.client.http().post(self.client.url("audio/transcriptions")),
            )?
            .multipart(form);
        let response = self.client.send("transcription", builder).await?;
        let body: TranscriptionResponse = response.json().await.map_err(|err| UpstreamError::Decode {
            capability: "transcription",
            message: err.to_string(),
        })?;
        Ok(body.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moderation_results_merge_to_highest_scores() {
        let response: ModerationResponse = serde_json::from_str(
            r#"{"results":[
                {"flagged":false,"category_scores":{"hate":0.1,"violence":0.7}},
                {"flagged":true,"category_scores":{"hate":0.4,"violence":0.2}}
            ]}"#,
        )
        .expect("moderation response parses");
        let merged = merge_results(response);
        assert!(merged.flagged);
        assert_eq!(merged.category_scores["hate"], 0.4);
        assert_eq!(merged.category_scores["violence"], 0.7);
        assert_eq!(merged.top_category(), Some(("violence", 0.7)));
    }

    #[test]
    fn empty_moderation_response_is_clean() {
        let response: ModerationResponse = serde_json::from_str("{}").expect("parses");
        assert_eq!(merge_results(response), ModerationResult::default());
    }
}
