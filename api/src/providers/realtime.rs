//! Realtime voice sessions against an OpenAI-compatible realtime API.

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;

use super::OpenAiClient;
use crate::orchestrator::ports::UpstreamError;
use crate::voice::{EventByteStream, RealtimeProvider, RealtimeSession};

const CAPABILITY: &str = "realtime";

pub struct OpenAiRealtime {
    client: OpenAiClient,
    /// Event stream path template; `{session}` is replaced by the session handle
    events_path: String,
}

impl OpenAiRealtime {
    pub fn new(client: OpenAiClient, events_path: String) -> Self {
        Self { client, events_path }
    }

    fn events_url(&self, session: &RealtimeSession) -> String {
        self.client
            .url(&self.events_path.replace("{session}", &session.handle))
    }
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    voice: Option<String>,
    client_secret: ClientSecret,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

fn into_session(response: SessionResponse, model: &str, voice: &str) -> RealtimeSession {
    RealtimeSession {
        handle: response.id,
        client_secret: response.client_secret.value,
        expires_at: response
            .client_secret
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        model: response.model.unwrap_or_else(|| model.to_string()),
        voice: response.voice.unwrap_or_else(|| voice.to_string()),
    }
}

#[async_trait]
impl RealtimeProvider for OpenAiRealtime {
    async fn create_session(&self, model: &str, voice: &str) -> Result<RealtimeSession, UpstreamError> {
        let body = json!({
            "model": model,
            "voice": voice,
            "input_audio_transcription": { "model": "gpt-4o-mini-transcribe" },
        });
        let response: SessionResponse = self
            .client
            .post_json(CAPABILITY, "realtime/sessions", &body)
            .await?;
        Ok(into_session(response, model, voice))
    }

    async fn exchange_offer(&self, session: &RealtimeSession, sdp: &str) -> Result<String, UpstreamError> {
        let url = format!("{}?model={}", self.client.url("realtime"), session.model);
        let builder = self
            .client
            .http()
            .post(url)
            .bearer_auth(&session.client_secret)
            .header(CONTENT_TYPE, "application/sdp")
            .body(sdp.to_string());
        let response = self.client.send(CAPABILITY, builder).await?;
        let answer = response.text().await.map_err(|err| UpstreamError::Decode {
            capability: CAPABILITY,
            message: err.to_string(),
        })?;
        if answer.trim().is_empty() {
            return Err(UpstreamError::Decode {
                capability: CAPABILITY,
                message: "empty SDP answer".to_string(),
            });
        }
        Ok(answer)
    }

    async fn open_events(&self, session: &RealtimeSession) -> Result<EventByteStream, UpstreamError> {
        let builder = self
            .client
            .authorize(CAPABILITY, self.client.http().get(self.events_url(session)))?
            .header(ACCEPT, "text/event-stream");
        let response = self.client.send(CAPABILITY, builder).await?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk.map(|bytes| bytes.to_vec()).map_err(|err| UpstreamError::Request {
                capability: CAPABILITY,
                message: err.to_string(),
            })
        });
        Ok(Box::pin(stream))
    }
}
