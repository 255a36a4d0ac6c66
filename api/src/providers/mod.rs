//! OpenAI-compatible adapters for every external capability.
//!
//! Works against any provider that speaks the OpenAI chat completions,
//! moderation, audio and realtime APIs. All adapters share one
//! [`OpenAiClient`], so one connection pool and one credential.

pub mod audio;
pub mod chat;
pub mod realtime;

use std::sync::Arc;

use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use switchyard_core::dispatch::TokenUsage;

use crate::config::{AppConfig, ProviderConfig};
use crate::orchestrator::Capabilities;
use crate::orchestrator::ports::UpstreamError;
use crate::orchestrator::specialists::{Greeter, SpecialistRegistry};

/// Error bodies are cut to this many characters before they reach logs.
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Attach the API key, or fail when none is configured.
    pub(crate) fn authorize(
        &self,
        capability: &'static str,
        builder: RequestBuilder,
    ) -> Result<RequestBuilder, UpstreamError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(UpstreamError::NotConfigured { capability })?;
        Ok(builder.bearer_auth(key))
    }

    pub(crate) async fn send(
        &self,
        capability: &'static str,
        builder: RequestBuilder,
    ) -> Result<Response, UpstreamError> {
        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamError::Request {
                capability,
                message: err.to_string(),
            })?;
        check_status(capability, response).await
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        capability: &'static str,
        path: &str,
        body: &Value,
    ) -> Result<T, UpstreamError> {
        let builder = self.authorize(capability, self.http.post(self.url(path)))?.json(body);
        let response = self.send(capability, builder).await?;
        response.json::<T>().await.map_err(|err| UpstreamError::Decode {
            capability,
            message: err.to_string(),
        })
    }

    /// One chat completion. `json_mode` asks the model for a JSON object.
    pub(crate) async fn chat(
        &self,
        capability: &'static str,
        model: &str,
        messages: Vec<Value>,
        json_mode: bool,
    ) -> Result<ChatCompletion, UpstreamError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let data: ApiResponse = self.post_json(capability, "chat/completions", &body).await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Decode {
                capability,
                message: "no choices in response".to_string(),
            })?;

        Ok(ChatCompletion {
            content: choice.message.content.unwrap_or_default(),
            usage: data.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }
}

async fn check_status(capability: &'static str, response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(UpstreamError::Status {
        capability,
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Wire every capability to the configured provider. Without an API key the
/// optional capabilities (evaluation, moderation, speech) are left out, and
/// the rest fail per call with `NotConfigured`.
pub fn openai_capabilities(config: &AppConfig) -> Capabilities {
    let client = OpenAiClient::new(&config.provider);
    let configured = client.is_configured();
    if !configured {
        tracing::warn!("OPENAI_API_KEY not set; upstream capabilities will fail until configured");
    }

    let transcriber = Arc::new(audio::OpenAiTranscriber::new(
        client.clone(),
        config.provider.transcribe_model.clone(),
    ));
    let mut specialists = SpecialistRegistry::new();
    specialists
        .register(Arc::new(Greeter))
        .register(Arc::new(chat::ChatSpecialist::new(
            client.clone(),
            config.provider.chat_model.clone(),
        )))
        .register(Arc::new(chat::DocumentSpecialist::new(
            client.clone(),
            config.provider.chat_model.clone(),
        )))
        .register(Arc::new(chat::VoiceSpecialist::new(transcriber)));

    Capabilities {
        planner: Arc::new(chat::LlmPlanner::new(
            client.clone(),
            config.provider.planner_model.clone(),
        )),
        specialists,
        evaluator: configured.then(|| {
            Arc::new(chat::LlmEvaluator::new(
                client.clone(),
                config.provider.guard_model.clone(),
            )) as _
        }),
        moderator: configured.then(|| Arc::new(audio::OpenAiModerator::new(client.clone())) as _),
        speech: configured.then(|| {
            Arc::new(audio::OpenAiSpeech::new(
                client.clone(),
                config.provider.tts_model.clone(),
                config.provider.tts_voice.clone(),
            )) as _
        }),
    }
}
