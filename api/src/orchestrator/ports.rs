//! Capability traits at the boundary between the orchestrator and the
//! outside world. Provider adapters live in `crate::providers`; tests swap
//! in scripted fakes.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::conversation::{AudioPayload, Conversation, TurnSource};
use switchyard_core::dispatch::{Attachment, Plan, SpecialistResult};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{capability} request failed: {message}")]
    Request {
        capability: &'static str,
        message: String,
    },
    #[error("{capability} returned HTTP {status}: {body}")]
    Status {
        capability: &'static str,
        status: u16,
        body: String,
    },
    #[error("{capability} returned an unusable response: {message}")]
    Decode {
        capability: &'static str,
        message: String,
    },
    #[error("{capability} did not answer within {seconds}s")]
    Timeout {
        capability: &'static str,
        seconds: u64,
    },
    #[error("{capability} is not configured")]
    NotConfigured { capability: &'static str },
}

/// Run an upstream call under a deadline.
pub async fn with_timeout<T, F>(
    capability: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout {
            capability,
            seconds: limit.as_secs(),
        }),
    }
}

/// A responder the planner may choose, as described to the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderDescriptor {
    pub tag: String,
    pub description: String,
}

pub struct PlanRequest<'a> {
    pub conversation: &'a Conversation,
    /// Text the planner routes on, already annotated with attachment/source hints
    pub input: &'a str,
    pub responders: &'a [ResponderDescriptor],
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Plan, UpstreamError>;
}

pub struct SpecialistContext<'a> {
    pub conversation: &'a Conversation,
    pub message: &'a str,
    pub instructions: Option<&'a str>,
    pub attachments: &'a [Attachment],
    pub source: TurnSource,
}

#[async_trait]
pub trait Specialist: Send + Sync {
    fn tag(&self) -> &str;

    /// One-line capability summary shown to the planner.
    fn description(&self) -> &str;

    async fn handle(&self, ctx: SpecialistContext<'_>) -> Result<SpecialistResult, UpstreamError>;
}

/// Judges whether a response satisfies a request. Returns the evaluator's
/// raw text; parsing belongs to the response guard.
#[async_trait]
pub trait ResponseEvaluator: Send + Sync {
    async fn judge(&self, instructions: &str, prompt: &str) -> Result<String, UpstreamError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationResult {
    pub flagged: bool,
    pub category_scores: BTreeMap<String, f64>,
}

impl ModerationResult {
    pub fn top_category(&self) -> Option<(&str, f64)> {
        self.category_scores
            .iter()
            .map(|(name, score)| (name.as_str(), *score))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[async_trait]
pub trait Moderator: Send + Sync {
    async fn moderate(&self, text: &str) -> Result<ModerationResult, UpstreamError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioPayload, UpstreamError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, attachment: &Attachment) -> Result<String, UpstreamError>;
}
