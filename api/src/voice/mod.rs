//! Realtime voice bridge.
//!
//! Per conversation: request an external realtime session (metered as one
//! `voice_session`), accept the client's transport offer, and start exactly
//! one background task that reads the provider's event stream, assembles
//! finished utterances and feeds each into the orchestrator as a
//! `voice_transcription` turn. Stopping the bridge cancels the stream read;
//! turns already forwarded stay in the conversation.

pub mod sse;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::json;
use switchyard_core::conversation::TurnSource;
use switchyard_core::usage::{LimitDecision, UsageEvent, UsageKeys};
use switchyard_core::voice::{ConnectionState, IceServer, VoiceGrant, VoiceOfferResponse};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::RealtimeConfig;
use crate::orchestrator::ports::{UpstreamError, with_timeout};
use crate::orchestrator::{Orchestrator, TurnContext, TurnError};
use crate::usage::UsageLimiter;

use self::sse::{SseDecoder, TranscriptAssembler};

pub type EventByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, UpstreamError>> + Send>>;

/// An external realtime session as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSession {
    pub handle: String,
    pub client_secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub model: String,
    pub voice: String,
}

#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    async fn create_session(&self, model: &str, voice: &str) -> Result<RealtimeSession, UpstreamError>;

    /// Exchange an SDP offer for the provider's SDP answer.
    async fn exchange_offer(&self, session: &RealtimeSession, sdp: &str) -> Result<String, UpstreamError>;

    async fn open_events(&self, session: &RealtimeSession) -> Result<EventByteStream, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    SessionRequested,
    Ready,
    Streaming,
    Closed,
    Error,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SessionRequested => "session_requested",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("voice session quota exceeded")]
    Blocked(LimitDecision),
    #[error("no voice session for conversation {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Who owns a bridge. Mirrors the HTTP caller's session identity.
#[derive(Debug, Clone)]
pub struct BridgeOwner {
    pub session_id: Uuid,
    pub origin_key: Option<String>,
}

impl BridgeOwner {
    fn usage_keys(&self) -> UsageKeys {
        UsageKeys::new(self.session_id.to_string(), self.origin_key.clone())
    }
}

struct BridgeSession {
    generation: u64,
    owner: BridgeOwner,
    remote: Option<RealtimeSession>,
    state: BridgeState,
    cancel: CancellationToken,
}

type SessionMap = Arc<Mutex<HashMap<Uuid, BridgeSession>>>;

fn lock(sessions: &SessionMap) -> MutexGuard<'_, HashMap<Uuid, BridgeSession>> {
    sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct VoiceBridge {
    provider: Arc<dyn RealtimeProvider>,
    orchestrator: Arc<Orchestrator>,
    limiter: Arc<UsageLimiter>,
    audit: Arc<AuditLog>,
    config: RealtimeConfig,
    timeout: std::time::Duration,
    sessions: SessionMap,
    generations: AtomicU64,
}

impl VoiceBridge {
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        orchestrator: Arc<Orchestrator>,
        limiter: Arc<UsageLimiter>,
        audit: Arc<AuditLog>,
        config: RealtimeConfig,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            orchestrator,
            limiter,
            audit,
            config,
            timeout,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(1),
        }
    }

    pub fn state(&self, conversation_id: Uuid) -> BridgeState {
        lock(&self.sessions)
            .get(&conversation_id)
            .map(|session| session.state)
            .unwrap_or(BridgeState::Idle)
    }

    /// Meter, open an external session and hand back connection credentials.
    /// Any existing bridge for the conversation is torn down first.
    pub async fn create_session(
        &self,
        conversation_id: Uuid,
        owner: BridgeOwner,
    ) -> Result<VoiceGrant, BridgeError> {
        self.orchestrator
            .authorize(conversation_id, owner.session_id)
            .await?;

        let decision = self
            .limiter
            .consume(UsageEvent::VoiceSession, &owner.usage_keys(), 1);
        if !decision.allowed {
            self.audit.append(
                AuditEntry::new("voice_session", conversation_id)
                    .session(owner.session_id)
                    .payload(json!({ "disposition": "blocked", "limit": decision })),
            );
            return Err(BridgeError::Blocked(decision));
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let replaced = lock(&self.sessions).insert(
            conversation_id,
            BridgeSession {
                generation,
                owner: owner.clone(),
                remote: None,
                state: BridgeState::SessionRequested,
                cancel: CancellationToken::new(),
            },
        );
        if let Some(previous) = replaced {
            previous.cancel.cancel();
            tracing::info!(conversation_id = %conversation_id, "replacing existing voice bridge");
        }

        let remote = match with_timeout(
            "realtime",
            self.timeout,
            self.provider.create_session(&self.config.model, &self.config.voice),
        )
        .await
        {
            Ok(remote) => remote,
            Err(err) => {
                self.remove_if_current(conversation_id, generation);
                self.audit.append(
                    AuditEntry::new("voice_session", conversation_id)
                        .session(owner.session_id)
                        .payload(json!({ "disposition": "error", "error": err.to_string() })),
                );
                return Err(err.into());
            }
        };

        {
            let mut sessions = lock(&self.sessions);
            match sessions.get_mut(&conversation_id) {
                Some(session) if session.generation == generation => {
                    session.remote = Some(remote.clone());
                    session.state = BridgeState::Ready;
                }
                _ => {
                    tracing::debug!(conversation_id = %conversation_id, "voice bridge replaced during setup");
                }
            }
        }

        self.audit.append(
            AuditEntry::new("voice_session", conversation_id)
                .session(owner.session_id)
                .payload(json!({
                    "disposition": "ready",
                    "handle": remote.handle,
                    "model": remote.model,
                    "voice": remote.voice,
                    "limit": decision,
                })),
        );
        tracing::info!(conversation_id = %conversation_id, handle = %remote.handle, "voice session ready");

        Ok(VoiceGrant {
            conversation_id,
            session_handle: remote.handle,
            client_secret: remote.client_secret,
            expires_at: remote.expires_at,
            model: remote.model,
            voice: remote.voice,
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|url| IceServer {
                    urls: vec![url.clone()],
                })
                .collect(),
        })
    }

    /// Answer a transport offer. The event stream is started on the first
    /// offer only; later offers renegotiate transport without a second reader.
    pub async fn handle_offer(
        &self,
        conversation_id: Uuid,
        session_id: Uuid,
        sdp: &str,
    ) -> Result<VoiceOfferResponse, BridgeError> {
        let remote = {
            let sessions = lock(&self.sessions);
            let session = sessions
                .get(&conversation_id)
                .ok_or(BridgeError::NotFound(conversation_id))?;
            if session.owner.session_id != session_id {
                return Err(TurnError::Forbidden(conversation_id).into());
            }
            session
                .remote
                .clone()
                .ok_or(BridgeError::NotFound(conversation_id))?
        };

        let answer_sdp = with_timeout(
            "realtime",
            self.timeout,
            self.provider.exchange_offer(&remote, sdp),
        )
        .await?;

        let worker = {
            let mut sessions = lock(&self.sessions);
            match sessions.get_mut(&conversation_id) {
                Some(session) if session.state == BridgeState::Ready => {
                    session.state = BridgeState::Streaming;
                    Some(StreamWorker {
                        conversation_id,
                        generation: session.generation,
                        owner: session.owner.clone(),
                        remote: remote.clone(),
                        cancel: session.cancel.clone(),
                        provider: self.provider.clone(),
                        orchestrator: self.orchestrator.clone(),
                        limiter: self.limiter.clone(),
                        audit: self.audit.clone(),
                        sessions: self.sessions.clone(),
                    })
                }
                Some(_) => None,
                None => return Err(BridgeError::NotFound(conversation_id)),
            }
        };

        let stream_started = worker.is_some();
        if let Some(worker) = worker {
            tokio::spawn(worker.run());
            tracing::info!(conversation_id = %conversation_id, "voice event stream started");
        }

        Ok(VoiceOfferResponse {
            conversation_id,
            answer_sdp,
            stream_started,
        })
    }

    pub fn close_session(&self, conversation_id: Uuid, session_id: Uuid) -> Result<(), BridgeError> {
        self.teardown(conversation_id, session_id, BridgeState::Closed, "closed")
    }

    /// Record a transport state reported by the client; terminal states
    /// tear the bridge down.
    pub fn update_connection_state(
        &self,
        conversation_id: Uuid,
        session_id: Uuid,
        state: ConnectionState,
    ) -> Result<BridgeState, BridgeError> {
        match state {
            ConnectionState::Failed => {
                self.teardown(conversation_id, session_id, BridgeState::Error, "failed")?;
                Ok(BridgeState::Error)
            }
            ConnectionState::Closed => {
                self.teardown(conversation_id, session_id, BridgeState::Closed, "closed")?;
                Ok(BridgeState::Closed)
            }
            _ => {
                let sessions = lock(&self.sessions);
                let session = sessions
                    .get(&conversation_id)
                    .ok_or(BridgeError::NotFound(conversation_id))?;
                if session.owner.session_id != session_id {
                    return Err(TurnError::Forbidden(conversation_id).into());
                }
                tracing::debug!(
                    conversation_id = %conversation_id,
                    transport = ?state,
                    bridge = session.state.as_str(),
                    "voice transport state"
                );
                Ok(session.state)
            }
        }
    }

    fn teardown(
        &self,
        conversation_id: Uuid,
        session_id: Uuid,
        final_state: BridgeState,
        reason: &str,
    ) -> Result<(), BridgeError> {
        let session = {
            let mut sessions = lock(&self.sessions);
            let owned = sessions
                .get(&conversation_id)
                .map(|session| session.owner.session_id == session_id)
                .ok_or(BridgeError::NotFound(conversation_id))?;
            if !owned {
                return Err(TurnError::Forbidden(conversation_id).into());
            }
            sessions.remove(&conversation_id)
        };
        if let Some(session) = session {
            session.cancel.cancel();
            self.audit.append(
                AuditEntry::new("voice_session_closed", conversation_id)
                    .session(session_id)
                    .payload(json!({
                        "reason": reason,
                        "from": session.state.as_str(),
                        "to": final_state.as_str(),
                    })),
            );
            tracing::info!(conversation_id = %conversation_id, reason, "voice bridge torn down");
        }
        Ok(())
    }

    fn remove_if_current(&self, conversation_id: Uuid, generation: u64) {
        remove_generation(&self.sessions, conversation_id, generation);
    }
}

fn remove_generation(sessions: &SessionMap, conversation_id: Uuid, generation: u64) -> bool {
    let mut sessions = lock(sessions);
    if sessions
        .get(&conversation_id)
        .is_some_and(|session| session.generation == generation)
    {
        sessions.remove(&conversation_id);
        return true;
    }
    false
}

/// Background reader for one bridge generation.
struct StreamWorker {
    conversation_id: Uuid,
    generation: u64,
    owner: BridgeOwner,
    remote: RealtimeSession,
    cancel: CancellationToken,
    provider: Arc<dyn RealtimeProvider>,
    orchestrator: Arc<Orchestrator>,
    limiter: Arc<UsageLimiter>,
    audit: Arc<AuditLog>,
    sessions: SessionMap,
}

impl StreamWorker {
    async fn run(self) {
        let outcome = self.consume().await;
        let (reason, error) = match &outcome {
            Ok(reason) => (*reason, None),
            Err(err) => ("error", Some(err.to_string())),
        };
        if let Some(error) = &error {
            tracing::warn!(conversation_id = %self.conversation_id, error = %error, "voice event stream failed");
        }
        // A cancelled worker was already removed by whoever cancelled it.
        if reason != "cancelled" && remove_generation(&self.sessions, self.conversation_id, self.generation) {
            self.audit.append(
                AuditEntry::new("voice_session_closed", self.conversation_id)
                    .session(self.owner.session_id)
                    .payload(json!({ "reason": reason, "error": error })),
            );
        }
        tracing::debug!(conversation_id = %self.conversation_id, reason, "voice stream worker finished");
    }

    async fn consume(&self) -> Result<&'static str, UpstreamError> {
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok("cancelled"),
            opened = self.provider.open_events(&self.remote) => opened?,
        };

        let mut decoder = SseDecoder::new();
        let mut assembler = TranscriptAssembler::new();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok("cancelled"),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        if let Some(utterance) = assembler.apply(&event) {
                            self.forward(utterance).await;
                        }
                    }
                }
                Some(Err(err)) => return Err(err),
                None => {
                    if let Some(event) = decoder.finish()
                        && let Some(utterance) = assembler.apply(&event)
                    {
                        self.forward(utterance).await;
                    }
                    return Ok("stream_ended");
                }
            }
        }
    }

    async fn forward(&self, utterance: String) {
        let decision = self
            .limiter
            .consume(UsageEvent::Transcription, &self.owner.usage_keys(), 1);
        if !decision.allowed {
            self.audit.append(
                AuditEntry::new("voice_turn_blocked", self.conversation_id)
                    .session(self.owner.session_id)
                    .payload(json!({ "content": utterance, "limit": decision })),
            );
            return;
        }

        let ctx = TurnContext::new(
            self.owner.session_id,
            self.owner.origin_key.clone(),
            TurnSource::VoiceTranscription,
        )
        .with_admission(decision);
        if let Err(err) = self
            .orchestrator
            .handle_turn(self.conversation_id, utterance, Vec::new(), ctx)
            .await
        {
            tracing::warn!(conversation_id = %self.conversation_id, error = %err, "forwarded voice turn failed");
            self.audit.append(
                AuditEntry::new("voice_turn_failed", self.conversation_id)
                    .session(self.owner.session_id)
                    .payload(json!({ "error": err.to_string() })),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AppConfig, UsageConfig};
    use crate::orchestrator::tests::{Harness, ScriptedPlanner, ScriptedSpecialist, capabilities, harness};
    use std::time::Duration;
    use switchyard_core::conversation::Role;
    use switchyard_core::dispatch::{Plan, PlannedAction};
    use switchyard_core::usage::UsageScope;

    pub(crate) struct FakeRealtime {
        chunks: Vec<String>,
        hold_open: bool,
        pub(crate) opened: AtomicU64,
    }

    impl FakeRealtime {
        pub(crate) fn new(chunks: &[&str], hold_open: bool) -> Arc<Self> {
            Arc::new(Self {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                hold_open,
                opened: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl RealtimeProvider for FakeRealtime {
        async fn create_session(&self, model: &str, voice: &str) -> Result<RealtimeSession, UpstreamError> {
            Ok(RealtimeSession {
                handle: "sess_test".to_string(),
                client_secret: "ek_test".to_string(),
                expires_at: None,
                model: model.to_string(),
                voice: voice.to_string(),
            })
        }

        async fn exchange_offer(&self, _session: &RealtimeSession, sdp: &str) -> Result<String, UpstreamError> {
            Ok(format!("answer for {sdp}"))
        }

        async fn open_events(&self, _session: &RealtimeSession) -> Result<EventByteStream, UpstreamError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let items: Vec<Result<Vec<u8>, UpstreamError>> = self
                .chunks
                .iter()
                .map(|chunk| Ok(chunk.as_bytes().to_vec()))
                .collect();
            let stream = futures::stream::iter(items);
            if self.hold_open {
                Ok(Box::pin(stream.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(stream))
            }
        }
    }

    fn bridge_for(h: &Harness, provider: Arc<FakeRealtime>, orchestrator: Arc<Orchestrator>) -> VoiceBridge {
        VoiceBridge::new(
            provider,
            orchestrator,
            h.limiter.clone(),
            h.audit.clone(),
            RealtimeConfig::default(),
            Duration::from_secs(5),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn setup(config: AppConfig) -> (Harness, Arc<Orchestrator>) {
        let planner = ScriptedPlanner::new(vec![Plan {
            actions: vec![PlannedAction::new("general")],
            notes: None,
        }]);
        let general = ScriptedSpecialist::new("general", vec![]);
        let h = harness(config, capabilities(planner, vec![general]));
        let orchestrator = h.orchestrator.clone();
        (h, orchestrator)
    }

    #[tokio::test]
    async fn finished_utterances_become_voice_turns() {
        let (h, orchestrator) = setup(AppConfig::default());
        let session = Uuid::now_v7();
        let conversation = orchestrator.create_conversation(session).await.expect("conversation");
        let provider = FakeRealtime::new(
            &[
                "data: {\"type\":\"transcript.delta\",\"delta\":\"what's the \"}\n\n",
                "data: {\"type\":\"transcript.delta\",\"delta\":\"weather today\"}\n\ndata: {\"type\":\"transcript.done\"}\n\n",
            ],
            false,
        );
        let bridge = bridge_for(&h, provider.clone(), orchestrator.clone());
        let owner = BridgeOwner {
            session_id: session,
            origin_key: None,
        };

        let grant = bridge.create_session(conversation.id, owner).await.expect("grant");
        assert_eq!(grant.client_secret, "ek_test");
        assert_eq!(grant.ice_servers.len(), 1);
        assert_eq!(bridge.state(conversation.id), BridgeState::Ready);

        let answer = bridge
            .handle_offer(conversation.id, session, "v=0")
            .await
            .expect("offer");
        assert!(answer.stream_started);
        assert_eq!(answer.answer_sdp, "answer for v=0");

        wait_for(|| bridge.state(conversation.id) == BridgeState::Idle).await;
        let conversation = orchestrator
            .conversation(conversation.id, session)
            .await
            .expect("conversation");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].content, "what's the weather today");
        assert_eq!(conversation.messages[0].source, TurnSource::VoiceTranscription);
        assert_eq!(conversation.messages[1].content, "general reply");

        let keys = UsageKeys::new(session.to_string(), None);
        assert_eq!(h.limiter.ledger().get_count(UsageEvent::VoiceSession, &keys).session, 1);
        assert_eq!(h.limiter.ledger().get_count(UsageEvent::Transcription, &keys).session, 1);
    }

    #[tokio::test]
    async fn second_offer_does_not_start_a_second_stream() {
        let (h, orchestrator) = setup(AppConfig::default());
        let session = Uuid::now_v7();
        let conversation = orchestrator.create_conversation(session).await.expect("conversation");
        let provider = FakeRealtime::new(&[], true);
        let bridge = bridge_for(&h, provider.clone(), orchestrator);
        bridge
            .create_session(
                conversation.id,
                BridgeOwner {
                    session_id: session,
                    origin_key: None,
                },
            )
            .await
            .expect("grant");

        let first = bridge.handle_offer(conversation.id, session, "a").await.expect("offer");
        let second = bridge.handle_offer(conversation.id, session, "b").await.expect("offer");
        assert!(first.stream_started);
        assert!(!second.stream_started);
        assert_eq!(bridge.state(conversation.id), BridgeState::Streaming);
        wait_for(|| provider.opened.load(Ordering::SeqCst) == 1).await;

        bridge.close_session(conversation.id, session).expect("close");
        assert_eq!(bridge.state(conversation.id), BridgeState::Idle);
        assert!(matches!(
            bridge.close_session(conversation.id, session),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn voice_session_quota_blocks_without_opening() {
        let config = AppConfig {
            usage: UsageConfig::default().with_limit(UsageScope::Session, UsageEvent::VoiceSession, 1),
            ..AppConfig::default()
        };
        let (h, orchestrator) = setup(config);
        let session = Uuid::now_v7();
        let conversation = orchestrator.create_conversation(session).await.expect("conversation");
        let bridge = bridge_for(&h, FakeRealtime::new(&[], true), orchestrator);
        let owner = BridgeOwner {
            session_id: session,
            origin_key: None,
        };

        bridge.create_session(conversation.id, owner.clone()).await.expect("first grant");
        let err = bridge
            .create_session(conversation.id, owner)
            .await
            .expect_err("quota");
        match err {
            BridgeError::Blocked(decision) => {
                assert!(!decision.allowed);
                assert_eq!(decision.limit_type, Some(UsageScope::Session));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_transport_state_tears_down() {
        let (h, orchestrator) = setup(AppConfig::default());
        let session = Uuid::now_v7();
        let conversation = orchestrator.create_conversation(session).await.expect("conversation");
        let bridge = bridge_for(&h, FakeRealtime::new(&[], true), orchestrator);
        bridge
            .create_session(
                conversation.id,
                BridgeOwner {
                    session_id: session,
                    origin_key: None,
                },
            )
            .await
            .expect("grant");

        let state = bridge
            .update_connection_state(conversation.id, session, ConnectionState::Disconnected)
            .expect("state");
        assert_eq!(state, BridgeState::Ready);

        let stranger = Uuid::now_v7();
        assert!(matches!(
            bridge.update_connection_state(conversation.id, stranger, ConnectionState::Failed),
            Err(BridgeError::Turn(TurnError::Forbidden(_)))
        ));

        let state = bridge
            .update_connection_state(conversation.id, session, ConnectionState::Failed)
            .expect("state");
        assert_eq!(state, BridgeState::Error);
        assert_eq!(bridge.state(conversation.id), BridgeState::Idle);
    }

    #[tokio::test]
    async fn offers_require_a_session() {
        let (h, orchestrator) = setup(AppConfig::default());
        let bridge = bridge_for(&h, FakeRealtime::new(&[], false), orchestrator);
        let err = bridge
            .handle_offer(Uuid::now_v7(), Uuid::now_v7(), "v=0")
            .await
            .expect_err("no session");
        assert!(matches!(err, BridgeError::NotFound(_)));
    }
}
