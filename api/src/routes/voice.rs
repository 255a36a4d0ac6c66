use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Serialize;
use switchyard_core::voice::{
    ConnectionStateRequest, VoiceGrantResponse, VoiceOfferRequest, VoiceOfferResponse,
    VoiceSessionRequest,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::middleware::session::SessionContext;
use crate::state::AppState;
use crate::voice::BridgeOwner;

#[derive(Serialize, utoipa::ToSchema)]
pub struct VoiceStateResponse {
    pub conversation_id: Uuid,
    /// Bridge state after applying the report: idle, session_requested,
    /// ready, streaming, closed or error
    pub bridge_state: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/voice/sessions", post(create_voice_session))
        .route("/voice/offer", post(voice_offer))
        .route("/voice/session", post(voice_offer))
        .route("/voice/sessions/{conversation_id}", delete(close_voice_session))
        .route("/voice/sessions/{conversation_id}/state", post(report_connection_state))
}

/// Open a realtime voice session for a conversation
#[utoipa::path(
    post,
    path = "/voice/sessions",
    request_body = VoiceSessionRequest,
    responses(
        (status = 200, description = "Connection credentials", body = VoiceGrantResponse),
        (status = 404, description = "Unknown conversation", body = switchyard_core::error::ApiError),
        (status = 429, description = "Voice session quota exhausted", body = switchyard_core::error::ApiError),
        (status = 502, description = "Realtime provider failed", body = switchyard_core::error::ApiError)
    ),
    tag = "voice"
)]
pub async fn create_voice_session(
    State(state): State<AppState>,
    session: SessionContext,
    AppJson(req): AppJson<VoiceSessionRequest>,
) -> Result<Json<VoiceGrantResponse>, AppError> {
    let owner = BridgeOwner {
        session_id: session.session_id,
        origin_key: session.origin_key.clone(),
    };
    let grant = state.voice.create_session(req.conversation_id, owner).await?;
    Ok(Json(VoiceGrantResponse { grant }))
}

/// Exchange the client's SDP offer and start the transcript stream.
/// Also served at `/voice/session`.
#[utoipa::path(
    post,
    path = "/voice/offer",
    request_body = VoiceOfferRequest,
    responses(
        (status = 200, description = "SDP answer", body = VoiceOfferResponse),
        (status = 404, description = "No voice session for the conversation", body = switchyard_core::error::ApiError),
        (status = 502, description = "Realtime provider failed", body = switchyard_core::error::ApiError)
    ),
    tag = "voice"
)]
pub async fn voice_offer(
    State(state): State<AppState>,
    session: SessionContext,
    AppJson(req): AppJson<VoiceOfferRequest>,
) -> Result<Json<VoiceOfferResponse>, AppError> {
    if req.sdp.trim().is_empty() {
        return Err(AppError::validation("sdp must not be empty", "sdp"));
    }
    let answer = state
        .voice
        .handle_offer(req.conversation_id, session.session_id, &req.sdp)
        .await?;
    Ok(Json(answer))
}

/// Stop the bridge. Turns already forwarded stay in the conversation.
#[utoipa::path(
    delete,
    path = "/voice/sessions/{conversation_id}",
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 204, description = "Bridge torn down"),
        (status = 404, description = "No voice session for the conversation", body = switchyard_core::error::ApiError)
    ),
    tag = "voice"
)]
pub async fn close_voice_session(
    State(state): State<AppState>,
    session: SessionContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.voice.close_session(conversation_id, session.session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Report the client transport state; `failed` and `closed` tear the bridge down
#[utoipa::path(
    post,
    path = "/voice/sessions/{conversation_id}/state",
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    request_body = ConnectionStateRequest,
    responses(
        (status = 200, description = "Bridge state after the report", body = VoiceStateResponse),
        (status = 404, description = "No voice session for the conversation", body = switchyard_core::error::ApiError)
    ),
    tag = "voice"
)]
pub async fn report_connection_state(
    State(state): State<AppState>,
    session: SessionContext,
    Path(conversation_id): Path<Uuid>,
    AppJson(req): AppJson<ConnectionStateRequest>,
) -> Result<Json<VoiceStateResponse>, AppError> {
    let bridge_state =
        state
            .voice
            .update_connection_state(conversation_id, session.session_id, req.state)?;
    Ok(Json(VoiceStateResponse {
        conversation_id,
        bridge_state: bridge_state.as_str().to_string(),
    }))
}
