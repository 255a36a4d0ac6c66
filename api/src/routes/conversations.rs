use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use switchyard_core::conversation::{
    CreateConversationResponse, Message, TurnResponse, TurnSource,
};
use switchyard_core::usage::UsageEvent;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::AppError;
use crate::extract::TurnPayload;
use crate::middleware::session::SessionContext;
use crate::orchestrator::TurnContext;
use crate::state::AppState;

/// Multipart framing and the text fields on top of the largest attachment.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Serialize, utoipa::ToSchema)]
pub struct MessagesResponse {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ConversationLogResponse {
    pub conversation_id: Uuid,
    pub entries: Vec<AuditEntry>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route("/conversations/{id}/log", get(conversation_log))
}

/// Message routes, kept separate so they can carry their own burst limit.
pub fn turn_router(max_attachment_bytes: u64) -> Router<AppState> {
    let limit = usize::try_from(max_attachment_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_OVERHEAD_BYTES);
    Router::new()
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .layer(DefaultBodyLimit::max(limit))
}

/// Start a conversation owned by the caller's session
#[utoipa::path(
    post,
    path = "/conversations",
    responses(
        (status = 201, description = "Conversation created", body = CreateConversationResponse)
    ),
    tag = "conversations"
)]
pub async fn create_conversation(
    State(state): State<AppState>,
    session: SessionContext,
) -> Result<(StatusCode, Json<CreateConversationResponse>), AppError> {
    let conversation = state
        .orchestrator
        .create_conversation(session.session_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse {
            id: conversation.id,
            created_at: conversation.created_at,
        }),
    ))
}

/// Send one turn: JSON `{content, source?}` or multipart with an attachment.
///
/// Consumes one `message` unit, plus one `upload` unit when a file is
/// attached, before anything is dispatched. Both are admitted together or
/// the request is refused without spending either.
#[utoipa::path(
    post,
    path = "/conversations/{id}/messages",
    params(("id" = Uuid, Path, description = "Conversation id")),
    request_body = switchyard_core::conversation::SendMessageRequest,
    responses(
        (status = 200, description = "Turn handled", body = TurnResponse),
        (status = 400, description = "Invalid payload", body = switchyard_core::error::ApiError),
        (status = 403, description = "Conversation belongs to another session", body = switchyard_core::error::ApiError),
        (status = 404, description = "Unknown conversation", body = switchyard_core::error::ApiError),
        (status = 429, description = "Daily quota exhausted", body = switchyard_core::error::ApiError),
        (status = 502, description = "Upstream capability failed", body = switchyard_core::error::ApiError)
    ),
    tag = "conversations"
)]
pub async fn send_message(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
    payload: TurnPayload,
) -> Result<Json<TurnResponse>, AppError> {
    state.orchestrator.authorize(id, session.session_id).await?;

    let keys = session.usage_keys();
    let mut metered = vec![(UsageEvent::Message, 1)];
    if payload.attachment.is_some() {
        metered.push((UsageEvent::Upload, 1));
    }
    let admission = state
        .limiter
        .consume_all(&keys, &metered)
        .map_err(AppError::QuotaExceeded)?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal("limiter returned no decision".to_string()))?;

    let source = payload.source.unwrap_or(if payload.attachment.is_some() {
        TurnSource::Upload
    } else {
        TurnSource::Text
    });
    let ctx = TurnContext::new(session.session_id, session.origin_key.clone(), source)
        .with_admission(admission);
    let attachments = payload.attachment.into_iter().collect();

    let response = state
        .orchestrator
        .handle_turn(id, payload.content, attachments, ctx)
        .await?;
    Ok(Json(response))
}

/// Full message history
#[utoipa::path(
    get,
    path = "/conversations/{id}/messages",
    params(("id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Messages in append order", body = MessagesResponse),
        (status = 404, description = "Unknown conversation", body = switchyard_core::error::ApiError)
    ),
    tag = "conversations"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> Result<Json<MessagesResponse>, AppError> {
    let conversation = state.orchestrator.conversation(id, session.session_id).await?;
    Ok(Json(MessagesResponse {
        conversation_id: conversation.id,
        messages: conversation.messages,
    }))
}

/// Most recent audit entries, oldest first
#[utoipa::path(
    get,
    path = "/conversations/{id}/log",
    params(("id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Recent audit entries", body = ConversationLogResponse),
        (status = 404, description = "Unknown conversation", body = switchyard_core::error::ApiError)
    ),
    tag = "conversations"
)]
pub async fn conversation_log(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationLogResponse>, AppError> {
    state.orchestrator.authorize(id, session.session_id).await?;
    let entries = state
        .audit
        .recent(id, state.config.server.log_tail_limit)?;
    Ok(Json(ConversationLogResponse {
        conversation_id: id,
        entries,
    }))
}
