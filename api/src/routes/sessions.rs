use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::session::{SessionContext, apply_session_headers};
use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct SessionResetResponse {
    pub session_id: Uuid,
    pub previous_session_id: Uuid,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sessions/reset", post(reset_session))
}

/// Rotate the caller's session id. The old id is rejected afterwards, and
/// conversations it owned stay with it.
#[utoipa::path(
    post,
    path = "/sessions/reset",
    responses(
        (status = 200, description = "Session rotated; new id in body and x-session-id", body = SessionResetResponse)
    ),
    tag = "sessions"
)]
pub async fn reset_session(
    State(state): State<AppState>,
    session: SessionContext,
) -> Result<(HeaderMap, Json<SessionResetResponse>), AppError> {
    let rotated = state.sessions.rotate(
        session.session_id,
        session.origin_key.as_deref(),
        session.client.as_deref(),
    )?;

    let mut headers = HeaderMap::new();
    apply_session_headers(&mut headers, rotated.record.id, rotated.status);

    Ok((
        headers,
        Json(SessionResetResponse {
            session_id: rotated.record.id,
            previous_session_id: session.session_id,
        }),
    ))
}
