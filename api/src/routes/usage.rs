use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use switchyard_core::usage::UsageReport;

use crate::middleware::session::SessionContext;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/usage", get(usage_report))
}

/// Today's metered counts and token totals for the caller's session and origin
#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "Usage for the current UTC day", body = UsageReport)
    ),
    tag = "usage"
)]
pub async fn usage_report(State(state): State<AppState>, session: SessionContext) -> Json<UsageReport> {
    Json(state.limiter.report(&session.usage_keys()))
}
