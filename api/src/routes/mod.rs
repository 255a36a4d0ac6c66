pub mod conversations;
pub mod health;
pub mod sessions;
pub mod usage;
pub mod voice;

use axum::Router;

use crate::config::AppConfig;
use crate::middleware::rate_limit;
use crate::state::AppState;

/// Every API route. Per-IP burst limits wrap the message and voice routes
/// when `burst_limits` is set; they key on the client address, so tests
/// driving the router without one leave them off.
pub fn api_router(config: &AppConfig, burst_limits: bool) -> Router<AppState> {
    let mut turns = conversations::turn_router(config.input_guard.max_attachment_bytes);
    let mut voice = voice::router();
    if burst_limits {
        turns = turns.layer(rate_limit::turn_layer());
        voice = voice.layer(rate_limit::voice_layer());
    }

    Router::new()
        .merge(health::router())
        .merge(conversations::router())
        .merge(turns)
        .merge(sessions::router())
        .merge(usage::router())
        .merge(voice)
}
