use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod audit;
mod config;
mod error;
mod extract;
mod guard;
mod middleware;
mod orchestrator;
mod persist;
mod providers;
mod routes;
mod session;
mod state;
mod usage;
mod voice;

use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::store::ConversationStore;
use crate::providers::OpenAiClient;
use crate::providers::realtime::OpenAiRealtime;
use crate::session::SessionRegistry;
use crate::usage::ledger::utc_day_clock;
use crate::usage::{UsageLedger, UsageLimiter};
use crate::voice::VoiceBridge;

const LEDGER_FLUSH_PERIOD: Duration = Duration::from_secs(1);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Switchyard API",
        version = "0.1.0",
        description = "Chat turns routed through planned specialist responders, with input and response guardrails, daily usage quotas and a realtime voice bridge."
    ),
    paths(
        routes::health::health_check,
        routes::conversations::create_conversation,
        routes::conversations::send_message,
        routes::conversations::list_messages,
        routes::conversations::conversation_log,
        routes::sessions::reset_session,
        routes::usage::usage_report,
        routes::voice::create_voice_session,
        routes::voice::voice_offer,
        routes::voice::close_voice_session,
        routes::voice::report_connection_state,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::conversations::MessagesResponse,
        routes::conversations::ConversationLogResponse,
        routes::sessions::SessionResetResponse,
        routes::voice::VoiceStateResponse,
        audit::AuditEntry,
        switchyard_core::error::ApiError,
        switchyard_core::conversation::Conversation,
        switchyard_core::conversation::Message,
        switchyard_core::conversation::Role,
        switchyard_core::conversation::TurnSource,
        switchyard_core::conversation::AttachmentInfo,
        switchyard_core::conversation::AudioPayload,
        switchyard_core::conversation::CreateConversationResponse,
        switchyard_core::conversation::SendMessageRequest,
        switchyard_core::conversation::TurnResponse,
        switchyard_core::usage::UsageEvent,
        switchyard_core::usage::UsageScope,
        switchyard_core::usage::UsageCounts,
        switchyard_core::usage::LimitDecision,
        switchyard_core::usage::EventUsage,
        switchyard_core::usage::UsageReport,
        switchyard_core::dispatch::TokenUsage,
        switchyard_core::voice::IceServer,
        switchyard_core::voice::VoiceGrant,
        switchyard_core::voice::VoiceSessionRequest,
        switchyard_core::voice::VoiceGrantResponse,
        switchyard_core::voice::VoiceOfferRequest,
        switchyard_core::voice::VoiceOfferResponse,
        switchyard_core::voice::ConnectionState,
        switchyard_core::voice::ConnectionStateRequest,
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Arc::new(AppConfig::from_env());
    let data_dir = config.server.data_dir.clone();
    std::fs::create_dir_all(&data_dir).expect("Failed to create data directory");

    // File-backed stores
    let audit = Arc::new(AuditLog::open(data_dir.join("audit")).expect("Failed to open audit log"));
    let ledger = Arc::new(
        UsageLedger::open(data_dir.join("usage.json"), utc_day_clock())
            .expect("Failed to load usage snapshot"),
    );
    ledger.spawn_flusher(LEDGER_FLUSH_PERIOD);
    let limiter = Arc::new(UsageLimiter::new(ledger.clone(), config.usage.clone()));
    let sessions = Arc::new(
        SessionRegistry::open(data_dir.join("sessions.json")).expect("Failed to load session registry"),
    );
    let store = ConversationStore::open(data_dir.join("conversations"));

    // Upstream capabilities
    let capabilities = providers::openai_capabilities(&config);
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        capabilities,
        store,
        limiter.clone(),
        audit.clone(),
    ));
    let realtime = Arc::new(OpenAiRealtime::new(
        OpenAiClient::new(&config.provider),
        config.realtime.events_path.clone(),
    ));
    let voice = Arc::new(VoiceBridge::new(
        realtime,
        orchestrator.clone(),
        limiter.clone(),
        audit.clone(),
        config.realtime.clone(),
        config.orchestrator.upstream_timeout,
    ));

    let app_state = state::AppState {
        config: config.clone(),
        sessions: sessions.clone(),
        limiter,
        orchestrator,
        voice,
        audit,
    };

    let cors_layer = middleware::cors::build_cors_layer(&config.server.cors_origins);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::api_router(&config, true))
        .layer(middleware::session::InjectSessionLayer::new(sessions))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(axum::middleware::from_fn(middleware::security_headers::apply))
                .layer(cors_layer),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(data_dir = %data_dir.display(), "Switchyard API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await
    .expect("Server error");

    ledger.flush().await;
}
