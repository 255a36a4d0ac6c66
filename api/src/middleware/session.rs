use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Extensions};
use axum::response::{IntoResponse, Response};
use switchyard_core::identity::{self, SESSION_HEADER, SESSION_STATUS_HEADER};
use switchyard_core::usage::UsageKeys;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use crate::error::AppError;
use crate::session::{ResolvedSession, SessionRegistry, SessionStatus};
use crate::state::AppState;

/// The caller's anonymous identity for this request.
///
/// Two-phase resolution:
/// 1. `InjectSessionLayer` resolves the presented `x-session-id` (minting one
///    when absent or unusable), injects this into extensions and echoes the
///    id back on the response
/// 2. Handlers extract it from extensions, or resolve directly when the
///    layer did not run
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    /// Fingerprint of the network origin, never the raw address
    pub origin_key: Option<String>,
    pub status: SessionStatus,
    pub client: Option<String>,
}

impl SessionContext {
    fn from_resolved(resolved: ResolvedSession, origin_key: Option<String>, client: Option<String>) -> Self {
        Self {
            session_id: resolved.record.id,
            origin_key,
            status: resolved.status,
            client,
        }
    }

    pub fn usage_keys(&self) -> UsageKeys {
        UsageKeys::new(self.session_id.to_string(), self.origin_key.clone())
    }
}

/// Client address: first `x-forwarded-for` hop, then `x-real-ip`, then the
/// socket peer.
fn client_address(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

struct Presented {
    session: Option<String>,
    origin_key: Option<String>,
    client: Option<String>,
}

fn presented(headers: &HeaderMap, extensions: &Extensions) -> Presented {
    Presented {
        session: headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        origin_key: client_address(headers, extensions).map(|addr| identity::origin_fingerprint(&addr)),
        client: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.chars().take(200).collect()),
    }
}

fn resolve(registry: &SessionRegistry, presented: Presented) -> Result<SessionContext, AppError> {
    let resolved = registry.resolve(
        presented.session.as_deref(),
        presented.origin_key.as_deref(),
        presented.client.as_deref(),
    )?;
    Ok(SessionContext::from_resolved(
        resolved,
        presented.origin_key,
        presented.client,
    ))
}

/// Set the session headers unless the handler already did (a reset sends
/// the replacement id itself).
pub fn apply_session_headers(headers: &mut HeaderMap, session_id: Uuid, status: SessionStatus) {
    if !headers.contains_key(SESSION_HEADER)
        && let Ok(value) = HeaderValue::from_str(&session_id.to_string())
    {
        headers.insert(SESSION_HEADER, value);
    }
    if !headers.contains_key(SESSION_STATUS_HEADER)
        && let Some(status) = status.header_value()
    {
        headers.insert(SESSION_STATUS_HEADER, HeaderValue::from_static(status));
    }
}

// --- Tower Layer/Service for session injection ---

/// Tower Layer that injects `SessionContext` into request extensions.
/// A registry failure is logged and the request continues without one.
#[derive(Clone)]
pub struct InjectSessionLayer {
    registry: Arc<SessionRegistry>,
}

impl InjectSessionLayer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for InjectSessionLayer {
    type Service = InjectSessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectSessionService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectSessionService<S> {
    inner: S,
    registry: Arc<SessionRegistry>,
}

impl<S> Service<Request> for InjectSessionService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);

        let presented = presented(req.headers(), req.extensions());
        let session = match resolve(&self.registry, presented) {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::warn!(error = ?err, "session resolution failed");
                None
            }
        };

        Box::pin(async move {
            if let Some(session) = &session {
                req.extensions_mut().insert(session.clone());
            }
            let mut response = ready.oneshot(req).await.into_response();
            if let Some(session) = session {
                apply_session_headers(response.headers_mut(), session.session_id, session.status);
            }
            Ok(response)
        })
    }
}

// --- Extractor (used by handlers) ---

impl FromRequestParts<AppState> for SessionContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // Fast path: the layer already resolved the session
        if let Some(session) = parts.extensions.get::<SessionContext>() {
            return Ok(session.clone());
        }

        // Slow path: no layer ran
        resolve(&state.sessions, presented(&parts.headers, &parts.extensions))
    }
}
