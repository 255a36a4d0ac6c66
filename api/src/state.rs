use std::sync::Arc;

use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use crate::session::SessionRegistry;
use crate::usage::UsageLimiter;
use crate::voice::VoiceBridge;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<UsageLimiter>,
    pub orchestrator: Arc<Orchestrator>,
    pub voice: Arc<VoiceBridge>,
    pub audit: Arc<AuditLog>,
}
