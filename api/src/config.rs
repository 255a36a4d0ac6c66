//! Startup configuration.
//!
//! Everything is read from the environment exactly once in `AppConfig::from_env`
//! and handed to components by reference. `Default` values mirror the env
//! defaults so tests can build components without touching the environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use switchyard_core::guard::RecoveryStrategy;
use switchyard_core::usage::{UsageEvent, UsageScope};

const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "audio/webm",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "audio/mp4",
    "application/pdf",
    "text/plain",
    "text/markdown",
    "image/png",
    "image/jpeg",
];

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub input_guard: InputGuardConfig,
    pub response_guard: ResponseGuardConfig,
    pub usage: UsageConfig,
    pub orchestrator: OrchestratorConfig,
    pub provider: ProviderConfig,
    pub realtime: RealtimeConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            input_guard: InputGuardConfig::from_env(),
            response_guard: ResponseGuardConfig::from_env(),
            usage: UsageConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            provider: ProviderConfig::from_env(),
            realtime: RealtimeConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub cors_origins: Vec<String>,
    pub log_tail_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: PathBuf::from("./data"),
            cors_origins: vec!["http://localhost:5173".to_string()],
            log_tail_limit: 50,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            data_dir: env_string("SWITCHYARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cors_origins: env_list("SWITCHYARD_CORS_ORIGINS").unwrap_or(defaults.cors_origins),
            log_tail_limit: env_parse("SWITCHYARD_LOG_TAIL_LIMIT").unwrap_or(defaults.log_tail_limit),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputGuardConfig {
    pub max_attachment_bytes: u64,
    pub allowed_mime_types: BTreeSet<String>,
    pub moderation_enabled: bool,
    pub moderation_threshold: f64,
    pub confirm_short_transcripts: bool,
    pub min_transcript_chars: usize,
}

impl Default for InputGuardConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|mime| mime.to_string())
                .collect(),
            moderation_enabled: false,
            moderation_threshold: 0.5,
            confirm_short_transcripts: true,
            min_transcript_chars: 4,
        }
    }
}

impl InputGuardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attachment_bytes: env_parse("GUARD_MAX_ATTACHMENT_BYTES")
                .unwrap_or(defaults.max_attachment_bytes),
            allowed_mime_types: env_list("GUARD_ALLOWED_MIME_TYPES")
                .map(|list| list.into_iter().map(|m| m.to_ascii_lowercase()).collect())
                .unwrap_or(defaults.allowed_mime_types),
            moderation_enabled: env_flag("GUARD_MODERATION_ENABLED")
                .unwrap_or(defaults.moderation_enabled),
            moderation_threshold: env_parse("GUARD_MODERATION_THRESHOLD")
                .unwrap_or(defaults.moderation_threshold),
            confirm_short_transcripts: env_flag("GUARD_CONFIRM_SHORT_TRANSCRIPTS")
                .unwrap_or(defaults.confirm_short_transcripts),
            min_transcript_chars: env_parse("GUARD_MIN_TRANSCRIPT_CHARS")
                .unwrap_or(defaults.min_transcript_chars),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseGuardConfig {
    pub enabled: bool,
    pub responders: BTreeSet<String>,
    pub strategy: RecoveryStrategy,
}

impl Default for ResponseGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            responders: ["general", "document"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            strategy: RecoveryStrategy::Clarify,
        }
    }
}

impl ResponseGuardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_flag("RESPONSE_GUARD_ENABLED").unwrap_or(defaults.enabled),
            responders: env_list("RESPONSE_GUARD_RESPONDERS")
                .map(|list| list.into_iter().collect())
                .unwrap_or(defaults.responders),
            strategy: env_string("RESPONSE_GUARD_STRATEGY")
                .map(|raw| RecoveryStrategy::parse_or_default(&raw))
                .unwrap_or(defaults.strategy),
        }
    }
}

/// Per-event daily quotas. A missing entry means unlimited for that scope.
#[derive(Debug, Clone, Default)]
pub struct UsageConfig {
    pub limits: BTreeMap<(UsageScope, UsageEvent), u64>,
}

impl UsageConfig {
    pub fn from_env() -> Self {
        let mut limits = BTreeMap::new();
        for event in UsageEvent::ALL {
            let suffix = event.as_str().to_ascii_uppercase();
            if let Some(limit) = env_parse::<u64>(&format!("USAGE_SESSION_LIMIT_{suffix}")) {
                limits.insert((UsageScope::Session, event), limit);
            }
            if let Some(limit) = env_parse::<u64>(&format!("USAGE_ORIGIN_LIMIT_{suffix}")) {
                limits.insert((UsageScope::Origin, event), limit);
            }
        }
        Self { limits }
    }

    pub fn limit(&self, scope: UsageScope, event: UsageEvent) -> Option<u64> {
        self.limits.get(&(scope, event)).copied()
    }

    pub fn with_limit(mut self, scope: UsageScope, event: UsageEvent, limit: u64) -> Self {
        self.limits.insert((scope, event), limit);
        self
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tts_responders: BTreeSet<String>,
    pub upstream_timeout: Duration,
    pub max_turn_items: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tts_responders: BTreeSet::new(),
            upstream_timeout: Duration::from_secs(45),
            max_turn_items: 8,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tts_responders: env_list("SWITCHYARD_TTS_RESPONDERS")
                .map(|list| list.into_iter().collect())
                .unwrap_or(defaults.tts_responders),
            upstream_timeout: env_parse("SWITCHYARD_UPSTREAM_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            max_turn_items: env_parse::<usize>("SWITCHYARD_MAX_TURN_ITEMS")
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_turn_items),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub planner_model: String,
    pub guard_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub transcribe_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            planner_model: "gpt-4o-mini".to_string(),
            guard_model: "gpt-4o-mini".to_string(),
            tts_model: "gpt-4o-mini-tts".to_string(),
            tts_voice: "alloy".to_string(),
            transcribe_model: "gpt-4o-mini-transcribe".to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: env_string("OPENAI_API_KEY"),
            base_url: env_string("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            chat_model: env_string("SWITCHYARD_CHAT_MODEL").unwrap_or(defaults.chat_model),
            planner_model: env_string("SWITCHYARD_PLANNER_MODEL").unwrap_or(defaults.planner_model),
            guard_model: env_string("SWITCHYARD_GUARD_MODEL").unwrap_or(defaults.guard_model),
            tts_model: env_string("SWITCHYARD_TTS_MODEL").unwrap_or(defaults.tts_model),
            tts_voice: env_string("SWITCHYARD_TTS_VOICE").unwrap_or(defaults.tts_voice),
            transcribe_model: env_string("SWITCHYARD_TRANSCRIBE_MODEL")
                .unwrap_or(defaults.transcribe_model),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub model: String,
    pub voice: String,
    pub ice_servers: Vec<String>,
    /// Path template for the session event stream; `{session}` is substituted.
    pub events_path: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "verse".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            events_path: "/realtime/sessions/{session}/events".to_string(),
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model: env_string("REALTIME_MODEL").unwrap_or(defaults.model),
            voice: env_string("REALTIME_VOICE").unwrap_or(defaults.voice),
            ice_servers: env_list("REALTIME_ICE_SERVERS").unwrap_or(defaults.ice_servers),
            events_path: env_string("REALTIME_EVENTS_PATH").unwrap_or(defaults.events_path),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_string(key).map(|value| parse_flag(&value))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|value| parse_list(&value))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_skips_blank_entries() {
        assert_eq!(
            parse_list(" general , ,document,"),
            vec!["general".to_string(), "document".to_string()]
        );
    }

    #[test]
    fn parse_flag_accepts_common_truthy_values() {
        assert!(parse_flag("true"));
        assert!(parse_flag("ON"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("nope"));
    }

    #[test]
    fn usage_limits_default_to_unlimited() {
        let config = UsageConfig::default().with_limit(UsageScope::Session, UsageEvent::Message, 2);
        assert_eq!(config.limit(UsageScope::Session, UsageEvent::Message), Some(2));
        assert_eq!(config.limit(UsageScope::Origin, UsageEvent::Message), None);
        assert_eq!(config.limit(UsageScope::Session, UsageEvent::Upload), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.response_guard.strategy, RecoveryStrategy::Clarify);
        assert!(!config.response_guard.enabled);
        assert!(config.input_guard.allowed_mime_types.contains("audio/webm"));
        assert_eq!(config.orchestrator.max_turn_items, 8);
    }
}
