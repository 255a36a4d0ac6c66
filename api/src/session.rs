//! Durable session identities.
//!
//! A client presents an opaque id in `x-session-id`. Only a well-formed id
//! that has not been rotated away is honored; anything else gets a freshly
//! minted id. Records live in one JSON file rewritten atomically after each
//! mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use switchyard_core::identity;
use uuid::Uuid;

use crate::persist::{self, SnapshotError};

/// `last_seen_at` is only persisted when it moved by at least this much.
const LAST_SEEN_WRITE_INTERVAL: Duration = Duration::seconds(60);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_to: Option<Uuid>,
}

impl SessionRecord {
    fn fresh(id: Uuid, origin: Option<&str>, client: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_seen_at: now,
            origin: origin.map(str::to_string),
            client: client.map(str::to_string),
            expires_at: None,
            rotated_to: None,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.rotated_to.is_none() && self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    New,
    Rotated,
    Existing,
}

impl SessionStatus {
    /// Value for the `x-session-status` header; existing sessions send none.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::New => Some("new"),
            Self::Rotated => Some("rotated"),
            Self::Existing => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub record: SessionRecord,
    pub status: SessionStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    #[serde(default)]
    sessions: BTreeMap<Uuid, SessionRecord>,
}

pub struct SessionRegistry {
    state: Mutex<RegistrySnapshot>,
    path: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(RegistrySnapshot::default()),
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let snapshot = persist::read_snapshot::<RegistrySnapshot>(&path)?.unwrap_or_default();
        tracing::debug!(sessions = snapshot.sessions.len(), path = %path.display(), "session registry loaded");
        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistrySnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        if let Some(path) = &self.path {
            persist::write_snapshot(path, snapshot)?;
        }
        Ok(())
    }

    /// Map a presented id to a live record, creating one when needed.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        origin: Option<&str>,
        client: Option<&str>,
    ) -> Result<ResolvedSession, RegistryError> {
        let now = Utc::now();
        let mut state = self.lock();

        let requested = requested.and_then(identity::parse_session_id);
        if let Some(id) = requested {
            match state.sessions.get_mut(&id) {
                Some(record) if record.is_active(now) => {
                    let stale = now - record.last_seen_at >= LAST_SEEN_WRITE_INTERVAL;
                    record.last_seen_at = now;
                    if record.origin.is_none() {
                        record.origin = origin.map(str::to_string);
                    }
                    let record = record.clone();
                    if stale {
                        self.save(&state)?;
                    }
                    return Ok(ResolvedSession {
                        record,
                        status: SessionStatus::Existing,
                    });
                }
                Some(_) => {
                    tracing::info!(session_id = %id, "rejected rotated or expired session id");
                }
                None => {
                    let record = SessionRecord::fresh(id, origin, client, now);
                    state.sessions.insert(id, record.clone());
                    self.save(&state)?;
                    return Ok(ResolvedSession {
                        record,
                        status: SessionStatus::New,
                    });
                }
            }
        }

        let record = SessionRecord::fresh(identity::mint_session_id(), origin, client, now);
        state.sessions.insert(record.id, record.clone());
        self.save(&state)?;
        tracing::debug!(session_id = %record.id, "minted session");
        Ok(ResolvedSession {
            record,
            status: SessionStatus::New,
        })
    }

    /// Retire `current` and issue a replacement. The old id is rejected from
    /// now on.
    pub fn rotate(
        &self,
        current: Uuid,
        origin: Option<&str>,
        client: Option<&str>,
    ) -> Result<ResolvedSession, RegistryError> {
        let now = Utc::now();
        let mut state = self.lock();

        let replacement = SessionRecord::fresh(identity::mint_session_id(), origin, client, now);
        if let Some(old) = state.sessions.get_mut(&current) {
            old.expires_at = Some(now);
            old.rotated_to = Some(replacement.id);
        }
        state.sessions.insert(replacement.id, replacement.clone());
        self.save(&state)?;

        tracing::info!(from = %current, to = %replacement.id, "session rotated");
        Ok(ResolvedSession {
            record: replacement,
            status: SessionStatus::Rotated,
        })
    }

    pub fn get(&self, id: Uuid) -> Option<SessionRecord> {
        self.lock().sessions.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_malformed_id_mints_new_session() {
        let registry = SessionRegistry::in_memory();
        let first = registry.resolve(None, Some("org_a"), None).expect("resolve");
        assert_eq!(first.status, SessionStatus::New);
        assert_eq!(first.record.origin.as_deref(), Some("org_a"));

        let tampered = registry
            .resolve(Some("../../etc/passwd"), None, None)
            .expect("resolve");
        assert_eq!(tampered.status, SessionStatus::New);
        assert_ne!(tampered.record.id, first.record.id);
    }

    #[test]
    fn known_id_resolves_to_existing() {
        let registry = SessionRegistry::in_memory();
        let created = registry.resolve(None, None, Some("cli")).expect("resolve");
        let again = registry
            .resolve(Some(&created.record.id.to_string()), None, None)
            .expect("resolve");
        assert_eq!(again.status, SessionStatus::Existing);
        assert_eq!(again.record.id, created.record.id);
        assert_eq!(again.record.client.as_deref(), Some("cli"));
    }

    #[test]
    fn well_formed_unknown_id_is_adopted() {
        let registry = SessionRegistry::in_memory();
        let id = Uuid::now_v7();
        let resolved = registry
            .resolve(Some(&id.to_string()), None, None)
            .expect("resolve");
        assert_eq!(resolved.status, SessionStatus::New);
        assert_eq!(resolved.record.id, id);
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn rotated_id_is_never_honored_again() {
        let registry = SessionRegistry::in_memory();
        let original = registry.resolve(None, None, None).expect("resolve").record.id;
        let rotated = registry.rotate(original, None, None).expect("rotate");
        assert_eq!(rotated.status, SessionStatus::Rotated);
        assert_ne!(rotated.record.id, original);

        let old = registry.get(original).expect("old record kept");
        assert_eq!(old.rotated_to, Some(rotated.record.id));
        assert!(old.expires_at.is_some());

        let retry = registry
            .resolve(Some(&original.to_string()), None, None)
            .expect("resolve");
        assert_eq!(retry.status, SessionStatus::New);
        assert_ne!(retry.record.id, original);
        assert_ne!(retry.record.id, rotated.record.id);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let id = {
            let registry = SessionRegistry::open(&path).expect("open");
            registry.resolve(None, Some("org_x"), None).expect("resolve").record.id
        };

        let reopened = SessionRegistry::open(&path).expect("reopen");
        let resolved = reopened
            .resolve(Some(&id.to_string()), None, None)
            .expect("resolve");
        assert_eq!(resolved.status, SessionStatus::Existing);
        assert_eq!(resolved.record.origin.as_deref(), Some("org_x"));
    }

    #[test]
    fn status_header_values() {
        assert_eq!(SessionStatus::New.header_value(), Some("new"));
        assert_eq!(SessionStatus::Rotated.header_value(), Some("rotated"));
        assert_eq!(SessionStatus::Existing.header_value(), None);
    }
}
