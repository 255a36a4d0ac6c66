//! Append-only structured audit trail, one JSONL file per conversation.
//!
//! This is separate from `tracing`: tracing carries diagnostics, the audit
//! log records what happened to a conversation so a blocked or rewritten turn
//! can be reconstructed later. Writes are synchronous and never fail a turn.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One line of a conversation's audit file.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub conversation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AuditEntry {
    pub fn new(kind: &str, conversation_id: Uuid) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            conversation_id,
            session_id: None,
            responder: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn responder(mut self, responder: &str) -> Self {
        self.responder = Some(responder.to_string());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

pub struct AuditLog {
    dir: PathBuf,
    // Serializes appends so concurrent writers never interleave partial lines.
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, conversation_id: Uuid) -> PathBuf {
        self.dir.join(format!("{conversation_id}.jsonl"))
    }

    pub fn try_append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(entry.conversation_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Append an entry, reporting failures through tracing only.
    pub fn append(&self, entry: AuditEntry) {
        if let Err(err) = self.try_append(&entry) {
            tracing::warn!(
                error = %err,
                conversation_id = %entry.conversation_id,
                kind = %entry.kind,
                "failed to append audit entry"
            );
        }
    }

    /// The most recent `limit` entries, oldest first. Unreadable lines are skipped.
    pub fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let entries = read_entries(&path)?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::debug!(error = %err, path = %path.display(), "skipping unreadable audit line");
            }
        }
    }
    Ok(entries)
}
