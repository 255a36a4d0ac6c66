//! Conversation storage.
//!
//! Live conversations sit behind a per-conversation async mutex, which is
//! what serializes turns for one conversation. Each conversation is also
//! written through to `{dir}/{id}.json` after every append, and loaded back
//! lazily on first access after a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use switchyard_core::conversation::Conversation;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::persist::{self, SnapshotError};

pub type ConversationHandle = Arc<Mutex<Conversation>>;

pub struct ConversationStore {
    dir: Option<PathBuf>,
    live: RwLock<HashMap<Uuid, ConversationHandle>>,
}

impl ConversationStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            live: RwLock::new(HashMap::new()),
        }
    }

    fn path(&self, id: Uuid) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{id}.json")))
    }

    pub async fn insert(&self, conversation: Conversation) -> Result<ConversationHandle, SnapshotError> {
        self.save(&conversation).await?;
        let id = conversation.id;
        let handle = Arc::new(Mutex::new(conversation));
        self.live.write().await.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ConversationHandle>, SnapshotError> {
        if let Some(handle) = self.live.read().await.get(&id) {
            return Ok(Some(handle.clone()));
        }
        let Some(path) = self.path(id) else {
            return Ok(None);
        };
        let Some(conversation) = persist::read_snapshot::<Conversation>(&path)? else {
            return Ok(None);
        };
        if conversation.id != id {
            tracing::warn!(conversation_id = %id, path = %path.display(), "conversation file id mismatch");
            return Ok(None);
        }

        let mut live = self.live.write().await;
        let handle = live
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(conversation)))
            .clone();
        Ok(Some(handle))
    }

    /// Write-through after an append. No-op for in-memory stores. The body is
    /// encoded by the caller and written on the blocking pool.
    pub async fn save(&self, conversation: &Conversation) -> Result<(), SnapshotError> {
        let Some(path) = self.path(conversation.id) else {
            return Ok(());
        };
        let body = persist::encode_snapshot(&path, conversation)?;
        persist::write_encoded(path, body).await
    }
}
