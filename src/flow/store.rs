use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::flow::thread::ConversationThread;

pub type SharedThreadStore = Arc<dyn ThreadStore>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("thread could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for conversation threads, keyed by thread id.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Insert or replace the thread.
    async fn save(&self, thread: &ConversationThread) -> Result<(), StoreError>;

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError>;

    /// Returns true if a thread was removed.
    async fn remove(&self, thread_id: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<ConversationThread>, StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn ThreadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStore")
            .field("impl", &self.name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    threads: DashMap<String, ConversationThread>,
}

impl InMemoryThreadStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn save(&self, thread: &ConversationThread) -> Result<(), StoreError> {
        self.threads.insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError> {
        Ok(self.threads.get(thread_id).map(|t| t.value().clone()))
    }

    async fn remove(&self, thread_id: &str) -> Result<bool, StoreError> {
        Ok(self.threads.remove(thread_id).is_some())
    }

    async fn list(&self) -> Result<Vec<ConversationThread>, StoreError> {
        Ok(self.threads.iter().map(|t| t.value().clone()).collect())
    }

    fn name(&self) -> &'static str {
        "InMemoryThreadStore"
    }
}

/// One pretty-printed JSON file per thread: `<dir>/<thread id>.json`.
#[derive(Debug, Clone)]
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Arc::new(Self { dir }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread_id: &str) -> Option<PathBuf> {
        let safe = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.json", thread_id)))
    }
}

#[async_trait]
impl ThreadStore for FileThreadStore {
    async fn save(&self, thread: &ConversationThread) -> Result<(), StoreError> {
        let Some(path) = self.path_for(&thread.id) else {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid thread id `{}`", thread.id),
            )));
        };
        let contents = serde_json::to_vec_pretty(thread)?;
        // write then rename so readers never see half a file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(thread_id = %thread.id, path = %path.display(), "thread saved");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError> {
        let Some(path) = self.path_for(thread_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, thread_id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.path_for(thread_id) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationThread>, StoreError> {
        let mut threads = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ConversationThread>(&bytes) {
                Ok(thread) => threads.push(thread),
                Err(e) => warn!(path = %path.display(), "skipping unreadable thread file: {}", e),
            }
        }
        Ok(threads)
    }

    fn name(&self) -> &'static str {
        "FileThreadStore"
    }
}
