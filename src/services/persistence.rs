use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::Conversation;

const WRITE_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode conversation {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable storage for conversations: one JSON document per conversation,
/// keyed by id. Writes go through a temp file and rename so a crash never
/// leaves a half-written record behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    /// Default store under the user data directory.
    pub async fn open_default() -> Result<Self, StorageError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").expect("HOME not set");
                PathBuf::from(home).join(".local/share")
            });
        Self::new(data_dir.join("parley").join("conversations")).await
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    /// Load every conversation, most recently updated first. A record that
    /// fails to parse is logged and skipped; one corrupt file must not take
    /// the whole history down.
    pub async fn list(&self) -> Result<Vec<Conversation>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;

        let mut conversations = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(json) => match serde_json::from_str::<Conversation>(&json) {
                    Ok(conv) => conversations.push(conv),
                    Err(e) => {
                        tracing::warn!("Skipping corrupt conversation {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Skipping unreadable file {}: {}", path.display(), e);
                }
            }
        }

        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub async fn get(&self, id: &str) -> Result<Conversation, StorageError> {
        let path = self.path_for(id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_str(&json).map_err(|source| StorageError::Encode {
            id: id.to_string(),
            source,
        })
    }

    /// Write the full record, replacing any previous version. Transient
    /// failures are retried a bounded number of times before the error
    /// surfaces to the caller.
    pub async fn put(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let json =
            serde_json::to_string_pretty(conversation).map_err(|source| StorageError::Encode {
                id: conversation.id.clone(),
                source,
            })?;
        let path = self.path_for(&conversation.id);
        let tmp = self.root.join(format!("{}.json.tmp", conversation.id));

        let mut last_err = None;
        for attempt in 1..=WRITE_RETRIES {
            match self.write_atomic(&tmp, &path, &json).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Write attempt {}/{} for conversation {} failed: {}",
                        attempt,
                        WRITE_RETRIES,
                        conversation.id,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(StorageError::Io {
            path,
            source: last_err.unwrap(),
        })
    }

    async fn write_atomic(
        &self,
        tmp: &Path,
        path: &Path,
        json: &str,
    ) -> Result<(), std::io::Error> {
        tokio::fs::write(tmp, json).await?;
        tokio::fs::rename(tmp, path).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}
