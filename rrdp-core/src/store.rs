//! Persistence collaborator for [`RepositoryState`].
//!
//! The engine requires atomic replacement: a reader sees either the old
//! state or the new one, never a partial write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::state::RepositoryState;

/// Errors that can occur while loading or storing state
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid repository id {0:?}")]
    InvalidId(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Load and atomically replace repository state by repository id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, repository: &str) -> Result<Option<RepositoryState>, StoreError>;

    async fn store(&self, repository: &str, state: &RepositoryState) -> Result<(), StoreError>;
}

/// One JSON file per repository under a state directory.
///
/// Writes go to a temporary file which is then renamed over the old one.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_file_path(&self, repository: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_id(repository) {
            return Err(StoreError::InvalidId(repository.to_string()));
        }
        Ok(self.dir.join(format!("{}.state.json", repository)))
    }

    fn load_sync(path: &Path) -> Result<Option<RepositoryState>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        let state = serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(state))
    }

    fn store_sync(dir: &Path, path: &Path, state: &RepositoryState) -> Result<(), StoreError> {
        fs::create_dir_all(dir)?;
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, repository: &str) -> Result<Option<RepositoryState>, StoreError> {
        let path = self.state_file_path(repository)?;
        tokio::task::spawn_blocking(move || Self::load_sync(&path))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn store(&self, repository: &str, state: &RepositoryState) -> Result<(), StoreError> {
        let path = self.state_file_path(repository)?;
        let dir = self.dir.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || Self::store_sync(&dir, &path, &state))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

/// Repository ids double as file names.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, RepositoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, repository: &str) -> Option<RepositoryState> {
        self.states.read().await.get(repository).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, repository: &str) -> Result<Option<RepositoryState>, StoreError> {
        Ok(self.get(repository).await)
    }

    async fn store(&self, repository: &str, state: &RepositoryState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(repository.to_string(), state.clone());
        Ok(())
    }
}
