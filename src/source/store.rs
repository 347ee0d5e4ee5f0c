use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::traits::{ContentRecord, OfflineStore};

/// File-backed offline store: the full record list as one JSON document.
/// Absence of the file means an empty store, not an error.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl OfflineStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<ContentRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(_) => {
                debug!("offline store has no file at {}", self.path.display());
                Ok(Vec::new())
            }
        }
    }

    /// Upserts by record id, keeping whatever else the store already holds.
    async fn sync(&self, records: &[ContentRecord]) -> Result<()> {
        let mut existing = self.load_all().await?;
        for record in records {
            match existing.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record.clone(),
                None => existing.push(record.clone()),
            }
        }
        let bytes = serde_json::to_vec(&existing)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}
