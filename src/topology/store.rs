//! Metadata store collaborators.
//!
//! The topology only needs `load`/`save` of the full descriptor list for a
//! cluster. Two implementations ship with the crate:
//!
//! - [`InMemoryMetadataStore`] for tests and single-process clusters
//! - [`FileMetadataStore`] writing one JSON document per cluster, atomically
//!
//! ```text
//! metadata/
//!   ├── prod.json        # [ShardInfo, ...]
//!   └── staging.json
//! ```

use crate::error::{Error, Result};
use crate::topology::shard::ShardInfo;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Metadata Store Trait
// ============================================================================

/// Durable storage of shard descriptors.
#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Load all descriptors of a cluster. Unknown clusters yield an empty list.
    async fn load(&self, cluster_name: &str) -> Result<Vec<ShardInfo>>;

    /// Replace all descriptors of a cluster.
    async fn save(&self, cluster_name: &str, shards: &[ShardInfo]) -> Result<()>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    clusters: RwLock<HashMap<String, Vec<ShardInfo>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn load(&self, cluster_name: &str) -> Result<Vec<ShardInfo>> {
        Ok(self
            .clusters
            .read()
            .get(cluster_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, cluster_name: &str, shards: &[ShardInfo]) -> Result<()> {
        self.clusters
            .write()
            .insert(cluster_name.to_string(), shards.to_vec());
        Ok(())
    }
}

// ============================================================================
// File-Based Implementation (using async tokio::fs)
// ============================================================================

/// JSON file per cluster under a base directory.
#[derive(Debug)]
pub struct FileMetadataStore {
    base_dir: PathBuf,
}

impl FileMetadataStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| Error::Metadata(format!("Failed to create {}: {}", base_dir.display(), e)))?;
        Ok(Self { base_dir })
    }

    fn cluster_path(&self, cluster_name: &str) -> PathBuf {
        let safe: String = cluster_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.base_dir.join(format!("{}.json", safe))
    }

    /// Write to a temp file, sync, then rename over the target.
    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Metadata(format!("Failed to create temp file: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| Error::Metadata(format!("Failed to write temp file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Metadata(format!("Failed to sync temp file: {}", e)))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Metadata(format!("Failed to rename file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load(&self, cluster_name: &str) -> Result<Vec<ShardInfo>> {
        let path = self.cluster_path(cluster_name);
        match fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .map_err(|e| Error::Metadata(format!("Corrupt topology in {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Metadata(format!("Failed to read topology: {}", e))),
        }
    }

    async fn save(&self, cluster_name: &str, shards: &[ShardInfo]) -> Result<()> {
        let content = serde_json::to_vec_pretty(shards)?;
        self.atomic_write(&self.cluster_path(cluster_name), &content)
            .await?;
        tracing::debug!(cluster = cluster_name, shards = shards.len(), "Saved topology");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
