//! 持久化模块：终态产物与代码附件的存储接口。
//!
//! # Artifact Storage
//!
//! Persistence is an external collaborator. The accumulator calls it once per
//! finished stream; failures are logged by the caller and never retried.

use crate::types::{AssetMetadata, CodeAsset};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the final text of a stream under its page id.
    async fn save_terminal_artifact(&self, page_id: &str, text: &str, assets: &[CodeAsset])
        -> Result<()>;

    async fn save_asset(&self, asset_id: &str, bytes: Bytes, metadata: &AssetMetadata) -> Result<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub text: String,
    pub asset_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub bytes: Bytes,
    pub metadata: AssetMetadata,
}

#[derive(Default)]
struct Stored {
    artifacts: HashMap<String, StoredArtifact>,
    assets: HashMap<String, StoredAsset>,
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<Stored>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Stored> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Stored> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn artifact(&self, page_id: &str) -> Option<StoredArtifact> {
        self.read().artifacts.get(page_id).cloned()
    }

    pub fn asset(&self, asset_id: &str) -> Option<StoredAsset> {
        self.read().assets.get(asset_id).cloned()
    }

    pub fn artifact_count(&self) -> usize {
        self.read().artifacts.len()
    }

    pub fn asset_count(&self) -> usize {
        self.read().assets.len()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save_terminal_artifact(
        &self,
        page_id: &str,
        text: &str,
        assets: &[CodeAsset],
    ) -> Result<()> {
        let artifact = StoredArtifact {
            text: text.to_string(),
            asset_ids: assets.iter().map(|a| a.id.clone()).collect(),
        };
        self.write().artifacts.insert(page_id.to_string(), artifact);
        Ok(())
    }

    async fn save_asset(&self, asset_id: &str, bytes: Bytes, metadata: &AssetMetadata) -> Result<()> {
        let asset = StoredAsset {
            bytes,
            metadata: metadata.clone(),
        };
        self.write().assets.insert(asset_id.to_string(), asset);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
