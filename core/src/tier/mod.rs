//! Two-level artifact cache
//!
//! Local is authoritative for request-time existence checks; Remote is the
//! durability backstop and may be absent. Remote failures never fail the
//! caller, they only cost durability.

mod local;
mod remote;

pub use local::{LocalArtifact, LocalTier};
pub use remote::RemoteTier;

use crate::hash::ContentHash;
use crate::Result;
use tracing::{info, warn};

pub struct TieredCache {
    local: LocalTier,
    remote: Option<RemoteTier>,
}

impl TieredCache {
    pub fn new(local: LocalTier, remote: Option<RemoteTier>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteTier> {
        self.remote.as_ref()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Local-only existence check (request path).
    pub async fn exists(&self, hash: &ContentHash) -> bool {
        self.local.exists(hash).await
    }

    pub async fn exists_remote(&self, hash: &ContentHash) -> bool {
        match &self.remote {
            Some(remote) => remote.exists(hash).await,
            None => false,
        }
    }

    pub async fn fetch_remote(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.remote.as_ref()?.fetch(hash).await
    }

    pub async fn store_local(&self, hash: &ContentHash, bytes: &[u8]) -> Result<()> {
        self.local.store(hash, bytes).await
    }

    pub async fn read_local(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.local.read(hash).await
    }

    /// Best-effort; `false` when there is no remote tier or the upload failed.
    pub async fn upload_remote(&self, hash: &ContentHash, bytes: Vec<u8>) -> bool {
        match &self.remote {
            Some(remote) => remote.upload(hash, bytes).await,
            None => false,
        }
    }

    /// Copies a remote artifact into the local tier. `false` on any miss or failure.
    pub async fn promote(&self, hash: &ContentHash) -> bool {
        if !self.exists_remote(hash).await {
            return false;
        }
        let Some(bytes) = self.fetch_remote(hash).await else {
            return false;
        };
        match self.local.store(hash, &bytes).await {
            Ok(()) => {
                info!(target: "cache", hash = %hash, "Restored artifact from remote tier");
                true
            }
            Err(e) => {
                warn!(target: "cache", hash = %hash, error = %e, "Promotion to local tier failed");
                false
            }
        }
    }

    pub async fn remove_local(&self, hash: &ContentHash) -> Result<u64> {
        self.local.remove(hash).await
    }

    pub async fn local_artifacts(&self) -> Result<Vec<LocalArtifact>> {
        self.local.artifacts().await
    }
}
