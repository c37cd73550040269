//! Orphan eviction for the local tier
//!
//! Only artifacts missing from the protected set are candidates; a protected
//! artifact is never deleted however full the cache is.

use crate::config::EvictionConfig;
use crate::manifest::ManifestStore;
use crate::tier::TieredCache;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// False when the cache was under both thresholds and the run was not forced
    pub ran: bool,
    pub files_scanned: usize,
    pub bytes_scanned: u64,
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

pub struct EvictionPolicy {
    config: EvictionConfig,
    cache: Arc<TieredCache>,
    manifest: Arc<ManifestStore>,
}

impl EvictionPolicy {
    pub fn new(config: EvictionConfig, cache: Arc<TieredCache>, manifest: Arc<ManifestStore>) -> Self {
        Self {
            config,
            cache,
            manifest,
        }
    }

    pub async fn maybe_cleanup(&self, force: bool) -> Result<CleanupReport> {
        let artifacts = self.cache.local_artifacts().await?;
        let mut report = CleanupReport {
            files_scanned: artifacts.len(),
            bytes_scanned: artifacts.iter().map(|a| a.size).sum(),
            ..Default::default()
        };

        let over_files = report.files_scanned >= self.config.max_files;
        let over_bytes = report.bytes_scanned >= self.config.max_bytes;
        if !force && !over_files && !over_bytes {
            debug!(target: "eviction", files = report.files_scanned, bytes = report.bytes_scanned, "Under thresholds; nothing to do");
            return Ok(report);
        }
        report.ran = true;

        let protected = self.manifest.protected().await;
        for artifact in artifacts.iter().filter(|a| !protected.contains(&a.hash)) {
            match self.cache.remove_local(&artifact.hash).await {
                Ok(freed) => {
                    report.files_deleted += 1;
                    report.bytes_freed += freed;
                }
                Err(e) => {
                    warn!(target: "eviction", hash = %artifact.hash, error = %e, "Could not delete orphan");
                }
            }
        }

        info!(
            target: "eviction",
            forced = force,
            scanned = report.files_scanned,
            deleted = report.files_deleted,
            freed_bytes = report.bytes_freed,
            "Orphan cleanup finished"
        );
        Ok(report)
    }
}
