// Vocab TTS Core Library
// Content-addressed speech cache with background vocabulary pregeneration

pub mod blob;
pub mod config;
pub mod eviction;
pub mod failure;
pub mod hash;
pub mod manifest;
pub mod pipeline;
pub mod rate_limit;
pub mod scanner;
pub mod scheduler;
pub mod stats;
pub mod synth;
pub mod tier;
pub mod vocabulary;
pub mod watch;

// Export core types
pub use blob::{BlobStore, DriveAuth, DriveBlobStore, InMemoryBlobStore, ServiceAccountKey};
pub use config::CacheConfig;
pub use eviction::{CleanupReport, EvictionPolicy};
pub use failure::{FailureRecord, FailureTracker};
pub use hash::{ContentHash, ContentKey};
pub use manifest::{ManifestStore, RegistryEntry, VocabStatus};
pub use pipeline::{Generation, GenerationOutcome, GenerationPipeline};
pub use rate_limit::{Admission, AdmissionReason, RateLimitStatus, RateLimiter};
pub use scanner::{ScanReport, VocabularyScanner};
pub use scheduler::{Job, JobOutcome, JobQueue, PregenerateReport, Scheduler};
pub use stats::StatsSnapshot;
pub use synth::{HttpSynthesizer, SpeechSynthesizer, SynthesisError};
pub use tier::{LocalTier, RemoteTier, TieredCache};
pub use watch::{ChangeEvent, ChangeSender, WatchBridge};
#[cfg(feature = "watch")]
pub use watch::FsWatcher;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Job queue closed")]
    QueueClosed,

    #[error("Watch error: {0}")]
    Watch(String),
}
pub type Result<T> = std::result::Result<T, CacheError>;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The service works but cannot write new artifacts or find its sources
    Degraded,
}

/// Point-in-time service health, for admin endpoints
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub local_cache_dir: PathBuf,
    pub local_cache_writable: bool,
    pub vocabularies_dir_exists: bool,
    pub local_artifacts: usize,
    pub remote_enabled: bool,
    pub remote_indexed: bool,
    pub protected_hashes: usize,
    pub vocabularies: BTreeMap<String, VocabStatus>,
    pub failing_keys: usize,
    pub rate_limit: RateLimitStatus,
    pub stats: StatsSnapshot,
}

/// Core service
pub struct VocabTts {
    config: CacheConfig,
    pipeline: Arc<GenerationPipeline>,
    scanner: Arc<VocabularyScanner>,
    eviction: Arc<EvictionPolicy>,
    queue: JobQueue,
    changes: ChangeSender,
    pending: Option<(UnboundedReceiver<Job>, UnboundedReceiver<ChangeEvent>)>,
    worker: Option<JoinHandle<()>>,
    bridge: Option<JoinHandle<()>>,
}

impl VocabTts {
    pub async fn new(
        config: CacheConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        blob_store: Option<Arc<dyn BlobStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let local = LocalTier::new(&config.local_cache_dir);
        local.ensure_dir().await?;
        let remote = match (blob_store, config.remote.folder_id.clone()) {
            (Some(store), Some(folder)) => {
                Some(RemoteTier::new(store, folder).with_list_retry(config.remote.list_retry()))
            }
            (Some(_), None) => {
                tracing::warn!(target: "cache", "Blob store supplied without a folder id; remote tier disabled");
                None
            }
            (None, _) => None,
        };
        let cache = Arc::new(TieredCache::new(local, remote));
        let manifest = Arc::new(ManifestStore::open(&config.manifest_path).await?);

        let pipeline = Arc::new(GenerationPipeline::new(
            &config,
            cache.clone(),
            synthesizer,
            Arc::new(RateLimiter::new(&config.rate_limit)),
            Arc::new(FailureTracker::new(config.generation.failure_threshold)),
            manifest.clone(),
        ));
        let eviction = Arc::new(EvictionPolicy::new(
            config.eviction.clone(),
            cache,
            manifest.clone(),
        ));

        let (queue, job_rx) = JobQueue::new();
        let scanner = Arc::new(VocabularyScanner::new(&config, manifest, queue.clone())?);
        let (changes, change_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            pipeline,
            scanner,
            eviction,
            queue,
            changes,
            pending: Some((job_rx, change_rx)),
            worker: None,
            bridge: None,
        })
    }

    /// Spawns the worker and the change bridge, then requests the startup scan.
    pub async fn start(&mut self) -> Result<()> {
        let Some((job_rx, change_rx)) = self.pending.take() else {
            tracing::warn!(target: "scheduler", "Already started");
            return Ok(());
        };
        tracing::info!("Starting Vocab TTS...");

        let scheduler = Scheduler::new(
            &self.config,
            self.pipeline.clone(),
            self.eviction.clone(),
            self.queue.stop_signal(),
        );
        self.worker = Some(scheduler.spawn(job_rx));

        let bridge = WatchBridge::new(self.scanner.clone(), self.config.scanner.debounce());
        self.bridge = Some(bridge.spawn(change_rx));

        self.rescan()?;
        tracing::info!("Vocab TTS started successfully");
        Ok(())
    }

    /// Stops the change bridge, then lets the worker finish the key it is on.
    /// Queued jobs that never started go back to `detected`.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down Vocab TTS...");

        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
            let _ = bridge.await;
        }
        if let Some(worker) = self.worker.take() {
            self.queue.shutdown();
            if let Err(e) = worker.await {
                tracing::error!(target: "scheduler", error = %e, "Worker task panicked");
            }
        }

        tracing::info!("Vocab TTS shut down successfully");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Sender for filesystem watchers; events are debounced into one reconcile.
    pub fn change_sender(&self) -> ChangeSender {
        self.changes.clone()
    }

    pub fn rescan(&self) -> Result<()> {
        self.changes
            .send(ChangeEvent::Rescan)
            .map_err(|_| CacheError::QueueClosed)
    }

    pub fn enqueue(&self, source: impl Into<String>) -> Result<()> {
        self.queue.enqueue(Job::pregenerate(source))
    }

    pub async fn generate(&self, language: &str, text: &str) -> Generation {
        self.pipeline.generate(language, text).await
    }

    pub async fn fetch_artifact(&self, file_name: &str) -> Option<Vec<u8>> {
        self.pipeline.fetch_artifact(file_name).await
    }

    pub async fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        self.eviction.maybe_cleanup(force).await
    }

    /// Forgets every failure record so short-circuited keys are retried.
    pub fn clear_failures(&self) -> usize {
        let cleared = self.pipeline.failures().clear();
        tracing::info!(target: "pipeline", cleared, "Failure records cleared");
        cleared
    }

    pub async fn vocabularies(&self) -> manifest::Registry {
        self.pipeline.manifest().registry().await
    }

    pub async fn health(&self) -> HealthReport {
        let cache = self.pipeline.cache();
        let manifest = self.pipeline.manifest().snapshot().await;
        let local_artifacts = match cache.local_artifacts().await {
            Ok(a) => a.len(),
            Err(e) => {
                tracing::warn!(target: "cache", error = %e, "Cannot list local tier");
                0
            }
        };
        let local_cache_writable = cache.local().is_writable().await;
        let vocabularies_dir_exists = tokio::fs::metadata(&self.config.vocabularies_dir)
            .await
            .is_ok_and(|m| m.is_dir());
        let status = if local_cache_writable && vocabularies_dir_exists {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            running: self.is_running(),
            local_cache_dir: self.config.local_cache_dir.clone(),
            local_cache_writable,
            vocabularies_dir_exists,
            local_artifacts,
            remote_enabled: cache.has_remote(),
            remote_indexed: cache.remote().is_some_and(|r| r.is_indexed()),
            protected_hashes: manifest.protected_hashes.len(),
            vocabularies: manifest
                .vocabularies
                .iter()
                .map(|(k, v)| (k.clone(), v.status))
                .collect(),
            failing_keys: self.pipeline.failures().len(),
            rate_limit: self.pipeline.limiter().status(),
            stats: self.pipeline.stats(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<GenerationPipeline> {
        &self.pipeline
    }

    pub fn scanner(&self) -> &Arc<VocabularyScanner> {
        &self.scanner
    }
}
