//! Background pregeneration
//!
//! A single worker drains [`Job`]s from an unbounded channel. Between jobs the
//! wait is bounded by the maintenance timeout so the eviction policy gets a
//! chance to run even when the queue is idle.
//!
//! Stopping goes through a separate watch flag rather than the job channel,
//! so a backlog never delays shutdown. The worker checks it before taking the
//! next job and the running job checks it between keys.

use crate::config::{CacheConfig, SchedulerConfig};
use crate::eviction::EvictionPolicy;
use crate::hash::{ContentHash, ContentKey};
use crate::manifest::{RegistryEntry, VocabStatus};
use crate::pipeline::{GenerationOutcome, GenerationPipeline};
use crate::scanner::modified_time;
use crate::vocabulary::Vocabulary;
use crate::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Pregenerate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub action: JobAction,
    /// Vocabulary source identifier (file stem)
    pub source: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn pregenerate(source: impl Into<String>) -> Self {
        Self {
            action: JobAction::Pregenerate,
            source: source.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Sending half of the job channel plus the stop flag. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    stop: Arc<watch::Sender<bool>>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        (
            Self {
                tx,
                stop: Arc::new(stop),
            },
            rx,
        )
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        if self.is_stopping() {
            return Err(CacheError::QueueClosed);
        }
        debug!(target: "scheduler", source = %job.source, "Job enqueued");
        self.tx.send(job).map_err(|_| CacheError::QueueClosed)
    }

    /// Asks the worker to stop after the key it is generating.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Resolves once stop is requested. Yields `false` if every queue handle is gone first.
async fn stop_requested(mut stop: watch::Receiver<bool>) -> bool {
    stop.wait_for(|stopping| *stopping).await.is_ok()
}

/// Per-job tally of what happened to each required key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PregenerateReport {
    pub source: String,
    pub word_count: usize,
    pub required: usize,
    pub already_present: usize,
    pub generated: usize,
    pub restored: usize,
    pub invalid: usize,
    pub failed: usize,
    /// Keys not attempted because the rate-limit wait exceeded its bound
    pub deferred: usize,
}

impl PregenerateReport {
    pub fn missing(&self) -> usize {
        self.failed + self.deferred
    }

    pub fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(PregenerateReport),
    Failed(String),
}

pub struct Scheduler {
    config: SchedulerConfig,
    vocabularies_dir: PathBuf,
    eviction_interval: Duration,
    pipeline: Arc<GenerationPipeline>,
    eviction: Arc<EvictionPolicy>,
    stop: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        config: &CacheConfig,
        pipeline: Arc<GenerationPipeline>,
        eviction: Arc<EvictionPolicy>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: config.scheduler.clone(),
            vocabularies_dir: config.vocabularies_dir.clone(),
            eviction_interval: config.eviction.interval(),
            pipeline,
            eviction,
            stop,
        }
    }

    pub fn spawn(self, rx: mpsc::UnboundedReceiver<Job>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        info!(target: "scheduler", "Worker started");
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                biased;
                true = stop_requested(self.stop.clone()) => {
                    info!(target: "scheduler", "Shutdown requested");
                    break;
                }
                received = timeout(self.config.maintenance_timeout(), rx.recv()) => match received {
                    Ok(Some(job)) => {
                        self.run_job(job).await;
                    }
                    Ok(None) => {
                        debug!(target: "scheduler", "All queue senders dropped");
                        break;
                    }
                    Err(_) => {
                        if last_cleanup.elapsed() >= self.eviction_interval {
                            if let Err(e) = self.eviction.maybe_cleanup(false).await {
                                error!(target: "scheduler", error = %e, "Maintenance failed");
                            }
                            last_cleanup = Instant::now();
                        }
                    }
                },
            }
        }

        rx.close();
        let mut pending = Vec::new();
        while let Ok(job) = rx.try_recv() {
            pending.push(job.source);
        }
        if !pending.is_empty() {
            self.release(&pending).await;
        }
        info!(target: "scheduler", abandoned = pending.len(), "Worker stopped");
    }

    fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Puts queued sources that never ran back to `detected`.
    async fn release(&self, sources: &[String]) {
        self.pipeline
            .manifest()
            .update(|m| {
                for source in sources {
                    if let Some(entry) = m.vocabularies.get_mut(source) {
                        if entry.status == VocabStatus::Processing {
                            entry.status = VocabStatus::Detected;
                        }
                    }
                }
            })
            .await;
    }

    pub async fn run_job(&self, job: Job) -> JobOutcome {
        let waited = Utc::now().signed_duration_since(job.enqueued_at);
        info!(
            target: "scheduler",
            source = %job.source,
            queued_ms = waited.num_milliseconds(),
            "Processing job"
        );
        let outcome = match job.action {
            JobAction::Pregenerate => self.pregenerate(&job.source).await,
        };
        match &outcome {
            JobOutcome::Completed(report) if report.is_complete() => {
                info!(target: "scheduler", source = %job.source, generated = report.generated, "Vocabulary ready");
            }
            JobOutcome::Completed(report) => {
                warn!(
                    target: "scheduler",
                    source = %job.source,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Vocabulary incomplete"
                );
            }
            JobOutcome::Failed(reason) => {
                error!(target: "scheduler", source = %job.source, reason = %reason, "Job failed");
            }
        }
        outcome
    }

    fn source_path(&self, source: &str) -> PathBuf {
        self.vocabularies_dir.join(format!("{source}.json"))
    }

    /// Ensures every artifact a vocabulary source needs exists locally and is protected.
    pub async fn pregenerate(&self, source: &str) -> JobOutcome {
        let path = self.source_path(source);
        let modified = modified_time(&path).await.ok();

        let vocabulary = match Vocabulary::load(&path).await {
            Ok(v) => v,
            Err(e) => {
                let reason = e.to_string();
                self.finish(source, modified, 0, VocabStatus::Failed, Some(reason.clone()))
                    .await;
                return JobOutcome::Failed(reason);
            }
        };

        let required = vocabulary.required_keys();
        let mut report = PregenerateReport {
            source: source.to_string(),
            word_count: vocabulary.word_count(),
            required: required.len(),
            ..Default::default()
        };

        let mut remaining = required.iter();
        while let Some((hash, key)) = remaining.next() {
            if self.is_stopping() {
                report.deferred += 1 + remaining.len();
                info!(target: "scheduler", source, deferred = report.deferred, "Stopping mid-job");
                break;
            }
            if self.pipeline.cache().exists(hash).await {
                report.already_present += 1;
                continue;
            }
            if !self.generate_with_wait(key, &mut report).await {
                // The failed wait counted as one deferred key; the rest follow.
                report.deferred += remaining.len();
                break;
            }
        }

        let protected = required.keys().cloned().collect::<Vec<ContentHash>>();
        let added = self.pipeline.manifest().protect(protected).await;
        debug!(target: "scheduler", source, added, "Protected vocabulary hashes");

        let (status, error) = if report.is_complete() {
            (VocabStatus::Ready, None)
        } else {
            (
                VocabStatus::Failed,
                Some(format!(
                    "{} of {} artifacts missing ({} failed, {} deferred)",
                    report.missing(),
                    report.required,
                    report.failed,
                    report.deferred
                )),
            )
        };
        self.finish(source, modified, report.word_count, status, error)
            .await;
        JobOutcome::Completed(report)
    }

    /// Runs one key, sleeping through rate limits up to the configured bound.
    /// Returns `false` when the job should stop.
    async fn generate_with_wait(&self, key: &ContentKey, report: &mut PregenerateReport) -> bool {
        let max_wait = self.config.rate_limit_wait_max();
        loop {
            let generation = self.pipeline.generate_key(key.clone()).await;
            match generation.outcome {
                GenerationOutcome::Generated => report.generated += 1,
                GenerationOutcome::CachedLocal => report.already_present += 1,
                GenerationOutcome::CachedRemote => report.restored += 1,
                GenerationOutcome::InvalidInput(reason) => {
                    debug!(target: "scheduler", key = %key, reason = %reason, "Skipping invalid key");
                    report.invalid += 1;
                }
                GenerationOutcome::ShortCircuited | GenerationOutcome::Failed(_) => {
                    report.failed += 1
                }
                GenerationOutcome::RateLimited(reason) => {
                    let wait = self.pipeline.limiter().retry_after().unwrap_or_default();
                    if wait > max_wait {
                        warn!(
                            target: "scheduler",
                            reason = reason.as_str(),
                            wait_secs = wait.as_secs(),
                            "Rate limit wait too long; deferring rest of job"
                        );
                        report.deferred += 1;
                        return false;
                    }
                    debug!(target: "scheduler", wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
                    tokio::select! {
                        _ = sleep(wait) => continue,
                        true = stop_requested(self.stop.clone()) => {
                            report.deferred += 1;
                            return false;
                        }
                    }
                }
            }
            return true;
        }
    }

    async fn finish(
        &self,
        source: &str,
        modified: Option<DateTime<Utc>>,
        word_count: usize,
        status: VocabStatus,
        error: Option<String>,
    ) {
        self.pipeline
            .manifest()
            .update(|m| {
                let last_modified = modified
                    .or_else(|| m.vocabularies.get(source).map(|e| e.last_modified))
                    .unwrap_or_else(Utc::now);
                m.vocabularies.insert(
                    source.to_string(),
                    RegistryEntry {
                        source: source.to_string(),
                        word_count,
                        last_modified,
                        status,
                        error,
                    },
                );
            })
            .await;
    }

    pub fn vocabularies_dir(&self) -> &Path {
        &self.vocabularies_dir
    }
}
