//! Vocabulary directory reconciliation
//!
//! Diffs `*.json` sources against the registry by modification time and
//! enqueues pregeneration jobs for anything new, changed, or not yet ready.
//! Both the startup scan and every debounced change notification end here.

use crate::config::CacheConfig;
use crate::manifest::{ManifestStore, RegistryEntry, VocabStatus};
use crate::scheduler::{Job, JobQueue};
use crate::vocabulary::Vocabulary;
use crate::Result;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

const SOURCE_EXT: &str = "json";

/// Modification time of a file as UTC.
pub async fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let meta = fs::metadata(path).await?;
    Ok(meta.modified()?.into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub enqueued: Vec<String>,
    pub unchanged: usize,
    pub in_flight: usize,
    pub failed: Vec<String>,
    pub removed: Vec<String>,
}

enum Decision {
    Enqueue(RegistryEntry),
    Invalid(RegistryEntry),
    Unchanged,
    InFlight,
}

pub struct VocabularyScanner {
    dir: PathBuf,
    exclusions: GlobSet,
    manifest: Arc<ManifestStore>,
    queue: JobQueue,
}

impl VocabularyScanner {
    pub fn new(config: &CacheConfig, manifest: Arc<ManifestStore>, queue: JobQueue) -> Result<Self> {
        Ok(Self {
            dir: config.vocabularies_dir.clone(),
            exclusions: config.scanner.exclusion_set()?,
            manifest,
            queue,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` names something the scanner would look at. Only the
    /// file name is checked, so it also answers for deleted files.
    pub fn is_source(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        path.extension().and_then(|e| e.to_str()) == Some(SOURCE_EXT)
            && !self.exclusions.is_match(name)
    }

    /// Lists `(source id, path, mtime)` for every eligible file.
    async fn list_sources(&self) -> Result<Vec<(String, PathBuf, DateTime<Utc>)>> {
        fs::create_dir_all(&self.dir).await?;
        let mut sources = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.is_source(&path) || !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match modified_time(&path).await {
                Ok(mtime) => sources.push((stem.to_string(), path.clone(), mtime)),
                Err(e) => {
                    warn!(target: "scanner", path = %path.display(), error = %e, "Cannot stat source");
                }
            }
        }
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(sources)
    }

    async fn decide(
        &self,
        source: &str,
        path: &Path,
        mtime: DateTime<Utc>,
        existing: Option<&RegistryEntry>,
    ) -> Decision {
        if let Some(entry) = existing.filter(|e| mtime <= e.last_modified) {
            match entry.status {
                VocabStatus::Ready => return Decision::Unchanged,
                VocabStatus::Processing => return Decision::InFlight,
                VocabStatus::Detected | VocabStatus::Failed => {}
            }
        }

        let mut entry = RegistryEntry {
            source: source.to_string(),
            word_count: 0,
            last_modified: mtime,
            status: VocabStatus::Processing,
            error: None,
        };
        match Vocabulary::load(path).await {
            Ok(vocabulary) => {
                entry.word_count = vocabulary.word_count();
                Decision::Enqueue(entry)
            }
            Err(e) => {
                entry.status = VocabStatus::Failed;
                entry.error = Some(e.to_string());
                Decision::Invalid(entry)
            }
        }
    }

    pub async fn reconcile(&self) -> Result<ScanReport> {
        let sources = self.list_sources().await?;
        let registry = self.manifest.registry().await;
        let mut report = ScanReport {
            scanned: sources.len(),
            ..Default::default()
        };

        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();
        for (source, path, mtime) in &sources {
            seen.insert(source.clone());
            match self.decide(source, path, *mtime, registry.get(source)).await {
                Decision::Enqueue(entry) => {
                    report.enqueued.push(source.clone());
                    changes.push(entry);
                }
                Decision::Invalid(entry) => {
                    warn!(target: "scanner", source = %source, error = ?entry.error, "Vocabulary source does not parse");
                    report.failed.push(source.clone());
                    if registry.get(source) != Some(&entry) {
                        changes.push(entry);
                    }
                }
                Decision::Unchanged => report.unchanged += 1,
                Decision::InFlight => report.in_flight += 1,
            }
        }
        report.removed = registry
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();

        if changes.is_empty() && report.removed.is_empty() {
            debug!(target: "scanner", scanned = report.scanned, "No vocabulary changes");
            return Ok(report);
        }

        // Mark `processing` before the job is visible to the worker.
        let removed = report.removed.clone();
        self.manifest
            .update(|m| {
                for entry in changes {
                    m.vocabularies.insert(entry.source.clone(), entry);
                }
                for source in &removed {
                    m.vocabularies.remove(source);
                }
            })
            .await;

        let mut unqueued = Vec::new();
        for source in &report.enqueued {
            if let Err(e) = self.queue.enqueue(Job::pregenerate(source.clone())) {
                warn!(target: "scanner", source = %source, error = %e, "Could not enqueue job");
                unqueued.push(source.clone());
            }
        }
        if !unqueued.is_empty() {
            self.manifest
                .update(|m| {
                    for source in &unqueued {
                        if let Some(entry) = m.vocabularies.get_mut(source) {
                            entry.status = VocabStatus::Detected;
                        }
                    }
                })
                .await;
            report.enqueued.retain(|s| !unqueued.contains(s));
        }

        info!(
            target: "scanner",
            scanned = report.scanned,
            enqueued = report.enqueued.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "Vocabulary scan complete"
        );
        Ok(report)
    }
}
