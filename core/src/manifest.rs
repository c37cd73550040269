//! Durable manifest: protected hashes and the vocabulary registry
//!
//! The document is always read and replaced whole. Saves go to a sibling
//! temp file which is then renamed over the manifest, so a crash mid-write
//! leaves the previous version intact.
//!
//! [`ManifestStore`] owns the only in-memory copy. Its lock is held across
//! the save so the scanner and the scheduler cannot interleave writes.

use crate::hash::ContentHash;
use crate::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub type ProtectedSet = BTreeSet<ContentHash>;
pub type Registry = BTreeMap<String, RegistryEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabStatus {
    Detected,
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub source: String,
    pub word_count: usize,
    pub last_modified: DateTime<Utc>,
    pub status: VocabStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub protected_hashes: ProtectedSet,
    #[serde(default)]
    pub vocabularies: Registry,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(protected_hashes: ProtectedSet, vocabularies: Registry) -> Self {
        Self {
            protected_hashes,
            vocabularies,
            last_updated: None,
        }
    }

    /// `Ok(None)` when no manifest has been written yet.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        let manifest = serde_json::from_str(&content).map_err(|e| {
            CacheError::Manifest(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(manifest))
    }

    /// Stamps `last_updated` and replaces the document atomically.
    pub async fn save(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        self.last_updated = Some(Utc::now());
        let json = serde_json::to_vec_pretty(self)?;

        let tmp = temp_path(path);
        if let Err(e) = fs::write(&tmp, &json).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::Io(e));
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::Io(e));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "manifest.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Lock-guarded owner of the manifest
pub struct ManifestStore {
    path: PathBuf,
    state: Mutex<Manifest>,
}

impl ManifestStore {
    /// Loads the manifest (or starts empty). Entries left `processing` by a
    /// previous process go back to `detected` so the next scan re-enqueues them.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut manifest = Manifest::load(&path).await?.unwrap_or_default();
        let mut requeued = 0;
        for entry in manifest.vocabularies.values_mut() {
            if entry.status == VocabStatus::Processing {
                entry.status = VocabStatus::Detected;
                requeued += 1;
            }
        }
        info!(
            target: "manifest",
            path = %path.display(),
            protected = manifest.protected_hashes.len(),
            vocabularies = manifest.vocabularies.len(),
            requeued,
            "Manifest opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(manifest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Manifest {
        self.state.lock().await.clone()
    }

    pub async fn protected(&self) -> ProtectedSet {
        self.state.lock().await.protected_hashes.clone()
    }

    pub async fn is_protected(&self, hash: &ContentHash) -> bool {
        self.state.lock().await.protected_hashes.contains(hash)
    }

    pub async fn entry(&self, source: &str) -> Option<RegistryEntry> {
        self.state.lock().await.vocabularies.get(source).cloned()
    }

    pub async fn registry(&self) -> Registry {
        self.state.lock().await.vocabularies.clone()
    }

    /// Applies `f` and persists. A failed save is logged; the in-memory
    /// state keeps the mutation and the next successful save makes it durable.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Manifest) -> T) -> T {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        if let Err(e) = state.save(&self.path).await {
            error!(target: "manifest", path = %self.path.display(), error = %e, "Manifest save failed; durability degraded");
        }
        out
    }

    /// Marks hashes as protected; saves only when something was added.
    pub async fn protect<I>(&self, hashes: I) -> usize
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let mut state = self.state.lock().await;
        let before = state.protected_hashes.len();
        state.protected_hashes.extend(hashes);
        let added = state.protected_hashes.len() - before;
        if added > 0 {
            if let Err(e) = state.save(&self.path).await {
                error!(target: "manifest", error = %e, "Manifest save failed; durability degraded");
            } else {
                debug!(target: "manifest", added, "Protected hashes persisted");
            }
        }
        added
    }

    pub async fn upsert_entry(&self, entry: RegistryEntry) {
        self.update(|m| {
            m.vocabularies.insert(entry.source.clone(), entry);
        })
        .await
    }

    /// Administrative reset of the protected set; returns how many were dropped.
    pub async fn reset_protected(&self) -> usize {
        let dropped = self
            .update(|m| std::mem::take(&mut m.protected_hashes).len())
            .await;
        warn!(target: "manifest", dropped, "Protected set reset");
        dropped
    }

    /// Re-reads the document from disk, replacing the in-memory copy.
    pub async fn reload(&self) -> Result<()> {
        let loaded = Manifest::load(&self.path).await?.unwrap_or_default();
        *self.state.lock().await = loaded;
        Ok(())
    }

    /// Persists the current state as-is (e.g. to retry after a failed save).
    pub async fn save(&self) -> Result<()> {
        self.state.lock().await.save(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, status: VocabStatus) -> RegistryEntry {
        RegistryEntry {
            source: source.to_string(),
            word_count: 12,
            last_modified: Utc::now(),
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let protected: ProtectedSet = [ContentHash::of("de", "a"), ContentHash::of("ru", "b")]
            .into_iter()
            .collect();
        let mut registry = Registry::new();
        registry.insert("a1".into(), entry("a1", VocabStatus::Ready));
        let mut failed = entry("b2", VocabStatus::Failed);
        failed.error = Some("2 of 9 artifacts missing".into());
        registry.insert("b2".into(), failed);

        let mut m = Manifest::new(protected.clone(), registry.clone());
        m.save(&path).await.unwrap();
        assert!(m.last_updated.is_some());

        let loaded = Manifest::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.protected_hashes, protected);
        assert_eq!(loaded.vocabularies, registry);
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        let mut m = Manifest::default();
        m.protected_hashes.insert(ContentHash::of("de", "x"));
        m.vocabularies
            .insert("a1".into(), entry("a1", VocabStatus::Processing));
        m.save(&path).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["protected_hashes"].is_array());
        assert_eq!(raw["vocabularies"]["a1"]["status"], "processing");
        assert!(raw["vocabularies"]["a1"].get("error").is_none());
        assert!(raw["last_updated"].is_string());
    }

    #[tokio::test]
    async fn missing_is_none_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        assert!(Manifest::load(&path).await.unwrap().is_none());

        std::fs::write(&path, "not json {{").unwrap();
        assert!(matches!(
            Manifest::load(&path).await,
            Err(CacheError::Manifest(_))
        ));
    }

    #[tokio::test]
    async fn save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("er").join("manifest.json");
        Manifest::default().save(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn store_requeues_processing_entries_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut m = Manifest::default();
        m.vocabularies
            .insert("a1".into(), entry("a1", VocabStatus::Processing));
        m.vocabularies.insert("b1".into(), entry("b1", VocabStatus::Ready));
        m.save(&path).await.unwrap();

        let store = ManifestStore::open(&path).await.unwrap();
        assert_eq!(store.entry("a1").await.unwrap().status, VocabStatus::Detected);
        assert_eq!(store.entry("b1").await.unwrap().status, VocabStatus::Ready);
    }

    #[tokio::test]
    async fn protect_persists_and_reset_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let store = ManifestStore::open(&path).await.unwrap();

        let h = ContentHash::of("de", "Hallo");
        assert_eq!(store.protect([h.clone()]).await, 1);
        assert_eq!(store.protect([h.clone()]).await, 0);
        assert!(store.is_protected(&h).await);

        let reopened = ManifestStore::open(&path).await.unwrap();
        assert!(reopened.is_protected(&h).await);

        assert_eq!(reopened.reset_protected().await, 1);
        assert!(reopened.protected().await.is_empty());
        reopened.reload().await.unwrap();
        assert!(reopened.protected().await.is_empty());
    }

    #[tokio::test]
    async fn failed_save_keeps_serving_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the manifest file should be makes every save fail.
        let path = dir.path().join("manifest.json");
        std::fs::create_dir_all(&path).unwrap();
        let store = ManifestStore {
            path: path.clone(),
            state: Mutex::new(Manifest::default()),
        };

        let h = ContentHash::of("de", "Tisch");
        assert_eq!(store.protect([h.clone()]).await, 1);
        assert!(store.is_protected(&h).await);
        assert!(store.save().await.is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_status() -> impl Strategy<Value = VocabStatus> {
            prop_oneof![
                Just(VocabStatus::Detected),
                Just(VocabStatus::Processing),
                Just(VocabStatus::Ready),
                Just(VocabStatus::Failed),
            ]
        }

        fn arb_entry() -> impl Strategy<Value = RegistryEntry> {
            (
                "[a-z][a-z0-9_]{0,12}",
                0usize..500,
                0i64..4_000_000_000,
                arb_status(),
                proptest::option::of("[ -~]{0,40}"),
            )
                .prop_map(|(source, word_count, secs, status, error)| RegistryEntry {
                    source,
                    word_count,
                    last_modified: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
                    status,
                    error,
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn saved_document_loads_back_unchanged(
                phrases in prop::collection::vec(("(de|ru|en)", "\\PC{1,30}"), 0..20),
                entries in prop::collection::vec(arb_entry(), 0..8),
            ) {
                let protected: ProtectedSet = phrases
                    .iter()
                    .map(|(lang, text)| ContentHash::of(lang, text))
                    .collect();
                let registry: Registry = entries
                    .into_iter()
                    .map(|e| (e.source.clone(), e))
                    .collect();

                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let loaded = rt.block_on(async {
                    let dir = tempfile::tempdir().unwrap();
                    let path = dir.path().join("manifest.json");
                    Manifest::new(protected.clone(), registry.clone())
                        .save(&path)
                        .await
                        .unwrap();
                    Manifest::load(&path).await.unwrap().unwrap()
                });

                prop_assert_eq!(loaded.protected_hashes, protected);
                prop_assert_eq!(loaded.vocabularies, registry);
            }
        }
    }
}
