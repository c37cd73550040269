use crate::blob::BlobStore;
use crate::hash::ContentHash;
use crate::{CacheError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_LIST_RETRY: Duration = Duration::from_secs(60);

/// Durable tier backed by a [`BlobStore`] folder.
///
/// Existence checks go against an in-memory name→id index that is built once,
/// on first use, by walking every page of the folder listing, and then kept
/// current by uploads. A failed listing leaves the index unbuilt; it is
/// attempted again at most once per retry interval.
pub struct RemoteTier {
    store: Arc<dyn BlobStore>,
    folder: String,
    index: OnceCell<RwLock<HashMap<String, String>>>,
    list_retry: Duration,
    next_attempt: Mutex<Option<Instant>>,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn BlobStore>, folder: impl Into<String>) -> Self {
        Self {
            store,
            folder: folder.into(),
            index: OnceCell::new(),
            list_retry: DEFAULT_LIST_RETRY,
            next_attempt: Mutex::new(None),
        }
    }

    pub fn with_list_retry(mut self, interval: Duration) -> Self {
        self.list_retry = interval;
        self
    }

    fn backing_off(&self) -> bool {
        self.next_attempt
            .lock()
            .ok()
            .and_then(|next| *next)
            .is_some_and(|at| Instant::now() < at)
    }

    fn schedule_retry(&self) {
        if let Ok(mut next) = self.next_attempt.lock() {
            *next = Some(Instant::now() + self.list_retry);
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    async fn index(&self) -> Result<&RwLock<HashMap<String, String>>> {
        if let Some(idx) = self.index.get() {
            return Ok(idx);
        }
        if self.backing_off() {
            debug!(target: "remote", folder = %self.folder, "Skipping listing until retry interval passes");
            return Err(CacheError::Remote("listing unavailable; retry pending".into()));
        }
        let built = self
            .index
            .get_or_try_init(|| async {
                let mut names = HashMap::new();
                let mut token = None;
                let mut pages = 0usize;
                loop {
                    let page = self.store.list(&self.folder, token).await?;
                    pages += 1;
                    for entry in page.entries {
                        names.insert(entry.name, entry.id);
                    }
                    match page.next_page_token {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                info!(target: "remote", folder = %self.folder, files = names.len(), pages, "Remote index built");
                Ok::<_, CacheError>(RwLock::new(names))
            })
            .await;
        if built.is_err() {
            self.schedule_retry();
        }
        built
    }

    /// Whether the index has been built yet.
    pub fn is_indexed(&self) -> bool {
        self.index.initialized()
    }

    pub async fn len(&self) -> usize {
        match self.index().await {
            Ok(idx) => idx.read().await.len(),
            Err(_) => 0,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn exists(&self, hash: &ContentHash) -> bool {
        match self.index().await {
            Ok(idx) => idx.read().await.contains_key(&hash.file_name()),
            Err(e) => {
                warn!(target: "remote", error = %e, "Remote index unavailable");
                false
            }
        }
    }

    pub async fn fetch(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        let idx = self.index().await.ok()?;
        let id = idx.read().await.get(&hash.file_name()).cloned()?;
        match self.store.download(&id).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(target: "remote", hash = %hash, error = %e, "Remote download failed");
                None
            }
        }
    }

    pub async fn upload(&self, hash: &ContentHash, bytes: Vec<u8>) -> bool {
        let name = hash.file_name();
        match self.store.upload(&self.folder, &name, bytes).await {
            Ok(id) => {
                if let Ok(idx) = self.index().await {
                    idx.write().await.insert(name, id);
                }
                true
            }
            Err(e) => {
                warn!(target: "remote", hash = %hash, error = %e, "Remote upload failed; artifact is local-only");
                false
            }
        }
    }
}
