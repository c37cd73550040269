use super::{BlobEntry, BlobPage, BlobStore};
use crate::{CacheError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// In-process blob store with small pages, used for local-only runs and tests.
///
/// Pagination is real (page tokens are offsets into the sorted listing) so
/// callers that stop after the first page are caught.
pub struct InMemoryBlobStore {
    page_size: usize,
    // folder -> (name -> id)
    folders: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    blobs: DashMap<String, Vec<u8>>,
    next_id: AtomicU64,
    fail_uploads: AtomicBool,
    fail_downloads: AtomicBool,
    fail_listing: AtomicBool,
    list_calls: AtomicU64,
    uploads: AtomicU64,
}

impl InMemoryBlobStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            folders: Mutex::new(BTreeMap::new()),
            blobs: DashMap::new(),
            next_id: AtomicU64::new(1),
            fail_uploads: AtomicBool::new(false),
            fail_downloads: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            list_calls: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
        }
    }

    /// Seeds a blob directly, bypassing upload accounting.
    pub fn insert(&self, folder: &str, name: &str, bytes: Vec<u8>) -> String {
        let id = format!("blob-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.blobs.insert(id.clone(), bytes);
        if let Ok(mut folders) = self.folders.lock() {
            folders
                .entry(folder.to_string())
                .or_default()
                .insert(name.to_string(), id.clone());
        }
        id
    }

    pub fn contains(&self, folder: &str, name: &str) -> bool {
        self.folders
            .lock()
            .map(|f| f.get(folder).is_some_and(|names| names.contains_key(name)))
            .unwrap_or(false)
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, folder: &str, page_token: Option<String>) -> Result<BlobPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(CacheError::Remote("listing unavailable".into()));
        }
        let offset = match page_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| CacheError::Remote(format!("bad page token {t:?}")))?,
            None => 0,
        };
        let folders = self
            .folders
            .lock()
            .map_err(|_| CacheError::Remote("blob index poisoned".into()))?;
        let Some(names) = folders.get(folder) else {
            return Ok(BlobPage::default());
        };

        let entries: Vec<BlobEntry> = names
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|(name, id)| BlobEntry {
                name: name.clone(),
                id: id.clone(),
            })
            .collect();
        let next = offset + entries.len();
        let next_page_token = (next < names.len()).then(|| next.to_string());
        Ok(BlobPage {
            entries,
            next_page_token,
        })
    }

    async fn upload(&self, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(CacheError::Remote("upload rejected".into()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(folder, name, bytes))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(CacheError::Remote("download rejected".into()));
        }
        self.blobs
            .get(id)
            .map(|b| b.value().clone())
            .ok_or_else(|| CacheError::Remote(format!("no blob with id {id}")))
    }
}
