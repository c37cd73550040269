//! Remote blob store boundary
//!
//! A flat folder of named blobs. Listings are paginated and callers must
//! follow `next_page_token` until it is `None`.

mod auth;
mod drive;
mod memory;

pub use auth::{DriveAuth, ServiceAccountKey, DRIVE_SCOPE};
pub use drive::DriveBlobStore;
pub use memory::InMemoryBlobStore;

use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    pub entries: Vec<BlobEntry>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self, folder: &str, page_token: Option<String>) -> Result<BlobPage>;

    /// Stores `bytes` under `name` in `folder` and returns the new blob id.
    async fn upload(&self, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String>;

    async fn download(&self, id: &str) -> Result<Vec<u8>>;
}
