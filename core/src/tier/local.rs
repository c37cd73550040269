use crate::hash::ContentHash;
use crate::{CacheError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

/// A local artifact and its size on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    pub hash: ContentHash,
    pub size: u64,
}

/// Flat directory of `{hash}.mp3` files.
pub struct LocalTier {
    dir: PathBuf,
}

impl LocalTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join(hash.file_name())
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub async fn exists(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.path_for(hash)).await.unwrap_or(false)
    }

    pub async fn read(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        fs::read(self.path_for(hash)).await.ok()
    }

    /// Writes to a uniquely named `{hash}.mp3.*.partial` file then renames it
    /// over the artifact, so concurrent writers never share a temp file and
    /// readers never see a torn one.
    pub async fn store(&self, hash: &ContentHash, bytes: &[u8]) -> Result<()> {
        let dir = self.dir.clone();
        let final_path = self.path_for(hash);
        let prefix = format!("{}.", hash.file_name());
        let bytes_owned = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut partial = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(PARTIAL_SUFFIX)
                .tempfile_in(&dir)?;
            partial.write_all(&bytes_owned)?;
            partial.flush()?;
            // The temp file deletes itself if the rename fails.
            partial.persist(&final_path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!(target: "cache", hash = %hash, bytes = bytes.len(), "Stored local artifact");
        Ok(())
    }

    /// True when a file can be created in the directory right now.
    pub async fn is_writable(&self) -> bool {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || tempfile::tempfile_in(dir).is_ok())
            .await
            .unwrap_or(false)
    }

    /// Returns bytes freed; a missing file counts as already removed.
    pub async fn remove(&self, hash: &ContentHash) -> Result<u64> {
        let path = self.path_for(hash);
        let size = match fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::Io(e)),
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Every `{hash}.mp3` in the directory; other files are ignored.
    pub async fn artifacts(&self) -> Result<Vec<LocalArtifact>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CacheError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(hash) = name.to_str().and_then(ContentHash::from_file_name) else {
                continue;
            };
            let meta = entry.metadata().await?;
            if meta.is_file() {
                out.push(LocalArtifact {
                    hash,
                    size: meta.len(),
                });
            }
        }
        Ok(out)
    }
}
