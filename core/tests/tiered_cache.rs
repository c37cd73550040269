mod common;

use async_trait::async_trait;
use common::{service, test_config, FakeSynthesizer};
use std::sync::Arc;
use std::time::Duration;
use vocab_tts_core::blob::BlobPage;
use vocab_tts_core::{BlobStore, CacheError, ContentHash, GenerationOutcome, InMemoryBlobStore, Result};

/// Listing and downloads behave normally; every upload stalls and then fails.
struct StalledUploads {
    inner: InMemoryBlobStore,
    delay: Duration,
}

#[async_trait]
impl BlobStore for StalledUploads {
    async fn list(&self, folder: &str, page_token: Option<String>) -> Result<BlobPage> {
        self.inner.list(folder, page_token).await
    }

    async fn upload(&self, _folder: &str, _name: &str, _bytes: Vec<u8>) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Err(CacheError::Remote("upload timed out".into()))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        self.inner.download(id).await
    }
}

#[tokio::test]
async fn remote_artifact_is_promoted_without_synthesis() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let store = Arc::new(InMemoryBlobStore::new(2));
    for i in 0..5 {
        let hash = ContentHash::of("de", &format!("filler{i}"));
        store.insert("audio", &hash.file_name(), vec![0]);
    }
    let hash = ContentHash::of("de", "Bahnhof");
    store.insert("audio", &hash.file_name(), b"remote-bytes".to_vec());

    let synth = FakeSynthesizer::new();
    let blob: Arc<dyn BlobStore> = store.clone();
    let tts = service(config.clone(), synth.clone(), Some(blob)).await?;

    let g = tts.generate("de", "Bahnhof").await;
    assert_eq!(g.outcome, GenerationOutcome::CachedRemote);
    assert_eq!(synth.calls(), 0);
    assert_eq!(
        std::fs::read(config.local_cache_dir.join(hash.file_name()))?,
        b"remote-bytes"
    );
    // Six entries at page size two.
    assert_eq!(store.list_calls(), 3);
    Ok(())
}

#[tokio::test]
async fn generated_artifact_is_backed_up() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryBlobStore::default());
    let blob: Arc<dyn BlobStore> = store.clone();
    let tts = service(test_config(dir.path()), FakeSynthesizer::new(), Some(blob)).await?;

    let g = tts.generate("ru", "вокзал").await;
    assert_eq!(g.outcome, GenerationOutcome::Generated);
    assert!(store.contains("audio", &g.artifact_name()));
    assert_eq!(tts.health().await.stats.remote_uploads, 1);
    Ok(())
}

#[tokio::test]
async fn upload_failure_is_best_effort() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(InMemoryBlobStore::default());
    store.set_fail_uploads(true);
    let blob: Arc<dyn BlobStore> = store.clone();
    let tts = service(test_config(dir.path()), FakeSynthesizer::new(), Some(blob)).await?;

    let g = tts.generate("de", "Gleis").await;
    assert_eq!(g.outcome, GenerationOutcome::Generated);
    assert!(!store.contains("audio", &g.artifact_name()));
    assert!(tts.pipeline().manifest().is_protected(&g.hash).await);
    Ok(())
}

#[tokio::test]
async fn evicted_artifact_is_restored_on_fetch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let store = Arc::new(InMemoryBlobStore::default());
    let blob: Arc<dyn BlobStore> = store.clone();
    let tts = service(config.clone(), FakeSynthesizer::new(), Some(blob)).await?;

    let g = tts.generate("de", "Fahrkarte").await;
    std::fs::remove_file(config.local_cache_dir.join(g.artifact_name()))?;

    let bytes = tts.fetch_artifact(&g.artifact_name()).await;
    assert_eq!(bytes.as_deref(), Some(&b"ID3:de:Fahrkarte"[..]));
    assert!(tts.fetch_artifact(&ContentHash::of("de", "nie").file_name()).await.is_none());
    Ok(())
}

#[tokio::test]
async fn missing_folder_disables_remote() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(dir.path());
    config.remote.folder_id = None;
    let store = Arc::new(InMemoryBlobStore::default());
    let blob: Arc<dyn BlobStore> = store.clone();
    let tts = service(config, FakeSynthesizer::new(), Some(blob)).await?;

    assert!(tts.generate("de", "Zug").await.is_success());
    assert!(!tts.health().await.remote_enabled);
    assert_eq!(store.upload_count(), 0);
    Ok(())
}

#[tokio::test]
async fn cleanup_during_upload_keeps_fresh_artifact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let blob: Arc<dyn BlobStore> = Arc::new(StalledUploads {
        inner: InMemoryBlobStore::default(),
        delay: Duration::from_millis(300),
    });
    let tts = service(config.clone(), FakeSynthesizer::new(), Some(blob)).await?;

    let (generation, report) = tokio::join!(tts.generate("de", "Hallo"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tts.cleanup(true).await
    });

    assert_eq!(generation.outcome, GenerationOutcome::Generated);
    assert_eq!(report?.files_deleted, 0);
    assert!(config.local_cache_dir.join(generation.artifact_name()).exists());
    assert!(tts.pipeline().manifest().is_protected(&generation.hash).await);
    Ok(())
}
