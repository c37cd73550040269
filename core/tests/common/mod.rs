#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vocab_tts_core::{BlobStore, CacheConfig, Result, SpeechSynthesizer, SynthesisError, VocabTts};

/// Counts calls and returns deterministic bytes; can be made slow or failing.
pub struct FakeSynthesizer {
    calls: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl FakeSynthesizer {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, language: &str) -> std::result::Result<Vec<u8>, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SynthesisError::from_message("connection reset"));
        }
        Ok(format!("ID3:{language}:{text}").into_bytes())
    }
}

/// Config rooted in `dir` with fast backoff, a generous rate budget and a short debounce.
pub fn test_config(dir: &Path) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.local_cache_dir = dir.join("audio");
    config.vocabularies_dir = dir.join("vocabularies");
    config.manifest_path = dir.join("data").join("manifest.json");
    config.rate_limit.per_minute = 100;
    config.rate_limit.per_hour = 1000;
    config.generation.backoff_base_ms = 1;
    config.scanner.debounce_ms = 20;
    config.remote.folder_id = Some("audio".to_string());
    config
}

pub async fn service(
    config: CacheConfig,
    synth: Arc<FakeSynthesizer>,
    blob_store: Option<Arc<dyn BlobStore>>,
) -> Result<VocabTts> {
    VocabTts::new(config, synth, blob_store).await
}

/// Polls `check` until it holds or about five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
