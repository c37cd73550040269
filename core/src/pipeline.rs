//! Generation pipeline
//!
//! One request walks: validate → local → remote (promote) → circuit breaker →
//! rate gate → sanitize → generate → persist. Only generation runs under the
//! process-wide lock; everything before it is cheap and lock-free so cache
//! hits never queue behind a slow provider call.
//!
//! The local existence check is repeated right after the lock is acquired.
//! That re-check is what turns concurrent duplicate requests into a single
//! provider call instead of a serialized series of identical ones.

use crate::config::{CacheConfig, GenerationConfig};
use crate::failure::FailureTracker;
use crate::hash::{ContentHash, ContentKey};
use crate::manifest::ManifestStore;
use crate::rate_limit::{AdmissionReason, RateLimiter};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::synth::{SpeechSynthesizer, SynthesisError};
use crate::tier::TieredCache;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Characters removed before text reaches the provider
const MARKUP_DENYLIST: [char; 3] = ['<', '>', '&'];

/// Terminal state of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum GenerationOutcome {
    CachedLocal,
    CachedRemote,
    Generated,
    ShortCircuited,
    RateLimited(AdmissionReason),
    InvalidInput(String),
    Failed(String),
}

impl GenerationOutcome {
    /// True when the artifact exists locally after the call.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            GenerationOutcome::CachedLocal
                | GenerationOutcome::CachedRemote
                | GenerationOutcome::Generated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Generation {
    pub key: ContentKey,
    pub hash: ContentHash,
    #[serde(flatten)]
    pub outcome: GenerationOutcome,
}

impl Generation {
    fn new(key: ContentKey, outcome: GenerationOutcome) -> Self {
        Self {
            hash: key.hash(),
            key,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn artifact_name(&self) -> String {
        self.hash.file_name()
    }
}

/// Invisible format characters (Unicode category Cf) that `char` has no predicate for.
fn is_format(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{0600}'..='\u{0605}'
            | '\u{061C}'
            | '\u{06DD}'
            | '\u{070F}'
            | '\u{08E2}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{110BD}'
            | '\u{110CD}'
            | '\u{1BCA0}'..='\u{1BCA3}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
    )
}

/// Drops control and format characters, non-space whitespace, and the markup denylist.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| *c == ' ' || (!c.is_control() && !c.is_whitespace() && !is_format(*c)))
        .filter(|c| !MARKUP_DENYLIST.contains(c))
        .collect()
}

pub struct GenerationPipeline {
    config: GenerationConfig,
    supported_languages: Vec<String>,
    max_text_length: usize,
    cache: Arc<TieredCache>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    limiter: Arc<RateLimiter>,
    failures: Arc<FailureTracker>,
    manifest: Arc<ManifestStore>,
    stats: Arc<PipelineStats>,
    generation_lock: Mutex<()>,
}

impl GenerationPipeline {
    pub fn new(
        config: &CacheConfig,
        cache: Arc<TieredCache>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        limiter: Arc<RateLimiter>,
        failures: Arc<FailureTracker>,
        manifest: Arc<ManifestStore>,
    ) -> Self {
        Self {
            config: config.generation.clone(),
            supported_languages: config.supported_languages.clone(),
            max_text_length: config.max_text_length,
            cache,
            synthesizer,
            limiter,
            failures,
            manifest,
            stats: Arc::new(PipelineStats::new()),
            generation_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    pub fn manifest(&self) -> &Arc<ManifestStore> {
        &self.manifest
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn validate(&self, key: &ContentKey) -> Result<(), String> {
        if !self.supported_languages.iter().any(|l| *l == key.language) {
            return Err(format!("unsupported language: {}", key.language));
        }
        if key.text.is_empty() {
            return Err("text is empty".to_string());
        }
        let len = key.text.chars().count();
        if len > self.max_text_length {
            return Err(format!(
                "text too long ({len} > {} chars)",
                self.max_text_length
            ));
        }
        Ok(())
    }

    /// Ensures the artifact for (language, text) exists locally.
    pub async fn generate(&self, language: &str, text: &str) -> Generation {
        self.generate_key(ContentKey::new(language, text)).await
    }

    pub async fn generate_key(&self, key: ContentKey) -> Generation {
        self.stats.record_request();

        if let Err(reason) = self.validate(&key) {
            debug!(target: "pipeline", key = %key, reason = %reason, "Rejected input");
            return Generation::new(key, GenerationOutcome::InvalidInput(reason));
        }
        let hash = key.hash();

        if self.cache.exists(&hash).await {
            self.stats.record_cache_hit();
            return Generation::new(key, GenerationOutcome::CachedLocal);
        }
        self.stats.record_cache_miss();

        if self.cache.promote(&hash).await {
            self.stats.record_remote_download();
            return Generation::new(key, GenerationOutcome::CachedRemote);
        }

        if self.failures.is_tripped(&key) {
            self.stats.record_short_circuit();
            info!(target: "pipeline", key = %key, "Skipping key after repeated failures");
            return Generation::new(key, GenerationOutcome::ShortCircuited);
        }

        let admission = self.limiter.can_admit();
        if !admission.allowed {
            self.stats.record_rate_limited();
            warn!(target: "pipeline", reason = admission.reason.as_str(), "Rate limit reached");
            return Generation::new(key, GenerationOutcome::RateLimited(admission.reason));
        }

        let cleaned = sanitize(&key.text);
        if cleaned.trim().is_empty() {
            warn!(target: "pipeline", key = %key, "Text empty after sanitizing");
            return Generation::new(
                key,
                GenerationOutcome::InvalidInput("text empty after sanitizing".into()),
            );
        }

        let outcome = self.generate_locked(&key, &hash, cleaned.trim()).await;
        Generation::new(key, outcome)
    }

    async fn generate_locked(
        &self,
        key: &ContentKey,
        hash: &ContentHash,
        text: &str,
    ) -> GenerationOutcome {
        let bytes = {
            let _guard = self.generation_lock.lock().await;

            // A concurrent request for the same key may have finished while we waited.
            if self.cache.exists(hash).await {
                self.stats.record_cache_hit();
                debug!(target: "pipeline", hash = %hash, "Generated by a concurrent request");
                return GenerationOutcome::CachedLocal;
            }

            let admission = self.limiter.try_admit();
            if !admission.allowed {
                self.stats.record_rate_limited();
                warn!(target: "pipeline", reason = admission.reason.as_str(), "Rate limit reached while queued");
                return GenerationOutcome::RateLimited(admission.reason);
            }

            let bytes = match self.synthesize_with_retry(text, &key.language).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let attempts = self.failures.record_failure(key);
                    self.stats.record_error();
                    if e.is_quota() {
                        error!(target: "pipeline", key = %key, consecutive = attempts, "Provider quota exceeded");
                    } else {
                        error!(target: "pipeline", key = %key, consecutive = attempts, error = %e, "Synthesis failed");
                    }
                    return GenerationOutcome::Failed(e.to_string());
                }
            };

            if let Err(e) = self.cache.store_local(hash, &bytes).await {
                self.stats.record_error();
                error!(target: "pipeline", hash = %hash, error = %e, "Could not persist artifact");
                return GenerationOutcome::Failed(format!("local write failed: {e}"));
            }
            // Protected before the lock drops so eviction never sees it as an orphan.
            self.manifest.protect([hash.clone()]).await;
            self.failures.record_success(key);
            self.stats.record_generation();
            bytes
        };

        if self.cache.upload_remote(hash, bytes).await {
            self.stats.record_remote_upload();
        }

        info!(target: "pipeline", hash = %hash, language = %key.language, "Generated artifact");
        GenerationOutcome::Generated
    }

    async fn synthesize_with_retry(
        &self,
        text: &str,
        language: &str,
    ) -> Result<Vec<u8>, SynthesisError> {
        let attempt_timeout = self.config.attempt_timeout();
        let mut last_error = SynthesisError::Transient("no attempts made".into());

        for attempt in 1..=self.config.max_attempts {
            let result = timeout(attempt_timeout, self.synthesizer.synthesize(text, language)).await;
            last_error = match result {
                Ok(Ok(bytes)) if !bytes.is_empty() => return Ok(bytes),
                Ok(Ok(_)) => SynthesisError::Transient("provider returned no audio".into()),
                Ok(Err(e)) => e,
                Err(_) => SynthesisError::Timeout(attempt_timeout),
            };

            if attempt < self.config.max_attempts {
                let delay = self.config.backoff(attempt);
                warn!(
                    target: "pipeline",
                    attempt,
                    max_attempts = self.config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Synthesis attempt failed; retrying"
                );
                sleep(delay).await;
            }
        }
        Err(last_error)
    }

    /// Serves `{hash}.mp3`: local first, then promotion from the remote tier.
    pub async fn fetch_artifact(&self, file_name: &str) -> Option<Vec<u8>> {
        let hash = ContentHash::from_file_name(file_name)?;
        if let Some(bytes) = self.cache.read_local(&hash).await {
            self.stats.record_cache_hit();
            return Some(bytes);
        }
        self.stats.record_cache_miss();
        if self.cache.promote(&hash).await {
            self.stats.record_remote_download();
            return self.cache.read_local(&hash).await;
        }
        None
    }
}
