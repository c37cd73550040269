//! Typed configuration for the cache and pipeline
//!
//! Every recognised option lives here with its default. Deserializing from a
//! partial document fills the rest from `Default`; `validate()` is called once
//! by [`crate::VocabTts::new`].

use crate::{CacheError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `{hash}.mp3` artifacts (the local tier)
    pub local_cache_dir: PathBuf,
    /// Directory scanned for vocabulary `*.json` sources
    pub vocabularies_dir: PathBuf,
    /// Durable manifest document (protected hashes + registry)
    pub manifest_path: PathBuf,
    pub supported_languages: Vec<String>,
    pub max_text_length: usize,
    pub rate_limit: RateLimitConfig,
    pub generation: GenerationConfig,
    pub remote: RemoteConfig,
    pub eviction: EvictionConfig,
    pub scheduler: SchedulerConfig,
    pub scanner: ScannerConfig,
    pub synth: SynthConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_cache_dir: PathBuf::from("/tmp/audio_cache"),
            vocabularies_dir: PathBuf::from("vocabularies"),
            manifest_path: PathBuf::from("data/audio_manifest.json"),
            supported_languages: ["de", "ru", "en", "fr", "es"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_text_length: 250,
            rate_limit: RateLimitConfig::default(),
            generation: GenerationConfig::default(),
            remote: RemoteConfig::default(),
            eviction: EvictionConfig::default(),
            scheduler: SchedulerConfig::default(),
            scanner: ScannerConfig::default(),
            synth: SynthConfig::default(),
        }
    }
}

/// Provider call budgets
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: usize,
    pub per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 6,
            per_hour: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    /// First backoff delay; doubles after every failed attempt
    pub backoff_base_ms: u64,
    pub attempt_timeout_ms: u64,
    /// Consecutive failures after which a key is short-circuited
    pub failure_threshold: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            attempt_timeout_ms: 30_000,
            failure_threshold: 3,
        }
    }
}

impl GenerationConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay after the given (1-based) failed attempt: base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Remote tier settings. Without a folder the cache runs local-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub folder_id: Option<String>,
    pub page_size: usize,
    /// Service-account key file; takes precedence over `access_token`
    pub credentials_path: Option<PathBuf>,
    /// Static bearer token, for short runs or an externally refreshed token
    pub access_token: Option<String>,
    pub api_base: String,
    pub upload_base: String,
    pub timeout_ms: u64,
    /// Minimum gap between listing attempts after a failed one
    pub list_retry_secs: u64,
}

impl RemoteConfig {
    pub fn list_retry(&self) -> Duration {
        Duration::from_secs(self.list_retry_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            page_size: 1000,
            credentials_path: None,
            access_token: None,
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            timeout_ms: 30_000,
            list_retry_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub max_files: usize,
    pub max_bytes: u64,
    pub interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_files: 5_000,
            max_bytes: 512 * 1024 * 1024,
            interval_secs: 3_600,
        }
    }
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long the worker waits for a job before running maintenance
    pub maintenance_timeout_ms: u64,
    /// Longest the worker sleeps for the rate limiter inside one job
    pub rate_limit_wait_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_timeout_ms: 30_000,
            rate_limit_wait_max_ms: 65_000,
        }
    }
}

impl SchedulerConfig {
    pub fn maintenance_timeout(&self) -> Duration {
        Duration::from_millis(self.maintenance_timeout_ms)
    }

    pub fn rate_limit_wait_max(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_max_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Glob patterns matched against file names; matches never enter the registry
    pub exclude_patterns: Vec<String>,
    pub debounce_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: [".*", "*~", "*.bak", "*.tmp", "*.swp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            debounce_ms: 2_000,
        }
    }
}

impl ScannerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn exclusion_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                CacheError::Config(format!("invalid exclude pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| CacheError::Config(format!("exclude patterns: {e}")))
    }
}

/// HTTP synthesizer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Longest text sent in one provider request; longer text is split on word boundaries
    pub max_chunk_chars: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://translate.google.com/translate_tts".to_string(),
            timeout_ms: 20_000,
            user_agent: "Mozilla/5.0 (compatible; vocab-tts/0.1)".to_string(),
            max_chunk_chars: 100,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(CacheError::Config(
                "rate_limit budgets must be greater than zero".into(),
            ));
        }
        if self.rate_limit.per_minute > self.rate_limit.per_hour {
            return Err(CacheError::Config(format!(
                "rate_limit.per_minute ({}) exceeds rate_limit.per_hour ({})",
                self.rate_limit.per_minute, self.rate_limit.per_hour
            )));
        }
        if self.generation.max_attempts == 0 {
            return Err(CacheError::Config(
                "generation.max_attempts must be at least 1".into(),
            ));
        }
        if self.generation.failure_threshold == 0 {
            return Err(CacheError::Config(
                "generation.failure_threshold must be at least 1".into(),
            ));
        }
        if self.generation.attempt_timeout_ms == 0 {
            return Err(CacheError::Config(
                "generation.attempt_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.supported_languages.is_empty() {
            return Err(CacheError::Config(
                "supported_languages must not be empty".into(),
            ));
        }
        if self.max_text_length == 0 {
            return Err(CacheError::Config(
                "max_text_length must be greater than zero".into(),
            ));
        }
        if self.remote.folder_id.is_some() && self.remote.page_size == 0 {
            return Err(CacheError::Config(
                "remote.page_size must be greater than zero".into(),
            ));
        }
        if self.synth.max_chunk_chars == 0 {
            return Err(CacheError::Config(
                "synth.max_chunk_chars must be greater than zero".into(),
            ));
        }
        self.scanner.exclusion_set()?;
        Ok(())
    }

    pub fn is_supported_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l == language)
    }
}
