use std::fs;
use std::path::{Path, PathBuf};

use vocab_tts_core::CacheConfig;

/// Demo configuration: the core cache config plus credentials that never live in TOML
#[derive(Clone, Debug)]
pub struct PregenConfig {
    pub cache: CacheConfig,
    /// Fixed Drive bearer token, used only when no service-account key is configured
    pub drive_access_token: Option<String>,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

impl PregenConfig {
    /// Load configuration from a TOML file (path via VOCAB_TTS_CONFIG or ./vocab_tts.toml),
    /// overlaying values onto defaults, then apply environment overrides.
    pub fn load() -> Self {
        let path = std::env::var("VOCAB_TTS_CONFIG").unwrap_or_else(|_| "vocab_tts.toml".into());
        let mut cache = Self::read_toml(Path::new(&path));
        Self::apply_env(&mut cache);

        let drive_access_token = env_nonempty("DRIVE_ACCESS_TOKEN").or_else(|| cache.remote.access_token.clone());
        Self {
            cache,
            drive_access_token,
        }
    }

    fn read_toml(p: &Path) -> CacheConfig {
        if !p.exists() {
            tracing::info!(target = "pregen", path = %p.display(), "No TOML config found; using defaults/env");
            return CacheConfig::default();
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<CacheConfig>(&s) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(target = "pregen", error = %e, "Failed to parse TOML; using defaults");
                    CacheConfig::default()
                }
            },
            Err(e) => {
                tracing::warn!(target = "pregen", error = %e, "Failed to read TOML; using defaults");
                CacheConfig::default()
            }
        }
    }

    fn apply_env(cache: &mut CacheConfig) {
        if let Some(v) = env_nonempty("AUDIO_CACHE_DIR") {
            cache.local_cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("VOCABULARIES_DIR") {
            cache.vocabularies_dir = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("MANIFEST_PATH") {
            cache.manifest_path = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("GOOGLE_DRIVE_FOLDER_ID") {
            cache.remote.folder_id = Some(v);
        }
        if let Some(v) = env_nonempty("GOOGLE_APPLICATION_CREDENTIALS") {
            cache.remote.credentials_path = Some(PathBuf::from(v));
        }
    }

    pub fn remote_enabled(&self) -> bool {
        self.cache.remote.folder_id.is_some()
            && (self.cache.remote.credentials_path.is_some() || self.drive_access_token.is_some())
    }
}
