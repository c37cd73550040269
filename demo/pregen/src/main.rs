mod config;
use config::PregenConfig;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use vocab_tts_core::{BlobStore, DriveBlobStore, FsWatcher, HttpSynthesizer, ServiceAccountKey, VocabTts};

const USAGE: &str = "usage: vocab-tts-pregen [run | say <lang> <text...> | cleanup [--force] | health]";

/// Prefers the service-account key, which refreshes itself, over a fixed token.
async fn drive_store(cfg: &PregenConfig) -> Option<Arc<dyn BlobStore>> {
    if !cfg.remote_enabled() {
        info!(target = "pregen", "Remote tier disabled (no folder id or Drive credentials)");
        return None;
    }
    let remote = cfg.cache.remote.clone();
    if let Some(path) = &remote.credentials_path {
        return match ServiceAccountKey::from_file(path).await {
            Ok(key) => {
                info!(target = "pregen", account = %key.client_email, "Using Drive service account");
                Some(Arc::new(DriveBlobStore::with_service_account(remote, key)))
            }
            Err(e) => {
                warn!(target = "pregen", error = %e, "Cannot load Drive credentials; remote tier disabled");
                None
            }
        };
    }
    let token = cfg.drive_access_token.clone()?;
    Some(Arc::new(DriveBlobStore::with_access_token(remote, token)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,vocab_tts_core=info,vocab_tts_pregen=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Defaults + optional TOML overlay + env
    let cfg = PregenConfig::load();

    let synth = Arc::new(HttpSynthesizer::new(cfg.cache.synth.clone()));
    let blob_store = drive_store(&cfg).await;
    let mut tts = VocabTts::new(cfg.cache.clone(), synth, blob_store).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => {}
        Some("say") => {
            let (Some(lang), true) = (args.get(1), args.len() > 2) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let generation = tts.generate(lang, &args[2..].join(" ")).await;
            println!("{}", serde_json::to_string_pretty(&generation)?);
            if !generation.is_success() {
                std::process::exit(1);
            }
            return Ok(());
        }
        Some("cleanup") => {
            let force = args.iter().any(|a| a == "--force");
            let report = tts.cleanup(force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Some("health") => {
            println!("{}", serde_json::to_string_pretty(&tts.health().await)?);
            return Ok(());
        }
        Some(other) => {
            eprintln!("unknown command: {other}\n{USAGE}");
            std::process::exit(2);
        }
    }

    info!(
        target = "pregen",
        vocabularies = %cfg.cache.vocabularies_dir.display(),
        cache = %cfg.cache.local_cache_dir.display(),
        "Starting pregeneration daemon"
    );
    std::fs::create_dir_all(&cfg.cache.vocabularies_dir)?;
    tts.start().await?;

    let _watcher = match FsWatcher::watch(&cfg.cache.vocabularies_dir, tts.change_sender()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(target = "pregen", error = %e, "File watching unavailable; only the startup scan will run");
            None
        }
    };

    if let Err(e) = signal::ctrl_c().await {
        error!(target = "pregen", error = %e, "Failed to listen for shutdown signal");
    }
    info!(target = "pregen", "Shutdown signal received");
    tts.shutdown().await?;
    Ok(())
}
