mod common;

use common::{eventually, service, test_config, FakeSynthesizer};
use std::time::{Duration, Instant};
use vocab_tts_core::{ChangeEvent, ContentHash, HealthStatus, Result, VocabStatus};

#[tokio::test]
async fn startup_scan_pregenerates_vocabulary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.vocabularies_dir)?;
    std::fs::write(
        config.vocabularies_dir.join("a1_animals.json"),
        r#"{"words": [
            {"german": "Hund"},
            {"german": "Katze", "russian": "кошка", "sentence": "Die Katze schläft."}
        ]}"#,
    )?;

    let synth = FakeSynthesizer::new();
    let mut tts = service(config, synth.clone(), None).await?;
    tts.start().await?;

    let tts_ref = &tts;
    let ready = eventually(move || async move {
        tts_ref
            .vocabularies()
            .await
            .get("a1_animals")
            .is_some_and(|e| e.status == VocabStatus::Ready)
    })
    .await;
    assert!(ready);

    // "Hund" has no sentence, so it contributes one request only.
    assert_eq!(synth.calls(), 4);
    let manifest = tts.pipeline().manifest();
    assert!(manifest.is_protected(&ContentHash::of("de", "Hund")).await);
    assert!(manifest.is_protected(&ContentHash::of("de", "Die Katze schläft.")).await);
    assert_eq!(tts.vocabularies().await["a1_animals"].word_count, 2);

    tts.shutdown().await?;
    assert!(!tts.is_running());
    Ok(())
}

#[tokio::test]
async fn change_events_pick_up_new_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let vocab_dir = config.vocabularies_dir.clone();
    let synth = FakeSynthesizer::new();
    let mut tts = service(config, synth.clone(), None).await?;
    tts.start().await?;

    std::fs::create_dir_all(&vocab_dir)?;
    std::fs::write(vocab_dir.join("b1.json"), r#"[{"russian": "дом"}]"#)?;
    std::fs::write(vocab_dir.join(".b1.json.swp"), "garbage")?;
    let changes = tts.change_sender();
    for _ in 0..5 {
        let _ = changes.send(ChangeEvent::Changed(vocab_dir.join("b1.json")));
    }

    let tts_ref = &tts;
    let ready = eventually(move || async move {
        tts_ref
            .vocabularies()
            .await
            .get("b1")
            .is_some_and(|e| e.status == VocabStatus::Ready)
    })
    .await;
    assert!(ready);
    assert_eq!(synth.calls(), 1);
    assert_eq!(tts.vocabularies().await.len(), 1);

    tts.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn forced_cleanup_keeps_protected_artifacts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let tts = service(config.clone(), FakeSynthesizer::new(), None).await?;

    let kept = tts.generate("de", "bleiben").await;
    let orphan = ContentHash::of("de", "weg");
    std::fs::write(config.local_cache_dir.join(orphan.file_name()), b"old")?;

    let report = tts.cleanup(true).await?;
    assert!(report.ran);
    assert_eq!(report.files_scanned, 2);
    assert_eq!(report.files_deleted, 1);
    assert!(config.local_cache_dir.join(kept.artifact_name()).exists());
    assert!(!config.local_cache_dir.join(orphan.file_name()).exists());
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_after_current_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.vocabularies_dir)?;
    for (source, word) in [("j1", "Apfel"), ("j2", "Birne"), ("j3", "Kirsche")] {
        std::fs::write(
            config.vocabularies_dir.join(format!("{source}.json")),
            format!(r#"[{{"german": "{word}"}}]"#),
        )?;
    }

    let synth = FakeSynthesizer::slow(Duration::from_millis(300));
    let mut tts = service(config, synth.clone(), None).await?;
    tts.start().await?;

    let counter = synth.clone();
    let in_flight = eventually(move || {
        let synth = counter.clone();
        async move { synth.calls() == 1 }
    })
    .await;
    assert!(in_flight);

    let started = Instant::now();
    tts.shutdown().await?;
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(synth.calls(), 1);

    let registry = tts.vocabularies().await;
    assert_eq!(registry["j1"].status, VocabStatus::Ready);
    assert_eq!(registry["j2"].status, VocabStatus::Detected);
    assert_eq!(registry["j3"].status, VocabStatus::Detected);
    Ok(())
}

#[tokio::test]
async fn health_reports_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.vocabularies_dir)?;
    let mut tts = service(config, FakeSynthesizer::new(), None).await?;
    assert!(!tts.health().await.running);

    tts.start().await?;
    tts.generate("de", "Hallo").await;
    let health = tts.health().await;
    assert!(health.running);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.local_cache_writable);
    assert!(health.vocabularies_dir_exists);
    assert_eq!(health.local_artifacts, 1);
    assert_eq!(health.protected_hashes, 1);
    assert_eq!(health.rate_limit.minute_used, 1);
    assert_eq!(health.stats.generations_total, 1);

    tts.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn missing_sources_dir_is_degraded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let tts = service(test_config(dir.path()), FakeSynthesizer::new(), None).await?;

    let health = tts.health().await;
    assert!(!health.vocabularies_dir_exists);
    assert!(health.local_cache_writable);
    assert_eq!(health.status, HealthStatus::Degraded);
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.rate_limit.per_minute = 0;
    assert!(service(config, FakeSynthesizer::new(), None).await.is_err());
}
