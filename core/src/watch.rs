//! Change notification bridge
//!
//! Every filesystem notification and the startup scan arrive as
//! [`ChangeEvent`]s on one channel. Bursts are coalesced: after the first
//! event the bridge keeps draining until the channel has been quiet for the
//! debounce window, then runs a single reconcile.

use crate::scanner::VocabularyScanner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Full rescan (startup, or an explicit request)
    Rescan,
    Changed(PathBuf),
}

pub type ChangeSender = UnboundedSender<ChangeEvent>;

pub struct WatchBridge {
    scanner: Arc<VocabularyScanner>,
    debounce: Duration,
}

impl WatchBridge {
    pub fn new(scanner: Arc<VocabularyScanner>, debounce: Duration) -> Self {
        Self { scanner, debounce }
    }

    fn is_relevant(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::Rescan => true,
            ChangeEvent::Changed(path) => self.scanner.is_source(path),
        }
    }

    pub fn spawn(self, rx: UnboundedReceiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Runs until every sender is dropped.
    pub async fn run(self, mut rx: UnboundedReceiver<ChangeEvent>) {
        let mut closed = false;
        while !closed {
            let Some(first) = rx.recv().await else {
                break;
            };
            if !self.is_relevant(&first) {
                continue;
            }

            let mut coalesced = 1usize;
            loop {
                match timeout(self.debounce, rx.recv()).await {
                    Ok(Some(event)) => {
                        if self.is_relevant(&event) {
                            coalesced += 1;
                        }
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            debug!(target: "scanner", coalesced, "Change burst settled");
            if let Err(e) = self.scanner.reconcile().await {
                error!(target: "scanner", error = %e, "Reconcile failed");
            }
        }
        info!(target: "scanner", "Change bridge stopped");
    }
}

#[cfg(feature = "watch")]
pub use fs_watch::FsWatcher;

#[cfg(feature = "watch")]
mod fs_watch {
    use super::{ChangeEvent, ChangeSender};
    use crate::{CacheError, Result};
    use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use std::path::Path;
    use tracing::{info, warn};

    /// Forwards `notify` events for one directory into the change channel.
    /// Watching stops when this is dropped.
    pub struct FsWatcher {
        _watcher: RecommendedWatcher,
    }

    impl FsWatcher {
        pub fn watch(dir: &Path, tx: ChangeSender) -> Result<Self> {
            let mut watcher = notify::recommended_watcher(
                move |res: notify::Result<notify::Event>| match res {
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            return;
                        }
                        for path in event.paths {
                            let _ = tx.send(ChangeEvent::Changed(path));
                        }
                    }
                    Err(e) => warn!(target: "scanner", error = %e, "Watch error"),
                },
            )
            .map_err(|e| CacheError::Watch(e.to_string()))?;

            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| CacheError::Watch(e.to_string()))?;
            info!(target: "scanner", dir = %dir.display(), "Watching vocabulary directory");
            Ok(Self { _watcher: watcher })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manifest::ManifestStore;
    use crate::scheduler::{Job, JobQueue};
    use tokio::sync::mpsc;

    async fn setup(
        debounce: Duration,
    ) -> (
        tempfile::TempDir,
        Arc<VocabularyScanner>,
        WatchBridge,
        UnboundedReceiver<Job>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.vocabularies_dir = dir.path().join("vocab");
        std::fs::create_dir_all(&config.vocabularies_dir).unwrap();
        let manifest = Arc::new(
            ManifestStore::open(dir.path().join("manifest.json"))
                .await
                .unwrap(),
        );
        let (queue, jobs) = JobQueue::new();
        let scanner = Arc::new(VocabularyScanner::new(&config, manifest, queue).unwrap());
        let bridge = WatchBridge::new(scanner.clone(), debounce);
        (dir, scanner, bridge, jobs)
    }

    fn jobs_in(rx: &mut UnboundedReceiver<Job>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn burst_coalesces_into_one_reconcile() {
        let (_dir, scanner, bridge, mut jobs) = setup(Duration::from_millis(50)).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bridge.spawn(rx);

        std::fs::write(scanner.dir().join("a1.json"), "[]").unwrap();
        for _ in 0..20 {
            tx.send(ChangeEvent::Changed(scanner.dir().join("a1.json")))
                .unwrap();
        }
        tx.send(ChangeEvent::Rescan).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(jobs_in(&mut jobs), 1);
    }

    #[tokio::test]
    async fn irrelevant_events_do_not_reconcile() {
        let (_dir, scanner, bridge, mut jobs) = setup(Duration::from_millis(10)).await;
        std::fs::write(scanner.dir().join("a1.json"), "[]").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ChangeEvent::Changed(scanner.dir().join(".a1.json.swp")))
            .unwrap();
        tx.send(ChangeEvent::Changed(scanner.dir().join("readme.md")))
            .unwrap();
        drop(tx);
        bridge.run(rx).await;

        assert_eq!(jobs_in(&mut jobs), 0);
        assert_eq!(scanner.reconcile().await.unwrap().enqueued.len(), 1);
    }

    #[tokio::test]
    async fn separate_bursts_each_reconcile() {
        let (_dir, scanner, bridge, mut jobs) = setup(Duration::from_millis(20)).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bridge.spawn(rx);

        std::fs::write(scanner.dir().join("a1.json"), "[]").unwrap();
        tx.send(ChangeEvent::Rescan).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(jobs_in(&mut jobs), 1);

        std::fs::write(scanner.dir().join("b1.json"), "[]").unwrap();
        tx.send(ChangeEvent::Changed(scanner.dir().join("b1.json")))
            .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(jobs_in(&mut jobs), 1);
    }
}
