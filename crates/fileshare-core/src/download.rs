//! User-facing downloads: pull a file through the engine, persist it, and
//! narrate the whole thing as [`ShareEvent`]s.

use crate::descriptor::format_file_size;
use crate::engine::TransferEngine;
use crate::events::ShareEvent;
use crate::lock;
use crate::transfer::ProgressFn;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use storage::Storage;

/// Marks a file id as being downloaded for as long as it lives.
struct DownloadGuard {
    running: Arc<Mutex<HashSet<String>>>,
    file_id: String,
}

impl DownloadGuard {
    fn acquire(running: &Arc<Mutex<HashSet<String>>>, file_id: &str) -> Option<Self> {
        if !lock(running).insert(file_id.to_string()) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            file_id: file_id.to_string(),
        })
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.file_id);
    }
}

/// Rate limit for progress text.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    fn starting_at(interval: Duration, start: Instant) -> Self {
        Self { interval, last: start }
    }

    /// Whether an update may be shown at `now`. Records it if so.
    pub fn ready_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        true
    }
}

pub struct Downloader<S> {
    engine: Arc<TransferEngine>,
    storage: Arc<S>,
    progress_interval: Duration,
    running: Arc<Mutex<HashSet<String>>>,
}

impl<S: Storage> Downloader<S> {
    pub fn new(engine: Arc<TransferEngine>, storage: Arc<S>, progress_interval: Duration) -> Self {
        Self {
            engine,
            storage,
            progress_interval,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_downloading(&self, file_id: &str) -> bool {
        lock(&self.running).contains(file_id)
    }

    /// Download `file_id` and save it. Returns `Ok(None)` without doing
    /// anything if the same file is already being downloaded.
    pub async fn download_and_save(&self, file_id: &str) -> Result<Option<PathBuf>> {
        let Some(_guard) = DownloadGuard::acquire(&self.running, file_id) else {
            tracing::debug!("Download of {} already running", file_id);
            return Ok(None);
        };

        let events = self.engine.events().clone();
        let result = self.fetch_and_store(file_id).await;

        match &result {
            Ok((name, path)) => {
                tracing::info!("Saved {} to {}", name, path.display());
                events.emit(ShareEvent::DownloadComplete {
                    file_id: file_id.to_string(),
                    name: name.clone(),
                    path: path.clone(),
                });
            }
            Err(e) => {
                tracing::error!("Download of {} failed: {:#}", file_id, e);
                events.emit(ShareEvent::DownloadFailed {
                    file_id: file_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
        events.emit(ShareEvent::StateChanged);

        result.map(|(_, path)| Some(path))
    }

    async fn fetch_and_store(&self, file_id: &str) -> Result<(String, PathBuf)> {
        let events = self.engine.events().clone();
        events.emit(ShareEvent::DownloadProgress {
            file_id: file_id.to_string(),
            text: "Downloading: Connecting...".to_string(),
        });

        let throttle = Mutex::new(ProgressThrottle::new(self.progress_interval));
        let id = file_id.to_string();
        let on_progress: ProgressFn = Arc::new(move |done: u64, total: u64| {
            if !lock(&throttle).ready_at(Instant::now()) {
                return;
            }
            events.emit(ShareEvent::DownloadProgress {
                file_id: id.clone(),
                text: format!(
                    "Downloading: {} of {}",
                    format_file_size(done),
                    format_file_size(total)
                ),
            });
        });

        let artifact = self.engine.request_file(file_id, Some(on_progress)).await?;

        let path = self
            .storage
            .put_file(&artifact.name, &artifact.data)
            .await
            .with_context(|| format!("Failed to save {}", artifact.name))?;

        Ok((artifact.name, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShareConfig;
    use crate::descriptor::{FileDescriptor, SharedFile};
    use crate::events::LocalBus;
    use crate::keys::LocalParticipant;
    use crate::registry::Registry;
    use crate::store::MemoryStore;
    use peer_transport::MemoryNetwork;
    use storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn engine(net: &MemoryNetwork, store: &Arc<MemoryStore>, bus: &LocalBus, id: &str) -> Arc<TransferEngine> {
        let registry = Arc::new(Registry::new(
            LocalParticipant::new(id, id),
            "sharedFiles/",
            store.clone(),
            Arc::new(bus.clone()),
        ));
        let engine = TransferEngine::new(registry, Arc::new(net.join(id)), &ShareConfig::default());
        engine.start();
        engine
    }

    struct Pair {
        alice: Arc<TransferEngine>,
        bob: Arc<TransferEngine>,
        _net: MemoryNetwork,
    }

    fn pair() -> Pair {
        let net = MemoryNetwork::new();
        let store = MemoryStore::new("session");
        let bus = LocalBus::default();
        let alice = engine(&net, &store, &bus, "alice");
        let bob = engine(&net, &store, &bus, "bob");
        net.connect("alice", "bob");
        Pair { alice, bob, _net: net }
    }

    async fn share(engine: &Arc<TransferEngine>, name: &str, data: Vec<u8>) -> FileDescriptor {
        engine
            .registry()
            .share(SharedFile::new(name, "text/plain", data))
            .await
            .unwrap()
            .expect("new share")
    }

    fn download_events(rx: &mut broadcast::Receiver<ShareEvent>) -> Vec<ShareEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, ShareEvent::StateChanged | ShareEvent::FileShared(_)) {
                out.push(event);
            }
        }
        out
    }

    #[test]
    fn test_throttle() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::starting_at(Duration::from_millis(250), start);

        assert!(!throttle.ready_at(start + Duration::from_millis(100)));
        assert!(throttle.ready_at(start + Duration::from_millis(250)));
        assert!(!throttle.ready_at(start + Duration::from_millis(400)));
        assert!(throttle.ready_at(start + Duration::from_millis(600)));
    }

    #[tokio::test]
    async fn test_download_saves_and_reports() {
        let temp = TempDir::new().unwrap();
        let Pair { alice, bob, _net } = pair();
        let descriptor = share(&alice, "hello.txt", b"hello world".to_vec()).await;

        let downloader = Downloader::new(
            bob.clone(),
            Arc::new(LocalStorage::new(temp.path().to_path_buf()).unwrap()),
            Duration::from_millis(250),
        );
        let mut events = bob.subscribe();

        let path = downloader
            .download_and_save(&descriptor.id)
            .await
            .unwrap()
            .expect("download ran");

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert_eq!(path.file_name().unwrap(), "hello.txt");
        assert!(!downloader.is_downloading(&descriptor.id));

        let seen = download_events(&mut events);
        assert_eq!(
            seen.first(),
            Some(&ShareEvent::DownloadProgress {
                file_id: descriptor.id.clone(),
                text: "Downloading: Connecting...".to_string(),
            })
        );
        assert_eq!(
            seen.last(),
            Some(&ShareEvent::DownloadComplete {
                file_id: descriptor.id.clone(),
                name: "hello.txt".to_string(),
                path: path.clone(),
            })
        );

        // A second download keeps the first copy
        let again = downloader.download_and_save(&descriptor.id).await.unwrap().unwrap();
        assert_ne!(again, path);
        assert_eq!(again.file_name().unwrap(), "hello (1).txt");
    }

    #[tokio::test]
    async fn test_failed_download_is_reported() {
        let temp = TempDir::new().unwrap();
        let Pair { bob, .. } = pair();
        let downloader = Downloader::new(
            bob.clone(),
            Arc::new(LocalStorage::new(temp.path().to_path_buf()).unwrap()),
            Duration::from_millis(250),
        );
        let mut events = bob.subscribe();

        let err = downloader.download_and_save("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to find file with id missing");

        let seen = download_events(&mut events);
        assert_eq!(
            seen.last(),
            Some(&ShareEvent::DownloadFailed {
                file_id: "missing".to_string(),
                message: "Unable to find file with id missing".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_download_is_ignored() {
        let temp = TempDir::new().unwrap();
        let Pair { alice, bob, _net } = pair();
        let descriptor = share(&alice, "big.bin", vec![3u8; 100_000]).await;

        let downloader = Downloader::new(
            bob.clone(),
            Arc::new(LocalStorage::new(temp.path().to_path_buf()).unwrap()),
            Duration::from_millis(250),
        );

        let (first, second) = tokio::join!(
            downloader.download_and_save(&descriptor.id),
            downloader.download_and_save(&descriptor.id),
        );

        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_none());
        assert_eq!(std::fs::read_dir(temp.path().join("downloads")).unwrap().count(), 1);
    }
}
