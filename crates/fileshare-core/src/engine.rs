//! Transfer dispatch.
//!
//! The engine owns the set of in-flight transfers. Outbound it guarantees at
//! most one receiving transfer per file id: concurrent requests for the same
//! file await the same [`Transfer`]. Inbound it answers every channel opened
//! on the protocol tag with a fresh sending transfer.

use crate::config::ShareConfig;
use crate::descriptor::{FileArtifact, FileDescriptor};
use crate::error::{TransferError, TransferResult};
use crate::events::{Events, GroupMessage, ShareEvent};
use crate::lock;
use crate::protocol::FramedChannel;
use crate::registry::Registry;
use crate::transfer::{ProgressFn, ShareLookup, Transfer, TransferSnapshot};
use peer_transport::{IncomingChannel, PeerTransport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

pub struct TransferEngine {
    registry: Arc<Registry>,
    transport: Arc<dyn PeerTransport>,
    events: Events,
    protocol_tag: String,
    chunk_size: usize,
    max_frame_len: usize,
    idle_timeout: Option<Duration>,
    /// Receiving transfers by file id
    active: Mutex<HashMap<String, Arc<Transfer>>>,
    /// Sending transfers, one per inbound channel
    outgoing: Mutex<Vec<Arc<Transfer>>>,
}

impl TransferEngine {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn PeerTransport>,
        cfg: &ShareConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            events: Events::default(),
            protocol_tag: cfg.protocol_tag.clone(),
            chunk_size: cfg.chunk_size,
            max_frame_len: cfg.max_frame_len,
            idle_timeout: cfg.idle_timeout(),
            active: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// Accept inbound transfer channels and start turning store changes,
    /// peer disconnects and group messages into [`ShareEvent`]s.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.transport.on_incoming(
            &self.protocol_tag,
            Arc::new(move |incoming: IncomingChannel| {
                if let Some(engine) = weak.upgrade() {
                    engine.accept(incoming);
                }
            }),
        );

        let namespace = self.registry.namespace().to_string();
        forward(Arc::downgrade(self), self.registry.store().subscribe(), move |engine, key: String| {
            if key.starts_with(&namespace) {
                engine.events.emit(ShareEvent::StateChanged);
            }
        });

        forward(Arc::downgrade(self), self.transport.disconnects(), |engine, peer: String| {
            tracing::debug!("Peer {} disconnected", peer);
            engine.events.emit(ShareEvent::StateChanged);
        });

        forward(Arc::downgrade(self), self.registry.bus().subscribe(), |engine, message| {
            match message {
                GroupMessage::FileShared { from, descriptor } => {
                    if from != engine.registry.participant().id {
                        tracing::info!("File shared: {}", descriptor.summary());
                        engine.events.emit(ShareEvent::FileShared(descriptor));
                        engine.events.emit(ShareEvent::StateChanged);
                    }
                }
            }
        });

        tracing::debug!("Accepting '{}' channels as {}", self.protocol_tag, self.transport.local_id());
    }

    /// Our merged file list, reachability taken from the transport.
    pub async fn visible_files(&self) -> Vec<FileDescriptor> {
        let transport = &self.transport;
        self.registry
            .visible_files(|peer| transport.is_connected(peer))
            .await
    }

    /// Get a file: straight from our own shares if we have it, otherwise by
    /// pulling it from its owner. Joins an in-flight transfer of the same
    /// file instead of opening a second channel.
    pub async fn request_file(
        self: &Arc<Self>,
        file_id: &str,
        on_progress: Option<ProgressFn>,
    ) -> TransferResult<FileArtifact> {
        if let Some(file) = self.registry.find_share(file_id) {
            return Ok(FileArtifact::from(file));
        }

        let transfer = match self.active_transfer(file_id) {
            Some(existing) => {
                tracing::debug!("Joining transfer {} for {}", existing.id(), file_id);
                if let Some(observer) = on_progress {
                    existing.add_progress_observer(observer);
                }
                existing
            }
            None => {
                let descriptor = self.registry.descriptor(file_id).await?;
                self.claim(descriptor, on_progress)
            }
        };

        let result = transfer.artifact().await;
        if result.is_ok() {
            self.registry.mark_downloaded(file_id);
        }
        result
    }

    /// The running (or successfully finished, not yet retired) receiving
    /// transfer for `file_id`.
    pub fn active_transfer(&self, file_id: &str) -> Option<Arc<Transfer>> {
        lock(&self.active)
            .get(file_id)
            .filter(|t| !t.is_failed())
            .cloned()
    }

    /// Register a receiving transfer for `descriptor`, or return the one
    /// another caller registered while we were resolving the descriptor.
    /// `on_progress` is attached before the transfer can make progress.
    fn claim(self: &Arc<Self>, descriptor: FileDescriptor, on_progress: Option<ProgressFn>) -> Arc<Transfer> {
        let transfer = {
            let mut active = lock(&self.active);
            let running = active.get(&descriptor.id).filter(|t| !t.is_failed()).cloned();
            if let Some(existing) = running {
                drop(active);
                if let Some(observer) = on_progress {
                    existing.add_progress_observer(observer);
                }
                return existing;
            }
            let transfer = Transfer::receiving(descriptor.id.clone());
            if let Some(observer) = on_progress {
                transfer.add_progress_observer(observer);
            }
            active.insert(descriptor.id.clone(), transfer.clone());
            transfer
        };

        self.spawn_receive(transfer.clone(), descriptor);
        self.events.emit(ShareEvent::StateChanged);
        transfer
    }

    fn spawn_receive(self: &Arc<Self>, transfer: Arc<Transfer>, descriptor: FileDescriptor) {
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!("Requesting {} from {}", descriptor.summary(), descriptor.owner);
            let opened = engine
                .transport
                .open_channel(&descriptor.owner, &engine.protocol_tag)
                .await;

            let result = match opened {
                Ok(stream) => {
                    let channel = engine.framed(stream, &descriptor.owner);
                    transfer.run_receive(channel, &descriptor).await.map(|_| ())
                }
                Err(e) => {
                    let error = TransferError::Transport(format!("{:#}", e));
                    transfer.abort(error.clone());
                    Err(error)
                }
            };

            if result.is_ok() {
                engine.registry.mark_downloaded(&descriptor.id);
            }
            engine.retire_receiving(&descriptor.id, &transfer);
            engine.events.emit(ShareEvent::StateChanged);
        });
    }

    fn framed(&self, stream: peer_transport::DynStream, peer: &str) -> FramedChannel {
        FramedChannel::new(stream, peer).with_limits(self.max_frame_len, self.idle_timeout)
    }

    fn retire_receiving(&self, file_id: &str, transfer: &Arc<Transfer>) {
        let mut active = lock(&self.active);
        if active.get(file_id).is_some_and(|t| Arc::ptr_eq(t, transfer)) {
            active.remove(file_id);
        }
    }

    /// Answer one inbound channel.
    pub fn accept(self: &Arc<Self>, incoming: IncomingChannel) -> Arc<Transfer> {
        let transfer = Transfer::sending();
        lock(&self.outgoing).push(transfer.clone());
        tracing::debug!("Incoming transfer {} from {}", transfer.id(), incoming.from);

        let engine = self.clone();
        let task_transfer = transfer.clone();
        tokio::spawn(async move {
            let channel = engine.framed(incoming.stream, &incoming.from);
            let _ = task_transfer
                .run_send(channel, engine.registry.as_ref(), engine.chunk_size)
                .await;

            lock(&engine.outgoing).retain(|t| !Arc::ptr_eq(t, &task_transfer));
            engine.events.emit(ShareEvent::StateChanged);
        });

        self.events.emit(ShareEvent::StateChanged);
        transfer
    }

    /// Snapshot of every transfer still in flight, receiving first.
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        let mut out: Vec<TransferSnapshot> = lock(&self.active)
            .values()
            .map(|t| t.snapshot())
            .collect();
        out.extend(lock(&self.outgoing).iter().map(|t| t.snapshot()));
        out
    }
}

/// Relay a broadcast stream into engine callbacks until the engine or the
/// sender goes away. A lagged receiver still triggers a redraw.
fn forward<T, F>(engine: Weak<TransferEngine>, mut rx: broadcast::Receiver<T>, on_item: F)
where
    T: Clone + Send + 'static,
    F: Fn(&TransferEngine, T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    let Some(engine) = engine.upgrade() else { break };
                    on_item(engine.as_ref(), item);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event relay skipped {} items", skipped);
                    let Some(engine) = engine.upgrade() else { break };
                    engine.events.emit(ShareEvent::StateChanged);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
