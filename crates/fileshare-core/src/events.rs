//! Signals flowing out of the core: presentation events for this process and
//! the group-wide notification sent to everyone when a file is shared.

use crate::descriptor::FileDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Fire-and-forget events for whatever renders the file list.
#[derive(Debug, Clone, PartialEq)]
pub enum ShareEvent {
    /// Shared files, transfers or peer reachability changed; re-query.
    StateChanged,
    /// Someone else shared a file.
    FileShared(FileDescriptor),
    DownloadProgress { file_id: String, text: String },
    DownloadComplete { file_id: String, name: String, path: PathBuf },
    DownloadFailed { file_id: String, message: String },
}

/// Broadcast sink for [`ShareEvent`]s. Sending never fails; events with no
/// listener are dropped.
#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<ShareEvent>,
}

impl Default for Events {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Events {
    pub fn emit(&self, event: ShareEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.tx.subscribe()
    }
}

/// Lightweight message delivered to every participant in the session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum GroupMessage {
    FileShared { from: String, descriptor: FileDescriptor },
}

/// Best-effort group messaging. Nothing may depend on delivery.
pub trait MessageBus: Send + Sync {
    fn send_global(&self, message: GroupMessage);
    fn subscribe(&self) -> broadcast::Receiver<GroupMessage>;
}

/// In-process bus; every subscriber (the sender included) gets every message.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<GroupMessage>,
}

impl Default for LocalBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl MessageBus for LocalBus {
    fn send_global(&self, message: GroupMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Group message dropped: nobody is listening");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupMessage> {
        self.tx.subscribe()
    }
}
