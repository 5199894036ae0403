//! Fileshare Core - peer-to-peer file sharing within a session
//!
//! Participants publish descriptors of the files they share to a replicated
//! store and serve the bytes on demand over a dedicated peer channel, using a
//! small request / size / chunks protocol.

pub mod config;
pub mod descriptor;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod keys;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod transfer;

use std::sync::{Mutex, MutexGuard};

// Re-export commonly used types
pub use config::ShareConfig;
pub use descriptor::{format_file_size, FileArtifact, FileDescriptor, SharedFile};
pub use download::Downloader;
pub use engine::TransferEngine;
pub use error::{TransferError, TransferResult};
pub use events::{Events, GroupMessage, LocalBus, MessageBus, ShareEvent};
pub use keys::{Identity, LocalParticipant};
pub use registry::Registry;
pub use store::{DescriptorStore, MemoryStore, PersistentStore};
pub use transfer::{ProgressFn, Transfer, TransferSnapshot, TransferState};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
