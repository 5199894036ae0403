//! What this participant shares, and which files it can see.

use crate::descriptor::{unix_millis, FileDescriptor, SharedFile};
use crate::error::{TransferError, TransferResult};
use crate::events::{GroupMessage, MessageBus};
use crate::keys::LocalParticipant;
use crate::store::DescriptorStore;
use crate::transfer::ShareLookup;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub struct Registry {
    participant: LocalParticipant,
    namespace: String,
    store: Arc<dyn DescriptorStore>,
    bus: Arc<dyn MessageBus>,
    shares: RwLock<Vec<SharedFile>>,
    /// Files we have pulled a copy of
    downloaded: RwLock<HashSet<String>>,
}

impl Registry {
    pub fn new(
        participant: LocalParticipant,
        namespace: impl Into<String>,
        store: Arc<dyn DescriptorStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            participant,
            namespace: namespace.into(),
            store,
            bus,
            shares: RwLock::new(Vec::new()),
            downloaded: RwLock::new(HashSet::new()),
        }
    }

    pub fn participant(&self) -> &LocalParticipant {
        &self.participant
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<dyn DescriptorStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn store_key(&self, file_id: &str) -> String {
        format!("{}{}", self.namespace, file_id)
    }

    /// Start sharing `file`. Returns `None` if a file with the same name and
    /// size is already shared.
    pub async fn share(&self, mut file: SharedFile) -> Result<Option<FileDescriptor>> {
        {
            let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
            if shares.iter().any(|f| f.name == file.name && f.size() == file.size()) {
                tracing::debug!("{} is already shared", file.name);
                return Ok(None);
            }
            if file.id.is_none() {
                file.id = Some(Uuid::new_v4().to_string());
            }
            shares.push(file.clone());
        }

        let id = file.id.clone().unwrap_or_default();
        let descriptor = FileDescriptor {
            id: id.clone(),
            name: file.name.clone(),
            size: file.size(),
            mime_type: file.mime_type.clone(),
            date: unix_millis(),
            owner: self.participant.id.clone(),
            owner_name: self.participant.display_name.clone(),
        };

        if let Err(e) = self.store.set(&self.store_key(&id), Some(descriptor.to_value())).await {
            self.remove_local(&id);
            return Err(e.context(format!("Failed to publish {}", file.name)));
        }

        self.bus.send_global(GroupMessage::FileShared {
            from: self.participant.id.clone(),
            descriptor: descriptor.clone(),
        });

        tracing::info!("Sharing {} as {}", descriptor.summary(), id);
        Ok(Some(descriptor))
    }

    fn remove_local(&self, file_id: &str) -> Option<SharedFile> {
        let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
        let index = shares.iter().position(|f| f.id.as_deref() == Some(file_id))?;
        Some(shares.remove(index))
    }

    /// Stop sharing one of our files. Returns false if we do not share it.
    pub async fn stop_sharing(&self, file_id: &str) -> Result<bool> {
        let Some(file) = self.remove_local(file_id) else {
            return Ok(false);
        };

        if let Err(e) = self.store.set(&self.store_key(file_id), None).await {
            // Still published, so keep serving it
            self.shares.write().unwrap_or_else(|e| e.into_inner()).push(file);
            return Err(e.context(format!("Failed to retract {}", file_id)));
        }
        tracing::info!("Stopped sharing {}", file_id);
        Ok(true)
    }

    /// Retract every file we share. Returns how many were retracted.
    pub async fn stop_sharing_all(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .shared_files()
            .into_iter()
            .filter_map(|f| f.id)
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.stop_sharing(&id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn shared_files(&self) -> Vec<SharedFile> {
        self.shares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn mark_downloaded(&self, file_id: &str) {
        self.downloaded
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_id.to_string());
    }

    pub fn has_downloaded(&self, file_id: &str) -> bool {
        self.downloaded
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(file_id)
    }

    /// Look a file up in the shared store.
    pub async fn descriptor(&self, file_id: &str) -> TransferResult<FileDescriptor> {
        let value = self
            .store
            .get(&self.store_key(file_id))
            .await
            .map_err(|e| TransferError::Store(format!("{:#}", e)))?;

        value
            .as_ref()
            .and_then(FileDescriptor::from_value)
            .ok_or_else(|| TransferError::NotFound(file_id.to_string()))
    }

    /// The merged file list as this participant should see it: our own
    /// files, files we already have, and files whose owner we can reach.
    /// Newest first. Malformed store entries are skipped.
    pub async fn visible_files(&self, is_connected: impl Fn(&str) -> bool) -> Vec<FileDescriptor> {
        let entries = match self.store.entries(&self.namespace).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Could not read shared files: {:#}", e);
                return Vec::new();
            }
        };

        let mut files: Vec<FileDescriptor> = entries
            .iter()
            .filter_map(|(key, value)| {
                let descriptor = FileDescriptor::from_value(value);
                if descriptor.is_none() {
                    tracing::debug!("Skipping malformed entry {}", key);
                }
                descriptor
            })
            .filter(|file| {
                file.owner == self.participant.id
                    || self.has_downloaded(&file.id)
                    || is_connected(&file.owner)
            })
            .collect();

        files.sort_by(|a, b| b.date.cmp(&a.date));
        files
    }
}

impl ShareLookup for Registry {
    fn find_share(&self, file_id: &str) -> Option<SharedFile> {
        self.shares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|f| f.id.as_deref() == Some(file_id))
            .cloned()
    }
}
