//! The group-visible key/value store that file descriptors are published to.
//!
//! Every participant holds a replica. Writes are stamped with
//! `(unix millis, writer id)` and replicas converge by keeping the highest
//! stamp per key (last write wins). A removal is a write of `None`, so it
//! also wins over older values instead of being resurrected by them.

use crate::descriptor::unix_millis;
use crate::lock;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage::Storage;
use tokio::sync::broadcast;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub millis: u64,
    pub writer: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub value: Option<Value>,
    pub stamp: Stamp,
}

impl StoreRecord {
    /// A local write that supersedes `previous`, even if our clock lags.
    fn after(previous: Option<&StoreRecord>, writer: &str, value: Option<Value>) -> Self {
        let now = unix_millis();
        let millis = match previous {
            Some(prev) if prev.stamp.millis >= now => prev.stamp.millis + 1,
            _ => now,
        };
        Self {
            value,
            stamp: Stamp { millis, writer: writer.to_string() },
        }
    }

    fn supersedes(&self, other: Option<&StoreRecord>) -> bool {
        match other {
            Some(existing) => self.stamp > existing.stamp,
            None => true,
        }
    }
}

#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Live entries whose key starts with `namespace`. Removed keys are omitted.
    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Value)>>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write or (with `None`) remove an entry.
    async fn set(&self, key: &str, value: Option<Value>) -> Result<()>;

    /// Receives the key of every entry that changes.
    fn subscribe(&self) -> broadcast::Receiver<String>;
}

/// In-memory replica.
pub struct MemoryStore {
    writer: String,
    records: Mutex<HashMap<String, StoreRecord>>,
    changes: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new(writer: impl Into<String>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(256);
        Arc::new(Self {
            writer: writer.into(),
            records: Mutex::new(HashMap::new()),
            changes,
        })
    }

    /// Apply a write received from another replica. Returns whether it won.
    pub fn merge(&self, key: &str, record: StoreRecord) -> bool {
        let applied = {
            let mut records = lock(&self.records);
            if record.supersedes(records.get(key)) {
                records.insert(key.to_string(), record);
                true
            } else {
                false
            }
        };

        if applied {
            let _ = self.changes.send(key.to_string());
        }
        applied
    }

    /// Pull every record from `other`, keeping the newest per key.
    pub fn sync_from(&self, other: &MemoryStore) -> usize {
        other
            .records()
            .into_iter()
            .filter(|(key, record)| self.merge(key, record.clone()))
            .count()
    }

    pub fn records(&self) -> Vec<(String, StoreRecord)> {
        lock(&self.records)
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }
}

#[async_trait]
impl DescriptorStore for MemoryStore {
    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|(key, _)| key.starts_with(namespace))
            .filter_map(|(key, record)| record.value.clone().map(|v| (key.clone(), v)))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.records).get(key).and_then(|r| r.value.clone()))
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        {
            let mut records = lock(&self.records);
            let record = StoreRecord::after(records.get(key), &self.writer, value);
            records.insert(key.to_string(), record);
        }
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

/// Replica persisted through a [`Storage`] record store, so processes that
/// point at the same directory see each other's descriptors. Only writes made
/// through this instance are announced on [`subscribe`](DescriptorStore::subscribe).
pub struct PersistentStore<S> {
    writer: String,
    storage: S,
    changes: broadcast::Sender<String>,
}

impl<S: Storage> PersistentStore<S> {
    pub fn new(writer: impl Into<String>, storage: S) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            writer: writer.into(),
            storage,
            changes,
        }
    }

    async fn record(&self, key: &str) -> Result<Option<StoreRecord>> {
        let Some(bytes) = self.storage.get_record(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable store record {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, record: &StoreRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record).context("Failed to encode store record")?;
        self.storage.put_record(key, &bytes).await?;
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    /// Apply a write received from another replica. Returns whether it won.
    pub async fn merge(&self, key: &str, record: StoreRecord) -> Result<bool> {
        let existing = self.record(key).await?;
        if !record.supersedes(existing.as_ref()) {
            return Ok(false);
        }
        self.write(key, &record).await?;
        Ok(true)
    }
}

#[async_trait]
impl<S: Storage> DescriptorStore for PersistentStore<S> {
    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for (key, bytes) in self.storage.list_records(namespace).await? {
            match serde_json::from_slice::<StoreRecord>(&bytes) {
                Ok(StoreRecord { value: Some(value), .. }) => out.push((key, value)),
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring unreadable store record {}: {}", key, e),
            }
        }
        Ok(out)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.record(key).await?.and_then(|r| r.value))
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        let existing = self.record(key).await?;
        let record = StoreRecord::after(existing.as_ref(), &self.writer, value);
        self.write(key, &record).await
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage::LocalStorage;
    use tempfile::TempDir;

    fn record(value: Option<Value>, millis: u64, writer: &str) -> StoreRecord {
        StoreRecord {
            value,
            stamp: Stamp { millis, writer: writer.to_string() },
        }
    }

    #[tokio::test]
    async fn test_set_get_and_namespace_filter() -> Result<()> {
        let store = MemoryStore::new("alice");
        let mut changes = store.subscribe();

        store.set("sharedFiles/a", Some(json!({"n": 1}))).await?;
        store.set("profiles/alice", Some(json!("Ada"))).await?;

        assert_eq!(changes.recv().await?, "sharedFiles/a");
        assert_eq!(changes.recv().await?, "profiles/alice");
        assert_eq!(store.entries("sharedFiles/").await?.len(), 1);
        assert_eq!(store.get("sharedFiles/a").await?, Some(json!({"n": 1})));

        store.set("sharedFiles/a", None).await?;
        assert!(store.entries("sharedFiles/").await?.is_empty());
        assert_eq!(store.get("sharedFiles/a").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryStore::new("bob");

        assert!(store.merge("k", record(Some(json!(1)), 100, "alice")));
        assert!(!store.merge("k", record(Some(json!(0)), 99, "carol")));
        // Same millisecond: writer id breaks the tie
        assert!(store.merge("k", record(Some(json!(2)), 100, "bob")));
        assert!(store.merge("k", record(None, 101, "alice")));
        assert!(!store.merge("k", record(Some(json!(3)), 100, "zed")));

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_write_supersedes_future_stamp() -> Result<()> {
        let store = MemoryStore::new("alice");
        let far_future = unix_millis() + 60_000;
        store.merge("k", record(Some(json!("remote")), far_future, "zed"));

        store.set("k", Some(json!("local"))).await?;
        assert_eq!(store.get("k").await?, Some(json!("local")));
        Ok(())
    }

    #[tokio::test]
    async fn test_replicas_converge() -> Result<()> {
        let alice = MemoryStore::new("alice");
        let bob = MemoryStore::new("bob");

        alice.set("sharedFiles/a", Some(json!("a"))).await?;
        bob.set("sharedFiles/b", Some(json!("b"))).await?;
        alice.set("sharedFiles/a", None).await?;

        bob.sync_from(&alice);
        alice.sync_from(&bob);

        let mut a = alice.entries("sharedFiles/").await?;
        let mut b = bob.entries("sharedFiles/").await?;
        a.sort_by(|x, y| x.0.cmp(&y.0));
        b.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(a, b);
        assert_eq!(a, vec![("sharedFiles/b".to_string(), json!("b"))]);
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_store_is_shared_through_disk() -> Result<()> {
        let temp = TempDir::new()?;
        let alice = PersistentStore::new("alice", LocalStorage::new(temp.path().to_path_buf())?);
        let bob = PersistentStore::new("bob", LocalStorage::new(temp.path().to_path_buf())?);

        alice.set("sharedFiles/a", Some(json!({"uuid": "a"}))).await?;
        assert_eq!(bob.entries("sharedFiles/").await?.len(), 1);

        // Stale replica write loses
        assert!(!bob.merge("sharedFiles/a", record(None, 1, "bob")).await?);
        assert_eq!(bob.get("sharedFiles/a").await?, Some(json!({"uuid": "a"})));

        alice.set("sharedFiles/a", None).await?;
        assert!(bob.entries("sharedFiles/").await?.is_empty());

        // Garbage written by someone else is skipped, not fatal
        LocalStorage::new(temp.path().to_path_buf())?
            .put_record("sharedFiles/junk", b"not json")
            .await?;
        assert!(bob.entries("sharedFiles/").await?.is_empty());
        Ok(())
    }
}
