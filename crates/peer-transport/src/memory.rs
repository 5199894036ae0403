//! In-process transport. Every participant joins a shared [`MemoryNetwork`];
//! channels are `tokio::io::duplex` pipes and reachability is an explicit
//! link table that can be toggled to simulate peers dropping out.

use crate::{DynStream, IncomingChannel, IncomingHandler, PeerTransport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkInner {
    handlers: Mutex<HashMap<(String, String), IncomingHandler>>,
    links: Mutex<HashSet<(String, String)>>,
    disconnects: Mutex<HashMap<String, broadcast::Sender<String>>>,
    opened: AtomicUsize,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl NetworkInner {
    fn linked(&self, a: &str, b: &str) -> bool {
        self.links
            .lock()
            .map(|links| links.contains(&link_key(a, b)))
            .unwrap_or(false)
    }

    fn notify_disconnect(&self, participant: &str, lost_peer: &str) {
        if let Ok(senders) = self.disconnects.lock() {
            if let Some(tx) = senders.get(participant) {
                let _ = tx.send(lost_peer.to_string());
            }
        }
    }
}

/// Shared hub for a set of in-process participants.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant to the network and return its transport.
    pub fn join(&self, participant_id: &str) -> MemoryTransport {
        let (tx, _) = broadcast::channel(64);
        if let Ok(mut senders) = self.inner.disconnects.lock() {
            senders.entry(participant_id.to_string()).or_insert(tx);
        }
        MemoryTransport {
            id: participant_id.to_string(),
            network: self.inner.clone(),
        }
    }

    /// Make `a` and `b` reachable from each other.
    pub fn connect(&self, a: &str, b: &str) {
        if let Ok(mut links) = self.inner.links.lock() {
            links.insert(link_key(a, b));
        }
    }

    /// Break the link between `a` and `b` and notify both sides.
    pub fn disconnect(&self, a: &str, b: &str) {
        let removed = self
            .inner
            .links
            .lock()
            .map(|mut links| links.remove(&link_key(a, b)))
            .unwrap_or(false);

        if removed {
            tracing::debug!("Link {} <-> {} dropped", a, b);
            self.inner.notify_disconnect(a, b);
            self.inner.notify_disconnect(b, a);
        }
    }

    /// Number of channels opened on this network so far.
    pub fn channels_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }
}

/// One participant's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    id: String,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn open_channel(&self, peer_id: &str, tag: &str) -> anyhow::Result<DynStream> {
        if !self.network.linked(&self.id, peer_id) {
            anyhow::bail!("Peer {} is not connected", peer_id);
        }

        let handler = self
            .network
            .handlers
            .lock()
            .map_err(|_| anyhow::anyhow!("handler table poisoned"))?
            .get(&(peer_id.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Peer {} does not accept '{}' channels", peer_id, tag))?;

        let (ours, theirs) = tokio::io::duplex(DEFAULT_PIPE_CAPACITY);
        self.network.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Opened '{}' channel {} -> {}", tag, self.id, peer_id);

        handler(IncomingChannel {
            from: self.id.clone(),
            tag: tag.to_string(),
            stream: Box::pin(theirs),
        });

        Ok(Box::pin(ours))
    }

    fn on_incoming(&self, tag: &str, handler: IncomingHandler) {
        if let Ok(mut handlers) = self.network.handlers.lock() {
            handlers.insert((self.id.clone(), tag.to_string()), handler);
        }
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.network.linked(&self.id, peer_id)
    }

    fn disconnects(&self) -> broadcast::Receiver<String> {
        match self.network.disconnects.lock() {
            Ok(mut senders) => senders
                .entry(self.id.clone())
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe(),
            // Poisoned table: hand out a receiver that never fires.
            Err(_) => broadcast::channel(1).1,
        }
    }
}
