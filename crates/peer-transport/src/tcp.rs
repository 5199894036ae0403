//! TCP transport.
//!
//! Reachability is an address book filled in by whatever discovery the
//! application runs; a peer counts as connected while it is in the book.
//! Each connection starts with a preamble of two u16-BE length-prefixed
//! strings: the protocol tag, then the initiating participant's id.

use crate::{DynStream, IncomingChannel, IncomingHandler, PeerTransport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Upper bound for a single preamble field.
const MAX_PREAMBLE_FIELD: usize = 1024;

/// How long an inbound connection may take to send its preamble.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

struct TcpInner {
    local_id: String,
    peers: RwLock<HashMap<String, SocketAddr>>,
    handlers: RwLock<HashMap<String, IncomingHandler>>,
    disconnects: broadcast::Sender<String>,
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    pub fn new(local_id: impl Into<String>) -> Self {
        let (disconnects, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TcpInner {
                local_id: local_id.into(),
                peers: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                disconnects,
            }),
        }
    }

    /// Record (or update) the address a participant can be reached at.
    pub fn add_peer(&self, participant_id: &str, addr: SocketAddr) {
        if participant_id == self.inner.local_id {
            return;
        }
        if let Ok(mut peers) = self.inner.peers.write() {
            peers.insert(participant_id.to_string(), addr);
        }
    }

    /// Forget a participant. Returns false if it was not known.
    pub fn remove_peer(&self, participant_id: &str) -> bool {
        let removed = self
            .inner
            .peers
            .write()
            .map(|mut peers| peers.remove(participant_id).is_some())
            .unwrap_or(false);

        if removed {
            let _ = self.inner.disconnects.send(participant_id.to_string());
        }
        removed
    }

    pub fn peers(&self) -> Vec<(String, SocketAddr)> {
        self.inner
            .peers
            .read()
            .map(|peers| peers.iter().map(|(id, addr)| (id.clone(), *addr)).collect())
            .unwrap_or_default()
    }

    /// Bind `addr` and dispatch inbound connections to the registered
    /// handlers in a background task. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local = listener.local_addr()?;
        tracing::info!("Listening for peer channels on {}", local);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        continue;
                    }
                };

                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatch(&inner, stream).await {
                        tracing::warn!("Dropping connection from {}: {}", remote, e);
                    }
                });
            }
        });

        Ok(local)
    }
}

async fn dispatch(inner: &TcpInner, stream: TcpStream) -> Result<()> {
    dispatch_within(inner, stream, PREAMBLE_TIMEOUT).await
}

async fn dispatch_within(inner: &TcpInner, mut stream: TcpStream, limit: Duration) -> Result<()> {
    let (tag, from) = tokio::time::timeout(limit, read_preamble(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("no preamble within {:?}", limit))??;

    let handler = inner
        .handlers
        .read()
        .map_err(|_| anyhow::anyhow!("handler table poisoned"))?
        .get(&tag)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no handler for '{}'", tag))?;

    tracing::debug!("Incoming '{}' channel from {}", tag, from);
    handler(IncomingChannel {
        from,
        tag,
        stream: Box::pin(stream),
    });
    Ok(())
}

async fn read_preamble(stream: &mut TcpStream) -> Result<(String, String)> {
    let tag = read_field(stream).await.context("reading protocol tag")?;
    let from = read_field(stream).await.context("reading participant id")?;
    Ok((tag, from))
}

async fn write_field<T: AsyncWrite + Unpin>(transport: &mut T, value: &str) -> std::io::Result<()> {
    if value.len() > MAX_PREAMBLE_FIELD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "preamble field too long",
        ));
    }
    transport.write_all(&(value.len() as u16).to_be_bytes()).await?;
    transport.write_all(value.as_bytes()).await
}

async fn read_field<T: AsyncRead + Unpin>(transport: &mut T) -> std::io::Result<String> {
    let mut lenb = [0u8; 2];
    transport.read_exact(&mut lenb).await?;
    let len = u16::from_be_bytes(lenb) as usize;

    if len > MAX_PREAMBLE_FIELD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "preamble field too long",
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "preamble is not utf-8"))
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    async fn open_channel(&self, peer_id: &str, tag: &str) -> Result<DynStream> {
        let addr = self
            .inner
            .peers
            .read()
            .map_err(|_| anyhow::anyhow!("peer table poisoned"))?
            .get(peer_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Peer {} is not connected", peer_id))?;

        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {} at {}", peer_id, addr))?;
        stream.set_nodelay(true)?;

        write_field(&mut stream, tag).await?;
        write_field(&mut stream, &self.inner.local_id).await?;
        stream.flush().await?;

        tracing::debug!("Opened '{}' channel to {} at {}", tag, peer_id, addr);
        Ok(Box::pin(stream))
    }

    fn on_incoming(&self, tag: &str, handler: IncomingHandler) {
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(tag.to_string(), handler);
        }
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.inner
            .peers
            .read()
            .map(|peers| peers.contains_key(peer_id))
            .unwrap_or(false)
    }

    fn disconnects(&self) -> broadcast::Receiver<String> {
        self.inner.disconnects.subscribe()
    }
}
