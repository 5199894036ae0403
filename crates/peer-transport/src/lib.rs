//! Peer transport layer.
//!
//! A channel between two participants is a plain ordered byte stream; message
//! framing is left to the caller. Two transports are provided: an in-process
//! [`MemoryNetwork`] built on `tokio::io::duplex`, and [`TcpTransport`] which
//! prefixes every connection with a short preamble naming the protocol tag.

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Any bidirectional byte stream usable as a channel.
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> StreamTrait for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type DynStream = Pin<Box<dyn StreamTrait>>;

/// A channel opened by a remote participant.
pub struct IncomingChannel {
    /// Participant that opened the channel.
    pub from: String,
    /// Protocol tag the channel was opened with.
    pub tag: String,
    pub stream: DynStream,
}

/// Called once per inbound channel. Handlers must not block; spawn instead.
pub type IncomingHandler = Arc<dyn Fn(IncomingChannel) + Send + Sync>;

/// Point-to-point channels between participants of one session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Identifier of the participant owning this transport.
    fn local_id(&self) -> &str;

    /// Open a new channel to `peer_id`, tagged so the remote side can route it.
    async fn open_channel(&self, peer_id: &str, tag: &str) -> anyhow::Result<DynStream>;

    /// Register the handler for inbound channels carrying `tag`. Replaces any
    /// previous handler for the same tag.
    fn on_incoming(&self, tag: &str, handler: IncomingHandler);

    /// Whether a channel to `peer_id` can currently be opened.
    fn is_connected(&self, peer_id: &str) -> bool;

    /// Receives the id of every peer that becomes unreachable.
    fn disconnects(&self) -> broadcast::Receiver<String>;
}
