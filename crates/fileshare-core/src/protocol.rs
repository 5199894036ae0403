//! Wire protocol for pulling one file over a peer channel.
//!
//! Every message is a u32 big-endian length prefix followed by a bincode
//! encoded [`Message`]. The exchange is strictly ordered: one request, one
//! response, then raw chunks until the declared total has been delivered.

use crate::error::{TransferError, TransferResult};
use peer_transport::DynStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sanity limit to prevent memory exhaustion from a hostile length prefix
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `action: requestFile`
    RequestFile { file_id: String },
    /// Either an error for the requester or the total size about to follow
    Response {
        error: Option<String>,
        total_bytes: u64,
    },
    Chunk(Vec<u8>),
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Message::RequestFile { .. } => "request",
            Message::Response { .. } => "response",
            Message::Chunk(_) => "chunk",
        }
    }
}

/// Minimal length-prefixed frame helpers (u32 BE length).
async fn write_lp<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8]
) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

/// Reads one frame; `None` when the peer closed cleanly between frames.
async fn read_lp<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
    max_len: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut lenb = [0u8; 4];
    let first = transport.read(&mut lenb).await?;
    if first == 0 {
        return Ok(None);
    }
    transport.read_exact(&mut lenb[first..]).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "message too large"
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// A peer channel speaking [`Message`] frames.
pub struct FramedChannel {
    stream: DynStream,
    peer: String,
    max_frame_len: usize,
    idle_timeout: Option<Duration>,
}

impl FramedChannel {
    pub fn new(stream: DynStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            max_frame_len: MAX_FRAME_LEN,
            idle_timeout: None,
        }
    }

    pub fn with_limits(mut self, max_frame_len: usize, idle_timeout: Option<Duration>) -> Self {
        self.max_frame_len = max_frame_len;
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, message: &Message) -> TransferResult<()> {
        let bytes = bincode::serialize(message)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        write_lp(&mut self.stream, &bytes).await?;
        Ok(())
    }

    /// Next message, or `None` once the peer has closed its side.
    pub async fn recv(&mut self) -> TransferResult<Option<Message>> {
        let read = read_lp(&mut self.stream, self.max_frame_len);
        let frame = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| TransferError::Timeout(limit))??,
            None => read.await?,
        };

        match frame {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| TransferError::Protocol(e.to_string())),
            None => Ok(None),
        }
    }

    /// Like [`recv`](Self::recv) but a closed channel is an error.
    pub async fn next_message(&mut self) -> TransferResult<Message> {
        self.recv().await?.ok_or(TransferError::ChannelClosed)
    }

    /// Discard anything the peer still sends until it closes the channel.
    pub async fn wait_closed(&mut self) -> TransferResult<()> {
        loop {
            match self.recv().await {
                Ok(Some(message)) => {
                    tracing::debug!("Ignoring trailing {} from {}", message.kind(), self.peer);
                }
                Ok(None) | Err(TransferError::ChannelClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut down our side. Consumes the channel so it happens once.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Closing channel to {}: {}", self.peer, e);
        }
    }
}

pub(crate) fn unexpected(message: &Message, wanted: &str) -> TransferError {
    TransferError::Protocol(format!("expected {}, got {}", wanted, message.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (FramedChannel, FramedChannel) {
        let (a, b) = duplex(4096);
        (FramedChannel::new(Box::pin(a), "b"), FramedChannel::new(Box::pin(b), "a"))
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut a, mut b) = pair();

        a.send(&Message::RequestFile { file_id: "f1".into() }).await.unwrap();
        a.send(&Message::Response { error: None, total_bytes: 3 }).await.unwrap();
        a.send(&Message::Chunk(vec![1, 2, 3])).await.unwrap();
        a.close().await;

        assert_eq!(b.next_message().await.unwrap(), Message::RequestFile { file_id: "f1".into() });
        assert_eq!(b.next_message().await.unwrap(), Message::Response { error: None, total_bytes: 3 });
        assert_eq!(b.next_message().await.unwrap(), Message::Chunk(vec![1, 2, 3]));
        assert_eq!(b.recv().await.unwrap(), None);
        assert_eq!(b.next_message().await, Err(TransferError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, b) = duplex(4096);
        let mut raw: DynStream = Box::pin(a);
        let mut channel = FramedChannel::new(Box::pin(b), "a").with_limits(16, None);

        raw.write_all(&1000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(channel.recv().await, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_channel_closed() {
        let (a, b) = duplex(4096);
        let mut raw: DynStream = Box::pin(a);
        let mut channel = FramedChannel::new(Box::pin(b), "a");

        raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0u8; 10]).await.unwrap();
        drop(raw);

        assert_eq!(channel.recv().await, Err(TransferError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_a, b) = duplex(4096);
        let limit = Duration::from_millis(50);
        let mut channel = FramedChannel::new(Box::pin(b), "a").with_limits(MAX_FRAME_LEN, Some(limit));

        assert_eq!(channel.recv().await, Err(TransferError::Timeout(limit)));
    }
}
