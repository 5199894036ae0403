//! One file exchange over one peer channel.
//!
//! A [`Transfer`] is either the receiving side (sends a request, reads the
//! declared size, then collects chunks) or the sending side (answers a
//! request from the local share set, streams the payload in chunks, then
//! waits for the requester to hang up). Each transfer may be started once;
//! its terminal outcome is published on a watch channel so any number of
//! callers can await the same result.

use crate::descriptor::{FileArtifact, FileDescriptor, SharedFile};
use crate::error::{TransferError, TransferResult};
use crate::lock;
use crate::protocol::{unexpected, FramedChannel, Message};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

/// Never preallocate more than this for a peer-declared size.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Progress observer: `(bytes so far, total bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Resolves a requested file id against what we are sharing.
pub trait ShareLookup: Send + Sync {
    fn find_share(&self, file_id: &str) -> Option<SharedFile>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Idle,
    /// Sender waiting for the requester to name a file
    AwaitingRequest,
    /// Requester waiting for the size declaration
    AwaitingTotalSize,
    Streaming,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Received(FileArtifact),
    Sent { file_id: String, bytes: u64 },
}

/// Point-in-time view of a transfer for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub file_id: Option<String>,
    pub direction: Direction,
    pub state: TransferState,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
}

type Outcome = Option<TransferResult<Completion>>;

pub struct Transfer {
    id: Uuid,
    direction: Direction,
    /// Known up front when receiving, learned from the request when sending
    file_id: Mutex<Option<String>>,
    state: Mutex<TransferState>,
    transferred: AtomicU64,
    total: AtomicU64,
    observers: Mutex<Vec<ProgressFn>>,
    outcome: watch::Sender<Outcome>,
}

impl Transfer {
    fn new(direction: Direction, file_id: Option<String>) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            id: Uuid::new_v4(),
            direction,
            file_id: Mutex::new(file_id),
            state: Mutex::new(TransferState::Idle),
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            outcome,
        })
    }

    pub fn receiving(file_id: impl Into<String>) -> Arc<Self> {
        Self::new(Direction::Receiving, Some(file_id.into()))
    }

    pub fn sending() -> Arc<Self> {
        Self::new(Direction::Sending, None)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn file_id(&self) -> Option<String> {
        lock(&self.file_id).clone()
    }

    pub fn state(&self) -> TransferState {
        *lock(&self.state)
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<TransferError> {
        match &*self.outcome.borrow() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TransferState::Failed
    }

    /// Attach a progress observer. Once the size is known it is first told
    /// the progress made so far.
    pub fn add_progress_observer(&self, observer: ProgressFn) {
        let mut observers = lock(&self.observers);
        if matches!(self.state(), TransferState::Streaming | TransferState::Complete) {
            observer(self.transferred_bytes(), self.total_bytes());
        }
        observers.push(observer);
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.to_string(),
            file_id: self.file_id(),
            direction: self.direction,
            state: self.state(),
            transferred_bytes: self.transferred_bytes(),
            total_bytes: self.total_bytes(),
            error: self.error().map(|e| e.to_string()),
        }
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> TransferResult<Completion> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| TransferError::ChannelClosed)?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(TransferError::ChannelClosed),
        }
    }

    /// Wait for a receiving transfer's file.
    pub async fn artifact(&self) -> TransferResult<FileArtifact> {
        match self.wait().await? {
            Completion::Received(artifact) => Ok(artifact),
            Completion::Sent { .. } => Err(TransferError::Protocol(
                "sending transfer has no artifact".to_string(),
            )),
        }
    }

    /// The single `Idle -> running` transition.
    fn begin(&self, next: TransferState) -> TransferResult<()> {
        let mut state = lock(&self.state);
        if *state != TransferState::Idle {
            return Err(TransferError::AlreadyStarted);
        }
        *state = next;
        Ok(())
    }

    fn set_state(&self, next: TransferState) {
        *lock(&self.state) = next;
    }

    /// Observers are called under the observer lock so a late observer's
    /// catch-up call can never arrive after a newer report.
    fn report(&self, transferred: u64, total: u64) {
        let observers = lock(&self.observers);
        self.transferred.store(transferred, Ordering::SeqCst);
        for observer in observers.iter() {
            observer(transferred, total);
        }
    }

    fn finish(&self, result: &TransferResult<Completion>) {
        let verb = match self.direction {
            Direction::Sending => "send",
            Direction::Receiving => "receive",
        };
        let file_id = self.file_id().unwrap_or_default();

        match result {
            Ok(_) => {
                self.set_state(TransferState::Complete);
                tracing::info!("Transfer {} complete: {} {} bytes of {}", self.id, verb, self.total_bytes(), file_id);
            }
            Err(e) => {
                self.set_state(TransferState::Failed);
                tracing::error!("Transfer {} failed to {} file {}: {}", self.id, verb, file_id, e);
            }
        }
        self.outcome.send_replace(Some(result.clone()));
    }

    /// Fail a transfer that never got a channel. No-op once started.
    pub fn abort(&self, error: TransferError) {
        if self.begin(TransferState::Failed).is_ok() {
            self.finish(&Err(error));
        }
    }

    /// Run the requesting side to completion. The channel is closed exactly
    /// once whatever the outcome.
    pub async fn run_receive(
        &self,
        mut channel: FramedChannel,
        descriptor: &FileDescriptor,
    ) -> TransferResult<Completion> {
        self.begin(TransferState::AwaitingTotalSize)?;
        tracing::debug!("Opening connection to {} to receive file {}...", channel.peer(), descriptor.id);

        let result = self.receive_inner(&mut channel, descriptor).await;
        channel.close().await;
        self.finish(&result);
        result
    }

    async fn receive_inner(
        &self,
        channel: &mut FramedChannel,
        descriptor: &FileDescriptor,
    ) -> TransferResult<Completion> {
        channel
            .send(&Message::RequestFile { file_id: descriptor.id.clone() })
            .await?;

        let total = match channel.next_message().await? {
            Message::Response { error: Some(error), .. } => {
                return Err(TransferError::RemoteRefusal(error))
            }
            Message::Response { total_bytes, .. } => total_bytes,
            other => return Err(unexpected(&other, "response")),
        };
        self.total.store(total, Ordering::SeqCst);
        self.set_state(TransferState::Streaming);

        let mut data = Vec::with_capacity(total.min(MAX_PREALLOCATION) as usize);
        let mut received = 0u64;

        if total == 0 {
            self.report(0, 0);
        }

        while received < total {
            match channel.next_message().await? {
                Message::Chunk(bytes) => {
                    let next = received + bytes.len() as u64;
                    if next > total {
                        return Err(TransferError::Protocol(format!(
                            "peer sent {} bytes, declared {}",
                            next, total
                        )));
                    }
                    data.extend_from_slice(&bytes);
                    received = next;
                    self.report(received, total);
                }
                other => return Err(unexpected(&other, "chunk")),
            }
        }

        tracing::debug!("File {} received successfully ({} bytes)", descriptor.id, received);
        Ok(Completion::Received(FileArtifact::new(
            descriptor.name.clone(),
            descriptor.mime_type.clone(),
            data,
        )))
    }

    /// Run the answering side to completion. The channel is closed exactly
    /// once whatever the outcome.
    pub async fn run_send(
        &self,
        mut channel: FramedChannel,
        shares: &dyn ShareLookup,
        chunk_size: usize,
    ) -> TransferResult<Completion> {
        self.begin(TransferState::AwaitingRequest)?;
        tracing::debug!("Opening connection to {} to send a file...", channel.peer());

        let result = self.send_inner(&mut channel, shares, chunk_size.max(1)).await;
        channel.close().await;
        self.finish(&result);
        result
    }

    async fn send_inner(
        &self,
        channel: &mut FramedChannel,
        shares: &dyn ShareLookup,
        chunk_size: usize,
    ) -> TransferResult<Completion> {
        let file_id = match channel.next_message().await? {
            Message::RequestFile { file_id } => file_id,
            other => return Err(unexpected(&other, "request")),
        };
        *lock(&self.file_id) = Some(file_id.clone());

        let Some(file) = shares.find_share(&file_id) else {
            // The one error the requester is told about before we hang up
            channel
                .send(&Message::Response {
                    error: Some("File not found.".to_string()),
                    total_bytes: 0,
                })
                .await?;
            return Err(TransferError::NotFound(file_id));
        };

        let payload = file.data;
        let total = payload.len() as u64;
        self.total.store(total, Ordering::SeqCst);
        channel
            .send(&Message::Response { error: None, total_bytes: total })
            .await?;
        self.set_state(TransferState::Streaming);

        let mut sent = 0u64;
        for chunk in payload.chunks(chunk_size) {
            channel.send(&Message::Chunk(chunk.to_vec())).await?;
            sent += chunk.len() as u64;
            self.report(sent, total);
        }
        if total == 0 {
            self.report(0, 0);
        }

        // Wait for the requester to close the channel
        match channel.wait_closed().await {
            Ok(()) => {}
            Err(TransferError::Timeout(limit)) => {
                tracing::warn!("{} did not close the channel within {:?} after receiving {}", channel.peer(), limit, file_id);
            }
            Err(e) => return Err(e),
        }

        Ok(Completion::Sent { file_id, bytes: sent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    struct Shares(Vec<SharedFile>);

    impl ShareLookup for Shares {
        fn find_share(&self, file_id: &str) -> Option<SharedFile> {
            self.0.iter().find(|f| f.id.as_deref() == Some(file_id)).cloned()
        }
    }

    fn shared(id: &str, data: Vec<u8>) -> SharedFile {
        let mut file = SharedFile::new("payload.bin", "application/octet-stream", data);
        file.id = Some(id.to_string());
        file
    }

    fn descriptor(id: &str, size: u64) -> FileDescriptor {
        FileDescriptor {
            id: id.to_string(),
            name: "payload.bin".to_string(),
            size,
            mime_type: "application/octet-stream".to_string(),
            date: 1,
            owner: "sender".to_string(),
            owner_name: "Sender".to_string(),
        }
    }

    fn channels() -> (FramedChannel, FramedChannel) {
        let (a, b) = duplex(64 * 1024);
        (
            FramedChannel::new(Box::pin(a), "sender"),
            FramedChannel::new(Box::pin(b), "receiver"),
        )
    }

    async fn exchange(
        shares: Shares,
        wanted: &FileDescriptor,
    ) -> (TransferResult<Completion>, TransferResult<Completion>, Arc<Transfer>, Arc<Transfer>) {
        let (to_sender, to_receiver) = channels();
        let receiver = Transfer::receiving(wanted.id.clone());
        let sender = Transfer::sending();

        let send_task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run_send(to_receiver, &shares, 1024).await })
        };
        let received = receiver.run_receive(to_sender, wanted).await;
        let sent = send_task.await.expect("sender task panicked");
        (received, sent, receiver, sender)
    }

    #[tokio::test]
    async fn test_chunked_roundtrip_sizes() {
        for size in [0usize, 1, 1023, 1024, 1025, 10_000_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let shares = Shares(vec![shared("f1", payload.clone())]);

            let (received, sent, receiver, sender) =
                exchange(shares, &descriptor("f1", size as u64)).await;

            let artifact = match received.expect("receive ok") {
                Completion::Received(artifact) => artifact,
                other => panic!("unexpected completion {:?}", other),
            };
            assert_eq!(*artifact.data, payload, "size {}", size);
            assert_eq!(artifact.name, "payload.bin");
            assert_eq!(
                sent.expect("send ok"),
                Completion::Sent { file_id: "f1".to_string(), bytes: size as u64 }
            );
            assert_eq!(receiver.state(), TransferState::Complete);
            assert_eq!(sender.state(), TransferState::Complete);
            assert_eq!(sender.file_id().as_deref(), Some("f1"));
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_total() {
        let size = 5000usize;
        let shares = Shares(vec![shared("f1", vec![7u8; size])]);
        let (to_sender, to_receiver) = channels();

        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let receiver = Transfer::receiving("f1");
        let sink = seen.clone();
        receiver.add_progress_observer(Arc::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        }));

        let sender = Transfer::sending();
        let send_task = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.run_send(to_receiver, &shares, 1024).await })
        };
        receiver.run_receive(to_sender, &descriptor("f1", size as u64)).await.unwrap();
        send_task.await.unwrap().unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(seen.iter().all(|(done, total)| done <= total && *total == size as u64));
        assert_eq!(seen.last(), Some(&(size as u64, size as u64)));
        assert_eq!(receiver.transferred_bytes(), size as u64);
    }

    #[tokio::test]
    async fn test_late_observer_is_told_the_progress_so_far() {
        let shares = Shares(vec![shared("f1", vec![9u8; 3000])]);
        let (_, _, receiver, _) = exchange(shares, &descriptor("f1", 3000)).await;

        let idle = Transfer::receiving("f2");
        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let (late, never) = (seen.clone(), seen.clone());
        receiver.add_progress_observer(Arc::new(move |done, total| {
            late.lock().unwrap().push((done, total));
        }));
        idle.add_progress_observer(Arc::new(move |done, total| {
            never.lock().unwrap().push((done, total));
        }));

        // Only the finished transfer knows its size
        assert_eq!(*seen.lock().unwrap(), vec![(3000, 3000)]);
    }

    #[tokio::test]
    async fn test_missing_file_is_refused_remotely() {
        let (received, sent, receiver, sender) =
            exchange(Shares(vec![]), &descriptor("ghost", 10)).await;

        assert_eq!(received, Err(TransferError::RemoteRefusal("File not found.".to_string())));
        assert_eq!(sent, Err(TransferError::NotFound("ghost".to_string())));
        assert_eq!(receiver.state(), TransferState::Failed);
        assert_eq!(sender.state(), TransferState::Failed);
        assert_eq!(receiver.artifact().await, Err(TransferError::RemoteRefusal("File not found.".to_string())));
    }

    #[tokio::test]
    async fn test_mid_stream_close_is_an_error() {
        let (mut fake_sender, to_sender) = channels();
        let receiver = Transfer::receiving("f1");

        let fake = tokio::spawn(async move {
            assert_eq!(
                fake_sender.next_message().await.unwrap(),
                Message::RequestFile { file_id: "f1".to_string() }
            );
            fake_sender.send(&Message::Response { error: None, total_bytes: 4096 }).await.unwrap();
            fake_sender.send(&Message::Chunk(vec![0u8; 1024])).await.unwrap();
            fake_sender.close().await;
        });

        let result = receiver.run_receive(to_sender, &descriptor("f1", 4096)).await;
        fake.await.unwrap();

        assert_eq!(result, Err(TransferError::ChannelClosed));
        assert_eq!(receiver.transferred_bytes(), 1024);
        assert_eq!(receiver.error(), Some(TransferError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_oversend_is_a_protocol_error() {
        let (mut fake_sender, to_sender) = channels();
        let receiver = Transfer::receiving("f1");

        let fake = tokio::spawn(async move {
            fake_sender.next_message().await.unwrap();
            fake_sender.send(&Message::Response { error: None, total_bytes: 10 }).await.unwrap();
            fake_sender.send(&Message::Chunk(vec![0u8; 20])).await.unwrap();
            fake_sender.wait_closed().await.unwrap();
        });

        let result = receiver.run_receive(to_sender, &descriptor("f1", 10)).await;
        fake.await.unwrap();
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_request_without_file_id_closes_sender() {
        let (requester, to_receiver) = channels();
        let sender = Transfer::sending();

        requester.close().await;
        let result = sender.run_send(to_receiver, &Shares(vec![]), 1024).await;

        assert_eq!(result, Err(TransferError::ChannelClosed));
        assert_eq!(sender.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let shares = Shares(vec![shared("f1", vec![1, 2, 3])]);
        let (_, _, receiver, sender) = exchange(shares, &descriptor("f1", 3)).await;

        let (a, b) = channels();
        assert_eq!(
            receiver.run_receive(a, &descriptor("f1", 3)).await,
            Err(TransferError::AlreadyStarted)
        );
        assert_eq!(
            sender.run_send(b, &Shares(vec![]), 1024).await,
            Err(TransferError::AlreadyStarted)
        );
        // The stored outcome is untouched
        assert_eq!(receiver.artifact().await.unwrap().size(), 3);
    }

    #[tokio::test]
    async fn test_every_waiter_sees_the_same_outcome() {
        let receiver = Transfer::receiving("f1");

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move { receiver.artifact().await })
            })
            .collect();

        receiver.abort(TransferError::Transport("unreachable".to_string()));
        receiver.abort(TransferError::ChannelClosed);

        for waiter in waiters {
            assert_eq!(
                waiter.await.unwrap(),
                Err(TransferError::Transport("unreachable".to_string()))
            );
        }
        assert!(receiver.is_failed());
    }

    #[tokio::test]
    async fn test_silent_sender_times_out() {
        let (_silent, b) = duplex(1024);
        let limit = Duration::from_millis(50);
        let channel = FramedChannel::new(Box::pin(b), "sender")
            .with_limits(crate::protocol::MAX_FRAME_LEN, Some(limit));

        let receiver = Transfer::receiving("f1");
        let result = receiver.run_receive(channel, &descriptor("f1", 1)).await;
        assert_eq!(result, Err(TransferError::Timeout(limit)));
        assert_eq!(receiver.snapshot().state, TransferState::Failed);
    }
}
