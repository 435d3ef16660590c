//! Framed, sequenced, bidirectional message channel over any byte stream.
//!
//! Frames are a 4-byte big-endian length followed by an encoded
//! [`IpcMessage`]. A reader task and a writer task own the two halves of the
//! stream; callers talk to them through bounded queues, so a peer that stops
//! draining eventually suspends [`IpcSender::send`].
//!
//! - Malformed payloads are dropped and counted; the reader keeps going.
//! - A length prefix above `max_frame_len` desynchronizes the stream and
//!   closes the channel.
//! - Stale sequence numbers are rejected and counted.

use crate::config::IpcConfig;
use crate::error::ipc::IpcError;
use crate::ipc::message::{IpcMessage, Payload};
use crate::ipc::sequence::{SequenceCheck, SequenceTracker};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use prost::Message as ProstMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::spawn as TokioSpawn;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const LENGTH_FIELD_BYTES: usize = 4;

/// Counters shared by both halves of a channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_malformed: AtomicU64,
    frames_out_of_order: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_out_of_order: u64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_out_of_order: self.frames_out_of_order.load(Ordering::Relaxed),
        }
    }
}

pub struct IpcChannel;

impl IpcChannel {
    /// Split a duplex stream and start the reader and writer tasks.
    pub fn new<T>(io: T, config: &IpcConfig) -> (IpcSender, IpcReceiver)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(reader, writer, config)
    }

    /// Start a channel over separate read and write streams (child stdout/stdin).
    pub fn from_parts<R, W>(reader: R, writer: W, config: &IpcConfig) -> (IpcSender, IpcReceiver)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || {
            LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .max_frame_length(config.max_frame_len)
                .new_codec()
        };

        let capacity = config.buffer_capacity.max(1);
        let stats = Arc::new(ChannelStats::default());
        let link = CancellationToken::new();
        let closing = CancellationToken::new();

        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        let writer_task = TokioSpawn(write_loop(
            FramedWrite::new(writer, codec()),
            outbound_rx,
            closing.clone(),
            link.clone(),
            Arc::clone(&stats),
        ));

        TokioSpawn(read_loop(
            FramedRead::new(reader, codec()),
            inbound_tx,
            link.clone(),
            Arc::clone(&stats),
        ));

        let sender = IpcSender {
            inner: Arc::new(SenderInner {
                outbound: outbound_tx,
                next_seq: Mutex::new(1),
                link: link.clone(),
                closing,
                writer_task: Mutex::new(Some(writer_task)),
                stats: Arc::clone(&stats),
            }),
        };

        let receiver = IpcReceiver {
            inbound: inbound_rx,
            link,
            stats,
        };

        (sender, receiver)
    }
}

struct SenderInner {
    outbound: mpsc::Sender<IpcMessage>,
    /// Held across the queue push so sequence order equals queue order.
    next_seq: Mutex<u64>,
    link: CancellationToken,
    closing: CancellationToken,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ChannelStats>,
}

/// Sending half. Clones share one sequence counter.
#[derive(Clone)]
pub struct IpcSender {
    inner: Arc<SenderInner>,
}

impl IpcSender {
    /// Queue a frame, suspending while the outbound buffer is full.
    ///
    /// Returns the sequence number assigned to the frame.
    ///
    /// # Errors
    ///
    /// [`IpcError::ChannelClosed`] once the peer disconnected or the channel
    /// was closed locally.
    pub async fn send(&self, payload: Payload) -> Result<u64, IpcError> {
        if self.is_closed() {
            return Err(IpcError::channel_closed("IPC channel is closed"));
        }

        let mut next_seq = self.inner.next_seq.lock().await;
        let seq = *next_seq;
        let kind = payload.kind();

        tokio::select! {
            biased;
            _ = self.inner.link.cancelled() => {
                return Err(IpcError::channel_closed("IPC peer disconnected"));
            }
            _ = self.inner.closing.cancelled() => {
                return Err(IpcError::channel_closed("IPC channel is closing"));
            }
            sent = self.inner.outbound.send(IpcMessage::new(seq, payload)) => {
                sent.map_err(|_| IpcError::channel_closed("IPC writer stopped"))?;
            }
        }

        *next_seq += 1;
        trace!("Queued IPC {kind} #{seq}");
        Ok(seq)
    }

    /// [`send`](Self::send) bounded by `timeout`.
    pub async fn send_timeout(&self, payload: Payload, timeout: Duration) -> Result<u64, IpcError> {
        let kind = payload.kind();
        tokio::time::timeout(timeout, self.send(payload))
            .await
            .map_err(|_| IpcError::timeout(format!("sending {kind} took longer than {timeout:?}")))?
    }

    /// Flush queued frames, shut down the write half and stop reading.
    ///
    /// Both ends observe `ChannelClosed` afterwards: this side immediately,
    /// the peer when it reads end-of-stream.
    pub async fn close(&self) {
        self.inner.closing.cancel();

        if let Some(task) = self.inner.writer_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!("IPC writer task ended abnormally: {e}");
        }

        self.inner.link.cancel();
        debug!("IPC channel closed locally");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.link.is_cancelled() || self.inner.closing.is_cancelled()
    }

    /// Resolves when the channel goes down for any reason.
    pub async fn closed(&self) {
        self.inner.link.cancelled().await
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

/// Receiving half.
pub struct IpcReceiver {
    inbound: mpsc::Receiver<IpcMessage>,
    link: CancellationToken,
    stats: Arc<ChannelStats>,
}

impl IpcReceiver {
    /// Next frame in send order.
    ///
    /// Frames already buffered are still delivered after the peer goes away;
    /// after that this returns [`IpcError::ChannelClosed`].
    pub async fn receive(&mut self) -> Result<IpcMessage, IpcError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| IpcError::channel_closed("IPC peer disconnected"))
    }

    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<IpcMessage, IpcError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| IpcError::timeout(format!("no IPC frame within {timeout:?}")))?
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_cancelled() && self.inbound.is_empty()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<IpcMessage>,
    closing: CancellationToken,
    link: CancellationToken,
    stats: Arc<ChannelStats>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = link.cancelled() => {
                debug!("IPC link down, writer stopping");
                return;
            }
            _ = closing.cancelled() => None,
            message = outbound.recv() => message,
        };

        match next {
            Some(message) => {
                if let Err(e) = write_frame(&mut sink, &message, &stats).await {
                    warn!("IPC write failed: {e}");
                    link.cancel();
                    return;
                }
            }
            None => break,
        }
    }

    // Flush whatever was queued before close.
    outbound.close();
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut sink, &message, &stats).await {
            warn!("IPC write failed while flushing: {e}");
            link.cancel();
            return;
        }
    }

    if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!("IPC write half shutdown failed: {e}");
    }
}

async fn write_frame<W>(
    sink: &mut FramedWrite<W, LengthDelimitedCodec>,
    message: &IpcMessage,
    stats: &ChannelStats,
) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    sink.send(Bytes::from(message.encode_to_vec())).await?;
    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    trace!("Wrote IPC {} #{}", message.kind(), message.seq);
    Ok(())
}

async fn read_loop<R>(
    mut stream: FramedRead<R, LengthDelimitedCodec>,
    inbound: mpsc::Sender<IpcMessage>,
    link: CancellationToken,
    stats: Arc<ChannelStats>,
) where
    R: AsyncRead + Unpin,
{
    let mut tracker = SequenceTracker::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = link.cancelled() => break,
            frame = stream.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!("IPC read failed, closing channel: {e}");
                break;
            }
            None => {
                debug!("IPC peer closed the stream");
                break;
            }
        };

        let message = match IpcMessage::decode(bytes.freeze()) {
            Ok(message) if message.payload.is_some() => message,
            Ok(message) => {
                stats.frames_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping IPC frame #{} without payload", message.seq);
                continue;
            }
            Err(e) => {
                stats.frames_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed IPC frame: {e}");
                continue;
            }
        };

        match tracker.observe(message.seq) {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { missing } => {
                warn!(
                    "IPC sequence gap: {missing} frame(s) missing before #{}",
                    message.seq
                );
            }
            SequenceCheck::Stale { last } => {
                stats.frames_out_of_order.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejecting out-of-order IPC {} #{} (last accepted #{last})",
                    message.kind(),
                    message.seq
                );
                continue;
            }
        }

        stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let delivered = tokio::select! {
            biased;
            _ = link.cancelled() => false,
            sent = inbound.send(message) => sent.is_ok(),
        };

        if !delivered {
            break;
        }
    }

    link.cancel();
}
