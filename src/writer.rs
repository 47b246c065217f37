//! Per-connection writer task.
//!
//! Every connection owns one writer task fed through an mpsc channel. Calls
//! completing on the worker pool encode their response and push the frame
//! here; the task drains whatever is ready, coalesces it into one buffer and
//! writes it with a single `write_all`.
//!
//! ```text
//! engine callback ─┐
//! ping/info reply ─┼─► WriterHandle ─► mpsc ─► writer_loop ─► socket
//! engine callback ─┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::accounting::NetworkCounters;
use crate::error::{Result, WireError};
use crate::protocol::{FrameCodec, Packet, HEADER_SIZE};

/// Default outbound queue length per connection.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Default coalescing buffer size.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Default time a sender waits for room in a full queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on frames drained per write.
const MAX_BATCH_FRAMES: usize = 64;

/// An encoded frame waiting to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    header: [u8; HEADER_SIZE],
    body: Bytes,
}

impl OutboundFrame {
    /// Encode `packet` with the connection's codec.
    pub fn encode(codec: &FrameCodec, packet: &Packet) -> Result<Self> {
        let (header, body) = codec.encode_parts(packet)?;
        Ok(Self { header, body })
    }

    /// Bytes this frame occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub channel_capacity: usize,
    pub write_buffer_size: usize,
    pub send_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Cloneable sending side of a connection's writer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    codec: FrameCodec,
    pending: Arc<AtomicUsize>,
    send_timeout: Duration,
}

impl WriterHandle {
    /// Encode and queue a packet.
    ///
    /// Waits up to the configured send timeout when the queue is full, then
    /// gives up with [`WireError::BackpressureTimeout`].
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let frame = OutboundFrame::encode(&self.codec, packet)?;
        self.send(frame).await
    }

    /// Queue an already encoded frame.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = match tokio::time::timeout(self.send_timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(WireError::ConnectionClosed),
            Err(_) => return Err(WireError::BackpressureTimeout),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(frame);
        Ok(())
    }

    /// Frames queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for one connection.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error on the first failed write.
pub fn spawn_writer<W>(
    writer: W,
    codec: FrameCodec,
    config: WriterConfig,
    network: Arc<NetworkCounters>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle {
        tx,
        codec,
        pending: Arc::clone(&pending),
        send_timeout: config.send_timeout,
    };
    let task = tokio::spawn(writer_loop(
        rx,
        writer,
        pending,
        config.write_buffer_size,
        network,
    ));
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    buffer_size: usize,
    network: Arc<NetworkCounters>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);

    while let Some(first) = rx.recv().await {
        let mut frames = 1;
        append(&mut buf, &first);

        // Drain what is already queued, within the buffer budget.
        while frames < MAX_BATCH_FRAMES && buf.len() < buffer_size {
            match rx.try_recv() {
                Ok(frame) => {
                    append(&mut buf, &frame);
                    frames += 1;
                }
                Err(_) => break,
            }
        }

        let bytes = buf.len();
        let written = writer.write_all(&buf).await;
        buf.clear();
        pending.fetch_sub(frames, Ordering::AcqRel);
        if let Err(e) = written {
            tracing::debug!(error = %e, "write failed, closing writer");
            return Err(e.into());
        }
        writer.flush().await?;
        network.record_write(bytes, frames);
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[inline]
fn append(buf: &mut BytesMut, frame: &OutboundFrame) {
    buf.reserve(frame.size());
    buf.extend_from_slice(&frame.header);
    buf.extend_from_slice(&frame.body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CmdType, FrameBuffer};
    use tokio::io::{duplex, AsyncReadExt};

    fn ping(opaque: u32) -> Packet {
        Packet::new(opaque, CmdType::Ping, Bytes::from_static(b"{\"timestamp\":1}"))
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = OutboundFrame::encode(&FrameCodec::new(), &ping(1)).unwrap();
        assert_eq!(frame.size(), HEADER_SIZE + 15);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_queue_order() {
        let (client, mut server) = duplex(64 * 1024);
        let network = Arc::new(NetworkCounters::new());
        let (handle, _task) = spawn_writer(
            client,
            FrameCodec::new(),
            WriterConfig::default(),
            Arc::clone(&network),
        );

        for i in 0..10 {
            handle.send_packet(&ping(i)).await.unwrap();
        }

        let expected = 10 * (HEADER_SIZE + 15);
        let mut raw = vec![0u8; expected];
        server.read_exact(&mut raw).await.unwrap();

        let mut buffer = FrameBuffer::default();
        let packets = buffer.push(&raw).unwrap();
        let ids: Vec<u32> = packets.iter().map(|p| p.opaque).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());

        tokio::task::yield_now().await;
        assert_eq!(network.snapshot().write_count, 10);
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_compressing_writer_sets_flag() {
        let (client, mut server) = duplex(64 * 1024);
        let codec = FrameCodec::new().with_compression(true);
        let (handle, _task) = spawn_writer(
            client,
            codec.clone(),
            WriterConfig::default(),
            Arc::new(NetworkCounters::new()),
        );

        let body = Bytes::from(vec![b'a'; 4096]);
        handle
            .send_packet(&Packet::new(3, CmdType::Response, body.clone()))
            .await
            .unwrap();

        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[9] & 1, 1);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        assert!(len < body.len());

        let mut rest = vec![0u8; len];
        server.read_exact(&mut rest).await.unwrap();
        let mut raw = header.to_vec();
        raw.extend_from_slice(&rest);
        assert_eq!(codec.decode(&raw).unwrap().payload, body);
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            channel_capacity: 1,
            write_buffer_size: 16,
            send_timeout: Duration::from_millis(20),
        };
        let (handle, _task) =
            spawn_writer(client, FrameCodec::new(), config, Arc::new(NetworkCounters::new()));

        let big = Packet::new(1, CmdType::Response, Bytes::from(vec![0u8; 1024]));
        let mut last = Ok(());
        for _ in 0..4 {
            last = handle.send_packet(&big).await;
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(WireError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_writer_stops_when_handles_dropped() {
        let (client, _server) = duplex(1024);
        let (handle, task) = spawn_writer(
            client,
            FrameCodec::new(),
            WriterConfig::default(),
            Arc::new(NetworkCounters::new()),
        );
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_after_peer_gone_fails() {
        let (client, server) = duplex(64);
        let (handle, task) = spawn_writer(
            client,
            FrameCodec::new(),
            WriterConfig::default(),
            Arc::new(NetworkCounters::new()),
        );
        drop(server);

        handle.send_packet(&ping(1)).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send_packet(&ping(2)).await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
