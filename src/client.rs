//! Multiplexed client for the same wire protocol.
//!
//! One TCP connection carries any number of concurrent calls. Each call takes
//! a fresh opaque id and parks a oneshot sender in the pending table; the
//! reader task routes every reply to the sender with the same id. Replies may
//! arrive in any order.
//!
//! # Example
//!
//! ```ignore
//! use meshwire::{Client, Request};
//!
//! let client = Client::connect("127.0.0.1:13000").await?;
//! let request = Request::new("/service/echo", "Echo").arg("hello")?;
//! let response = client.invoke(&request).await?;
//! let text: String = response.decode_result()?;
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::accounting::{InfoReport, NetworkCounters};
use crate::codec::JsonCodec;
use crate::error::{Result, WireError};
use crate::protocol::{
    CmdType, FrameBuffer, FrameCodec, Heartbeat, Packet, Payload, Request, Response,
    DEFAULT_MAX_FRAME_LENGTH,
};
use crate::transport::WireStream;
use crate::writer::{spawn_writer, WriterConfig, WriterHandle};

/// Default per-call wait.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 16 * 1024;

type PendingCalls = DashMap<u32, oneshot::Sender<Packet>>;

pub struct ClientBuilder {
    compress: bool,
    max_frame_length: u32,
    call_timeout: Duration,
    writer_config: WriterConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            compress: false,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            writer_config: WriterConfig::default(),
        }
    }

    /// Snappy-compress outbound bodies.
    pub fn compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn max_frame_length(mut self, length: u32) -> Self {
        self.max_frame_length = length;
        self
    }

    /// How long [`Client::invoke`] waits for a reply.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    pub async fn connect(self, address: &str) -> Result<Client> {
        let stream = WireStream::connect(address).await?;
        let codec = FrameCodec::new()
            .with_max_frame_length(self.max_frame_length)
            .with_compression(self.compress);

        let (reader, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer(
            write_half,
            codec,
            self.writer_config,
            Arc::new(NetworkCounters::new()),
        );

        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let reader_task = tokio::spawn(read_loop(reader, codec, Arc::clone(&pending)));

        Ok(Client {
            writer,
            pending,
            next_opaque: AtomicU32::new(1),
            call_timeout: self.call_timeout,
            reader_task,
            writer_task,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected client.
pub struct Client {
    writer: WriterHandle,
    pending: Arc<PendingCalls>,
    next_opaque: AtomicU32,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default settings.
    pub async fn connect(address: &str) -> Result<Self> {
        ClientBuilder::new().connect(address).await
    }

    /// Call a remote method and wait for its response.
    pub async fn invoke(&self, request: &Request) -> Result<Response> {
        self.invoke_with_timeout(request, self.call_timeout).await
    }

    pub async fn invoke_with_timeout(&self, request: &Request, timeout: Duration) -> Result<Response> {
        let reply = self
            .round_trip(CmdType::Request, request.encode()?, timeout)
            .await?;
        Response::decode(reply.payload())
    }

    /// Send a heartbeat and return the server's echo of it.
    pub async fn ping(&self) -> Result<Heartbeat> {
        let body = JsonCodec::encode(&Heartbeat::now())?;
        let reply = self.round_trip(CmdType::Ping, body, self.call_timeout).await?;
        match Payload::decode(&reply)? {
            Payload::Pong(beat) => Ok(beat),
            other => Err(WireError::Protocol(format!(
                "expected PONG, got {:?}",
                other.command()
            ))),
        }
    }

    /// Fetch the server's network and call statistics.
    pub async fn info(&self) -> Result<InfoReport> {
        let reply = self
            .round_trip(CmdType::Info, Bytes::new(), self.call_timeout)
            .await?;
        JsonCodec::decode(reply.payload())
    }

    /// Calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn is_connected(&self) -> bool {
        !self.reader_task.is_finished() && !self.writer_task.is_finished()
    }

    async fn round_trip(&self, command: CmdType, body: Bytes, timeout: Duration) -> Result<Packet> {
        if !self.is_connected() {
            return Err(WireError::ConnectionClosed);
        }

        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(opaque, tx);

        if let Err(e) = self.writer.send_packet(&Packet::new(opaque, command, body)).await {
            self.pending.remove(&opaque);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&opaque);
                Err(WireError::Timeout)
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Route replies to their waiting callers until the connection ends.
async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, codec: FrameCodec, pending: Arc<PendingCalls>) {
    let mut frames = FrameBuffer::with_capacity(READ_BUFFER_SIZE, codec);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "client read failed");
                break;
            }
        };
        let (packets, framed) = frames.push_partial(&buf[..n]);
        for packet in packets {
            match pending.remove(&packet.opaque) {
                Some((_, tx)) => {
                    let _ = tx.send(packet);
                }
                None => tracing::debug!(opaque = packet.opaque, "reply for unknown or expired call"),
            }
        }
        if let Err(e) = framed {
            tracing::warn!(error = %e, "client frame error, closing");
            break;
        }
    }

    // Waiters see a closed channel.
    pending.clear();
}
