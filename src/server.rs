//! Server builder and runtime loops.
//!
//! [`ServerBuilder`] collects configuration and service descriptors;
//! [`ServerBuilder::start`] then:
//!
//! 1. binds the listener
//! 2. builds the invocation engine over one shared worker pool
//! 3. publishes every service to the registry (a refusal aborts startup)
//! 4. spawns the accept loop, the stat reporter and the stale-client sweep
//!
//! Each accepted connection gets a reader loop feeding the [`Dispatcher`] and
//! a writer task for replies.
//!
//! # Example
//!
//! ```ignore
//! use meshwire::{Server, ServiceDescriptor};
//!
//! let server = Server::builder()
//!     .bind_address("127.0.0.1:13000")
//!     .service(ServiceDescriptor::build("/service/echo", "*", bindings, &interface))
//!     .start()
//!     .await?;
//!
//! // ...
//! server.shutdown().await?;
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accounting::{
    spawn_reporter, CallAccounting, GaugeFn, Gauges, InvokePerClient, NetworkCounters, NetworkStat,
    StatMonitor,
};
use crate::config::{Compression, ServerConfig};
use crate::dispatch::Dispatcher;
use crate::engine::InvocationEngine;
use crate::error::{Result, WireError};
use crate::pool::WorkerPool;
use crate::protocol::{FrameBuffer, FrameCodec, HEADER_SIZE};
use crate::registry::{ServiceMeta, ServiceRegistry, PROTOCOL_VERSION};
use crate::service::ServiceDescriptor;
use crate::transport::{WireListener, WireStream};
use crate::writer::{spawn_writer, WriterConfig, DEFAULT_SEND_TIMEOUT};

/// How long shutdown waits for clients to disconnect on their own.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builder for a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    services: Vec<ServiceDescriptor>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    monitor: Option<Arc<dyn StatMonitor>>,
    advertise_address: Option<String>,
    shutdown_grace: Duration,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::from_config(ServerConfig::default())
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
            registry: None,
            monitor: None,
            advertise_address: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    pub fn compression(mut self, compress: Compression) -> Self {
        self.config.compress = compress;
        self
    }

    /// Budget given to every request this server receives.
    pub fn process_timeout(mut self, timeout: Duration) -> Self {
        self.config.process_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Size of the worker pool shared by all services.
    pub fn max_dispatcher_size(mut self, size: usize) -> Self {
        self.config.max_dispatcher_size = size;
        self
    }

    pub fn max_frame_length(mut self, length: u32) -> Self {
        self.config.max_frame_length = length;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    pub fn write_channel_size(mut self, size: usize) -> Self {
        self.config.write_channel_size = size;
        self
    }

    pub fn stat_interval(mut self, interval: Duration) -> Self {
        self.config.stat_interval = interval;
        self
    }

    pub fn client_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.client_sweep_interval = interval;
        self
    }

    pub fn service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(descriptor);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Receive every periodic [`StatReport`](crate::accounting::StatReport).
    pub fn monitor(mut self, monitor: impl StatMonitor) -> Self {
        self.monitor = Some(Arc::new(monitor));
        self
    }

    /// `host:port` published to the registry. Defaults to the bound address.
    pub fn advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn start(self) -> Result<Server> {
        Server::start(self).await
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the accept loop and every connection.
struct Shared {
    dispatcher: Dispatcher,
    network: Arc<NetworkCounters>,
    codec: FrameCodec,
    config: ServerConfig,
    connections: DashMap<u64, String>,
    next_connection: AtomicU64,
}

/// A running server.
pub struct Server {
    local_addr: SocketAddr,
    advertised: String,
    shared: Arc<Shared>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn start(builder: ServerBuilder) -> Result<Self> {
        let ServerBuilder {
            config,
            services,
            registry,
            monitor,
            advertise_address,
            shutdown_grace,
        } = builder;

        let mut seen = HashSet::new();
        for service in &services {
            if !seen.insert(service.service_uri().to_string()) {
                return Err(WireError::Config(format!(
                    "service {} registered twice",
                    service.service_uri()
                )));
            }
        }

        let listener = WireListener::bind(config.bind_address.as_str()).await?;
        let local_addr = listener.local_addr();
        let advertised = advertise_address.unwrap_or_else(|| local_addr.to_string());

        let services: Vec<Arc<ServiceDescriptor>> = services.into_iter().map(Arc::new).collect();
        let pool = WorkerPool::new(config.max_dispatcher_size);
        let accounting = Arc::new(CallAccounting::new());
        let engine = Arc::new(InvocationEngine::new(
            services.iter().cloned(),
            pool.clone(),
            Arc::clone(&accounting),
        ));
        let network = Arc::new(NetworkCounters::new());

        if let Some(registry) = &registry {
            for service in &services {
                register(registry.as_ref(), service, &advertised).await?;
            }
        }

        let codec = FrameCodec::new()
            .with_max_frame_length(config.max_frame_length)
            .with_compression(config.compress.is_enabled());
        let shared = Arc::new(Shared {
            dispatcher: Dispatcher::new(
                Arc::clone(&engine),
                Arc::clone(&network),
                config.process_timeout,
            ),
            network: Arc::clone(&network),
            codec,
            config: config.clone(),
            connections: DashMap::new(),
            next_connection: AtomicU64::new(0),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            shutdown_rx.clone(),
        )));

        let gauge_pool = pool.clone();
        let gauge_network = Arc::clone(&network);
        let gauges: GaugeFn = Arc::new(move || Gauges {
            invoke_in_use: gauge_pool.in_use() as u64,
            invoke_capacity: gauge_pool.capacity() as u64,
            invoke_queued: gauge_pool.queued() as u64,
            connections: gauge_network.connections(),
        });
        tasks.push(spawn_reporter(
            accounting,
            Arc::clone(&network),
            config.stat_interval,
            gauges,
            monitor,
            shutdown_rx.clone(),
        ));

        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&shared),
            config.client_sweep_interval,
            shutdown_rx,
        )));

        tracing::info!(
            address = %local_addr,
            advertised = %advertised,
            services = engine.services().count(),
            "server started"
        );

        Ok(Self {
            local_addr,
            advertised,
            shared,
            registry,
            shutdown,
            tasks,
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        self.shared.dispatcher.engine()
    }

    pub fn accounting(&self) -> &Arc<CallAccounting> {
        self.engine().accounting()
    }

    pub fn network(&self) -> NetworkStat {
        self.shared.network.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Addresses of the currently connected clients.
    pub fn clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .shared
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        clients.sort();
        clients
    }

    /// Per-client call counts of every service.
    pub fn list_invokes(&self) -> Vec<InvokePerClient> {
        let mut all: Vec<InvokePerClient> = self
            .engine()
            .services()
            .flat_map(|s| s.list_invokes())
            .collect();
        all.sort_by(|a, b| (&a.service_name, &a.client).cmp(&(&b.service_name, &b.client)));
        all
    }

    /// Withdraw from the registry, give clients the grace period to leave,
    /// then stop accepting and close the remaining connections.
    ///
    /// Calls already running finish and their replies are still written.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(registry) = &self.registry {
            for service in self.engine().services() {
                let outcome = registry
                    .unregister(
                        service.service_uri(),
                        &self.advertised,
                        PROTOCOL_VERSION,
                        service.group_id(),
                    )
                    .await;
                match outcome {
                    Ok(true) => {
                        tracing::info!(service = %service.service_uri(), "service unregistered")
                    }
                    Ok(false) => {
                        tracing::warn!(service = %service.service_uri(), "unregister refused")
                    }
                    Err(e) => {
                        tracing::warn!(service = %service.service_uri(), error = %e, "unregister failed")
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while !self.shared.connections.is_empty() && tokio::time::Instant::now() < deadline {
            tracing::debug!(
                connections = self.shared.connections.len(),
                "waiting for clients to disconnect"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "server task ended abnormally");
            }
        }
        tracing::info!(address = %self.local_addr, "server stopped");
        Ok(())
    }
}

async fn register(registry: &dyn ServiceRegistry, service: &ServiceDescriptor, host_port: &str) -> Result<()> {
    let meta = ServiceMeta::new(service.service_uri(), service.group_id(), host_port);
    let accepted = registry
        .register(
            service.service_uri(),
            host_port,
            PROTOCOL_VERSION,
            service.group_id(),
            meta,
        )
        .await?;
    if !accepted {
        return Err(WireError::Registry(format!(
            "registration of {} refused",
            service.service_uri()
        )));
    }
    tracing::info!(
        service = %service.service_uri(),
        group = %service.group_id(),
        endpoint = %host_port,
        "service registered"
    );
    Ok(())
}

async fn accept_loop(listener: WireListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        match stream {
            Ok(stream) => {
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&shared),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

/// Reader loop for one connection.
async fn serve_connection(stream: WireStream, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let peer = stream.peer_addr().to_string();
    let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    shared.connections.insert(id, peer.clone());
    shared.network.connection_opened();
    tracing::debug!(peer = %peer, "connection opened");

    let config = &shared.config;
    let (mut reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer(
        write_half,
        shared.codec,
        WriterConfig {
            channel_capacity: config.write_channel_size,
            write_buffer_size: config.write_buffer_size,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        },
        Arc::clone(&shared.network),
    );

    let mut frames = FrameBuffer::with_capacity(config.read_buffer_size, shared.codec);
    let mut buf = vec![0u8; config.read_buffer_size.max(HEADER_SIZE)];

    loop {
        let read = tokio::select! {
            read = tokio::time::timeout(config.idle_timeout, reader.read(&mut buf)) => read,
            _ = shutdown.changed() => break,
        };
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "read failed");
                break;
            }
            Err(_) => {
                tracing::debug!(peer = %peer, idle = ?config.idle_timeout, "idle connection closed");
                break;
            }
        };

        // Frames completed before a corrupt one are still answered.
        let (packets, framed) = frames.push_partial(&buf[..n]);
        shared.network.record_read(n, packets.len());
        for packet in packets {
            shared.dispatcher.dispatch(packet, &peer, writer.clone());
        }
        if let Err(e) = framed {
            tracing::warn!(peer = %peer, error = %e, "frame error, closing connection");
            break;
        }
    }

    shared.connections.remove(&id);
    shared.network.connection_closed();
    // The writer exits once in-flight replies have released their handles.
    drop(writer);
    tracing::debug!(peer = %peer, "connection closed");
}

/// Periodically drop per-client counters of clients that are gone.
async fn sweep_loop(shared: Arc<Shared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let live: HashSet<String> = shared
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for service in shared.dispatcher.engine().services() {
            let removed = service.invokes().retain_clients(&live);
            if removed > 0 {
                tracing::debug!(
                    service = %service.service_uri(),
                    removed,
                    "stale client counters removed"
                );
            }
        }
    }
}
