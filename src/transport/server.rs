//! Listening side of the engine.
//!
//! `Server::start` binds the TCP listener (and, when enabled, the UDP
//! companion on the next port), then runs an accept loop until the shutdown
//! channel fires or `ServerHandle::shutdown` is called. Every accepted socket
//! runs the handshake before it becomes a `Connection`; decoded messages are
//! stamped with the connection's id and fanned out to the worker queues.

use crate::config::NetworkConfig;
use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::server_handshake;
use crate::protocol::message::Message;
use crate::protocol::pipeline::CodecPipeline;
use crate::protocol::queue::{QueueHandler, QueueManager};
use crate::protocol::router::{GroupRelay, Role, Router, SyncSink};
use crate::transport::connection::{Connection, ConnectionEvent, InboundSink};
use crate::transport::datagram::{check_source, DatagramLink, MAX_DATAGRAM, UDP_REGISTER_HEAD};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 1024;

/// How often the shutdown drain re-checks pending frames
const DRAIN_POLL: Duration = Duration::from_millis(10);

type Job = (Message, Arc<Connection>);

/// Live connections keyed by id, plus id allocation.
pub struct Registry {
    connections: DashMap<UInt24, Arc<Connection>>,
    next_id: AtomicU32,
    max_connections: usize,
}

impl Registry {
    fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU32::new(1),
            max_connections,
        }
    }

    /// Picks the next free id. Ids wrap at 24 bits and never take 0.
    fn allocate(&self) -> Result<UInt24> {
        if self.connections.len() >= self.max_connections {
            return Err(ProtocolError::HandshakeError(constants::ERR_SERVER_FULL.into()));
        }
        for _ in 0..UInt24::MAX.get() {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed) & UInt24::MAX.get();
            if raw == 0 {
                continue;
            }
            let id = UInt24::truncating(raw);
            if !self.connections.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ProtocolError::HandshakeError(constants::ERR_ID_SPACE_EXHAUSTED.into()))
    }

    pub fn get(&self, id: UInt24) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl GroupRelay for Registry {
    fn relay(&self, message: &mut Message, from: &Arc<Connection>) -> usize {
        let Some(group) = from.group() else {
            debug!(connection_id = %from.id(), "Broadcast from a connection outside any group");
            return 0;
        };
        let frame = match message.serialize(from.pipeline()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %from.id(), error = %e, "Broadcast could not be encoded");
                return 0;
            }
        };

        self.snapshot()
            .into_iter()
            .filter(|member| member.id() != from.id() && member.group() == Some(group))
            .filter(|member| member.send_frame(frame.clone()).is_ok())
            .count()
    }
}

/// State shared by the accept loop, the UDP loop and every connection.
struct Shared {
    config: NetworkConfig,
    pipeline: Arc<CodecPipeline>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<ConnectionEvent>,
    queue: RwLock<Option<Arc<QueueManager<Job>>>>,
    udp: Option<Arc<UdpSocket>>,
    stop: CancellationToken,
}

impl Shared {
    /// Stamps the sender's id and queues the message for a worker.
    fn deliver(&self, mut message: Message, connection: &Arc<Connection>) {
        message.set_client_id(connection.id());
        let queue = self.queue.read().clone();
        let Some(queue) = queue else {
            debug!(connection_id = %connection.id(), "Queue stopped; message dropped");
            return;
        };
        if let Err(e) = queue.push((message, connection.clone())) {
            debug!(connection_id = %connection.id(), error = %e, "Message not queued");
        }
    }

    #[instrument(skip(self, stream), fields(peer = %peer))]
    async fn admit(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        self.metrics.handshake_attempt();
        let registry = self.registry.clone();
        let handshake = server_handshake(
            &mut stream,
            self.config.server.handshake_timeout,
            self.config.server.id_width,
            || registry.allocate(),
        )
        .await;

        let id = match handshake {
            Ok(id) => {
                self.metrics.handshake_success();
                id
            }
            Err(e) => {
                self.metrics.handshake_failed();
                warn!(error = %e, "Handshake failed; dropping socket");
                return;
            }
        };

        let weak = Arc::downgrade(&self);
        let inbound: InboundSink = Arc::new(move |message, connection| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(message, connection);
            }
        });

        let on_close = {
            let registry = Arc::downgrade(&self.registry);
            let events = self.events.clone();
            Box::new(move |id: UInt24| {
                if let Some(registry) = registry.upgrade() {
                    registry.connections.remove(&id);
                }
                let _ = events.send(ConnectionEvent::Disconnected(id));
            })
        };

        let datagrams = self
            .udp
            .as_ref()
            .map(|socket| Arc::new(DatagramLink::unbound(socket.clone())));

        let connection = Connection::spawn(
            Role::Server,
            id,
            stream,
            self.pipeline.clone(),
            self.metrics.clone(),
            self.config.transport.max_frame_size,
            datagrams,
            inbound,
            on_close,
        );
        self.registry.connections.insert(id, connection.clone());
        // The peer may already be gone; its close hook ran before the insert
        if connection.is_closed() {
            self.registry.connections.remove(&id);
            return;
        }
        let _ = self.events.send(ConnectionEvent::Connected(id));
    }

    /// Waits for queued frames to flush, then closes every connection and
    /// stops the workers.
    async fn drain(&self) {
        let _timer = Timer::start("server_drain");
        let flushed = with_timeout_error(
            async {
                loop {
                    let pending: usize = self
                        .registry
                        .snapshot()
                        .iter()
                        .map(|connection| connection.pending_frames())
                        .sum();
                    if pending == 0 {
                        break;
                    }
                    debug!(pending, "Waiting for frames to flush");
                    tokio::time::sleep(DRAIN_POLL).await;
                }
                Ok(())
            },
            self.config.server.shutdown_timeout,
        )
        .await;
        if flushed.is_err() {
            warn!("Shutdown timeout reached, closing with frames pending");
        }

        for connection in self.registry.snapshot() {
            connection.close();
        }

        let queue = self.queue.write().take();
        if let Some(queue) = queue {
            match Arc::try_unwrap(queue) {
                Ok(queue) => {
                    if tokio::task::spawn_blocking(move || queue.shutdown()).await.is_err() {
                        error!("Queue shutdown task panicked");
                    }
                }
                // A reader still holds it; dropping the last handle stops the workers
                Err(queue) => drop(queue),
            }
        }
        self.metrics.log_metrics();
    }
}

/// Builder for a listening server.
pub struct Server {
    config: NetworkConfig,
    pipeline: Arc<CodecPipeline>,
    dispatcher: Arc<Dispatcher>,
    sync_sink: Option<Arc<dyn SyncSink>>,
}

impl Server {
    pub fn new(config: NetworkConfig, pipeline: Arc<CodecPipeline>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            pipeline,
            dispatcher,
            sync_sink: None,
        }
    }

    /// Installs the consumer of synchronization payloads.
    pub fn with_sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync_sink = Some(sink);
        self
    }

    /// Binds the listener and starts accepting.
    ///
    /// Accepting stops when `shutdown_rx` receives a value or its sender is
    /// dropped; connections are then drained as in [`ServerHandle::shutdown`].
    #[instrument(skip(self, shutdown_rx), fields(address = %self.config.server.address))]
    pub async fn start(self, shutdown_rx: mpsc::Receiver<()>) -> Result<ServerHandle> {
        for problem in self.config.validate() {
            warn!(%problem, "Configuration issue");
        }

        let listener = TcpListener::bind(&self.config.server.address).await?;
        let local_addr = listener.local_addr()?;

        let udp = if self.config.server.udp_enabled {
            let port = local_addr.port().checked_add(1).ok_or_else(|| {
                ProtocolError::ConfigError("UDP companion needs TCP port + 1".into())
            })?;
            let socket = UdpSocket::bind(SocketAddr::new(local_addr.ip(), port)).await?;
            Some(Arc::new(socket))
        } else {
            None
        };
        let udp_addr = match &udp {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };

        let metrics = Arc::new(Metrics::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Registry::new(self.config.server.max_connections));

        let mut router = Router::new(Role::Server, self.dispatcher, metrics.clone(), events.clone())
            .with_relay(registry.clone());
        if let Some(sink) = self.sync_sink {
            router = router.with_sync_sink(sink);
        }
        let router = Arc::new(router);
        let handler: QueueHandler<Job> = Arc::new(move |(message, connection)| {
            router.route(message, &connection);
        });
        let queue = QueueManager::new(
            "gamewire-server",
            self.config.queue.workers,
            self.config.queue.scan_interval,
            handler,
        )?;

        let shared = Arc::new(Shared {
            config: self.config,
            pipeline: self.pipeline,
            registry,
            metrics,
            events,
            queue: RwLock::new(Some(Arc::new(queue))),
            udp: udp.clone(),
            stop: CancellationToken::new(),
        });

        info!(%local_addr, udp = ?udp_addr, "Server listening");

        let udp_task = udp.map(|socket| tokio::spawn(udp_loop(socket, shared.clone())));
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        Ok(ServerHandle {
            shared,
            local_addr,
            udp_addr,
            accept_task: Some(accept_task),
            udp_task,
        })
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
            _ = shared.stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Socket accepted");
                    tokio::spawn(shared.clone().admit(stream, peer));
                }
                Err(e) => error!(error = %e, "Error accepting connection"),
            }
        }
    }

    info!("Shutting down server. Waiting for connections to drain...");
    shared.stop.cancel();
    shared.drain().await;
    info!("Server stopped");
}

async fn udp_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shared.stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "UDP receive failed");
                continue;
            }
        };
        shared.metrics.datagram_received(len as u64);

        let message = match Message::from_frame(Bytes::copy_from_slice(&buf[..len]), &shared.pipeline) {
            Ok(message) => message,
            Err(e) => {
                shared.metrics.protocol_error();
                debug!(%from, error = %e, "Dropping malformed datagram");
                continue;
            }
        };

        let Some(connection) = shared.registry.get(message.client_id()) else {
            debug!(%from, client_id = %message.client_id(), "Datagram for unknown connection");
            continue;
        };
        if let Err(e) = check_source(connection.peer_addr(), from) {
            warn!(connection_id = %connection.id(), error = %e, "Datagram rejected");
            continue;
        }
        if let Some(link) = connection.datagrams() {
            link.learn_peer(from);
        }
        if message.head_id() == UDP_REGISTER_HEAD {
            continue;
        }
        shared.deliver(message, &connection);
    }
    debug!("UDP loop stopped");
}

/// Control surface of a running server.
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    udp_task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn connection(&self, id: UInt24) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.snapshot()
    }

    /// Moves a connection into `group`, leaving any previous group.
    pub fn join_group(&self, id: UInt24, group: u32) -> bool {
        match self.shared.registry.get(id) {
            Some(connection) => {
                connection.set_group(Some(group));
                debug!(connection_id = %id, group, "Joined group");
                true
            }
            None => false,
        }
    }

    pub fn leave_group(&self, id: UInt24) -> bool {
        match self.shared.registry.get(id) {
            Some(connection) => {
                connection.set_group(None);
                true
            }
            None => false,
        }
    }

    /// Sends `message` to every live connection; returns how many queued it.
    pub fn broadcast(&self, message: &mut Message) -> Result<usize> {
        let frame = message.serialize(&self.shared.pipeline)?;
        Ok(self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|connection| connection.send_frame(frame.clone()).is_ok())
            .count())
    }

    pub fn send_to(&self, id: UInt24, message: &mut Message) -> Result<()> {
        let connection = self
            .shared
            .registry
            .get(id)
            .ok_or_else(|| ProtocolError::TransportError(format!("no connection {id}")))?;
        message.set_client_id(id);
        connection.send(message)
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Stops accepting, flushes pending frames within the configured shutdown
    /// timeout and closes every connection.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shared.stop.cancel();
        if let Some(task) = self.accept_task.take() {
            task.await
                .map_err(|e| ProtocolError::Custom(format!("accept loop failed: {e}")))?;
        }
        if let Some(task) = self.udp_task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("udp_addr", &self.udp_addr)
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}
