//! Connecting side of the engine.

use crate::config::NetworkConfig;
use crate::core::uint24::UInt24;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::client_handshake;
use crate::protocol::message::Message;
use crate::protocol::pipeline::CodecPipeline;
use crate::protocol::queue::{QueueHandler, QueueManager};
use crate::protocol::router::{Role, Router};
use crate::transport::connection::{Connection, ConnectionEvent, InboundSink};
use crate::transport::datagram::{check_source, DatagramLink, MAX_DATAGRAM, UDP_REGISTER_HEAD};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

type Job = (Message, Arc<Connection>);

/// An admitted connection to a server, with its own worker queue.
pub struct Client {
    id: UInt24,
    config: NetworkConfig,
    connection: Arc<Connection>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<ConnectionEvent>,
    queue: Option<Arc<QueueManager<Job>>>,
    udp_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Connects to `config.client.address` and runs the handshake.
    ///
    /// # Errors
    /// - `ProtocolError::Timeout` if connecting or the handshake outlives
    ///   `connection_timeout`
    /// - `ProtocolError::HandshakeError` if the server rejects the key
    #[instrument(skip(config, pipeline, dispatcher), fields(address = %config.client.address))]
    pub async fn connect(
        config: NetworkConfig,
        pipeline: Arc<CodecPipeline>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let timeout = config.client.connection_timeout;

        metrics.handshake_attempt();
        let address = config.client.address.clone();
        let admitted = with_timeout_error(
            async {
                let mut stream = TcpStream::connect(&address).await?;
                let id = client_handshake(&mut stream, timeout, config.client.id_width).await?;
                Ok::<_, ProtocolError>((stream, id))
            },
            timeout,
        )
        .await;
        let (stream, id) = match admitted {
            Ok(admitted) => {
                metrics.handshake_success();
                admitted
            }
            Err(e) => {
                metrics.handshake_failed();
                warn!(error = %e, "Connect failed");
                return Err(e);
            }
        };
        let server_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let udp = if config.client.udp_enabled {
            let socket = Arc::new(UdpSocket::bind(SocketAddr::new(local_addr.ip(), 0)).await?);
            let server_udp = SocketAddr::new(server_addr.ip(), server_addr.port().wrapping_add(1));
            Some((socket, server_udp))
        } else {
            None
        };
        let datagrams = udp
            .as_ref()
            .map(|(socket, server_udp)| Arc::new(DatagramLink::new(socket.clone(), Some(*server_udp))));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let router = Arc::new(Router::new(Role::Client, dispatcher, metrics.clone(), events.clone()));
        let handler: QueueHandler<Job> = Arc::new(move |(message, connection)| {
            router.route(message, &connection);
        });
        // One worker keeps server messages in arrival order
        let queue = Arc::new(QueueManager::new("gamewire-client", 1, config.queue.scan_interval, handler)?);

        let weak = Arc::downgrade(&queue);
        let inbound: InboundSink = Arc::new(move |message, connection| {
            if let Some(queue) = weak.upgrade() {
                if let Err(e) = queue.push((message, connection.clone())) {
                    debug!(error = %e, "Message not queued");
                }
            }
        });
        let on_close = {
            let events = events.clone();
            Box::new(move |id: UInt24| {
                let _ = events.send(ConnectionEvent::Disconnected(id));
            })
        };

        let connection = Connection::spawn(
            Role::Client,
            id,
            stream,
            pipeline,
            metrics.clone(),
            config.transport.max_frame_size,
            datagrams,
            inbound,
            on_close,
        );

        let udp_task = match udp {
            Some((socket, server_udp)) => {
                let mut register = Message::with_header(id, UDP_REGISTER_HEAD, UInt24::ZERO);
                connection.send_datagram(&mut register)?;
                Some(tokio::spawn(udp_loop(
                    socket,
                    server_udp,
                    connection.clone(),
                    Arc::downgrade(&queue),
                )))
            }
            None => None,
        };

        let _ = events.send(ConnectionEvent::Connected(id));
        info!(connection_id = %id, server = %server_addr, "Connected");

        Ok(Self {
            id,
            config,
            connection,
            metrics,
            events,
            queue: Some(queue),
            udp_task,
        })
    }

    pub fn id(&self) -> UInt24 {
        self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    pub fn send(&self, message: &mut Message) -> Result<()> {
        message.set_client_id(self.id);
        self.connection.send(message)
    }

    pub fn send_with_reply<F>(&self, message: &mut Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Message) + Send + Sync + 'static,
    {
        message.set_client_id(self.id);
        self.connection.send_with_reply(message, callback)
    }

    /// Sends `message` and waits up to the configured response timeout.
    pub async fn request(&self, message: &mut Message) -> Result<Message> {
        message.set_client_id(self.id);
        self.connection
            .request(message, self.config.client.response_timeout)
            .await
    }

    /// Sends on the UDP side-channel; the server routes it by ClientID.
    pub fn send_datagram(&self, message: &mut Message) -> Result<()> {
        message.set_client_id(self.id);
        self.connection.send_datagram(message)
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Closes the connection and joins the worker thread.
    pub async fn disconnect(mut self) {
        self.connection.close();
        if let Some(task) = self.udp_task.take() {
            let _ = task.await;
        }
        if let Some(queue) = self.queue.take() {
            if let Ok(queue) = Arc::try_unwrap(queue) {
                if tokio::task::spawn_blocking(move || queue.shutdown()).await.is_err() {
                    error!("Queue shutdown task panicked");
                }
            }
        }
        debug!(connection_id = %self.id, "Client disconnected");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish()
    }
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    server_udp: SocketAddr,
    connection: Arc<Connection>,
    queue: std::sync::Weak<QueueManager<Job>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = connection.closed() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!(connection_id = %connection.id(), error = %e, "UDP receive failed");
                continue;
            }
        };
        if let Err(e) = check_source(Some(server_udp), from) {
            debug!(connection_id = %connection.id(), error = %e, "Datagram rejected");
            continue;
        }
        connection.metrics().datagram_received(len as u64);

        match Message::from_frame(Bytes::copy_from_slice(&buf[..len]), connection.pipeline()) {
            Ok(message) => {
                let Some(queue) = queue.upgrade() else { break };
                if let Err(e) = queue.push((message, connection.clone())) {
                    debug!(error = %e, "Datagram not queued");
                }
            }
            Err(e) => {
                connection.metrics().protocol_error();
                debug!(connection_id = %connection.id(), error = %e, "Dropping malformed datagram");
            }
        }
    }
}
