//! Per-connection send/receive engine.
//!
//! A `Connection` is created once the handshake admits a socket. Its TCP
//! stream is split into a reader task, which reassembles frames with
//! `FrameCodec` and hands decoded messages to an inbound sink, and a writer
//! task, which drains a FIFO of encoded frames one write at a time.
//!
//! Any I/O failure closes the connection. Closing is idempotent: the
//! cancellation token stops every task and the close hook (registry removal,
//! `Disconnected` event) runs exactly once.

use crate::core::codec::FrameCodec;
use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::protocol::pipeline::CodecPipeline;
use crate::protocol::reply::ReplyTable;
use crate::protocol::router::Role;
use crate::transport::datagram::DatagramLink;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Lifecycle notifications published by a server or client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(UInt24),
    Disconnected(UInt24),
    /// A message arrived for a HeadID with no registered action
    Unregistered { connection_id: UInt24, head_id: u16 },
}

/// Receives every decoded inbound message
pub type InboundSink = Arc<dyn Fn(Message, &Arc<Connection>) + Send + Sync + 'static>;

/// Runs once when the connection closes
pub type CloseHook = Box<dyn FnOnce(UInt24) + Send + 'static>;

pub struct Connection {
    id: UInt24,
    peer: Option<SocketAddr>,
    pipeline: Arc<CodecPipeline>,
    metrics: Arc<Metrics>,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: AtomicUsize,
    replies: ReplyTable,
    group: RwLock<Option<u32>>,
    datagrams: Option<Arc<DatagramLink>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    on_close: Mutex<Option<CloseHook>>,
}

impl Connection {
    fn build(
        role: Role,
        id: UInt24,
        peer: Option<SocketAddr>,
        pipeline: Arc<CodecPipeline>,
        metrics: Arc<Metrics>,
        datagrams: Option<Arc<DatagramLink>>,
        on_close: Option<CloseHook>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            peer,
            pipeline,
            metrics,
            outbound,
            pending: AtomicUsize::new(0),
            replies: ReplyTable::new(role),
            group: RwLock::new(None),
            datagrams,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_close: Mutex::new(on_close),
        });
        (connection, rx)
    }

    /// A client-side connection with no socket behind it.
    ///
    /// Every frame it would write is delivered to the returned receiver
    /// instead. Useful for exercising handlers and routing without I/O.
    pub fn detached(id: UInt24, pipeline: Arc<CodecPipeline>) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        Self::detached_as(Role::Client, id, pipeline)
    }

    pub fn detached_as(
        role: Role,
        id: UInt24,
        pipeline: Arc<CodecPipeline>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        Self::build(role, id, None, pipeline, Arc::new(Metrics::new()), None, None)
    }

    /// Takes ownership of an admitted socket and starts its I/O tasks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        role: Role,
        id: UInt24,
        stream: TcpStream,
        pipeline: Arc<CodecPipeline>,
        metrics: Arc<Metrics>,
        max_frame: usize,
        datagrams: Option<Arc<DatagramLink>>,
        inbound: InboundSink,
        on_close: CloseHook,
    ) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (connection, rx) = Self::build(role, id, peer, pipeline, metrics, datagrams, Some(on_close));
        connection.metrics.connection_established();

        tokio::spawn(Self::read_loop(connection.clone(), read_half, max_frame, inbound));
        tokio::spawn(Self::write_loop(connection.clone(), write_half, rx));
        if let Some(link) = connection.datagrams.clone() {
            let conn = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = link.run_sender(conn.id, &conn.metrics, &conn.cancel).await {
                    debug!(connection_id = %conn.id, error = %e, "Datagram sender stopped");
                    conn.close();
                }
            });
        }

        info!(connection_id = %id, peer = ?peer, "Connection established");
        connection
    }

    async fn read_loop(
        connection: Arc<Self>,
        read_half: OwnedReadHalf,
        max_frame: usize,
        inbound: InboundSink,
    ) {
        let codec = FrameCodec::new(connection.pipeline.min_frame_len(), max_frame);
        let mut frames = FramedRead::new(read_half, codec);

        loop {
            let next = tokio::select! {
                _ = connection.cancel.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    let size = frame.len() as u64;
                    match Message::from_frame(frame, &connection.pipeline) {
                        Ok(message) => {
                            connection.metrics.message_received(size);
                            trace!(
                                connection_id = %connection.id,
                                head_id = message.head_id(),
                                type_id = %message.type_id(),
                                "Frame received"
                            );
                            inbound(message, &connection);
                        }
                        Err(e) => {
                            connection.metrics.protocol_error();
                            warn!(connection_id = %connection.id, error = %e, "Dropping malformed frame");
                        }
                    }
                }
                Some(Err(e)) => {
                    connection.metrics.protocol_error();
                    warn!(connection_id = %connection.id, error = %e, "Receive failed");
                    break;
                }
                None => {
                    debug!(connection_id = %connection.id, "Peer closed the stream");
                    break;
                }
            }
        }
        connection.close();
    }

    async fn write_loop(
        connection: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = connection.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            // One frame in flight; the next waits until this write completes
            let written = write_half.write_all(&frame).await;
            connection.pending.fetch_sub(1, Ordering::AcqRel);
            match written {
                Ok(()) => connection.metrics.message_sent(frame.len() as u64),
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "Send failed");
                    break;
                }
            }
        }
        let _ = write_half.shutdown().await;
        connection.close();
    }

    pub fn id(&self) -> UInt24 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn pipeline(&self) -> &Arc<CodecPipeline> {
        &self.pipeline
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn replies(&self) -> &ReplyTable {
        &self.replies
    }

    pub fn datagrams(&self) -> Option<&Arc<DatagramLink>> {
        self.datagrams.as_ref()
    }

    pub fn group(&self) -> Option<u32> {
        *self.group.read()
    }

    pub fn set_group(&self, group: Option<u32>) {
        *self.group.write() = group;
    }

    /// Frames queued or being written
    pub fn pending_frames(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encodes `message` and queues it for sending.
    pub fn send(&self, message: &mut Message) -> Result<()> {
        let frame = message.serialize(&self.pipeline)?;
        self.send_frame(frame)
    }

    /// Queues an already encoded frame.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.outbound.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            ProtocolError::ConnectionClosed
        })
    }

    /// Sends `message` expecting an answer; `callback` runs once with it.
    ///
    /// Returns the reply slot.
    pub fn send_with_reply<F>(&self, message: &mut Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Message) + Send + Sync + 'static,
    {
        let slot = self.replies.register(Box::new(callback));
        let sent = message
            .set_reply_id(slot)
            .and_then(|message| self.send(message));
        if let Err(e) = sent {
            self.replies.cancel(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// Sends `message` and waits for its reply.
    ///
    /// # Errors
    /// `ProtocolError::Timeout` if nothing arrives within `timeout`; the slot
    /// is released so a late answer counts as an orphan.
    #[instrument(skip(self, message), fields(connection_id = %self.id, head_id = message.head_id()))]
    pub async fn request(&self, message: &mut Message, timeout: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let slot = self.send_with_reply(message, move |reply| {
            let _ = tx.send(reply);
        })?;

        let waited = with_timeout_error(
            async {
                rx.await
                    .map_err(|_| ProtocolError::Custom(constants::ERR_REPLY_DROPPED.into()))
            },
            timeout,
        )
        .await;

        if waited.is_err() {
            self.replies.cancel(slot);
        }
        waited
    }

    /// Queues `message` on the UDP side-channel.
    ///
    /// A newer datagram for the same HeadID replaces one still pending.
    pub fn send_datagram(&self, message: &mut Message) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let link = self
            .datagrams
            .as_ref()
            .ok_or_else(|| ProtocolError::TransportError(constants::ERR_NO_UDP_CHANNEL.into()))?;
        let frame = message.serialize(&self.pipeline)?;
        if link.enqueue(message.head_id(), frame) {
            self.metrics.datagram_shed();
        }
        Ok(())
    }

    /// Tears the connection down. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        // Pending requests observe a dropped callback
        self.replies.clear();
        self.metrics.connection_closed();
        info!(connection_id = %self.id, "Connection closed");

        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook(self.id);
        }
    }

    /// Resolves when the connection has closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("group", &self.group())
            .field("pending", &self.pending_frames())
            .field("closed", &self.is_closed())
            .finish()
    }
}
