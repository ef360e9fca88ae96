//! UDP side-channel.
//!
//! Datagrams are unreliable state updates: for each HeadID only the newest
//! pending frame matters. `DatagramSlots` keeps at most one pending frame per
//! HeadID and hands them out oldest-first; a send task drains it one datagram
//! at a time.

use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// HeadID of the datagram a client sends so the server learns its UDP address
pub const UDP_REGISTER_HEAD: u16 = 0xFFFF;

/// Largest datagram read from the socket
pub const MAX_DATAGRAM: usize = u16::MAX as usize;

/// Latest-wins pending datagrams, at most one per HeadID
#[derive(Debug, Default)]
pub struct DatagramSlots {
    pending: HashMap<u16, Bytes>,
    order: VecDeque<u16>,
}

impl DatagramSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `frame` for `head_id`.
    ///
    /// Returns `true` if an older pending frame for the same HeadID was
    /// overwritten. The overwritten frame's queue position is kept.
    pub fn push(&mut self, head_id: u16, frame: Bytes) -> bool {
        match self.pending.insert(head_id, frame) {
            Some(_) => true,
            None => {
                self.order.push_back(head_id);
                false
            }
        }
    }

    /// Takes the oldest pending frame.
    pub fn pop(&mut self) -> Option<(u16, Bytes)> {
        while let Some(head_id) = self.order.pop_front() {
            if let Some(frame) = self.pending.remove(&head_id) {
                return Some((head_id, frame));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One connection's view of a UDP socket
#[derive(Debug)]
pub struct DatagramLink {
    socket: Arc<UdpSocket>,
    peer: RwLock<Option<SocketAddr>>,
    slots: Mutex<DatagramSlots>,
    ready: Notify,
}

impl DatagramLink {
    /// A link whose peer address is learned later from inbound datagrams.
    pub fn unbound(socket: Arc<UdpSocket>) -> Self {
        Self::new(socket, None)
    }

    pub fn new(socket: Arc<UdpSocket>, peer: Option<SocketAddr>) -> Self {
        Self {
            socket,
            peer: RwLock::new(peer),
            slots: Mutex::new(DatagramSlots::new()),
            ready: Notify::new(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    /// Records where the peer's datagrams come from.
    pub fn learn_peer(&self, addr: SocketAddr) {
        let mut peer = self.peer.write();
        if *peer != Some(addr) {
            debug!(%addr, "UDP peer address learned");
            *peer = Some(addr);
        }
        drop(peer);
        // Frames queued before the address was known can go now
        self.ready.notify_one();
    }

    /// Queues a frame; returns `true` if it replaced a pending one.
    pub fn enqueue(&self, head_id: u16, frame: Bytes) -> bool {
        let replaced = self.slots.lock().push(head_id, frame);
        self.ready.notify_one();
        replaced
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drains queued datagrams until `cancel` fires or a send fails.
    ///
    /// Returns the error that ended the loop, if any.
    pub async fn run_sender(
        &self,
        connection_id: UInt24,
        metrics: &Metrics,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.ready.notified() => {}
            }

            let Some(peer) = self.peer() else {
                trace!(connection_id = %connection_id, "UDP peer unknown; holding datagrams");
                continue;
            };

            loop {
                let next = self.slots.lock().pop();
                let Some((head_id, frame)) = next else { break };
                match self.socket.send_to(&frame, peer).await {
                    Ok(_) => metrics.datagram_sent(frame.len() as u64),
                    Err(e) => {
                        warn!(connection_id = %connection_id, head_id, error = %e, "UDP send failed");
                        return Err(ProtocolError::Io(e));
                    }
                }
            }
        }
    }
}

/// Verifies an inbound datagram really comes from the TCP peer's host.
pub fn check_source(tcp_peer: Option<SocketAddr>, from: SocketAddr) -> Result<()> {
    match tcp_peer {
        Some(peer) if peer.ip() == from.ip() => Ok(()),
        Some(_) => Err(ProtocolError::TransportError(format!(
            "datagram from {from} does not match the TCP peer"
        ))),
        None => Err(ProtocolError::TransportError(constants::ERR_UDP_PEER_UNKNOWN.into())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_wins_per_head() {
        let mut slots = DatagramSlots::new();
        assert!(!slots.push(1, Bytes::from_static(b"a1")));
        assert!(!slots.push(2, Bytes::from_static(b"b1")));
        assert!(slots.push(1, Bytes::from_static(b"a2")));
        assert_eq!(slots.len(), 2);

        assert_eq!(slots.pop(), Some((1, Bytes::from_static(b"a2"))));
        assert_eq!(slots.pop(), Some((2, Bytes::from_static(b"b1"))));
        assert_eq!(slots.pop(), None);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_source_check() {
        let tcp: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        assert!(check_source(Some(tcp), "10.0.0.5:5123".parse().unwrap()).is_ok());
        assert!(check_source(Some(tcp), "10.0.0.6:5123".parse().unwrap()).is_err());
        assert!(check_source(None, "10.0.0.5:5123".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_sender_delivers_latest_frame() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = DatagramLink::new(a, Some(b.local_addr().unwrap()));

        assert!(!link.enqueue(7, Bytes::from_static(b"old")));
        assert!(link.enqueue(7, Bytes::from_static(b"new")));

        let metrics = Metrics::new();
        let cancel = CancellationToken::new();
        let sender = async {
            let _ = link.run_sender(UInt24::ZERO, &metrics, &cancel).await;
        };
        let receiver = async {
            let mut buf = [0u8; 16];
            let (n, _) = b.recv_from(&mut buf).await.unwrap();
            cancel.cancel();
            buf[..n].to_vec()
        };
        let ((), got) = tokio::join!(sender, receiver);
        assert_eq!(got, b"new");
        assert_eq!(metrics.snapshot().datagrams_sent, 1);
    }
}
