//! Per-message branching done by a queue worker.
//!
//! | TypeID | Server                          | Client   |
//! |--------|---------------------------------|----------|
//! | >= 10  | resolve reply (own slot)        | resolve reply (own slot) |
//! | 1      | relay to the sender's group     | dispatch |
//! | 2      | hand to the `SyncSink`          | dispatch |
//! | other  | dispatch                        | dispatch |
//!
//! A TypeID >= 10 carrying the peer's slot is a request and is dispatched;
//! the handler's response keeps the TypeID so it resolves on the peer.
//!
//! A message nobody handles is answered with `false` on a server and raises
//! `ConnectionEvent::Unregistered` on a client.

use crate::protocol::dispatcher::{Dispatch, Dispatcher};
use crate::protocol::message::{Message, MessageKind};
use crate::transport::connection::{Connection, ConnectionEvent};
use crate::utils::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Which end of the link this router serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Consumer of synchronization payloads (TypeID 2)
pub trait SyncSink: Send + Sync {
    fn on_sync(&self, message: Message, connection: &Arc<Connection>);
}

/// Fan-out of broadcast messages (TypeID 1) to a sender's group
pub trait GroupRelay: Send + Sync {
    /// Sends `message` to every other member of `from`'s group.
    ///
    /// Returns how many connections it was queued on.
    fn relay(&self, message: &mut Message, from: &Arc<Connection>) -> usize;
}

/// What the router did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Replied,
    Orphan,
    Relayed(usize),
    Synced,
    SyncDropped,
    Handled,
    NotHandled,
}

pub struct Router {
    role: Role,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<ConnectionEvent>,
    sync_sink: Option<Arc<dyn SyncSink>>,
    relay: Option<Arc<dyn GroupRelay>>,
}

impl Router {
    pub fn new(
        role: Role,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            role,
            dispatcher,
            metrics,
            events,
            sync_sink: None,
            relay: None,
        }
    }

    pub fn with_sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync_sink = Some(sink);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn GroupRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn route(&self, mut message: Message, connection: &Arc<Connection>) -> Route {
        match (message.kind(), self.role) {
            (MessageKind::Reply(slot), _) if connection.replies().owns(slot) => {
                if connection.replies().resolve(message) {
                    Route::Replied
                } else {
                    self.metrics.orphan_reply();
                    debug!(connection_id = %connection.id(), slot, "Reply for unknown slot dropped");
                    Route::Orphan
                }
            }
            (MessageKind::Broadcast, Role::Server) => match &self.relay {
                Some(relay) => Route::Relayed(relay.relay(&mut message, connection)),
                None => Route::Relayed(0),
            },
            (MessageKind::Sync, Role::Server) => match &self.sync_sink {
                Some(sink) => {
                    sink.on_sync(message, connection);
                    Route::Synced
                }
                None => {
                    debug!(connection_id = %connection.id(), head_id = message.head_id(), "No sync sink; payload dropped");
                    Route::SyncDropped
                }
            },
            _ => self.dispatch(message, connection),
        }
    }

    fn dispatch(&self, message: Message, connection: &Arc<Connection>) -> Route {
        let head_id = message.head_id();
        // Built up front since the request moves into the handler
        let fallback = match self.role {
            Role::Server => Some(Message::reply_to(&message)),
            Role::Client => None,
        };

        match self.dispatcher.dispatch(message, connection) {
            Ok(Dispatch::Handled) => Route::Handled,
            Ok(Dispatch::NotHandled) => {
                self.metrics.unhandled_message();
                self.not_handled(head_id, fallback, connection);
                Route::NotHandled
            }
            Err(e) => {
                warn!(connection_id = %connection.id(), head_id, error = %e, "Dispatch failed");
                Route::NotHandled
            }
        }
    }

    fn not_handled(&self, head_id: u16, fallback: Option<Message>, connection: &Arc<Connection>) {
        match (self.role, fallback) {
            (Role::Server, Some(mut answer)) => {
                debug!(connection_id = %connection.id(), head_id, "No head action; answering false");
                let sent = answer.set(false).and_then(|answer| connection.send(answer));
                if let Err(e) = sent {
                    debug!(connection_id = %connection.id(), error = %e, "Negative reply not sent");
                }
            }
            _ => {
                debug!(connection_id = %connection.id(), head_id, "No head action registered");
                let _ = self.events.send(ConnectionEvent::Unregistered {
                    connection_id: connection.id(),
                    head_id,
                });
            }
        }
    }
}
