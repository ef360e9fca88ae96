use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::transport::connection::Connection;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A head action: reads the request, optionally returns a response for the sender.
pub type HandlerFn =
    dyn Fn(&mut Message, &Arc<Connection>) -> Result<Option<Message>> + Send + Sync + 'static;

/// Moves a handler invocation onto a host-chosen thread or queue.
pub type Marshaller = Arc<dyn Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync + 'static>;

/// Outcome of a dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    NotHandled,
}

pub struct HeadAction {
    pub name: Cow<'static, str>,
    handler: Box<HandlerFn>,
}

impl std::fmt::Debug for HeadAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadAction").field("name", &self.name).finish()
    }
}

/// Maps HeadIDs to named handlers.
///
/// Handlers are looked up under a read lock and invoked after it is released,
/// so a handler may register further actions.
pub struct Dispatcher {
    actions: Arc<RwLock<HashMap<u16, Arc<HeadAction>>>>,
    marshaller: RwLock<Option<Marshaller>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(RwLock::new(HashMap::new())),
            marshaller: RwLock::new(None),
        }
    }

    /// Registers `handler` under `head_id`.
    ///
    /// # Errors
    /// `ProtocolError::DuplicateAction` if the HeadID is taken.
    pub fn add_head_action<F>(
        &self,
        head_id: u16,
        name: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&mut Message, &Arc<Connection>) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        let mut actions = self.actions.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        if actions.contains_key(&head_id) {
            return Err(ProtocolError::DuplicateAction(head_id));
        }

        let name = name.into();
        debug!(head_id, name = %name, "Head action registered");
        actions.insert(
            head_id,
            Arc::new(HeadAction {
                name,
                handler: Box::new(handler),
            }),
        );
        Ok(())
    }

    /// Builder-style [`Dispatcher::add_head_action`].
    pub fn with_head_action<F>(
        self,
        head_id: u16,
        name: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(&mut Message, &Arc<Connection>) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        self.add_head_action(head_id, name, handler)?;
        Ok(self)
    }

    pub fn remove_head_action(&self, head_id: u16) -> Result<bool> {
        let mut actions = self.actions.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;
        Ok(actions.remove(&head_id).is_some())
    }

    pub fn action_name(&self, head_id: u16) -> Option<String> {
        let actions = self.actions.read().ok()?;
        actions.get(&head_id).map(|a| a.name.to_string())
    }

    pub fn has_head_action(&self, head_id: u16) -> bool {
        self.actions
            .read()
            .map(|actions| actions.contains_key(&head_id))
            .unwrap_or(false)
    }

    /// Routes every future handler invocation through `marshaller`.
    pub fn set_marshaller(&self, marshaller: Marshaller) {
        if let Ok(mut slot) = self.marshaller.write() {
            *slot = Some(marshaller);
        }
    }

    pub fn clear_marshaller(&self) {
        if let Ok(mut slot) = self.marshaller.write() {
            *slot = None;
        }
    }

    /// Invokes the action registered for the message's HeadID.
    ///
    /// With a marshaller installed the invocation is handed off and this
    /// returns `Handled` immediately.
    pub fn dispatch(&self, message: Message, connection: &Arc<Connection>) -> Result<Dispatch> {
        let action = {
            let actions = self.actions.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            match actions.get(&message.head_id()) {
                Some(action) => action.clone(),
                None => return Ok(Dispatch::NotHandled),
            }
        };

        let marshaller = self.marshaller.read().ok().and_then(|m| m.clone());
        match marshaller {
            Some(marshal) => {
                let connection = connection.clone();
                marshal(Box::new(move || invoke(&action, message, &connection)));
            }
            None => invoke(&action, message, connection),
        }
        Ok(Dispatch::Handled)
    }
}

/// Runs one handler and deals with its outcome.
fn invoke(action: &HeadAction, mut message: Message, connection: &Arc<Connection>) {
    match (action.handler)(&mut message, connection) {
        Ok(Some(mut response)) => {
            if message.reply_id().is_some() {
                response.set_type_id(message.type_id());
            }
            if let Err(e) = connection.send(&mut response) {
                debug!(
                    connection_id = %connection.id(),
                    action = %action.name,
                    error = %e,
                    "Response not sent"
                );
            }
        }
        Ok(None) => {}
        Err(e) if e.is_peer_misbehaving() => {
            warn!(
                connection_id = %connection.id(),
                action = %action.name,
                error = %e,
                "Malformed request; closing connection"
            );
            connection.close();
        }
        Err(e) => {
            warn!(
                connection_id = %connection.id(),
                action = %action.name,
                error = %e,
                "Head action failed"
            );
        }
    }
}
