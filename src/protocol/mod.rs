//! # Protocol Layer
//!
//! Messages, the codec pipeline, the admission handshake and everything a
//! worker does with a received message.
//!
//! ## Components
//! - **Message**: header plus ordered blocks, packing and unpacking
//! - **Pipeline**: encryption then compression, behind an outer length
//! - **Handshake**: the random-challenge admission exchange
//! - **Dispatcher**: HeadID to named head action
//! - **Reply**: per-connection request/response correlation
//! - **Queue**: worker queues with shortest-queue selection
//! - **Router**: reply, broadcast, sync or dispatch for each message

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod reply;
pub mod router;
