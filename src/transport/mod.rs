//! # Transport Layer
//!
//! Sockets and the tasks that drive them.
//!
//! - **Connection**: one admitted TCP socket, its reader and writer tasks
//! - **Datagram**: the latest-wins UDP side-channel
//! - **Server**: accept loop, connection registry and group relay
//! - **Client**: outbound connect with its own worker queue

pub mod client;
pub mod connection;
pub mod datagram;
pub mod server;
