//! Admission handshake run once per accepted TCP connection.
//!
//! ```text
//! server -> client   i32 r1, i32 r2        (8 bytes LE)
//! client -> server   i32 mix_key(r1, r2)   (4 bytes LE)
//! server -> client   connection id         (3 or 4 bytes LE, success only)
//! ```
//!
//! The exchange proves the peer speaks this protocol; it is not authentication.
//! A wrong key or an expired deadline ends with the socket closed and nothing
//! sent back.
//!
//! Handshake state is per session: each accepted socket gets its own
//! `ServerHandshake`, so concurrent admissions never share state.

use crate::core::uint24::UInt24;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Bytes of the server challenge
pub const CHALLENGE_LEN: usize = 8;
/// Bytes of the client response
pub const RESPONSE_LEN: usize = 4;

/// How the assigned id is written at the end of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdWidth {
    #[default]
    Three,
    Four,
}

impl IdWidth {
    pub const fn len(self) -> usize {
        match self {
            IdWidth::Three => 3,
            IdWidth::Four => 4,
        }
    }

    pub fn encode(self, id: UInt24) -> Vec<u8> {
        match self {
            IdWidth::Three => id.to_le_bytes().to_vec(),
            IdWidth::Four => id.get().to_le_bytes().to_vec(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<UInt24> {
        match (self, bytes) {
            (IdWidth::Three, [a, b, c]) => Ok(UInt24::from_le_bytes([*a, *b, *c])),
            (IdWidth::Four, [a, b, c, d]) => UInt24::new(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => Err(ProtocolError::HandshakeError(format!(
                "expected {} id bytes, got {}",
                self.len(),
                bytes.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingChallengeSent,
    AwaitingClientKey,
    Validating,
    Accepted,
    Rejected,
}

/// Derives the handshake key from the two challenge values.
///
/// Combines them with a sign-dependent wrapping add/sub, then runs three
/// rounds of byte mixing where each byte absorbs its neighbour modulo 256.
/// Deterministic and cheap; it only has to agree on both ends.
pub fn mix_key(r1: i32, r2: i32) -> i32 {
    let seed = if r1 >= 0 {
        r1.wrapping_add(r2)
    } else {
        r1.wrapping_sub(r2)
    };

    let mut bytes = seed.to_le_bytes();
    for round in 0..3u8 {
        for i in 0..4 {
            let neighbour = bytes[(i + 1) % 4];
            let salt = round.wrapping_mul(0x3B).wrapping_add(i as u8);
            bytes[i] = bytes[i]
                .wrapping_mul(31)
                .wrapping_add(neighbour ^ salt)
                .rotate_left(3);
        }
    }
    i32::from_le_bytes(bytes)
}

/// Client half: answers a challenge.
pub fn respond(challenge: [u8; CHALLENGE_LEN]) -> [u8; RESPONSE_LEN] {
    let r1 = i32::from_le_bytes([challenge[0], challenge[1], challenge[2], challenge[3]]);
    let r2 = i32::from_le_bytes([challenge[4], challenge[5], challenge[6], challenge[7]]);
    mix_key(r1, r2).to_le_bytes()
}

/// Server-side handshake state for one socket
#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    r1: i32,
    r2: i32,
    key: i32,
    deadline: Instant,
}

impl ServerHandshake {
    /// Draws a fresh challenge.
    pub fn new(timeout: Duration) -> Self {
        Self::with_challenge(rand::random(), rand::random(), timeout)
    }

    pub fn with_challenge(r1: i32, r2: i32, timeout: Duration) -> Self {
        Self {
            state: HandshakeState::AwaitingChallengeSent,
            r1,
            r2,
            key: mix_key(r1, r2),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Bytes to send; moves to `AwaitingClientKey`.
    pub fn challenge(&mut self) -> [u8; CHALLENGE_LEN] {
        let mut out = [0u8; CHALLENGE_LEN];
        out[..4].copy_from_slice(&self.r1.to_le_bytes());
        out[4..].copy_from_slice(&self.r2.to_le_bytes());
        self.state = HandshakeState::AwaitingClientKey;
        out
    }

    /// Checks the client's key; ends in `Accepted` or `Rejected`.
    pub fn validate(&mut self, response: [u8; RESPONSE_LEN]) -> HandshakeState {
        let challenged = self.state == HandshakeState::AwaitingClientKey;
        self.state = HandshakeState::Validating;
        let accepted = challenged
            && !self.is_expired()
            && i32::from_le_bytes(response) == self.key;
        self.state = if accepted {
            HandshakeState::Accepted
        } else {
            HandshakeState::Rejected
        };
        self.state
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Runs the server side of the handshake on `stream`.
///
/// `allocate` is called only once the key checks out; its id is sent to the
/// client and returned.
///
/// # Errors
/// - `ProtocolError::HandshakeRejected` on a wrong key
/// - `ProtocolError::Timeout` if the exchange outlives `timeout`
/// - `ProtocolError::Io` on socket failure
#[instrument(skip(stream, allocate))]
pub async fn server_handshake<S, F>(
    stream: &mut S,
    timeout: Duration,
    width: IdWidth,
    allocate: F,
) -> Result<UInt24>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce() -> Result<UInt24>,
{
    let mut handshake = ServerHandshake::new(timeout);
    let challenge = handshake.challenge();

    let exchange = async {
        stream.write_all(&challenge).await?;
        stream.flush().await?;

        let mut response = [0u8; RESPONSE_LEN];
        stream.read_exact(&mut response).await?;
        Ok::<_, ProtocolError>(response)
    };
    let response = with_timeout_error(exchange, timeout).await?;

    if handshake.validate(response) != HandshakeState::Accepted {
        warn!("Handshake rejected: wrong key");
        return Err(ProtocolError::HandshakeRejected);
    }

    let id = allocate()?;
    with_timeout_error(
        async {
            stream.write_all(&width.encode(id)).await?;
            stream.flush().await?;
            Ok::<_, ProtocolError>(())
        },
        handshake.remaining(),
    )
    .await?;

    debug!(connection_id = %id, "Handshake accepted");
    Ok(id)
}

/// Runs the client side of the handshake and returns the assigned id.
///
/// A rejected client sees the socket close before an id arrives, reported as
/// `ProtocolError::HandshakeError`.
#[instrument(skip(stream))]
pub async fn client_handshake<S>(stream: &mut S, timeout: Duration, width: IdWidth) -> Result<UInt24>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let mut challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await?;

        stream.write_all(&respond(challenge)).await?;
        stream.flush().await?;

        let mut id = [0u8; 4];
        let id = &mut id[..width.len()];
        stream.read_exact(id).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::HandshakeError(constants::ERR_KEY_MISMATCH.into())
            } else {
                ProtocolError::Io(e)
            }
        })?;
        width.decode(id)
    };

    let id = with_timeout_error(exchange, timeout).await?;
    debug!(connection_id = %id, "Handshake complete");
    Ok(id)
}
