//! Timeout constants and async timeout wrappers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Deadline for the admission handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for connection attempts
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a graceful shutdown drain
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an async request waits for its reply
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Awaits `fut`, mapping an elapsed deadline to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
