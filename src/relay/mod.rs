//! Relay services
//!
//! The TCP and UDP relay state machines, plus the uniform lifecycle
//! contract every long-running component of the engine implements.

mod tcp;
mod udp;

pub use tcp::TcpRelay;
pub use udp::{UdpSessionRelay, DEFAULT_NAT_TIMEOUT, DEFAULT_SEND_CHANNEL_CAPACITY};

use std::fmt;

use async_trait::async_trait;

use crate::error::RelayError;

/// Uniform lifecycle contract for the engine's long-running components.
///
/// `start` is non-blocking: it binds sockets and spawns the service's
/// tasks, then returns. `stop` is synchronous in effect and idempotent:
/// when it returns, the service's tasks have observed the shutdown
/// signal and drained.
#[async_trait]
pub trait Service: Send + Sync + fmt::Display {
    /// Start the service.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the service cannot bind or is already
    /// running.
    async fn start(&self) -> Result<(), RelayError>;

    /// Stop the service and wait for its tasks to drain.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] only for misuse; a stopped or never
    /// started service stops cleanly.
    async fn stop(&self) -> Result<(), RelayError>;
}
