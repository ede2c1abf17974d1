//! Error types for rust-relay
//!
//! This module defines the error hierarchy for the relay engine.
//! All errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for rust-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Credential store and credential file errors
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Codec plug-in errors
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Routing oracle errors
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// TCP relay errors
    #[error("TCP relay error: {0}")]
    Tcp(#[from] TcpRelayError),

    /// UDP session relay errors
    #[error("UDP relay error: {0}")]
    Udp(#[from] UdpRelayError),

    /// Socket construction and option errors
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Credential(e) => e.is_recoverable(),
            Self::Framing(e) => e.is_recoverable(),
            Self::Route(e) => e.is_recoverable(),
            Self::Tcp(e) => e.is_recoverable(),
            Self::Udp(e) => e.is_recoverable(),
            Self::Socket(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Credential management errors
///
/// These are surfaced by the management API and name the offending
/// username and the rule violated. A failed operation never mutates
/// credential state.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Username is the empty string
    #[error("empty username")]
    EmptyUsername,

    /// uPSK length does not match the server's PSK length
    #[error("uPSK for user {username} has length {actual}, expected {expected}")]
    PskLength {
        username: String,
        actual: usize,
        expected: usize,
    },

    /// Add for a username that already exists
    #[error("user {0} already exists")]
    UserExists(String),

    /// Update/Delete for a username that does not exist
    #[error("nonexistent user: {0}")]
    NonexistentUser(String),

    /// Update with the uPSK the user already has
    #[error("user {0} already has the same uPSK")]
    UnchangedPsk(String),

    /// Two users derive the same identity hash
    #[error("duplicate uPSK for user {first} and {second}")]
    DuplicateUpsk { first: String, second: String },

    /// Server name registered twice
    #[error("server already registered: {0}")]
    ServerExists(String),

    /// Credential file could not be decoded
    #[error("failed to decode credential file: {0}")]
    Decode(String),

    /// I/O error reading or writing the credential file
    #[error("credential file I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CredentialError {
    /// Credential errors require operator intervention; only file I/O
    /// hiccups are worth retrying.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Codec plug-in errors
#[derive(Debug, Error)]
pub enum FramingError {
    /// Handshake with the client failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Packet too short or malformed for this framing
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Client identity not present in the credential store
    #[error("unknown client identity")]
    UnknownIdentity,

    /// Payload does not fit the buffer with the required headroom
    #[error("payload of {payload} bytes exceeds buffer space {space}")]
    PayloadTooLarge { payload: usize, space: usize },

    /// I/O error during handshake or framing
    #[error("framing I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    /// Framing errors are per-packet or per-connection; the relay drops
    /// the offending unit and continues.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a malformed-packet error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket(reason.into())
    }
}

/// Routing oracle errors
#[derive(Debug, Error)]
pub enum RouteError {
    /// No outbound client matches the request
    #[error("no route for target {target}")]
    NoRoute { target: String },

    /// The routing backend failed
    #[error("routing failed: {0}")]
    Backend(String),
}

impl RouteError {
    /// Routing failures affect one connection or packet only.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a no-route error
    pub fn no_route(target: impl ToString) -> Self {
        Self::NoRoute {
            target: target.to_string(),
        }
    }
}

/// TCP relay errors
#[derive(Debug, Error)]
pub enum TcpRelayError {
    /// Failed to bind the listener
    #[error("failed to bind TCP listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Relay started twice or stopped before start
    #[error("TCP relay is not in a startable/stoppable state: {0}")]
    State(String),

    /// Outbound dial failed
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// I/O error on the relay path
    #[error("TCP relay I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TcpRelayError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::State(_) => false,
            Self::Dial { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// UDP session relay errors
#[derive(Debug, Error)]
pub enum UdpRelayError {
    /// Failed to bind the server socket
    #[error("failed to bind UDP socket on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Relay started twice or stopped before start
    #[error("UDP relay is not in a startable/stoppable state: {0}")]
    State(String),

    /// Datagram was truncated by the kernel (MSG_TRUNC / MSG_CTRUNC)
    #[error("truncated datagram from {from}")]
    Truncated { from: SocketAddr },

    /// Failed to open the outbound socket for a new session
    #[error("failed to open outbound socket: {0}")]
    OutboundSocket(#[source] io::Error),

    /// I/O error on the relay path
    #[error("UDP relay I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UdpRelayError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::State(_) => false,
            Self::Truncated { .. } | Self::OutboundSocket(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Socket construction and option errors
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to create the socket
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    Option { option: String, reason: String },

    /// Failed to bind
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    /// Create a socket option error
    pub fn option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Option {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_error_names_user_and_rule() {
        let err = CredentialError::PskLength {
            username: "alice".into(),
            actual: 16,
            expected: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("16"));
        assert!(msg.contains("32"));
    }

    #[test]
    fn test_recoverability() {
        assert!(!CredentialError::EmptyUsername.is_recoverable());
        assert!(FramingError::malformed("short").is_recoverable());
        assert!(RouteError::no_route("example.com:443").is_recoverable());

        let bind = TcpRelayError::bind("127.0.0.1:8388".parse().unwrap(), "in use");
        assert!(!bind.is_recoverable());

        let top: RelayError = FramingError::UnknownIdentity.into();
        assert!(top.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::from(RouteError::no_route("10.0.0.1:53"));
        assert!(err.to_string().contains("10.0.0.1:53"));
    }
}
