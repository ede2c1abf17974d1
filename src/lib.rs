//! rust-relay: session-based Shadowsocks relay engine
//!
//! This crate provides the relay core of a Shadowsocks-family proxy:
//! it accepts local TCP and UDP client traffic on configured listeners,
//! drives the protocol handshake and cryptographic (un)framing through
//! pluggable codecs, selects an outbound client via a routing oracle,
//! and relays payload between the client-facing and upstream sockets.
//!
//! # Architecture
//!
//! ```text
//! TCP:  accept → handshake (StreamServer) → route → [initial-payload wait]
//!           → dial (StreamClient) → two-way zero-copy relay
//!
//! UDP:  recv → session lookup by client session ID → send queue
//!           → upstream worker (pack → natConn)
//!           ← downstream worker (natConn → unpack → repack → client)
//! ```
//!
//! Wire framings (Shadowsocks 2022, SOCKS5, HTTP, "none") are plug-ins
//! behind the [`framing`] traits; the relay core never interprets packet
//! bytes, it only honors the headroom contracts so codecs can prepend
//! and append headers in place.
//!
//! # Modules
//!
//! - [`addr`]: Target addresses and client-address canonicalization
//! - [`cred`]: Live-updatable credential stores with disk persistence
//! - [`error`]: Error types
//! - [`framing`]: Codec plug-in traits and the direct (passthrough) framing
//! - [`io`]: Packet buffer pool and the two-way stream relay
//! - [`relay`]: The TCP and UDP relay services
//! - [`route`]: Routing oracle trait
//! - [`socket`]: Socket construction and control-message plumbing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod addr;
pub mod cred;
pub mod error;
pub mod framing;
pub mod io;
pub mod relay;
pub mod route;
pub mod socket;

// Re-export commonly used types at the crate root
pub use addr::{canonicalize_client_addr, TargetAddr};
pub use cred::{
    identity_hash, CredStore, IdentityHash, ManagedServer, Manager, UserCipherConfig,
    UserCredential, UserLookupMap, IDENTITY_HASH_LENGTH,
};
pub use error::{
    CredentialError, FramingError, RelayError, RouteError, SocketError, TcpRelayError,
    UdpRelayError,
};
pub use framing::{
    AcceptError, DatagramClient, DatagramClientInfo, DatagramServer, FramedRead, FramedStream,
    FramedWrite, Headroom, PacketPacker, PacketUnpacker, StreamAccept, StreamClient,
    StreamClientInfo, StreamServer, StreamServerInfo, TcpConnCloser, UnpackedPacket,
};
pub use io::{two_way_relay, PacketBufferPool, PooledPacketBuffer, RelayResult};
pub use relay::{Service, TcpRelay, UdpSessionRelay};
pub use route::{Router, StaticRouter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
