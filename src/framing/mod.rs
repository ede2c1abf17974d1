//! Codec plug-in abstraction
//!
//! Wire framings (Shadowsocks 2022, SOCKS5, HTTP CONNECT, "none") plug
//! into the relay core through the traits in this module. The core
//! never interprets packet bytes; it honors each codec's headroom
//! contract so headers can be prepended and appended without copying.
//!
//! Stream framings perform a handshake in [`StreamServer::accept`] /
//! [`StreamClient::dial`] and then expose zero-copy reads and writes
//! over a [`FramedStream`]. Datagram framings are stateless per packet
//! on the session-ID path ([`DatagramServer::session_id`]) and carry
//! per-session cipher state in their packers and unpackers.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::addr::TargetAddr;
use crate::error::FramingError;

pub mod direct;

/// Buffer space a codec reserves before and after the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Headroom {
    /// Bytes reserved in front of the payload for headers
    pub front: usize,
    /// Bytes reserved behind the payload for trailers/tags
    pub rear: usize,
}

impl Headroom {
    /// No reserved space; the passthrough codec's headroom.
    pub const NONE: Self = Self { front: 0, rear: 0 };

    /// Componentwise maximum of two headrooms.
    ///
    /// A buffer shared by two codecs must satisfy the larger of the two
    /// requirements on each side.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            front: self.front.max(other.front),
            rear: self.rear.max(other.rear),
        }
    }

    /// The positive difference `self - other`, floored at zero per side.
    ///
    /// This is the extra space a buffer already sized for `other` needs
    /// to also satisfy `self`.
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            front: self.front.saturating_sub(other.front),
            rear: self.rear.saturating_sub(other.rear),
        }
    }
}

/// Static properties of a stream server codec.
#[derive(Debug, Clone, Copy)]
pub struct StreamServerInfo {
    /// Whether the handshake itself can surface initial payload bytes
    pub native_initial_payload: bool,
    /// How to dispose of a client socket after a failed handshake
    pub default_conn_closer: TcpConnCloser,
}

/// Static properties of a stream client codec.
#[derive(Debug, Clone)]
pub struct StreamClientInfo {
    /// Outbound client name, used in logs
    pub name: String,
    /// Whether [`StreamClient::dial`] embeds caller-provided bytes in
    /// its handshake instead of requiring a separate write
    pub native_initial_payload: bool,
}

/// Successful stream handshake result.
pub struct StreamAccept {
    /// The framed stream carrying the rest of the connection
    pub stream: Box<dyn FramedStream>,
    /// Target address the client asked for
    pub target_addr: TargetAddr,
    /// Payload bytes the handshake already buffered (may be empty)
    pub initial_payload: Vec<u8>,
    /// Authenticated username, when the codec identifies users
    pub username: Option<String>,
}

impl fmt::Debug for StreamAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAccept")
            .field("target_addr", &self.target_addr)
            .field("initial_payload_len", &self.initial_payload.len())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Stream handshake failure modes.
///
/// The raw socket travels back inside the error so the caller can keep
/// it open (hold) or hand it to the conn-closer (protocol failure).
#[derive(Debug)]
pub enum AcceptError {
    /// SOCKS5 UDP ASSOCIATE: keep the TCP socket open but idle until
    /// the peer closes it. Not a failure.
    UdpAssociateHold(TcpStream),
    /// The handshake failed; the conn-closer decides what the client
    /// sees before the socket goes away.
    Protocol {
        /// The raw socket, if the codec can still hand it back
        stream: Option<TcpStream>,
        /// What went wrong
        source: FramingError,
    },
}

impl AcceptError {
    /// Wrap a framing error with its socket for the conn-closer.
    #[must_use]
    pub fn protocol(stream: TcpStream, source: FramingError) -> Self {
        Self::Protocol {
            stream: Some(stream),
            source,
        }
    }
}

/// Server side of a stream framing: handshakes accepted connections.
#[async_trait]
pub trait StreamServer: Send + Sync {
    /// Static codec properties.
    fn info(&self) -> StreamServerInfo;

    /// Perform the protocol handshake on an accepted connection.
    ///
    /// May consume arbitrary bytes. On success the returned
    /// [`StreamAccept`] owns the socket inside its framed stream.
    ///
    /// # Errors
    ///
    /// [`AcceptError::UdpAssociateHold`] asks the caller to keep the
    /// socket open but idle; [`AcceptError::Protocol`] is a real
    /// handshake failure.
    async fn accept(&self, stream: TcpStream) -> Result<StreamAccept, AcceptError>;
}

/// Client side of a stream framing: dials upstream connections.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Static codec properties.
    fn info(&self) -> StreamClientInfo;

    /// Dial the upstream for `target`, carrying `initial_payload` inside
    /// the handshake when the codec supports that natively, otherwise
    /// writing it immediately after.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the dial or handshake fails.
    async fn dial(
        &self,
        target: &TargetAddr,
        initial_payload: &[u8],
    ) -> io::Result<Box<dyn FramedStream>>;
}

/// A handshaken stream with zero-copy framing.
pub trait FramedStream: Send {
    /// Headroom this codec needs around every payload.
    fn headroom(&self) -> Headroom;

    /// Minimum payload space a read buffer must offer, or 0 when the
    /// codec has no such requirement.
    fn min_payload_buffer_size_per_read(&self) -> usize {
        0
    }

    /// Split into independently owned read and write halves so the two
    /// relay directions can run concurrently.
    fn into_split(self: Box<Self>) -> (Box<dyn FramedRead>, Box<dyn FramedWrite>);
}

/// Read half of a [`FramedStream`].
#[async_trait]
pub trait FramedRead: Send {
    /// Headroom requirement of this half.
    fn headroom(&self) -> Headroom;

    /// Minimum payload space a read buffer must offer.
    fn min_payload_buffer_size_per_read(&self) -> usize {
        0
    }

    /// Read one unit of payload into `buf[payload_start..payload_start
    /// + payload_space]`, using the surrounding headroom for in-place
    /// unframing. Returns the payload length; 0 means EOF.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the read or the unframing fails.
    async fn read_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_space: usize,
    ) -> io::Result<usize>;
}

/// Write half of a [`FramedStream`].
#[async_trait]
pub trait FramedWrite: Send {
    /// Headroom requirement of this half.
    fn headroom(&self) -> Headroom;

    /// Frame and write the payload at `buf[payload_start..payload_start
    /// + payload_len]` in place, using the surrounding headroom.
    /// Returns the payload length written.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the framing or the write fails.
    async fn write_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_len: usize,
    ) -> io::Result<usize>;

    /// Flush and close the write direction.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the shutdown fails.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// What a failed TCP handshake leaves behind on the wire.
///
/// Some deployments prefer a synthetic error response over a bare
/// close, so probes see a plausible server rather than a proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TcpConnCloser {
    /// Close the socket without writing anything
    #[default]
    JustClose,
    /// Write a minimal HTTP 403 response, then close
    ReplyHttp403,
    /// Write a SOCKS5 general-failure reply, then close
    ReplySocks5,
}

impl TcpConnCloser {
    /// Dispose of a client socket after a failed handshake.
    pub async fn close(self, stream: Option<TcpStream>, client_addr: SocketAddr) {
        let Some(mut stream) = stream else { return };

        let reply: &[u8] = match self {
            Self::JustClose => {
                return;
            }
            Self::ReplyHttp403 => {
                b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
            }
            Self::ReplySocks5 => &[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0],
        };

        if let Err(e) = stream.write_all(reply).await {
            debug!(client = %client_addr, error = %e, "failed to write close reply");
        }
        let _ = stream.shutdown().await;
    }
}

/// Static properties of a datagram client codec.
#[derive(Debug, Clone, Copy)]
pub struct DatagramClientInfo {
    /// When set, every packet of the session goes to this upstream
    /// address and the per-packet target rides inside the framing
    /// instead of steering the socket
    pub fixed_target: Option<SocketAddr>,
    /// MTU of the upstream path
    pub mtu: usize,
    /// Firewall mark for the session's outbound socket (0 = unset)
    pub fwmark: u32,
}

/// Server side of a datagram framing.
pub trait DatagramServer: Send + Sync {
    /// Extract the 64-bit client session ID from a packet.
    ///
    /// Must work on any packet of a session without per-session state.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if the packet is too short or opaque.
    fn session_id(&self, packet: &[u8]) -> Result<u64, FramingError>;

    /// Create the unpacker for a new client session, keyed by its first
    /// packet.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if the packet does not authenticate.
    fn new_unpacker(&self, packet: &[u8], csid: u64)
        -> Result<Box<dyn PacketUnpacker>, FramingError>;

    /// Create the packer that frames replies toward this client session.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if session state cannot be derived.
    fn new_packer(&self, csid: u64) -> Result<Box<dyn PacketPacker>, FramingError>;
}

/// Client side of a datagram framing.
pub trait DatagramClient: Send + Sync {
    /// Static codec properties.
    fn info(&self) -> DatagramClientInfo;

    /// Create the packer/unpacker pair for a new upstream session.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if session state cannot be derived.
    fn new_session(&self) -> Result<(Box<dyn PacketPacker>, Box<dyn PacketUnpacker>), FramingError>;
}

/// Frames datagram payloads in place.
pub trait PacketPacker: Send {
    /// Headroom this packer needs around every payload.
    fn headroom(&self) -> Headroom;

    /// Frame the payload at `buf[payload_start..payload_start +
    /// payload_len]` in place, writing headers into the headroom.
    /// Returns `(packet_start, packet_len)` of the framed packet.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if the payload does not fit the buffer
    /// with the required headroom.
    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        target: &TargetAddr,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(usize, usize), FramingError>;
}

/// Result of unframing one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedPacket {
    /// Target address carried in the framing, when it carries one
    pub target_addr: Option<TargetAddr>,
    /// Payload start offset within the buffer
    pub payload_start: usize,
    /// Payload length
    pub payload_len: usize,
}

/// Unframes datagrams in place.
pub trait PacketUnpacker: Send {
    /// Unframe the packet at `buf[packet_start..packet_start +
    /// packet_len]` in place.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError`] if authentication or decoding fails.
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        packet_start: usize,
        packet_len: usize,
    ) -> Result<UnpackedPacket, FramingError>;
}
