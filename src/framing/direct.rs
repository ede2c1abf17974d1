//! Direct (passthrough) framing
//!
//! The trivial codec for plain TCP/UDP upstreams: no handshake, no
//! headers, zero headroom. The direct stream server fronts a fixed
//! target (client-side tunnel mode); the direct clients dial and send
//! to concrete upstreams. Also the reference implementation the relay
//! tests exercise.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{
    AcceptError, DatagramClient, DatagramClientInfo, FramedRead, FramedStream, FramedWrite,
    Headroom, PacketPacker, PacketUnpacker, StreamAccept, StreamClient, StreamClientInfo,
    StreamServer, StreamServerInfo, TcpConnCloser, UnpackedPacket,
};
use crate::addr::TargetAddr;
use crate::error::FramingError;
use crate::socket::{dial_tcp, TcpDialerOpts};

/// A plain TCP stream behind the framed interface.
pub struct DirectFramedStream {
    stream: TcpStream,
}

impl DirectFramedStream {
    /// Wrap an established TCP stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl FramedStream for DirectFramedStream {
    fn headroom(&self) -> Headroom {
        Headroom::NONE
    }

    fn into_split(self: Box<Self>) -> (Box<dyn FramedRead>, Box<dyn FramedWrite>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(DirectReadHalf { read }),
            Box::new(DirectWriteHalf { write }),
        )
    }
}

/// Read half of a [`DirectFramedStream`].
pub struct DirectReadHalf {
    read: OwnedReadHalf,
}

#[async_trait]
impl FramedRead for DirectReadHalf {
    fn headroom(&self) -> Headroom {
        Headroom::NONE
    }

    async fn read_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_space: usize,
    ) -> io::Result<usize> {
        self.read
            .read(&mut buf[payload_start..payload_start + payload_space])
            .await
    }
}

/// Write half of a [`DirectFramedStream`].
pub struct DirectWriteHalf {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FramedWrite for DirectWriteHalf {
    fn headroom(&self) -> Headroom {
        Headroom::NONE
    }

    async fn write_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_len: usize,
    ) -> io::Result<usize> {
        self.write
            .write_all(&buf[payload_start..payload_start + payload_len])
            .await?;
        Ok(payload_len)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }
}

/// Client-side tunnel server: every accepted connection goes to one
/// fixed target with no handshake.
pub struct DirectStreamServer {
    target: TargetAddr,
}

impl DirectStreamServer {
    /// Create a tunnel server for a fixed target.
    #[must_use]
    pub fn new(target: TargetAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl StreamServer for DirectStreamServer {
    fn info(&self) -> StreamServerInfo {
        StreamServerInfo {
            native_initial_payload: false,
            default_conn_closer: TcpConnCloser::JustClose,
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<StreamAccept, AcceptError> {
        Ok(StreamAccept {
            stream: Box::new(DirectFramedStream::new(stream)),
            target_addr: self.target.clone(),
            initial_payload: Vec::new(),
            username: None,
        })
    }
}

/// Direct outbound client: dials the target itself.
pub struct DirectStreamClient {
    name: String,
    opts: TcpDialerOpts,
    prefer_ipv6: bool,
}

impl DirectStreamClient {
    /// Create a direct outbound client.
    #[must_use]
    pub fn new(name: impl Into<String>, opts: TcpDialerOpts, prefer_ipv6: bool) -> Self {
        Self {
            name: name.into(),
            opts,
            prefer_ipv6,
        }
    }
}

#[async_trait]
impl StreamClient for DirectStreamClient {
    fn info(&self) -> StreamClientInfo {
        StreamClientInfo {
            name: self.name.clone(),
            // With TFO the first write rides the SYN, so handing the
            // dial an initial payload is the native fast path.
            native_initial_payload: self.opts.fastopen,
        }
    }

    async fn dial(
        &self,
        target: &TargetAddr,
        initial_payload: &[u8],
    ) -> io::Result<Box<dyn FramedStream>> {
        let addr = target.resolve(self.prefer_ipv6).await?;
        let mut stream = dial_tcp(addr, self.opts).await?;
        if !initial_payload.is_empty() {
            stream.write_all(initial_payload).await?;
        }
        Ok(Box::new(DirectFramedStream::new(stream)))
    }
}

/// Direct outbound datagram client: passthrough packets to one upstream.
pub struct DirectDatagramClient {
    target: SocketAddr,
    mtu: usize,
    fwmark: u32,
}

impl DirectDatagramClient {
    /// Create a direct datagram client for a fixed upstream.
    #[must_use]
    pub const fn new(target: SocketAddr, mtu: usize, fwmark: u32) -> Self {
        Self {
            target,
            mtu,
            fwmark,
        }
    }
}

impl DatagramClient for DirectDatagramClient {
    fn info(&self) -> DatagramClientInfo {
        DatagramClientInfo {
            fixed_target: Some(self.target),
            mtu: self.mtu,
            fwmark: self.fwmark,
        }
    }

    fn new_session(&self) -> Result<(Box<dyn PacketPacker>, Box<dyn PacketUnpacker>), FramingError>
    {
        Ok((
            Box::new(DirectPacketPacker),
            Box::new(DirectPacketUnpacker),
        ))
    }
}

/// Passthrough packer: the payload already is the packet.
pub struct DirectPacketPacker;

impl PacketPacker for DirectPacketPacker {
    fn headroom(&self) -> Headroom {
        Headroom::NONE
    }

    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        _target: &TargetAddr,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(usize, usize), FramingError> {
        if payload_start + payload_len > buf.len() {
            return Err(FramingError::PayloadTooLarge {
                payload: payload_len,
                space: buf.len().saturating_sub(payload_start),
            });
        }
        Ok((payload_start, payload_len))
    }
}

/// Passthrough unpacker: the packet already is the payload.
pub struct DirectPacketUnpacker;

impl PacketUnpacker for DirectPacketUnpacker {
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        packet_start: usize,
        packet_len: usize,
    ) -> Result<UnpackedPacket, FramingError> {
        if packet_start + packet_len > buf.len() {
            return Err(FramingError::malformed("packet exceeds buffer"));
        }
        Ok(UnpackedPacket {
            target_addr: None,
            payload_start: packet_start,
            payload_len: packet_len,
        })
    }
}
