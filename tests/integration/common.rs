//! Shared test doubles for the relay integration tests
//!
//! A length-prefixed stream codec that actually uses front headroom,
//! a recording outbound client for observing dial payloads, and a
//! hold-sentinel server framing.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use rust_relay::{
    AcceptError, FramedRead, FramedStream, FramedWrite, Headroom, StreamAccept, StreamClient,
    StreamClientInfo, StreamServer, StreamServerInfo, TargetAddr, TcpConnCloser,
};

/// Length-prefixed stream codec: each payload unit is a 4-byte
/// big-endian length followed by the bytes. The length header lives in
/// the codec's front headroom, so framing happens in place.
pub struct LpFramedStream {
    stream: TcpStream,
}

impl LpFramedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

pub const LP_HEADROOM: Headroom = Headroom { front: 4, rear: 0 };

impl FramedStream for LpFramedStream {
    fn headroom(&self) -> Headroom {
        LP_HEADROOM
    }

    fn into_split(self: Box<Self>) -> (Box<dyn FramedRead>, Box<dyn FramedWrite>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(LpReadHalf { read }),
            Box::new(LpWriteHalf { write }),
        )
    }
}

pub struct LpReadHalf {
    read: OwnedReadHalf,
}

#[async_trait]
impl FramedRead for LpReadHalf {
    fn headroom(&self) -> Headroom {
        LP_HEADROOM
    }

    async fn read_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_space: usize,
    ) -> io::Result<usize> {
        // Read the length header into the front headroom.
        let header_start = payload_start - 4;
        let mut filled = 0;
        while filled < 4 {
            let n = self
                .read
                .read(&mut buf[header_start + filled..payload_start])
                .await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(0);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside length header",
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(buf[header_start..payload_start].try_into().unwrap()) as usize;
        if len > payload_space {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds payload space",
            ));
        }
        self.read
            .read_exact(&mut buf[payload_start..payload_start + len])
            .await?;
        Ok(len)
    }
}

pub struct LpWriteHalf {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FramedWrite for LpWriteHalf {
    fn headroom(&self) -> Headroom {
        LP_HEADROOM
    }

    async fn write_zero_copy(
        &mut self,
        buf: &mut [u8],
        payload_start: usize,
        payload_len: usize,
    ) -> io::Result<usize> {
        let header_start = payload_start - 4;
        let len = u32::try_from(payload_len).unwrap();
        buf[header_start..payload_start].copy_from_slice(&len.to_be_bytes());
        self.write
            .write_all(&buf[header_start..payload_start + payload_len])
            .await?;
        Ok(payload_len)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.write.shutdown().await
    }
}

/// Frame one payload the way [`LpFramedStream`] expects it on the wire.
pub fn lp_frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = (u32::try_from(payload.len()).unwrap())
        .to_be_bytes()
        .to_vec();
    framed.extend_from_slice(payload);
    framed
}

/// Server framing speaking the length-prefixed codec toward a fixed
/// target, surfacing no initial payload of its own.
pub struct LpStreamServer {
    target: TargetAddr,
}

impl LpStreamServer {
    pub fn new(target: TargetAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl StreamServer for LpStreamServer {
    fn info(&self) -> StreamServerInfo {
        StreamServerInfo {
            native_initial_payload: false,
            default_conn_closer: TcpConnCloser::JustClose,
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<StreamAccept, AcceptError> {
        Ok(StreamAccept {
            stream: Box::new(LpFramedStream::new(stream)),
            target_addr: self.target.clone(),
            initial_payload: Vec::new(),
            username: None,
        })
    }
}

/// Server framing that always asks for the UDP-associate hold.
pub struct HoldStreamServer;

#[async_trait]
impl StreamServer for HoldStreamServer {
    fn info(&self) -> StreamServerInfo {
        StreamServerInfo {
            native_initial_payload: false,
            default_conn_closer: TcpConnCloser::JustClose,
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<StreamAccept, AcceptError> {
        Err(AcceptError::UdpAssociateHold(stream))
    }
}

/// Server framing that always fails its handshake.
pub struct RejectStreamServer;

#[async_trait]
impl StreamServer for RejectStreamServer {
    fn info(&self) -> StreamServerInfo {
        StreamServerInfo {
            native_initial_payload: false,
            default_conn_closer: TcpConnCloser::JustClose,
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<StreamAccept, AcceptError> {
        Err(AcceptError::protocol(
            stream,
            rust_relay::FramingError::Handshake("bad header".into()),
        ))
    }
}

/// A direct-dialing outbound client that records every initial payload
/// it is handed, with a configurable native-initial-payload flag.
pub struct RecordingStreamClient {
    native_initial_payload: bool,
    dials: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingStreamClient {
    pub fn new(native_initial_payload: bool) -> Self {
        Self {
            native_initial_payload,
            dials: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Initial payloads passed to [`StreamClient::dial`], in order.
    pub fn dials(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.dials)
    }
}

#[async_trait]
impl StreamClient for RecordingStreamClient {
    fn info(&self) -> StreamClientInfo {
        StreamClientInfo {
            name: "recording".into(),
            native_initial_payload: self.native_initial_payload,
        }
    }

    async fn dial(
        &self,
        target: &TargetAddr,
        initial_payload: &[u8],
    ) -> io::Result<Box<dyn FramedStream>> {
        self.dials.lock().push(initial_payload.to_vec());

        let addr = target.resolve(false).await?;
        let mut stream = TcpStream::connect(addr).await?;
        if !initial_payload.is_empty() {
            stream.write_all(initial_payload).await?;
        }
        Ok(Box::new(rust_relay::framing::direct::DirectFramedStream::new(stream)))
    }
}

/// Spawn a TCP server that copies everything it receives into a shared
/// sink, one accepted connection at a time.
pub async fn tcp_sink_server() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let task_sink = Arc::clone(&sink);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let sink = Arc::clone(&task_sink);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    sink.lock().extend_from_slice(&buf[..n]);
                }
            });
        }
    });

    (addr, sink)
}

/// Spawn a UDP echo server.
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}
