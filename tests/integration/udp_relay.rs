//! UDP session relay end-to-end scenarios

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use rust_relay::framing::direct::DirectDatagramClient;
use rust_relay::{
    DatagramServer, FramingError, Headroom, PacketPacker, PacketUnpacker, Service, StaticRouter,
    TargetAddr, UdpSessionRelay, UnpackedPacket,
};

use super::common::udp_echo_server;

/// Mask applied to payloads on the client-facing side.
const MASK: u8 = 0x5A;

/// Trailer the masked codec appends behind each reply payload.
const TRAILER: [u8; 2] = [0xEE, 0xFF];

/// A client-facing datagram codec that exercises both headrooms:
/// packets are `[8-byte csid][payload ^ MASK]`, and replies grow a
/// 2-byte trailer behind the payload.
struct MaskDatagramServer;

struct MaskUnpacker;

struct MaskPacker {
    csid: u64,
}

impl DatagramServer for MaskDatagramServer {
    fn session_id(&self, packet: &[u8]) -> Result<u64, FramingError> {
        let prefix = packet
            .get(..8)
            .ok_or_else(|| FramingError::malformed("packet shorter than session id"))?;
        Ok(u64::from_be_bytes(prefix.try_into().unwrap()))
    }

    fn new_unpacker(
        &self,
        _packet: &[u8],
        _csid: u64,
    ) -> Result<Box<dyn PacketUnpacker>, FramingError> {
        Ok(Box::new(MaskUnpacker))
    }

    fn new_packer(&self, csid: u64) -> Result<Box<dyn PacketPacker>, FramingError> {
        Ok(Box::new(MaskPacker { csid }))
    }
}

impl PacketUnpacker for MaskUnpacker {
    fn unpack_in_place(
        &mut self,
        buf: &mut [u8],
        packet_start: usize,
        packet_len: usize,
    ) -> Result<UnpackedPacket, FramingError> {
        if packet_len < 8 {
            return Err(FramingError::malformed("packet shorter than session id"));
        }
        let payload_start = packet_start + 8;
        let payload_len = packet_len - 8;
        for byte in &mut buf[payload_start..payload_start + payload_len] {
            *byte ^= MASK;
        }
        Ok(UnpackedPacket {
            target_addr: None,
            payload_start,
            payload_len,
        })
    }
}

impl PacketPacker for MaskPacker {
    fn headroom(&self) -> Headroom {
        Headroom { front: 8, rear: 2 }
    }

    fn pack_in_place(
        &mut self,
        buf: &mut [u8],
        _target: &TargetAddr,
        payload_start: usize,
        payload_len: usize,
    ) -> Result<(usize, usize), FramingError> {
        let packet_start = payload_start
            .checked_sub(8)
            .ok_or(FramingError::PayloadTooLarge {
                payload: payload_len,
                space: payload_start,
            })?;
        let end = payload_start + payload_len;
        if end + 2 > buf.len() {
            return Err(FramingError::PayloadTooLarge {
                payload: payload_len,
                space: buf.len() - payload_start,
            });
        }
        buf[packet_start..payload_start].copy_from_slice(&self.csid.to_be_bytes());
        for byte in &mut buf[payload_start..end] {
            *byte ^= MASK;
        }
        buf[end..end + 2].copy_from_slice(&TRAILER);
        Ok((packet_start, payload_len + 8 + 2))
    }
}

fn mask_frame(csid: u64, payload: &[u8]) -> Vec<u8> {
    let mut packet = csid.to_be_bytes().to_vec();
    packet.extend(payload.iter().map(|b| b ^ MASK));
    packet
}

fn mask_reply(csid: u64, payload: &[u8]) -> Vec<u8> {
    let mut packet = mask_frame(csid, payload);
    packet.extend_from_slice(&TRAILER);
    packet
}

fn masked_relay(
    upstream: SocketAddr,
    nat_timeout: Duration,
    send_channel_capacity: usize,
) -> UdpSessionRelay {
    let client = Arc::new(DirectDatagramClient::new(upstream, 1500, 0));
    UdpSessionRelay::new(
        "udp-test",
        "127.0.0.1:0".parse().unwrap(),
        rust_relay::socket::UdpSocketOpts::default(),
        1500,
        false,
        nat_timeout,
        send_channel_capacity,
        Arc::new(MaskDatagramServer),
        Arc::new(StaticRouter::new(None, Some(client))),
    )
}

#[tokio::test]
async fn masked_round_trip_exercises_both_headrooms() {
    let upstream = udp_echo_server().await;
    let relay = masked_relay(upstream, Duration::from_secs(300), 1024);
    relay.start().await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&mask_frame(0xABCD, b"sensitive"), relay_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(from, relay_addr);
    // The echo comes back masked again, with the codec's trailer.
    assert_eq!(&buf[..n], mask_reply(0xABCD, b"sensitive").as_slice());

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn client_port_migration_redirects_replies() {
    let upstream = udp_echo_server().await;
    let relay = masked_relay(upstream, Duration::from_secs(300), 1024);
    relay.start().await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first
        .send_to(&mask_frame(7, b"from-first"), relay_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    first.recv_from(&mut buf).await.unwrap();

    // Same session id from a different source port: the session must
    // follow the client, not spawn a second one.
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second
        .send_to(&mask_frame(7, b"from-second"), relay_addr)
        .await
        .unwrap();
    let (n, _) = second.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], mask_reply(7, b"from-second").as_slice());

    assert_eq!(relay.active_sessions().await, 1);
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn idle_session_evicted_then_recreated() {
    let upstream = udp_echo_server().await;
    let relay = masked_relay(upstream, Duration::from_millis(150), 1024);
    relay.start().await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&mask_frame(0xABCD, b"one"), relay_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    client.recv_from(&mut buf).await.unwrap();
    assert_eq!(relay.active_sessions().await, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(relay.active_sessions().await, 0, "idle session must vanish");

    client
        .send_to(&mask_frame(0xABCD, b"two"), relay_addr)
        .await
        .unwrap();
    let (n, _) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], mask_reply(0xABCD, b"two").as_slice());
    assert_eq!(relay.active_sessions().await, 1, "fresh session expected");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn flood_does_not_wedge_the_receive_loop() {
    let upstream = udp_echo_server().await;
    // Tiny send queue: a burst must overflow it, and overflow must
    // only cost packets, never the receive loop.
    let relay = masked_relay(upstream, Duration::from_secs(300), 2);
    relay.start().await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..200u16 {
        client
            .send_to(&mask_frame(1, &i.to_be_bytes()), relay_addr)
            .await
            .unwrap();
    }

    // Still exactly one session, and other sessions still work.
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe
        .send_to(&mask_frame(2, b"probe"), relay_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    let reply = timeout(Duration::from_secs(2), probe.recv_from(&mut buf)).await;
    let (n, _) = reply.expect("receive loop must stay responsive").unwrap();
    assert_eq!(&buf[..n], mask_reply(2, b"probe").as_slice());
    assert_eq!(relay.active_sessions().await, 2);

    relay.stop().await.unwrap();

    // Every borrowed buffer found its way back: nothing is in flight
    // after stop, so allocations equal pool returns plus full-pool
    // drops.
    let stats = relay.packet_pool().stats().snapshot();
    assert_eq!(stats.allocations + stats.reuses, stats.returns + stats.drops);
}

#[tokio::test]
async fn malformed_packets_cost_nothing_but_themselves() {
    let upstream = udp_echo_server().await;
    let relay = masked_relay(upstream, Duration::from_secs(300), 1024);
    relay.start().await.unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"short", relay_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.active_sessions().await, 0);

    client
        .send_to(&mask_frame(3, b"fine"), relay_addr)
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    let (n, _) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], mask_reply(3, b"fine").as_slice());

    relay.stop().await.unwrap();
}
