//! UDP session relay service
//!
//! A single receive loop demultiplexes datagrams on the server socket
//! by the client session ID the server framing extracts from each
//! packet. Every session owns a dedicated outbound socket and two
//! workers: the upstream worker drains the session's send queue toward
//! the upstream, the downstream worker relays replies back to the
//! client and evicts the session when its idle budget runs out.
//!
//! Buffer ownership is strict: a pool buffer borrowed by the receive
//! loop either transfers into the session's send queue or returns to
//! the pool on the spot; the upstream worker returns every queued
//! buffer, success or not, by dropping it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::addr::{canonicalize_client_addr, is_ipv4_or_mapped, TargetAddr};
use crate::error::{RelayError, UdpRelayError};
use crate::framing::{DatagramServer, Headroom, PacketPacker, PacketUnpacker};
use crate::io::{PacketBufferPool, PooledPacketBuffer};
use crate::route::Router;
use crate::socket::{bind_udp_outbound, listen_udp, recv_msg, send_msg, Pktinfo, UdpSocketOpts};

use super::Service;

/// Default idle budget of a NAT session.
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default capacity of each session's send queue.
pub const DEFAULT_SEND_CHANNEL_CAPACITY: usize = 1024;

/// IPv4 header length subtracted from the MTU for packet sizing.
const IPV4_HEADER_LENGTH: usize = 20;

/// IPv6 header length subtracted from the MTU for packet sizing.
const IPV6_HEADER_LENGTH: usize = 40;

/// UDP header length subtracted from the MTU for packet sizing.
const UDP_HEADER_LENGTH: usize = 8;

/// Fixed front headroom of pool buffers, sized for the largest header
/// stack any hosted codec prepends.
const FIXED_FRONT_HEADROOM: usize = 1024;

/// Fixed rear headroom of pool buffers, sized for the largest trailer
/// any hosted codec appends.
const FIXED_REAR_HEADROOM: usize = 128;

/// Pool capacity shared by the receive loop and in-flight queue items.
const PACKET_POOL_CAPACITY: usize = 1024;

/// A packet handed from the receive loop to an upstream worker.
///
/// Owning the pooled buffer transfers responsibility for returning it;
/// the worker returns it by dropping, on every path.
struct QueuedPacket {
    buf: PooledPacketBuffer,
    payload_start: usize,
    payload_len: usize,
    target_addr: TargetAddr,
}

/// The client-facing coordinates of a session.
///
/// Replaced wholesale by the receive loop on every packet (supporting
/// client source-port migration) and loaded by the downstream worker
/// per reply.
struct ClientLink {
    addr: SocketAddr,
    pktinfo: Pktinfo,
}

/// Per-session state owned by the session table.
struct SessionEntry {
    send_tx: mpsc::Sender<QueuedPacket>,
    unpacker: Box<dyn PacketUnpacker>,
    link: Arc<ArcSwap<ClientLink>>,
}

/// Configuration and collaborators shared by the relay's tasks.
struct UdpRelayShared {
    server_name: String,
    listen_addr: SocketAddr,
    mtu: usize,
    prefer_ipv6: bool,
    nat_timeout: Duration,
    send_channel_capacity: usize,
    server: Arc<dyn DatagramServer>,
    router: Arc<dyn Router>,
    pool: Arc<PacketBufferPool>,
    table: tokio::sync::Mutex<HashMap<u64, SessionEntry>>,
}

/// Live state between start and stop.
struct RunningState {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

/// A session-based relay service for UDP traffic.
///
/// Incoming packets are dispatched to NAT sessions based on the client
/// session ID.
pub struct UdpSessionRelay {
    shared: Arc<UdpRelayShared>,
    socket_opts: UdpSocketOpts,
    state: parking_lot::Mutex<Option<RunningState>>,
}

impl UdpSessionRelay {
    /// Create a UDP session relay.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_name: impl Into<String>,
        listen_addr: SocketAddr,
        socket_opts: UdpSocketOpts,
        mtu: usize,
        prefer_ipv6: bool,
        nat_timeout: Duration,
        send_channel_capacity: usize,
        server: Arc<dyn DatagramServer>,
        router: Arc<dyn Router>,
    ) -> Self {
        let packet_buf_size = mtu - IPV4_HEADER_LENGTH - UDP_HEADER_LENGTH;
        let pool = Arc::new(PacketBufferPool::new(
            PACKET_POOL_CAPACITY,
            Headroom {
                front: FIXED_FRONT_HEADROOM,
                rear: FIXED_REAR_HEADROOM,
            },
            packet_buf_size,
        ));
        Self {
            shared: Arc::new(UdpRelayShared {
                server_name: server_name.into(),
                listen_addr,
                mtu,
                prefer_ipv6,
                nat_timeout,
                send_channel_capacity,
                server,
                router,
                pool,
                table: tokio::sync::Mutex::new(HashMap::new()),
            }),
            socket_opts,
            state: parking_lot::Mutex::new(None),
        }
    }

    /// The bound listen address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|state| state.local_addr)
    }

    /// Number of live NAT sessions.
    pub async fn active_sessions(&self) -> usize {
        self.shared.table.lock().await.len()
    }

    /// The relay's packet buffer pool, for observability.
    #[must_use]
    pub fn packet_pool(&self) -> &Arc<PacketBufferPool> {
        &self.shared.pool
    }
}

impl fmt::Display for UdpSessionRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP session relay service for {}", self.shared.server_name)
    }
}

#[async_trait]
impl Service for UdpSessionRelay {
    async fn start(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(UdpRelayError::State("already started".into()).into());
        }

        let (server_conn, warning) =
            listen_udp(self.shared.listen_addr, self.socket_opts).map_err(RelayError::Socket)?;
        if let Some(w) = warning {
            warn!(
                server = %self.shared.server_name,
                listen = %self.shared.listen_addr,
                error = %w,
                "error while setting socket options on server socket"
            );
        }
        let local_addr = server_conn.local_addr().map_err(UdpRelayError::Io)?;
        let server_conn = Arc::new(server_conn);

        let (shutdown_tx, _) = broadcast::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);

        tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            server_conn,
            shutdown_tx.clone(),
            done_tx.clone(),
        ));

        *state = Some(RunningState {
            local_addr,
            shutdown_tx,
            done_tx,
            done_rx,
        });

        info!(
            server = %self.shared.server_name,
            listen = %local_addr,
            fwmark = self.socket_opts.fwmark,
            mtu = self.shared.mtu,
            "started UDP session relay service"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), RelayError> {
        let Some(state) = self.state.lock().take() else {
            return Ok(());
        };
        let RunningState {
            local_addr,
            shutdown_tx,
            done_tx,
            mut done_rx,
        } = state;

        // Wake the receive loop and every downstream worker, then wait
        // for the whole task set to drain.
        let _ = shutdown_tx.send(());
        drop(done_tx);
        while done_rx.recv().await.is_some() {}

        info!(
            server = %self.shared.server_name,
            listen = %local_addr,
            "stopped UDP session relay service"
        );
        Ok(())
    }
}

/// The single receive loop on the server socket.
async fn receive_loop(
    ctx: Arc<UdpRelayShared>,
    server_conn: Arc<UdpSocket>,
    shutdown_tx: broadcast::Sender<()>,
    done_tx: mpsc::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        let mut pkt_buf = ctx.pool.get();
        let payload_range = pkt_buf.payload_range();

        let msg = tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = recv_msg(&server_conn, &mut pkt_buf[payload_range.clone()]) => {
                match received {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(
                            server = %ctx.server_name,
                            listen = %ctx.listen_addr,
                            error = %e,
                            "failed to read packet from server socket"
                        );
                        continue;
                    }
                }
            }
        };

        let client_addr = canonicalize_client_addr(msg.src);
        let packet_start = payload_range.start;
        let packet_len = msg.len;

        let csid = match ctx
            .server
            .session_id(&pkt_buf[packet_start..packet_start + packet_len])
        {
            Ok(csid) => csid,
            Err(e) => {
                warn!(
                    server = %ctx.server_name,
                    listen = %ctx.listen_addr,
                    client = %client_addr,
                    packet_len,
                    error = %e,
                    "failed to extract session id from packet"
                );
                continue;
            }
        };

        let mut table = ctx.table.lock().await;

        let (target_addr, payload_start, payload_len) = if table.contains_key(&csid) {
            // Hit path: unpack with the session's cached unpacker and
            // refresh the client link (source-port migration).
            let entry = table.get_mut(&csid).expect("session entry exists");
            let unpacked =
                match entry
                    .unpacker
                    .unpack_in_place(&mut pkt_buf, packet_start, packet_len)
                {
                    Ok(unpacked) => unpacked,
                    Err(e) => {
                        warn!(
                            server = %ctx.server_name,
                            client = %client_addr,
                            csid,
                            packet_len,
                            error = %e,
                            "failed to unpack packet"
                        );
                        continue;
                    }
                };
            let target_addr = unpacked
                .target_addr
                .unwrap_or(TargetAddr::Socket(client_addr));

            let mut pktinfo = entry.link.load().pktinfo;
            pktinfo.merge(msg.pktinfo);
            entry.link.store(Arc::new(ClientLink {
                addr: client_addr,
                pktinfo,
            }));

            (target_addr, unpacked.payload_start, unpacked.payload_len)
        } else {
            // Miss path: authenticate the packet, route it, build the
            // session, then spawn its two workers.
            match create_session(
                &ctx,
                &server_conn,
                &shutdown_tx,
                &done_tx,
                &mut table,
                csid,
                client_addr,
                msg.pktinfo,
                &mut pkt_buf,
                packet_start,
                packet_len,
            )
            .await
            {
                Some(result) => result,
                None => continue,
            }
        };

        let entry = table.get(&csid).expect("session entry exists");
        match entry.send_tx.try_send(QueuedPacket {
            buf: pkt_buf,
            payload_start,
            payload_len,
            target_addr: target_addr.clone(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(pkt) | TrySendError::Closed(pkt)) => {
                debug!(
                    server = %ctx.server_name,
                    client = %client_addr,
                    target = %target_addr,
                    csid,
                    "dropping packet due to full send channel"
                );
                // Returns the buffer to the pool.
                drop(pkt);
            }
        }
    }
}

/// Build a NAT session for its first packet and insert it into the
/// table. Returns the unpacked target/payload on success; on failure
/// logs and returns `None` with no partial session recorded.
#[allow(clippy::too_many_arguments)]
async fn create_session(
    ctx: &Arc<UdpRelayShared>,
    server_conn: &Arc<UdpSocket>,
    shutdown_tx: &broadcast::Sender<()>,
    done_tx: &mpsc::Sender<()>,
    table: &mut HashMap<u64, SessionEntry>,
    csid: u64,
    client_addr: SocketAddr,
    pktinfo: Pktinfo,
    pkt_buf: &mut PooledPacketBuffer,
    packet_start: usize,
    packet_len: usize,
) -> Option<(TargetAddr, usize, usize)> {
    let mut unpacker = match ctx.server.new_unpacker(
        &pkt_buf[packet_start..packet_start + packet_len],
        csid,
    ) {
        Ok(unpacker) => unpacker,
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                csid,
                packet_len,
                error = %e,
                "failed to create unpacker for client session"
            );
            return None;
        }
    };

    let unpacked = match unpacker.unpack_in_place(pkt_buf, packet_start, packet_len) {
        Ok(unpacked) => unpacked,
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                csid,
                packet_len,
                error = %e,
                "failed to unpack packet"
            );
            return None;
        }
    };
    // Server unpackers almost always carry a target; the fallback is
    // the client itself.
    let target_addr = unpacked
        .target_addr
        .unwrap_or(TargetAddr::Socket(client_addr));

    let outbound = match ctx
        .router
        .route_datagram(&ctx.server_name, client_addr, &target_addr)
        .await
    {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                target = %target_addr,
                csid,
                error = %e,
                "failed to route new session"
            );
            return None;
        }
    };
    let outbound_info = outbound.info();

    let (nat_packer, nat_unpacker) = match outbound.new_session() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                target = %target_addr,
                csid,
                error = %e,
                "failed to create outbound session"
            );
            return None;
        }
    };

    let server_packer = match ctx.server.new_packer(csid) {
        Ok(packer) => packer,
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                csid,
                error = %e,
                "failed to create packer for client session"
            );
            return None;
        }
    };

    // Family hint for the wildcard bind: the fixed upstream when there
    // is one, else dual-stack.
    let bind_hint = outbound_info
        .fixed_target
        .unwrap_or_else(|| "[::]:0".parse().expect("wildcard v6"));
    let nat_conn = match bind_udp_outbound(bind_hint, outbound_info.fwmark) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!(
                server = %ctx.server_name,
                client = %client_addr,
                target = %target_addr,
                csid,
                error = %e,
                "failed to create outbound socket for new session"
            );
            return None;
        }
    };

    let max_client_packet_size = if is_ipv4_or_mapped(client_addr) {
        ctx.mtu - IPV4_HEADER_LENGTH - UDP_HEADER_LENGTH
    } else {
        ctx.mtu - IPV6_HEADER_LENGTH - UDP_HEADER_LENGTH
    };

    let (send_tx, send_rx) = mpsc::channel(ctx.send_channel_capacity);
    let link = Arc::new(ArcSwap::from_pointee(ClientLink {
        addr: client_addr,
        pktinfo,
    }));

    table.insert(
        csid,
        SessionEntry {
            send_tx,
            unpacker,
            link: Arc::clone(&link),
        },
    );

    // The idle budget is fixed at creation; the downstream worker's
    // read deadline is the only eviction mechanism.
    let deadline = Instant::now() + ctx.nat_timeout;
    let nat_packer_headroom = nat_packer.headroom();

    tokio::spawn(relay_server_conn_to_nat_conn(
        Arc::clone(ctx),
        csid,
        send_rx,
        Arc::clone(&nat_conn),
        nat_packer,
        outbound_info.fixed_target,
        done_tx.clone(),
    ));

    tokio::spawn(relay_nat_conn_to_server_conn(
        Arc::clone(ctx),
        csid,
        nat_conn,
        Arc::clone(server_conn),
        server_packer,
        nat_unpacker,
        nat_packer_headroom,
        Arc::clone(&link),
        max_client_packet_size,
        deadline,
        shutdown_tx.subscribe(),
        done_tx.clone(),
    ));

    info!(
        server = %ctx.server_name,
        listen = %ctx.listen_addr,
        client = %client_addr,
        target = %target_addr,
        csid,
        outbound_mtu = outbound_info.mtu,
        "new UDP session"
    );

    Some((target_addr, unpacked.payload_start, unpacked.payload_len))
}

/// Upstream worker: drain the session's send queue toward the upstream.
///
/// Exits when the send queue closes, which happens when the downstream
/// worker removes the session entry. The outbound socket stays open for
/// pending writes until then.
async fn relay_server_conn_to_nat_conn(
    ctx: Arc<UdpRelayShared>,
    csid: u64,
    mut send_rx: mpsc::Receiver<QueuedPacket>,
    nat_conn: Arc<UdpSocket>,
    mut packer: Box<dyn PacketPacker>,
    fixed_target: Option<SocketAddr>,
    done_tx: mpsc::Sender<()>,
) {
    let _done = done_tx;

    // When the target is a domain it is very likely constant for the
    // whole session; cache the last resolution to avoid a per-packet
    // lookup. A fixed-target outbound skips resolution entirely.
    let mut cached_target: Option<TargetAddr> = None;
    let mut cached_addr: Option<SocketAddr> = fixed_target;

    while let Some(packet) = send_rx.recv().await {
        let QueuedPacket {
            mut buf,
            payload_start,
            payload_len,
            target_addr,
        } = packet;

        let (packet_start, packet_len) =
            match packer.pack_in_place(&mut buf, &target_addr, payload_start, payload_len) {
                Ok(framed) => framed,
                Err(e) => {
                    warn!(
                        server = %ctx.server_name,
                        target = %target_addr,
                        csid,
                        error = %e,
                        "failed to pack packet"
                    );
                    continue;
                }
            };

        if fixed_target.is_none() && cached_target.as_ref() != Some(&target_addr) {
            match target_addr.resolve(ctx.prefer_ipv6).await {
                Ok(resolved) => {
                    // The outbound socket is dual-stack; IPv4 results
                    // go out in v4-mapped form.
                    cached_addr = Some(canonicalize_client_addr(resolved));
                    cached_target = Some(target_addr.clone());
                }
                Err(e) => {
                    warn!(
                        server = %ctx.server_name,
                        target = %target_addr,
                        csid,
                        error = %e,
                        "failed to resolve target address"
                    );
                    continue;
                }
            }
        }
        let Some(write_target) = cached_addr else {
            continue;
        };

        if let Err(e) = nat_conn
            .send_to(&buf[packet_start..packet_start + packet_len], write_target)
            .await
        {
            warn!(
                server = %ctx.server_name,
                target = %target_addr,
                write_target = %write_target,
                csid,
                error = %e,
                "failed to write packet to outbound socket"
            );
        }
        // `buf` drops here, returning to the pool on every path.
    }
}

/// Downstream worker: relay upstream replies back to the client.
///
/// Owns the session's idle eviction: when the read deadline passes, it
/// removes the session entry (closing the send queue, which in turn
/// stops the upstream worker) and exits.
#[allow(clippy::too_many_arguments)]
async fn relay_nat_conn_to_server_conn(
    ctx: Arc<UdpRelayShared>,
    csid: u64,
    nat_conn: Arc<UdpSocket>,
    server_conn: Arc<UdpSocket>,
    mut server_packer: Box<dyn PacketPacker>,
    mut nat_unpacker: Box<dyn PacketUnpacker>,
    nat_packer_headroom: Headroom,
    link: Arc<ArcSwap<ClientLink>>,
    max_client_packet_size: usize,
    deadline: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
    done_tx: mpsc::Sender<()>,
) {
    let _done = done_tx;

    // The scratch buffer must satisfy the server-side packer on top of
    // whatever headroom the upstream framing already consumed.
    let extra = server_packer.headroom().saturating_sub(nat_packer_headroom);
    let mut buf = vec![0u8; extra.front + max_client_packet_size + extra.rear];

    // One-entry cache for the source-address fallback.
    let mut cached_from: Option<SocketAddr> = None;
    let mut cached_target: Option<TargetAddr> = None;

    loop {
        let received = tokio::select! {
            _ = shutdown_rx.recv() => break,
            received = timeout_at(
                deadline,
                nat_conn.recv_from(&mut buf[extra.front..extra.front + max_client_packet_size]),
            ) => received,
        };

        let (n, from) = match received {
            // Idle budget exhausted: evict the session.
            Err(_elapsed) => break,
            Ok(Err(e)) => {
                warn!(
                    server = %ctx.server_name,
                    csid,
                    error = %e,
                    "failed to read packet from outbound socket"
                );
                continue;
            }
            Ok(Ok((n, from))) => (n, from),
        };

        let unpacked = match nat_unpacker.unpack_in_place(&mut buf, extra.front, n) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                warn!(
                    server = %ctx.server_name,
                    from = %from,
                    csid,
                    packet_len = n,
                    error = %e,
                    "failed to unpack packet"
                );
                continue;
            }
        };

        let target_addr = match unpacked.target_addr {
            Some(target) => target,
            None => {
                if cached_from == Some(from) {
                    cached_target.clone().expect("cached with from")
                } else {
                    let target = TargetAddr::Socket(from);
                    cached_from = Some(from);
                    cached_target = Some(target.clone());
                    target
                }
            }
        };

        let (packet_start, packet_len) = match server_packer.pack_in_place(
            &mut buf,
            &target_addr,
            unpacked.payload_start,
            unpacked.payload_len,
        ) {
            Ok(framed) => framed,
            Err(e) => {
                warn!(
                    server = %ctx.server_name,
                    target = %target_addr,
                    from = %from,
                    csid,
                    error = %e,
                    "failed to pack packet"
                );
                continue;
            }
        };

        let client = link.load();
        if let Err(e) = send_msg(
            &server_conn,
            &buf[packet_start..packet_start + packet_len],
            client.addr,
            client.pktinfo,
        )
        .await
        {
            warn!(
                server = %ctx.server_name,
                client = %client.addr,
                target = %target_addr,
                csid,
                error = %e,
                "failed to write packet to server socket"
            );
        }
    }

    // Teardown: removing the entry drops the queue's sender, which
    // stops the upstream worker; the outbound socket closes when both
    // workers have dropped their references.
    let mut table = ctx.table.lock().await;
    let removed = table.remove(&csid).is_some();
    drop(table);

    if removed {
        debug!(
            server = %ctx.server_name,
            csid,
            "UDP session closed"
        );
    }
}
