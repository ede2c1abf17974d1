//! TCP relay service
//!
//! Accepts client connections, drives the server framing's handshake,
//! routes to an outbound client, optionally waits briefly for the first
//! client payload so it can ride the outbound handshake, dials, and
//! runs the two-way zero-copy relay until either side closes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::addr::canonicalize_client_addr;
use crate::error::{RelayError, TcpRelayError};
use crate::framing::{AcceptError, StreamServer, TcpConnCloser};
use crate::io::two_way_relay_split;
use crate::route::Router;
use crate::socket::{listen_tcp, TcpListenerOpts};

use super::Service;

/// Fallback payload space for the initial-payload wait when the codec
/// declares no minimum.
const INITIAL_PAYLOAD_WAIT_BUFFER_SIZE: usize = 1280;

/// How long to wait for the first client payload before dialing anyway.
const INITIAL_PAYLOAD_WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// Configuration and collaborators shared by every connection handler.
struct TcpRelayShared {
    server_name: String,
    listen_addr: SocketAddr,
    wait_for_initial_payload: bool,
    server: Arc<dyn StreamServer>,
    conn_closer: TcpConnCloser,
    router: Arc<dyn Router>,
}

/// Live state between start and stop.
struct RunningState {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// A relay service for TCP traffic.
///
/// When started, the relay accepts incoming TCP connections on the
/// server, and dispatches them to an outbound client selected by the
/// router.
pub struct TcpRelay {
    shared: Arc<TcpRelayShared>,
    listener_opts: TcpListenerOpts,
    state: Mutex<Option<RunningState>>,
}

impl TcpRelay {
    /// Create a TCP relay.
    ///
    /// `conn_closer` overrides the server framing's default disposal of
    /// failed handshakes. `wait_for_initial_payload` enables the
    /// initial-payload window for outbound clients that can embed it in
    /// their own handshake.
    #[must_use]
    pub fn new(
        server_name: impl Into<String>,
        listen_addr: SocketAddr,
        listener_opts: TcpListenerOpts,
        wait_for_initial_payload: bool,
        server: Arc<dyn StreamServer>,
        conn_closer: Option<TcpConnCloser>,
        router: Arc<dyn Router>,
    ) -> Self {
        let conn_closer = conn_closer.unwrap_or(server.info().default_conn_closer);
        Self {
            shared: Arc::new(TcpRelayShared {
                server_name: server_name.into(),
                listen_addr,
                wait_for_initial_payload,
                server,
                conn_closer,
                router,
            }),
            listener_opts,
            state: Mutex::new(None),
        }
    }

    /// The bound listen address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|state| state.local_addr)
    }
}

impl fmt::Display for TcpRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCP relay service for {}", self.shared.server_name)
    }
}

#[async_trait]
impl Service for TcpRelay {
    async fn start(&self) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(TcpRelayError::State("already started".into()).into());
        }

        let listener = listen_tcp(self.shared.listen_addr, self.listener_opts)
            .map_err(RelayError::Socket)?;
        let local_addr = listener.local_addr().map_err(TcpRelayError::Io)?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let shared = Arc::clone(&self.shared);

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, client_addr)) => {
                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move {
                                    handle_conn(shared, stream, client_addr).await;
                                });
                            }
                            Err(e) => {
                                warn!(
                                    server = %shared.server_name,
                                    listen = %shared.listen_addr,
                                    error = %e,
                                    "failed to accept TCP connection"
                                );
                            }
                        }
                    }
                }
            }
        });

        *state = Some(RunningState {
            local_addr,
            shutdown_tx,
            accept_task,
        });

        info!(
            server = %self.shared.server_name,
            listen = %local_addr,
            fwmark = self.listener_opts.fwmark,
            fastopen = self.listener_opts.fastopen,
            "started TCP relay service"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), RelayError> {
        let Some(state) = self.state.lock().take() else {
            return Ok(());
        };
        // Closing the listener is the shutdown signal; in-flight
        // connections drain naturally.
        let _ = state.shutdown_tx.send(());
        let _ = state.accept_task.await;

        info!(
            server = %self.shared.server_name,
            listen = %state.local_addr,
            "stopped TCP relay service"
        );
        Ok(())
    }
}

/// Handle one accepted TCP connection through handshake, routing, the
/// initial-payload window, the outbound dial, and the two-way relay.
async fn handle_conn(shared: Arc<TcpRelayShared>, stream: TcpStream, client_addr: SocketAddr) {
    let client_addr = canonicalize_client_addr(client_addr);

    // Handshake.
    let accept = match shared.server.accept(stream).await {
        Ok(accept) => accept,
        Err(AcceptError::UdpAssociateHold(mut stream)) => {
            debug!(
                server = %shared.server_name,
                client = %client_addr,
                "keeping TCP connection open for UDP association"
            );
            // Idle until the peer closes; one byte of data also ends
            // the hold.
            let mut byte = [0u8; 1];
            if let Err(e) = stream.read(&mut byte).await {
                warn!(
                    server = %shared.server_name,
                    client = %client_addr,
                    error = %e,
                    "error while holding connection open"
                );
            }
            return;
        }
        Err(AcceptError::Protocol { stream, source }) => {
            warn!(
                server = %shared.server_name,
                listen = %shared.listen_addr,
                client = %client_addr,
                error = %source,
                "failed to complete handshake with client"
            );
            shared.conn_closer.close(stream, client_addr).await;
            return;
        }
    };

    let target_addr = accept.target_addr;
    let mut initial_payload = accept.initial_payload;

    // Route.
    let outbound = match shared
        .router
        .route_stream(&shared.server_name, client_addr, &target_addr)
        .await
    {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!(
                server = %shared.server_name,
                client = %client_addr,
                target = %target_addr,
                error = %e,
                "failed to route client connection"
            );
            return;
        }
    };

    let (mut client_read, client_write) = accept.stream.into_split();

    // Initial-payload window: when the outbound handshake can carry the
    // first client bytes natively and the server handshake did not
    // already surface any, wait briefly for them.
    if shared.wait_for_initial_payload
        && initial_payload.is_empty()
        && outbound.info().native_initial_payload
    {
        let headroom = client_read.headroom();
        let payload_space = client_read
            .min_payload_buffer_size_per_read()
            .max(INITIAL_PAYLOAD_WAIT_BUFFER_SIZE);
        let mut buf = vec![0u8; headroom.front + payload_space + headroom.rear];

        match timeout(
            INITIAL_PAYLOAD_WAIT_TIMEOUT,
            client_read.read_zero_copy(&mut buf, headroom.front, payload_space),
        )
        .await
        {
            Ok(Ok(n)) => {
                debug!(
                    server = %shared.server_name,
                    client = %client_addr,
                    target = %target_addr,
                    payload_len = n,
                    "got initial payload"
                );
                buf.truncate(headroom.front + n);
                buf.drain(..headroom.front);
                initial_payload = buf;
            }
            Ok(Err(e)) => {
                warn!(
                    server = %shared.server_name,
                    client = %client_addr,
                    target = %target_addr,
                    error = %e,
                    "failed to read initial payload"
                );
                return;
            }
            Err(_elapsed) => {
                debug!(
                    server = %shared.server_name,
                    client = %client_addr,
                    target = %target_addr,
                    "initial payload wait timed out"
                );
            }
        }
    }

    // Dial.
    let remote = match outbound.dial(&target_addr, &initial_payload).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(
                server = %shared.server_name,
                client = %client_addr,
                target = %target_addr,
                payload_len = initial_payload.len(),
                error = %e,
                "failed to create remote connection"
            );
            return;
        }
    };
    let (remote_read, remote_write) = remote.into_split();

    // Two-way relay.
    let (result, err) =
        two_way_relay_split(client_read, client_write, remote_read, remote_write).await;
    if let Some(e) = err {
        warn!(
            server = %shared.server_name,
            client = %client_addr,
            target = %target_addr,
            nl2r = result.client_to_remote,
            nr2l = result.remote_to_client,
            error = %e,
            "two-way relay failed"
        );
        return;
    }

    info!(
        server = %shared.server_name,
        client = %client_addr,
        target = %target_addr,
        nl2r = result.client_to_remote,
        nr2l = result.remote_to_client,
        "two-way relay completed"
    );
}
