//! TCP relay end-to-end scenarios

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use rust_relay::{
    Service, StaticRouter, StreamClient, TargetAddr, TcpConnCloser, TcpRelay,
};

use super::common::{
    lp_frame, tcp_sink_server, HoldStreamServer, LpStreamServer, RecordingStreamClient,
    RejectStreamServer,
};

fn relay_with(
    server: Arc<dyn rust_relay::StreamServer>,
    client: Arc<dyn StreamClient>,
    wait_for_initial_payload: bool,
    conn_closer: Option<TcpConnCloser>,
) -> TcpRelay {
    TcpRelay::new(
        "tcp-test",
        "127.0.0.1:0".parse().unwrap(),
        rust_relay::socket::TcpListenerOpts::default(),
        wait_for_initial_payload,
        server,
        conn_closer,
        Arc::new(StaticRouter::new(Some(client), None)),
    )
}

async fn wait_for_sink(sink: &parking_lot::Mutex<Vec<u8>>, expected_len: usize) {
    for _ in 0..100 {
        if sink.lock().len() >= expected_len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "sink never reached {expected_len} bytes (has {})",
        sink.lock().len()
    );
}

#[tokio::test]
async fn framed_payload_reaches_upstream_unframed() {
    let (upstream, sink) = tcp_sink_server().await;

    let client = Arc::new(RecordingStreamClient::new(false));
    let dials = client.dials();
    let relay = relay_with(
        Arc::new(LpStreamServer::new(TargetAddr::Socket(upstream))),
        client,
        false,
        None,
    );
    relay.start().await.unwrap();

    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    conn.write_all(&lp_frame(b"hello world")).await.unwrap();

    wait_for_sink(&sink, 11).await;
    assert_eq!(sink.lock().as_slice(), b"hello world");

    // No initial-payload window was configured, so the dial carried
    // nothing.
    assert_eq!(dials.lock().as_slice(), &[Vec::<u8>::new()]);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn initial_payload_rides_the_dial() {
    let (upstream, sink) = tcp_sink_server().await;

    let client = Arc::new(RecordingStreamClient::new(true));
    let dials = client.dials();
    let relay = relay_with(
        Arc::new(LpStreamServer::new(TargetAddr::Socket(upstream))),
        client,
        true,
        None,
    );
    relay.start().await.unwrap();

    let payload = vec![0x42u8; 100];
    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    // First bytes arrive well inside the wait window.
    conn.write_all(&lp_frame(&payload)).await.unwrap();
    conn.write_all(&lp_frame(b"more")).await.unwrap();

    wait_for_sink(&sink, 104).await;

    let recorded = dials.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0], payload, "first 100 bytes must ride the dial");
    drop(recorded);

    let got = sink.lock().clone();
    assert_eq!(&got[..100], payload.as_slice());
    assert_eq!(&got[100..], b"more");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn initial_payload_wait_times_out_and_dials_empty() {
    let (upstream, sink) = tcp_sink_server().await;

    let client = Arc::new(RecordingStreamClient::new(true));
    let dials = client.dials();
    let relay = relay_with(
        Arc::new(LpStreamServer::new(TargetAddr::Socket(upstream))),
        client,
        true,
        None,
    );
    relay.start().await.unwrap();

    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();

    // Stay silent past the 250ms window, then send.
    tokio::time::sleep(Duration::from_millis(400)).await;
    conn.write_all(&lp_frame(b"late")).await.unwrap();

    wait_for_sink(&sink, 4).await;
    assert_eq!(sink.lock().as_slice(), b"late");

    let recorded = dials.lock();
    assert_eq!(recorded.len(), 1);
    assert!(
        recorded[0].is_empty(),
        "dial after the window must carry an empty payload"
    );

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn udp_associate_hold_keeps_socket_open_without_dialing() {
    let client = Arc::new(RecordingStreamClient::new(false));
    let dials = client.dials();
    let relay = relay_with(Arc::new(HoldStreamServer), client, false, None);
    relay.start().await.unwrap();

    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();

    // The relay holds the socket open: nothing to read for a while.
    let mut byte = [0u8; 1];
    let read = timeout(Duration::from_millis(200), conn.read(&mut byte)).await;
    assert!(read.is_err(), "socket must stay open during the hold");

    // Peer close ends the handler without errors or dials.
    conn.shutdown().await.unwrap();
    drop(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(dials.lock().is_empty(), "hold must never dial outbound");
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn failed_handshake_just_closes() {
    let client = Arc::new(RecordingStreamClient::new(false));
    let dials = client.dials();
    let relay = relay_with(Arc::new(RejectStreamServer), client, false, None);
    relay.start().await.unwrap();

    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), conn.read(&mut buf))
        .await
        .expect("close must arrive promptly")
        .unwrap();
    assert_eq!(n, 0, "JustClose writes nothing before closing");
    assert!(dials.lock().is_empty());

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn failed_handshake_can_reply_socks5_error() {
    let client = Arc::new(RecordingStreamClient::new(false));
    let relay = relay_with(
        Arc::new(RejectStreamServer),
        client,
        false,
        Some(TcpConnCloser::ReplySocks5),
    );
    relay.start().await.unwrap();

    let mut conn = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    let mut buf = Vec::new();
    timeout(Duration::from_secs(1), conn.read_to_end(&mut buf))
        .await
        .expect("close must arrive promptly")
        .unwrap();
    assert_eq!(buf, [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    relay.stop().await.unwrap();
}
