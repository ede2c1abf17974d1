//! Two-way zero-copy stream relay
//!
//! Runs the two directional copies of an established TCP relay
//! concurrently until either side reaches EOF or fails, then shuts the
//! peer's write half down so the other direction terminates too.
//! Every direction owns one buffer sized for the larger of the two
//! codecs' headroom requirements, so payloads are framed and unframed
//! in place with no intermediate copies.

use std::io;

use tracing::debug;

use crate::framing::{FramedRead, FramedStream, FramedWrite};

/// Default payload space per relay direction (32KB)
pub const DEFAULT_PAYLOAD_BUFFER_SIZE: usize = 32 * 1024;

/// Byte totals of a completed two-way relay
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayResult {
    /// Bytes relayed from the client toward the remote
    pub client_to_remote: u64,
    /// Bytes relayed from the remote toward the client
    pub remote_to_client: u64,
}

impl RelayResult {
    /// Total bytes relayed in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_remote + self.remote_to_client
    }
}

/// Relay payload between two framed streams until both directions end.
///
/// Returns the byte totals together with the first error either
/// direction encountered; EOF and peer shutdown are normal completions,
/// not errors.
pub async fn two_way_relay(
    client: Box<dyn FramedStream>,
    remote: Box<dyn FramedStream>,
) -> (RelayResult, Option<io::Error>) {
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();
    two_way_relay_split(client_read, client_write, remote_read, remote_write).await
}

/// [`two_way_relay`] over already-split halves.
///
/// The TCP relay splits the client stream early so the initial-payload
/// window can read from it before the outbound dial.
pub async fn two_way_relay_split(
    client_read: Box<dyn FramedRead>,
    client_write: Box<dyn FramedWrite>,
    remote_read: Box<dyn FramedRead>,
    remote_write: Box<dyn FramedWrite>,
) -> (RelayResult, Option<io::Error>) {
    let (client_to_remote, remote_to_client) = tokio::join!(
        copy_one_direction(client_read, remote_write),
        copy_one_direction(remote_read, client_write),
    );

    let (nl2r, err_l2r) = client_to_remote;
    let (nr2l, err_r2l) = remote_to_client;

    (
        RelayResult {
            client_to_remote: nl2r,
            remote_to_client: nr2l,
        },
        err_l2r.or(err_r2l),
    )
}

/// Copy one direction until EOF or error, then shut the writer down.
async fn copy_one_direction(
    mut reader: Box<dyn FramedRead>,
    mut writer: Box<dyn FramedWrite>,
) -> (u64, Option<io::Error>) {
    let headroom = reader.headroom().max(writer.headroom());
    let payload_space = reader
        .min_payload_buffer_size_per_read()
        .max(DEFAULT_PAYLOAD_BUFFER_SIZE);
    let mut buf = vec![0u8; headroom.front + payload_space + headroom.rear];

    let mut total: u64 = 0;
    let mut first_error = None;

    loop {
        let n = match reader
            .read_zero_copy(&mut buf, headroom.front, payload_space)
            .await
        {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                first_error = Some(e);
                break;
            }
        };

        if let Err(e) = writer.write_zero_copy(&mut buf, headroom.front, n).await {
            first_error = Some(e);
            break;
        }

        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "shutdown after one-way copy failed");
    }

    (total, first_error)
}
