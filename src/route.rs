//! Routing oracle
//!
//! The relays ask a single oracle for the outbound client to use for
//! each connection or NAT session. Routing policy (rules, DNS, GeoIP,
//! access lists) lives behind this trait; the relay core treats the
//! returned client as opaque.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::addr::TargetAddr;
use crate::error::RouteError;
use crate::framing::{DatagramClient, StreamClient};

/// Selects outbound clients for relay traffic.
///
/// Implementations must be safe to call concurrently from every relay
/// task.
#[async_trait]
pub trait Router: Send + Sync {
    /// Select the outbound client for a stream connection.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if no outbound matches; the relay closes
    /// the client connection.
    async fn route_stream(
        &self,
        server: &str,
        client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<Arc<dyn StreamClient>, RouteError>;

    /// Select the outbound client for a new datagram session.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if no outbound matches; the relay drops
    /// the packet.
    async fn route_datagram(
        &self,
        server: &str,
        client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<Arc<dyn DatagramClient>, RouteError>;
}

/// The degenerate router: every request goes to one fixed pair of
/// outbound clients.
pub struct StaticRouter {
    stream: Option<Arc<dyn StreamClient>>,
    datagram: Option<Arc<dyn DatagramClient>>,
}

impl StaticRouter {
    /// Create a router that always returns the given clients.
    #[must_use]
    pub fn new(
        stream: Option<Arc<dyn StreamClient>>,
        datagram: Option<Arc<dyn DatagramClient>>,
    ) -> Self {
        Self { stream, datagram }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route_stream(
        &self,
        _server: &str,
        _client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<Arc<dyn StreamClient>, RouteError> {
        self.stream
            .clone()
            .ok_or_else(|| RouteError::no_route(target))
    }

    async fn route_datagram(
        &self,
        _server: &str,
        _client: SocketAddr,
        target: &TargetAddr,
    ) -> Result<Arc<dyn DatagramClient>, RouteError> {
        self.datagram
            .clone()
            .ok_or_else(|| RouteError::no_route(target))
    }
}
