//! Capability traits the embedding application implements.
//!
//! The DHT core never owns a socket: it consumes streams, peer metadata and
//! connection events through the seams defined here, so the transport stack
//! (and its test double) stays replaceable.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Host`] | open streams, probe reachability, register the inbound handler |
//! | [`PeerRepository`] | resolve a [`PeerId`] to its known [`PeerInfo`] |
//! | [`AddressRepository`] | record learned and failed addresses |
//! | [`StreamHandler`] | the inbound seam the DHT itself implements |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::core::PeerId;
use crate::protocol::Connectedness;

/// A transport address in the host's own format. The DHT treats it as an
/// opaque token: it only stores, forwards, and compares them.
pub type Multiaddr = String;

/// Address TTL for peers pinned by the embedder (bootstrap peers, self).
pub const ADDRESS_TTL_PERMANENT: Duration = Duration::MAX;

/// Address TTL for peers learned through the protocol.
pub const ADDRESS_TTL_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A peer identity together with its known addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// Connection lifecycle events published by the host.
#[derive(Clone, Debug)]
pub enum HostEvent {
    /// A connection was established. `initiator` is true for outbound.
    NewConnection { peer: PeerInfo, initiator: bool },
    /// The last connection to a peer was closed.
    PeerDisconnected(PeerId),
}

/// An ordered, reliable duplex byte stream.
///
/// Anything that reads and writes asynchronously qualifies; the host decides
/// what actually backs it (a multiplexed QUIC stream, a TCP connection, an
/// in-memory pipe in tests).
pub trait DhtStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DhtStream for T {}

/// Receiver of inbound streams for a registered protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Take ownership of an inbound stream from `remote`.
    async fn handle_stream(&self, remote: PeerId, stream: Box<dyn DhtStream>);
}

/// Write access to the host's address book.
pub trait AddressRepository: Send + Sync {
    /// Insert or refresh addresses for a peer with the given TTL.
    fn upsert_addresses(
        &self,
        peer: &PeerId,
        addresses: &[Multiaddr],
        ttl: Duration,
    ) -> anyhow::Result<()>;

    /// Note that dialing `addr` failed, so the host can demote or drop it.
    fn dial_failed(&self, peer: &PeerId, addr: &Multiaddr);
}

/// Read access to the host's peer metadata.
pub trait PeerRepository: Send + Sync {
    /// Everything known about a peer. An unknown peer yields a `PeerInfo`
    /// with no addresses.
    fn peer_info(&self, peer: &PeerId) -> PeerInfo;

    fn address_repository(&self) -> Arc<dyn AddressRepository>;
}

/// The host abstraction the DHT runs on.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Identity and addresses of the local node.
    fn local_peer(&self) -> PeerInfo;

    fn peer_repository(&self) -> Arc<dyn PeerRepository>;

    /// Open an outbound stream to `peer`, negotiating one of `protocols`.
    async fn new_stream(
        &self,
        peer: &PeerInfo,
        protocols: &[String],
    ) -> anyhow::Result<Box<dyn DhtStream>>;

    /// The host's judgement of whether `peer` is reachable.
    async fn connectedness(&self, peer: &PeerInfo) -> Connectedness;

    /// Route inbound streams for `protocols` to `handler`. Registering again
    /// replaces the previous handler.
    fn set_protocol_handler(&self, protocols: &[String], handler: Arc<dyn StreamHandler>);

    /// Subscribe to connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}
