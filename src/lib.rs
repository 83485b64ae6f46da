//! # kadstream
//!
//! A Kademlia-style distributed hash table (DHT) core designed to be embedded
//! in a peer-to-peer networking stack. The crate owns the routing and storage
//! logic and speaks a length-delimited request/response protocol over streams
//! supplied by a [`Host`] implementation; it never touches sockets itself.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: identifiers and the XOR metric, the k-bucket
//!   [`PeerRoutingTable`], the provider index [`ContentRoutingTable`], and
//!   the validator-gated record [`Storage`].
//! - [`protocol`]: the serialisable wire messages exchanged between peers.
//! - [`framing`]: varint length-prefixed frames so messages can be carried
//!   over any ordered byte stream.
//! - [`host`]: the capability traits the embedding application implements to
//!   provide transport, peer metadata, and connection events.
//! - [`session`]: the per-stream request/response state machine.
//! - [`lookup`]: the iterative α-parallel lookup executors.
//! - [`node`]: the [`Dht`] facade tying everything together.
//!
//! ## Getting started
//!
//! The embedder supplies a [`Host`] and (optionally) a [`Validator`], builds
//! a [`Dht`], and starts it:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kadstream::{Config, Dht, Host};
//!
//! # async fn launch(host: Arc<dyn Host>) -> Result<(), kadstream::Error> {
//! let dht = Dht::new(Config::default(), host);
//! dht.start().await;
//!
//! dht.put_value(b"cat".to_vec(), vec![1, 2, 3]).await?;
//! let value = dht.get_value(b"cat").await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```
//!
//! Inbound streams negotiated with one of the configured protocol ids are
//! handed to the `Dht` by the host; everything else (connection management,
//! stream multiplexing, security) stays on the host's side of the seam.

pub mod core;
pub mod framing;
pub mod host;
pub mod lookup;
pub mod node;
pub mod protocol;
pub mod session;

pub use crate::core::{
    AcceptAllValidator, Config, ContentRoutingTable, Key, NodeId, PeerId, PeerRoutingTable,
    ProviderEvent, RandomWalkConfig, RoutingEvent, Storage, UpdateOutcome, Validator,
};
pub use crate::host::{
    AddressRepository, DhtStream, Host, HostEvent, Multiaddr, PeerInfo, PeerRepository,
    StreamHandler,
};
pub use crate::node::{Dht, DhtStats};
pub use crate::protocol::{Connectedness, Message, MessageType, Record};

/// Errors surfaced by the user-facing DHT operations.
///
/// Per-hop transport and decode failures are handled inside the lookup
/// machinery and never surface here; an error from the public API means the
/// operation as a whole could not be satisfied.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No matching record, peer, or provider was found.
    #[error("not found")]
    NotFound,
    /// The validator rejected a record.
    #[error("record validation failed: {0}")]
    ValidationFailed(String),
    /// A request did not complete within its timeout.
    #[error("request timed out")]
    Timeout,
    /// The peer could not be dialed.
    #[error("peer unreachable")]
    Unreachable,
    /// An inbound or outbound message could not be decoded.
    #[error("wire error: {0}")]
    WireError(String),
    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
    /// The DHT has not been started yet.
    #[error("node not started")]
    NotStarted,
    /// A routing bucket refused an insert.
    #[error("bucket full")]
    Full,
}
