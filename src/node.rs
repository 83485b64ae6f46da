//! The [`Dht`] facade: ties the routing tables, storage, sessions, and
//! lookup executors together on top of a [`Host`].
//!
//! `Dht::start` registers the protocol handler, subscribes to the host's
//! connection events, starts the provider sweep, and (if configured) the
//! background random walk. All subscriptions and background tasks hold only
//! a [`Weak`] reference back to the node, so dropping the last [`Dht`]
//! handle winds everything down.
//!
//! ## Inbound dispatch
//!
//! | Message | Behaviour |
//! |---------|-----------|
//! | PutValue | validate the record, store it, echo the message |
//! | GetValue | attach known providers and the stored record, reply |
//! | AddProvider | record self-attributed providers, no reply |
//! | GetProviders | attach providers and nearest peers, reply |
//! | FindNode | absorb then drop caller addresses, attach nearest peers, reply |
//! | Ping | clear the body, reply |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::core::{
    AcceptAllValidator, Config, ContentRoutingTable, Key, NodeId, PeerId, PeerRoutingTable,
    ProviderEvent, RoutingEvent, Storage, UpdateOutcome, Validator,
};
use crate::host::{
    DhtStream, Host, HostEvent, PeerInfo, StreamHandler, ADDRESS_TTL_DAY, ADDRESS_TTL_PERMANENT,
};
use crate::lookup::{self, LookupContext};
use crate::protocol::{unix_expiry_string, Connectedness, Message, MessagePeer, MessageType, Record};
use crate::session::Session;
use crate::Error;

/// Distinct valid records required before a value lookup settles.
const GET_VALUE_QUORUM: usize = 1;

/// How often expired provider entries are collected.
const PROVIDER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct DhtStats {
    /// Peers across all routing buckets.
    pub routing_table_size: usize,
    /// Resident records in storage.
    pub stored_records: usize,
    /// Live (key, provider) entries.
    pub provider_entries: usize,
}

/// A Kademlia DHT node.
///
/// Cheap to clone; all clones share the same state. See the crate docs for
/// a usage sketch.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<DhtInner>,
}

struct DhtInner {
    config: Arc<Config>,
    host: Arc<dyn Host>,
    validator: Arc<dyn Validator>,
    storage: Mutex<Storage>,
    providers: Mutex<ContentRoutingTable>,
    table: Arc<Mutex<PeerRoutingTable>>,
    local: PeerInfo,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dht {
    /// Build a node that accepts every record.
    pub fn new(config: Config, host: Arc<dyn Host>) -> Self {
        Self::with_validator(config, host, Arc::new(AcceptAllValidator))
    }

    /// Build a node with a custom record [`Validator`].
    pub fn with_validator(
        config: Config,
        host: Arc<dyn Host>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let local = host.local_peer();
        let inner = Arc::new(DhtInner {
            storage: Mutex::new(Storage::new(validator.clone(), config.record_ttl)),
            providers: Mutex::new(ContentRoutingTable::new(config.provider_ttl)),
            table: Arc::new(Mutex::new(PeerRoutingTable::new(
                local.id.clone(),
                config.bucket_size,
            ))),
            config: Arc::new(config),
            host,
            validator,
            local,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Identity and addresses of the local node.
    pub fn local_peer(&self) -> &PeerInfo {
        &self.inner.local
    }

    /// Start serving the protocol. Idempotent.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;

        // Pin our own addresses in the address book.
        if !inner.local.addresses.is_empty() {
            let repo = inner.host.peer_repository().address_repository();
            let _ = repo.upsert_addresses(
                &inner.local.id,
                &inner.local.addresses,
                ADDRESS_TTL_PERMANENT,
            );
        }

        let handler = Arc::new(InboundHandler {
            dht: Arc::downgrade(&self.inner),
        });
        inner
            .host
            .set_protocol_handler(&inner.config.protocols, handler);

        let mut tasks = inner.tasks.lock().await;
        tasks.push(tokio::spawn(drive_host_events(
            inner.host.subscribe(),
            Arc::downgrade(&self.inner),
        )));
        tasks.push(tokio::spawn(sweep_providers(Arc::downgrade(&self.inner))));
        if inner.config.random_walk.enabled {
            tasks.push(tokio::spawn(random_walk(Arc::downgrade(&self.inner))));
        }

        info!(
            local = %inner.local.id,
            version = %inner.config.client_version,
            "dht started"
        );
    }

    /// Stop background work. Lookups already in flight are unaffected.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(local = %self.inner.local.id, "dht stopped");
    }

    fn ensure_started(&self) -> Result<(), Error> {
        if self.inner.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Store a record locally and replicate it to the closest peers.
    ///
    /// Validation failures surface immediately; replication failures are
    /// per-peer and ignored.
    pub async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<(), Error> {
        self.ensure_started()?;
        debug!(key = %hex::encode(&key[..key.len().min(8)]), "CALL: PutValue");
        {
            self.inner
                .storage
                .lock()
                .await
                .put(key.clone(), value.clone())?;
        }
        lookup::put_value(
            &self.inner.lookup_context(),
            &key,
            value,
            self.inner.config.record_ttl,
        )
        .await
    }

    /// Fetch a record, preferring a live local copy.
    ///
    /// An expired local record is treated as absent and the lookup proceeds
    /// to the network.
    pub async fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        self.ensure_started()?;
        debug!(key = %hex::encode(&key[..key.len().min(8)]), "CALL: GetValue");
        if let Ok((value, _)) = self.inner.storage.lock().await.get(key) {
            trace!("record found locally");
            return Ok(value);
        }
        lookup::get_value(
            &self.inner.lookup_context(),
            &self.inner.validator,
            key,
            GET_VALUE_QUORUM,
        )
        .await
    }

    /// Announce the local node as a provider for `key`.
    ///
    /// With `announce = false` the mapping is only recorded locally.
    pub async fn provide(&self, key: &[u8], announce: bool) -> Result<(), Error> {
        self.ensure_started()?;
        debug!(key = %hex::encode(&key[..key.len().min(8)]), "CALL: Provide");
        {
            self.inner
                .providers
                .lock()
                .await
                .add_provider(key, self.inner.local.id.clone());
        }
        if !announce {
            return Ok(());
        }
        lookup::add_provider(&self.inner.lookup_context(), key).await
    }

    /// Discover peers that announced `key`, up to `limit` (0 = unlimited).
    pub async fn find_providers(&self, key: &[u8], limit: usize) -> Result<Vec<PeerInfo>, Error> {
        self.ensure_started()?;
        debug!(key = %hex::encode(&key[..key.len().min(8)]), "CALL: FindProviders");

        // Local fast path. Deliberately requires strictly more known
        // providers than requested: with exactly `limit` known the lookup
        // still goes to the network.
        let known = {
            self.inner
                .providers
                .lock()
                .await
                .providers_for(key, None)
        };
        if limit > 0 && known.len() > limit {
            let repo = self.inner.host.peer_repository();
            let mut result = Vec::with_capacity(limit);
            for peer in &known {
                let info = repo.peer_info(peer);
                if info.addresses.is_empty() {
                    continue;
                }
                if self.inner.host.connectedness(&info).await == Connectedness::CannotConnect {
                    continue;
                }
                result.push(info);
                if result.len() >= limit {
                    break;
                }
            }
            if result.len() >= limit {
                info!(count = result.len(), "providers found locally");
                return Ok(result);
            }
        }

        lookup::find_providers(&self.inner.lookup_context(), key, limit).await
    }

    /// Locate a peer by id, preferring the local address book.
    pub async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, Error> {
        self.ensure_started()?;
        debug!(peer = %peer, "CALL: FindPeer");
        let info = self.inner.host.peer_repository().peer_info(peer);
        if !info.addresses.is_empty() {
            trace!(peer = %peer, "peer found locally");
            return Ok(info);
        }
        let outcome = lookup::find_peer(&self.inner.lookup_context(), peer).await;
        outcome.peer.ok_or(Error::NotFound)
    }

    /// Seed the routing table with a known peer (e.g. a bootstrap node).
    pub async fn add_peer(&self, info: &PeerInfo, permanent: bool) {
        self.inner.add_peer(info, permanent, false).await;
    }

    /// Run one random-walk iteration to refresh the routing table.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        self.ensure_started()?;
        self.inner.find_random_peer().await;
        Ok(())
    }

    /// Observe routing table additions and removals.
    pub async fn routing_events(&self) -> broadcast::Receiver<RoutingEvent> {
        self.inner.table.lock().await.subscribe()
    }

    /// Observe provider announcements and expiries.
    pub async fn provider_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.providers.lock().await.subscribe()
    }

    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            routing_table_size: self.inner.table.lock().await.size(),
            stored_records: self.inner.storage.lock().await.len(),
            provider_entries: self.inner.providers.lock().await.len(),
        }
    }
}

impl DhtInner {
    fn lookup_context(&self) -> LookupContext {
        LookupContext {
            host: self.host.clone(),
            table: self.table.clone(),
            config: self.config.clone(),
            local: self.local.clone(),
        }
    }

    /// Record a peer's addresses and insert it into the routing table.
    /// Peers without addresses are not routable and are skipped.
    async fn add_peer(&self, info: &PeerInfo, permanent: bool, is_connected: bool) {
        if info.addresses.is_empty() {
            debug!(peer = %info.id, "skipping peer without addresses");
            return;
        }
        let repo = self.host.peer_repository().address_repository();
        let ttl = if permanent {
            ADDRESS_TTL_PERMANENT
        } else {
            ADDRESS_TTL_DAY
        };
        if let Err(err) = repo.upsert_addresses(&info.id, &info.addresses, ttl) {
            debug!(peer = %info.id, error = %err, "address upsert refused");
            return;
        }
        let (outcome, total) = {
            let mut table = self.table.lock().await;
            let outcome = table.update(info.id.clone(), permanent, is_connected);
            (outcome, table.size())
        };
        match outcome {
            UpdateOutcome::Added => {
                debug!(peer = %info.id, total, "peer added to routing table");
            }
            UpdateOutcome::Updated => {
                trace!(peer = %info.id, "peer refreshed in routing table");
            }
            UpdateOutcome::Rejected => {
                trace!(peer = %info.id, "peer not added to routing table");
            }
        }
    }

    /// Look up a uniformly random id, absorbing whatever the search learns
    /// about the network on the way.
    async fn find_random_peer(&self) {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let random = PeerId::from_bytes(bytes.to_vec());
        trace!(target = %random, "random walk lookup");
        let outcome = lookup::find_peer(&self.lookup_context(), &random).await;
        if let Some(info) = outcome.peer {
            self.add_peer(&info, false, false).await;
        }
    }

    // ------------------------------------------------------------------
    // Inbound protocol handling
    // ------------------------------------------------------------------

    async fn handle_stream(&self, remote: PeerId, stream: Box<dyn DhtStream>) {
        if remote == self.local.id {
            debug!("refusing inbound stream from ourselves");
            return;
        }
        trace!(remote = %remote, "inbound stream");
        let mut session = Session::new(stream, remote, self.config.response_timeout);
        loop {
            match session.read().await {
                Ok(Some(msg)) => self.dispatch(&mut session, msg).await,
                Ok(None) => break,
                Err(err) => {
                    debug!(remote = %session.remote(), error = %err, "session ended");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, msg: Message) {
        match msg.message_type {
            MessageType::PutValue => self.on_put_value(session, msg).await,
            MessageType::GetValue => self.on_get_value(session, msg).await,
            MessageType::AddProvider => self.on_add_provider(session, msg).await,
            MessageType::GetProviders => self.on_get_providers(session, msg).await,
            MessageType::FindNode => self.on_find_node(session, msg).await,
            MessageType::Ping => self.on_ping(session, msg).await,
        }
    }

    /// Store a valid record and echo the request. Invalid records are
    /// dropped without a reply so a poisoner learns nothing.
    async fn on_put_value(&self, session: &mut Session, msg: Message) {
        let Some(record) = msg.record.clone() else {
            warn!("incoming PutValue without a record");
            return;
        };
        debug!(
            key = %hex::encode(&record.key[..record.key.len().min(8)]),
            "MSG: PutValue"
        );
        let result = {
            self.storage
                .lock()
                .await
                .put(record.key, record.value)
        };
        if let Err(err) = result {
            warn!(error = %err, "incoming PutValue rejected");
            return;
        }
        let _ = session.write(&msg).await;
    }

    async fn on_get_value(&self, session: &mut Session, mut msg: Message) {
        if msg.key.is_empty() {
            warn!("incoming GetValue with empty key");
            return;
        }
        debug!(key = %hex::encode(&msg.key[..msg.key.len().min(8)]), "MSG: GetValue");

        // Providers are attached whenever the key has any, even for plain
        // value keys, for on-wire compatibility.
        let providers = {
            self.providers
                .lock()
                .await
                .providers_for(&msg.key, None)
        };
        if !providers.is_empty() {
            let peers = self.collect_peers(providers).await;
            if !peers.is_empty() {
                msg.provider_peers = Some(peers);
            }
        }

        let stored = { self.storage.lock().await.get(&msg.key) };
        if let Ok((value, expires_at)) = stored {
            let remaining = expires_at.saturating_duration_since(Instant::now());
            msg.record = Some(Record {
                key: msg.key.clone(),
                value,
                expiry: unix_expiry_string(remaining),
            });
        }

        let _ = session.write(&msg).await;
    }

    /// Record providers that announce themselves. Entries attributed to any
    /// other peer are ignored, and no reply is sent.
    async fn on_add_provider(&self, session: &mut Session, msg: Message) {
        let Message {
            key,
            provider_peers: Some(providers),
            ..
        } = msg
        else {
            warn!("incoming AddProvider without provider entries");
            return;
        };
        debug!(key = %hex::encode(&key[..key.len().min(8)]), "MSG: AddProvider");
        for provider in providers {
            if &provider.info.id != session.remote() {
                trace!(
                    claimed = %provider.info.id,
                    remote = %session.remote(),
                    "ignoring provider entry for another peer"
                );
                continue;
            }
            {
                self.providers
                    .lock()
                    .await
                    .add_provider(&key, provider.info.id.clone());
            }
            self.add_peer(&provider.info, false, false).await;
        }
    }

    async fn on_get_providers(&self, session: &mut Session, mut msg: Message) {
        if msg.key.is_empty() {
            warn!("incoming GetProviders with empty key");
            return;
        }
        debug!(key = %hex::encode(&msg.key[..msg.key.len().min(8)]), "MSG: GetProviders");

        let fetch = 2 * self.config.closer_peer_count;
        let providers = {
            self.providers
                .lock()
                .await
                .providers_for(&msg.key, Some(fetch))
        };
        if !providers.is_empty() {
            let peers = self.collect_peers(providers).await;
            if !peers.is_empty() {
                msg.provider_peers = Some(peers);
            }
        }

        let nearest = {
            self.table
                .lock()
                .await
                .nearest_peers(&NodeId::hash(&msg.key), fetch)
        };
        if !nearest.is_empty() {
            let peers = self.collect_peers(nearest).await;
            if !peers.is_empty() {
                msg.closer_peers = Some(peers);
            }
        }

        let _ = session.write(&msg).await;
    }

    async fn on_find_node(&self, session: &mut Session, mut msg: Message) {
        if msg.key.is_empty() {
            warn!("incoming FindNode with empty key");
            return;
        }

        // Use the caller's peer hints to refresh the address book, then
        // drop them from the reply.
        if let Some(hints) = msg.closer_peers.take() {
            let addresses = self.host.peer_repository().address_repository();
            for peer in hints {
                if peer.connectedness != Connectedness::CannotConnect
                    && !peer.info.addresses.is_empty()
                {
                    let _ = addresses.upsert_addresses(
                        &peer.info.id,
                        &peer.info.addresses,
                        ADDRESS_TTL_DAY,
                    );
                }
            }
        }

        debug!(key = %hex::encode(&msg.key[..msg.key.len().min(8)]), "MSG: FindNode");

        let nearest = {
            self.table
                .lock()
                .await
                .nearest_peers(&NodeId::hash(&msg.key), 2 * self.config.closer_peer_count)
        };
        let peers = self.collect_peers(nearest).await;
        if !peers.is_empty() {
            msg.closer_peers = Some(peers);
        }

        let _ = session.write(&msg).await;
    }

    async fn on_ping(&self, session: &mut Session, mut msg: Message) {
        trace!(remote = %session.remote(), "MSG: Ping");
        msg.clear_body();
        let _ = session.write(&msg).await;
    }

    /// Resolve peer ids into wire entries, dropping address-less peers and
    /// capping at `closer_peer_count`.
    async fn collect_peers(&self, ids: Vec<PeerId>) -> Vec<MessagePeer> {
        let repo = self.host.peer_repository();
        let mut peers = Vec::with_capacity(self.config.closer_peer_count);
        for id in ids {
            let info = repo.peer_info(&id);
            if info.addresses.is_empty() {
                continue;
            }
            let connectedness = self.host.connectedness(&info).await;
            peers.push(MessagePeer {
                info,
                connectedness,
            });
            if peers.len() >= self.config.closer_peer_count {
                break;
            }
        }
        peers
    }
}

/// Inbound seam registered with the host. Holds only a weak reference so
/// the registration cannot keep a dropped node alive.
struct InboundHandler {
    dht: Weak<DhtInner>,
}

#[async_trait]
impl StreamHandler for InboundHandler {
    async fn handle_stream(&self, remote: PeerId, stream: Box<dyn DhtStream>) {
        let Some(inner) = self.dht.upgrade() else {
            return;
        };
        inner.handle_stream(remote, stream).await;
    }
}

/// Feed host connection events into the routing table.
async fn drive_host_events(mut events: broadcast::Receiver<HostEvent>, dht: Weak<DhtInner>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "host event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = dht.upgrade() else {
            break;
        };
        match event {
            HostEvent::NewConnection { peer, initiator } => {
                // Outbound connections only.
                if initiator {
                    debug!(peer = %peer.id, "new outbound connection");
                    inner.add_peer(&peer, false, true).await;
                }
            }
            HostEvent::PeerDisconnected(peer) => {
                let mut table = inner.table.lock().await;
                let _ = table.update(peer, false, false);
            }
        }
    }
}

/// Periodically collect expired provider entries.
async fn sweep_providers(dht: Weak<DhtInner>) {
    let mut ticker = interval(PROVIDER_SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = dht.upgrade() else {
            break;
        };
        inner.providers.lock().await.sweep();
    }
}

/// Issue `queries_per_period` random lookups spaced `delay` apart, then
/// sleep out the rest of `interval`, forever.
async fn random_walk(dht: Weak<DhtInner>) {
    let Some(config) = dht.upgrade().map(|inner| inner.config.clone()) else {
        return;
    };
    let walk = &config.random_walk;
    let period = walk.queries_per_period.max(1);
    let mut iteration: usize = 0;
    loop {
        {
            let Some(inner) = dht.upgrade() else {
                return;
            };
            inner.find_random_peer().await;
        }
        iteration += 1;
        let pause = if iteration % period == 0 {
            walk.interval
                .saturating_sub(walk.delay.saturating_mul(period as u32))
        } else {
            walk.delay
        };
        sleep(pause).await;
    }
}
