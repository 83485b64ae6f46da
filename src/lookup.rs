//! Iterative α-parallel lookup executors.
//!
//! All queries share one traversal skeleton: seed candidates from the
//! routing table, repeatedly query the closest untried candidate with at
//! most α requests in flight, merge the closer peers from each response
//! back into the candidate set, and stop when the executor's terminal
//! condition is met or no candidate remains that is closer than the k-th
//! best responder.
//!
//! Per-hop failures (timeouts, dial errors, decode errors) only mark that
//! peer as failed; they never abort the lookup. Dropping the future that
//! drives a lookup cancels it: in-flight hops are aborted with their
//! [`tokio::task::JoinSet`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::core::{Config, Distance, NodeId, PeerId, PeerRoutingTable, Validator};
use crate::host::{Host, PeerInfo, ADDRESS_TTL_DAY};
use crate::protocol::{unix_expiry_string, Connectedness, Message, MessagePeer, MessageType, Record};
use crate::session::Session;
use crate::Error;

/// The narrow slice of the DHT an executor is allowed to touch: the host
/// seam for streams and addresses, and the routing table as an update sink.
#[derive(Clone)]
pub(crate) struct LookupContext {
    pub host: Arc<dyn Host>,
    pub table: Arc<Mutex<PeerRoutingTable>>,
    pub config: Arc<Config>,
    pub local: PeerInfo,
}

/// Verdict of a per-response interpreter.
pub(crate) enum Step {
    Continue,
    Done,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    distance: Distance,
    peer: PeerId,
}

/// Shared traversal state: a distance-ordered candidate frontier plus the
/// bookkeeping that enforces the lookup invariants (no peer queried twice,
/// at most α in flight, closer-than-best admission).
pub(crate) struct Traversal {
    ctx: LookupContext,
    target: NodeId,
    candidates: BinaryHeap<Reverse<Candidate>>,
    seen: HashSet<PeerId>,
    /// Responders in ascending distance order.
    responded: Vec<(Distance, PeerId)>,
    succeeded: Vec<PeerId>,
}

impl Traversal {
    pub(crate) async fn new(ctx: LookupContext, target: NodeId) -> Self {
        let seed_count = 2 * ctx.config.bucket_size;
        let seeds = {
            let table = ctx.table.lock().await;
            table.nearest_peers(&target, seed_count)
        };
        let mut traversal = Self {
            ctx,
            target,
            candidates: BinaryHeap::new(),
            seen: HashSet::new(),
            responded: Vec::new(),
            succeeded: Vec::new(),
        };
        // The local peer is never a candidate.
        traversal.seen.insert(traversal.ctx.local.id.clone());
        for peer in seeds {
            traversal.admit(peer);
        }
        traversal
    }

    /// Add a candidate unless it is a duplicate or the local peer.
    fn admit(&mut self, peer: PeerId) {
        if self.seen.insert(peer.clone()) {
            let distance = NodeId::from_peer(&peer).distance(&self.target);
            self.candidates.push(Reverse(Candidate { distance, peer }));
        }
    }

    /// A candidate is worth querying iff it is strictly closer than the
    /// k-th best responder, or fewer than k peers have responded.
    fn worth_querying(&self, distance: &Distance) -> bool {
        let k = self.ctx.config.bucket_size;
        match self.responded.get(k - 1) {
            Some((kth, _)) => distance < kth,
            None => true,
        }
    }

    fn next_candidate(&mut self) -> Option<PeerId> {
        let Reverse(candidate) = self.candidates.pop()?;
        if self.worth_querying(&candidate.distance) {
            return Some(candidate.peer);
        }
        // The heap pops in ascending distance order, so once the closest
        // remaining candidate fails the rule the frontier is exhausted.
        self.candidates.clear();
        None
    }

    fn note_response(&mut self, peer: &PeerId) {
        let distance = NodeId::from_peer(peer).distance(&self.target);
        let at = self.responded.partition_point(|(d, _)| d <= &distance);
        self.responded.insert(at, (distance, peer.clone()));
        self.succeeded.push(peer.clone());
    }

    /// Apply the side effects of a successful response: refresh the
    /// responder in the routing table, upsert learned addresses, and merge
    /// the attached peers into the candidate frontier. All table updates
    /// land before the next hop is scheduled.
    async fn absorb(&mut self, responder: &PeerId, msg: &Message) {
        {
            let mut table = self.ctx.table.lock().await;
            table.update(responder.clone(), false, true);
        }
        let addresses = self.ctx.host.peer_repository().address_repository();
        let attached = msg
            .closer_peers
            .iter()
            .flatten()
            .chain(msg.provider_peers.iter().flatten());
        for entry in attached {
            if entry.info.id == self.ctx.local.id {
                continue;
            }
            if entry.connectedness != Connectedness::CannotConnect
                && !entry.info.addresses.is_empty()
            {
                let _ = addresses.upsert_addresses(
                    &entry.info.id,
                    &entry.info.addresses,
                    ADDRESS_TTL_DAY,
                );
            }
            self.admit(entry.info.id.clone());
        }
    }

    /// Drive the traversal to completion, feeding each successful response
    /// to `on_response` until it reports [`Step::Done`] or the frontier is
    /// exhausted.
    pub(crate) async fn run<F>(&mut self, request: Message, mut on_response: F)
    where
        F: FnMut(&PeerId, &Message) -> Step,
    {
        let alpha = self.ctx.config.alpha;
        let mut inflight: JoinSet<(PeerId, Result<Message, Error>)> = JoinSet::new();
        loop {
            while inflight.len() < alpha {
                let Some(peer) = self.next_candidate() else {
                    break;
                };
                let ctx = self.ctx.clone();
                let req = request.clone();
                inflight.spawn(async move {
                    let result = query_peer(&ctx, &peer, &req).await;
                    (peer, result)
                });
            }
            let Some(joined) = inflight.join_next().await else {
                // Nothing in flight and no candidates left.
                break;
            };
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result {
                Ok(msg) => {
                    self.note_response(&peer);
                    self.absorb(&peer, &msg).await;
                    if matches!(on_response(&peer, &msg), Step::Done) {
                        inflight.abort_all();
                        break;
                    }
                }
                Err(err) => {
                    debug!(peer = %peer, error = %err, "lookup hop failed");
                }
            }
        }
    }

    fn into_outcome(self, found: Option<PeerInfo>) -> LookupOutcome {
        LookupOutcome {
            peer: found,
            closest: self.responded.into_iter().map(|(_, p)| p).collect(),
            succeeded: self.succeeded,
        }
    }
}

/// What a traversal left behind when it terminated.
pub(crate) struct LookupOutcome {
    /// The target peer, for FindPeer-style lookups that located it.
    pub peer: Option<PeerInfo>,
    /// Responders in ascending distance to the target.
    pub closest: Vec<PeerId>,
    /// Peers that answered successfully, in response order.
    pub succeeded: Vec<PeerId>,
}

/// One hop: resolve addresses, open a stream, exchange one request/reply.
async fn query_peer(
    ctx: &LookupContext,
    peer: &PeerId,
    request: &Message,
) -> Result<Message, Error> {
    let repo = ctx.host.peer_repository();
    let info = repo.peer_info(peer);
    if info.addresses.is_empty() {
        return Err(Error::Unreachable);
    }
    let stream = match timeout(
        ctx.config.request_timeout,
        ctx.host.new_stream(&info, &ctx.config.protocols),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            let addresses = repo.address_repository();
            for addr in &info.addresses {
                addresses.dial_failed(peer, addr);
            }
            trace!(peer = %peer, error = %err, "dial failed");
            return Err(Error::Unreachable);
        }
        Err(_) => return Err(Error::Timeout),
    };
    let mut session = Session::new(stream, peer.clone(), ctx.config.response_timeout);
    session.request(request, ctx.config.request_timeout).await
}

/// One-shot delivery of a message that expects no reply.
async fn send_to_peer(
    ctx: &LookupContext,
    peer: &PeerId,
    message: &Message,
) -> Result<(), Error> {
    let repo = ctx.host.peer_repository();
    let info = repo.peer_info(peer);
    if info.addresses.is_empty() {
        return Err(Error::Unreachable);
    }
    let stream = timeout(
        ctx.config.request_timeout,
        ctx.host.new_stream(&info, &ctx.config.protocols),
    )
    .await
    .map_err(|_| Error::Timeout)?
    .map_err(|_| Error::Unreachable)?;
    let mut session = Session::new(stream, peer.clone(), ctx.config.response_timeout);
    session.send(message).await
}

/// Fan a message out to `targets`, ignoring individual failures.
async fn broadcast(
    ctx: &LookupContext,
    message: &Message,
    targets: Vec<PeerId>,
    expect_reply: bool,
) {
    let mut deliveries = JoinSet::new();
    for peer in targets {
        let ctx = ctx.clone();
        let msg = message.clone();
        deliveries.spawn(async move {
            let result = if expect_reply {
                query_peer(&ctx, &peer, &msg).await.map(|_| ())
            } else {
                send_to_peer(&ctx, &peer, &msg).await
            };
            if let Err(err) = result {
                debug!(peer = %peer, error = %err, "broadcast delivery failed");
            }
        });
    }
    while deliveries.join_next().await.is_some() {}
}

// ============================================================================
// Executors
// ============================================================================

/// Locate a peer by iteratively asking for nodes near its id.
///
/// Terminates successfully as soon as any response lists the target with a
/// usable address; otherwise runs the frontier dry.
pub(crate) async fn find_peer(ctx: &LookupContext, target_peer: &PeerId) -> LookupOutcome {
    let target = NodeId::from_peer(target_peer);
    let request = Message::request(MessageType::FindNode, target_peer.as_bytes().to_vec());
    let mut traversal = Traversal::new(ctx.clone(), target).await;
    let mut found: Option<PeerInfo> = None;
    traversal
        .run(request, |_, msg| {
            for entry in msg.closer_peers.iter().flatten() {
                if &entry.info.id == target_peer && !entry.info.addresses.is_empty() {
                    found = Some(entry.info.clone());
                    return Step::Done;
                }
            }
            Step::Continue
        })
        .await;
    traversal.into_outcome(found)
}

/// Converge on the peers nearest to `target` without an early exit. Used as
/// the first phase of PutValue and AddProvider.
pub(crate) async fn find_closest_peers(
    ctx: &LookupContext,
    target: NodeId,
    key: &[u8],
) -> LookupOutcome {
    let request = Message::request(MessageType::FindNode, key.to_vec());
    let mut traversal = Traversal::new(ctx.clone(), target).await;
    traversal.run(request, |_, _| Step::Continue).await;
    traversal.into_outcome(None)
}

/// Fetch a record, stopping once `quorum` distinct valid records arrived.
/// The best record per the validator is returned.
pub(crate) async fn get_value(
    ctx: &LookupContext,
    validator: &Arc<dyn Validator>,
    key: &[u8],
    quorum: usize,
) -> Result<Vec<u8>, Error> {
    let target = NodeId::hash(key);
    let request = Message::request(MessageType::GetValue, key.to_vec());
    let mut traversal = Traversal::new(ctx.clone(), target).await;
    let mut records: Vec<Vec<u8>> = Vec::new();
    traversal
        .run(request, |peer, msg| {
            if let Some(record) = &msg.record {
                if record.key == key {
                    match validator.validate(key, &record.value) {
                        Ok(()) => {
                            records.push(record.value.clone());
                            if records.len() >= quorum {
                                return Step::Done;
                            }
                        }
                        Err(err) => {
                            debug!(peer = %peer, error = %err, "discarding invalid record");
                        }
                    }
                }
            }
            Step::Continue
        })
        .await;

    if records.is_empty() {
        return Err(Error::NotFound);
    }
    let best = validator.select(key, &records);
    Ok(records.swap_remove(best))
}

/// Replicate a record to the peers that answered a FindPeer-style
/// convergence on the key, up to the replication factor. Individual
/// delivery failures are ignored.
pub(crate) async fn put_value(
    ctx: &LookupContext,
    key: &[u8],
    value: Vec<u8>,
    record_ttl: Duration,
) -> Result<(), Error> {
    let outcome = find_closest_peers(ctx, NodeId::hash(key), key).await;
    let targets: Vec<PeerId> = outcome
        .succeeded
        .into_iter()
        .take(ctx.config.replication_factor)
        .collect();
    if targets.is_empty() {
        debug!(
            key = %hex::encode(&key[..key.len().min(8)]),
            "no peers reached, record stays local"
        );
        return Ok(());
    }

    let mut message = Message::request(MessageType::PutValue, key.to_vec());
    message.record = Some(Record {
        key: key.to_vec(),
        value,
        expiry: unix_expiry_string(record_ttl),
    });
    broadcast(ctx, &message, targets, true).await;
    Ok(())
}

/// Collect providers for a key until `limit` distinct ones are known or the
/// frontier is exhausted. `limit = 0` means unlimited.
pub(crate) async fn find_providers(
    ctx: &LookupContext,
    key: &[u8],
    limit: usize,
) -> Result<Vec<PeerInfo>, Error> {
    let target = NodeId::hash(key);
    let request = Message::request(MessageType::GetProviders, key.to_vec());
    let mut traversal = Traversal::new(ctx.clone(), target).await;
    let mut providers: Vec<PeerInfo> = Vec::new();
    let mut known: HashSet<PeerId> = HashSet::new();
    traversal
        .run(request, |_, msg| {
            for entry in msg.provider_peers.iter().flatten() {
                if known.insert(entry.info.id.clone()) {
                    providers.push(entry.info.clone());
                }
            }
            if limit > 0 && providers.len() >= limit {
                Step::Done
            } else {
                Step::Continue
            }
        })
        .await;

    if providers.is_empty() {
        return Err(Error::NotFound);
    }
    if limit > 0 {
        providers.truncate(limit);
    }
    Ok(providers)
}

/// Announce the local peer as a provider of `key` to the closest
/// `replication_factor` responders. No replies are expected.
pub(crate) async fn add_provider(ctx: &LookupContext, key: &[u8]) -> Result<(), Error> {
    let outcome = find_closest_peers(ctx, NodeId::hash(key), key).await;
    let targets: Vec<PeerId> = outcome
        .closest
        .into_iter()
        .take(ctx.config.replication_factor)
        .collect();
    if targets.is_empty() {
        debug!(
            key = %hex::encode(&key[..key.len().min(8)]),
            "no peers reached, provider announcement stays local"
        );
        return Ok(());
    }

    let mut message = Message::request(MessageType::AddProvider, key.to_vec());
    message.provider_peers = Some(vec![MessagePeer {
        info: ctx.local.clone(),
        connectedness: Connectedness::Connected,
    }]);
    broadcast(ctx, &message, targets, false).await;
    Ok(())
}
