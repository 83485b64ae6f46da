#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;

use kadstream::{
    AddressRepository, Config, Connectedness, Dht, DhtStream, Host, HostEvent, Multiaddr, PeerId,
    PeerInfo, PeerRepository, RandomWalkConfig, StreamHandler,
};

/// Routes streams between in-process hosts by peer id.
#[derive(Default)]
pub struct Network {
    hosts: RwLock<HashMap<PeerId, Arc<MemHost>>>,
}

impl Network {
    pub async fn register(&self, host: Arc<MemHost>) {
        let mut hosts = self.hosts.write().await;
        hosts.insert(host.local.id.clone(), host);
    }

    pub async fn get(&self, id: &PeerId) -> Option<Arc<MemHost>> {
        let hosts = self.hosts.read().await;
        hosts.get(id).cloned()
    }
}

/// Tracks how many outbound streams are open at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn acquire(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// A duplex stream that releases its gauge slot on drop.
pub struct CountedStream {
    inner: DuplexStream,
    gauge: Arc<Gauge>,
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.gauge.release();
    }
}

#[derive(Default)]
pub struct MemAddressBook {
    addresses: StdMutex<HashMap<PeerId, Vec<Multiaddr>>>,
    failed_dials: StdMutex<Vec<(PeerId, Multiaddr)>>,
}

impl MemAddressBook {
    pub fn failed_dials(&self) -> Vec<(PeerId, Multiaddr)> {
        self.failed_dials.lock().unwrap().clone()
    }
}

impl AddressRepository for MemAddressBook {
    fn upsert_addresses(
        &self,
        peer: &PeerId,
        addresses: &[Multiaddr],
        _ttl: Duration,
    ) -> anyhow::Result<()> {
        let mut book = self.addresses.lock().unwrap();
        let known = book.entry(peer.clone()).or_default();
        for addr in addresses {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
        Ok(())
    }

    fn dial_failed(&self, peer: &PeerId, addr: &Multiaddr) {
        let mut failed = self.failed_dials.lock().unwrap();
        failed.push((peer.clone(), addr.clone()));
    }
}

pub struct MemPeerRepository {
    book: Arc<MemAddressBook>,
}

impl PeerRepository for MemPeerRepository {
    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        let book = self.book.addresses.lock().unwrap();
        PeerInfo {
            id: peer.clone(),
            addresses: book.get(peer).cloned().unwrap_or_default(),
        }
    }

    fn address_repository(&self) -> Arc<dyn AddressRepository> {
        self.book.clone()
    }
}

/// In-memory [`Host`]: streams are `tokio::io::duplex` pipes, the peer
/// registry is shared through [`Network`], and tests can inject dial
/// failures and latency per host.
pub struct MemHost {
    pub local: PeerInfo,
    network: Arc<Network>,
    pub book: Arc<MemAddressBook>,
    handler: StdMutex<Option<Arc<dyn StreamHandler>>>,
    events: broadcast::Sender<HostEvent>,
    failed: StdMutex<HashSet<PeerId>>,
    dial_latency: StdMutex<Option<Duration>>,
    dialed: StdMutex<Vec<PeerId>>,
    pub gauge: Arc<Gauge>,
}

impl MemHost {
    pub fn new(network: Arc<Network>, local: PeerInfo) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            local,
            network,
            book: Arc::new(MemAddressBook::default()),
            handler: StdMutex::new(None),
            events,
            failed: StdMutex::new(HashSet::new()),
            dial_latency: StdMutex::new(None),
            dialed: StdMutex::new(Vec::new()),
            gauge: Arc::new(Gauge::default()),
        })
    }

    pub fn set_failure(&self, peer: &PeerId, fail: bool) {
        let mut failed = self.failed.lock().unwrap();
        if fail {
            failed.insert(peer.clone());
        } else {
            failed.remove(peer);
        }
    }

    pub fn set_dial_latency(&self, latency: Duration) {
        *self.dial_latency.lock().unwrap() = Some(latency);
    }

    /// Every outbound dial, in order.
    pub fn dialed(&self) -> Vec<PeerId> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Host for MemHost {
    fn local_peer(&self) -> PeerInfo {
        self.local.clone()
    }

    fn peer_repository(&self) -> Arc<dyn PeerRepository> {
        Arc::new(MemPeerRepository {
            book: self.book.clone(),
        })
    }

    async fn new_stream(
        &self,
        peer: &PeerInfo,
        _protocols: &[String],
    ) -> anyhow::Result<Box<dyn DhtStream>> {
        if self.failed.lock().unwrap().contains(&peer.id) {
            anyhow::bail!("injected dial failure");
        }
        let Some(remote) = self.network.get(&peer.id).await else {
            anyhow::bail!("unknown peer");
        };
        let handler = remote.handler.lock().unwrap().clone();
        let Some(handler) = handler else {
            anyhow::bail!("remote has no protocol handler");
        };

        self.dialed.lock().unwrap().push(peer.id.clone());
        self.gauge.acquire();
        let latency = *self.dial_latency.lock().unwrap();
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        let (local_io, remote_io) = tokio::io::duplex(64 * 1024);
        let dialer = self.local.id.clone();
        tokio::spawn(async move {
            handler.handle_stream(dialer, Box::new(remote_io)).await;
        });

        let _ = self.events.send(HostEvent::NewConnection {
            peer: peer.clone(),
            initiator: true,
        });
        let _ = remote.events.send(HostEvent::NewConnection {
            peer: self.local.clone(),
            initiator: false,
        });

        Ok(Box::new(CountedStream {
            inner: local_io,
            gauge: self.gauge.clone(),
        }))
    }

    async fn connectedness(&self, peer: &PeerInfo) -> Connectedness {
        if self.failed.lock().unwrap().contains(&peer.id) {
            return Connectedness::CannotConnect;
        }
        if self.network.get(&peer.id).await.is_some() {
            Connectedness::CanConnect
        } else {
            Connectedness::CannotConnect
        }
    }

    fn set_protocol_handler(&self, _protocols: &[String], handler: Arc<dyn StreamHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

pub struct TestNode {
    pub dht: Dht,
    pub host: Arc<MemHost>,
}

impl TestNode {
    pub fn info(&self) -> PeerInfo {
        self.host.local.clone()
    }

    pub fn id(&self) -> PeerId {
        self.host.local.id.clone()
    }
}

pub fn test_config() -> Config {
    Config {
        request_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(2),
        random_walk: RandomWalkConfig {
            enabled: false,
            ..RandomWalkConfig::default()
        },
        ..Config::default()
    }
}

pub fn make_peer_id(index: u32) -> PeerId {
    PeerId::from_bytes(index.to_be_bytes().to_vec())
}

pub async fn spawn_node(network: &Arc<Network>, index: u32) -> TestNode {
    spawn_node_with_config(network, index, test_config()).await
}

static LOGGING: Once = Once::new();

/// Route `RUST_LOG`-filtered tracing output through the test harness.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn spawn_node_with_config(
    network: &Arc<Network>,
    index: u32,
    config: Config,
) -> TestNode {
    init_logging();
    let local = PeerInfo {
        id: make_peer_id(index),
        addresses: vec![format!("/memory/{index}")],
    };
    let host = MemHost::new(network.clone(), local);
    network.register(host.clone()).await;
    let dht = Dht::new(config, host.clone());
    dht.start().await;
    TestNode { dht, host }
}

/// Make `a` aware of `b` (one direction only).
pub async fn introduce(a: &TestNode, b: &TestNode) {
    a.dht.add_peer(&b.info(), false).await;
}
