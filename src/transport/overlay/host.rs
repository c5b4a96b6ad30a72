//! The libp2p swarm and the task that owns it
//!
//! The swarm lives inside a single task. Everything else talks to it through
//! a cloneable [`HostHandle`] that sends [`Command`]s over a channel and
//! awaits replies on oneshot channels.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use libp2p::core::ConnectedPoint;
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{autonat, dcutr, identify, noise, tcp, upnp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{EnvelopeCodec, PROTOCOL};
use super::RelayCandidates;
use crate::config::OverlayConfig;
use crate::discovery::{DiscoveryError, PeerInfo, PeerRouting};
use crate::message::Envelope;
use crate::transport::{TransportError, TransportResult};

/// How long a request waits for its response before failing
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between relay reservation checks
pub const RELAY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Inner module to keep the derive's generated names out of the host code.
#[allow(missing_docs)]
mod behaviour {
    use libp2p::kad::{self, store::MemoryStore};
    use libp2p::swarm::NetworkBehaviour;
    use libp2p::{autonat, dcutr, identify, relay, request_response, upnp};

    use super::EnvelopeCodec;

    /// Combined network behaviour for a murmur host
    ///
    /// - relay client and DCUtR for reaching peers behind NAT
    /// - Kademlia for peer routing and the rendezvous namespace
    /// - identify for learning listen addresses
    /// - AutoNAT to decide whether relay reservations are needed
    /// - UPnP for gateway port mappings
    /// - request-response carrying envelopes
    #[derive(NetworkBehaviour)]
    pub struct MurmurBehaviour {
        pub relay_client: relay::client::Behaviour,
        pub kademlia: kad::Behaviour<MemoryStore>,
        pub identify: identify::Behaviour,
        pub dcutr: dcutr::Behaviour,
        pub autonat: autonat::Behaviour,
        pub upnp: upnp::tokio::Behaviour,
        pub messaging: request_response::Behaviour<EnvelopeCodec>,
    }
}

pub use behaviour::{MurmurBehaviour, MurmurBehaviourEvent};

/// An inbound request awaiting its response
pub struct InboundRequest {
    /// Authenticated remote peer
    pub peer: PeerId,
    /// The envelope it sent
    pub envelope: Envelope,
    /// Where the response goes; dropping it resets the stream
    pub channel: ResponseChannel<Envelope>,
}

/// Requests to the host task
pub enum Command {
    /// Connect to a peer, trying `addrs` in addition to anything known
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<TransportResult<()>>,
    },
    /// Send one envelope and route the response back
    SendRequest {
        peer: PeerId,
        envelope: Envelope,
        reply: oneshot::Sender<TransportResult<Envelope>>,
    },
    /// Answer an inbound request
    Respond {
        channel: ResponseChannel<Envelope>,
        response: Envelope,
        reply: oneshot::Sender<TransportResult<()>>,
    },
    /// DHT lookup of a peer's addresses
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Stream providers of a key
    FindProviders {
        key: String,
        results: mpsc::Sender<PeerInfo>,
    },
    /// Announce ourselves as a provider of a key
    StartProviding {
        key: String,
        reply: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    /// Addresses learned for a peer
    CachedAddresses {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Routing table snapshot
    RoutingTable {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    /// Current listen addresses
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Install or remove the inbound request sink
    SetInbound {
        sink: Option<mpsc::Sender<InboundRequest>>,
    },
    /// Ask for circuit reservations on these relays if we are behind NAT
    ReserveRelays { candidates: Vec<PeerInfo> },
}

/// Cell the relay source is installed into once discovery exists
pub type RelaySource = Arc<OnceLock<Arc<dyn RelayCandidates>>>;

/// Cloneable handle to the host task
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    relay_source: RelaySource,
    stopped: CancellationToken,
}

impl HostHandle {
    /// Build the swarm, start listening and bootstrapping, and spawn the
    /// host task and the relay maintainer
    pub fn spawn(keypair: Keypair, config: &OverlayConfig) -> TransportResult<Self> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, config)?;

        for addr in &config.listen_addrs {
            if let Err(e) = swarm.listen_on(addr.clone()) {
                warn!(%addr, error = %e, "failed to listen");
            }
        }

        let mut bootstrap_peers = 0;
        for addr in &config.bootstrap {
            match addr.iter().last() {
                Some(Protocol::P2p(peer)) => {
                    swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                    if let Err(e) = swarm.dial(addr.clone()) {
                        debug!(%addr, error = %e, "bootstrap dial failed");
                    }
                    bootstrap_peers += 1;
                }
                _ => warn!(%addr, "bootstrap address without /p2p/ peer id"),
            }
        }
        if bootstrap_peers > 0 {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = %e, "DHT bootstrap failed");
            }
        }
        info!(peer = %local_peer_id, bootstrap_peers, "overlay host started");

        let (commands, receiver) = mpsc::channel(64);
        let stopped = CancellationToken::new();
        let host = Host {
            swarm,
            commands: receiver,
            stopped: stopped.clone(),
            relay_count: config.relay_count,
            addresses: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_requests: HashMap::new(),
            pending_finds: HashMap::new(),
            pending_providers: HashMap::new(),
            inbound: None,
            relays: HashSet::new(),
        };
        tokio::spawn(host.run());

        let handle = HostHandle {
            commands,
            local_peer_id,
            relay_source: Arc::new(OnceLock::new()),
            stopped,
        };
        tokio::spawn(maintain_relays(handle.clone(), config.relay_count));
        Ok(handle)
    }

    /// Install the relay candidate source. Only the first call has effect.
    pub fn install_relay_candidates(&self, source: Arc<dyn RelayCandidates>) {
        if self.relay_source.set(source).is_err() {
            debug!("relay candidate source already installed");
        }
    }

    /// Stop the host task
    pub fn shutdown(&self) {
        self.stopped.cancel();
    }

    /// Whether the host task has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled() || self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> TransportResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| TransportError::Disconnected)?;
        rx.await.map_err(|_| TransportError::Disconnected)
    }

    /// Connect to `peer`
    pub async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> TransportResult<()> {
        self.request(|reply| Command::Dial { peer, addrs, reply }).await?
    }

    /// Queue a request; the returned receiver resolves with the response
    pub async fn send_request(
        &self,
        peer: PeerId,
        envelope: Envelope,
    ) -> TransportResult<oneshot::Receiver<TransportResult<Envelope>>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendRequest {
                peer,
                envelope,
                reply,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        Ok(rx)
    }

    /// Answer an inbound request
    pub async fn respond(
        &self,
        channel: ResponseChannel<Envelope>,
        response: Envelope,
    ) -> TransportResult<()> {
        self.request(|reply| Command::Respond {
            channel,
            response,
            reply,
        })
        .await?
    }

    /// Route inbound requests to `sink`, or reject them when `None`
    pub async fn set_inbound(&self, sink: Option<mpsc::Sender<InboundRequest>>) -> TransportResult<()> {
        self.commands
            .send(Command::SetInbound { sink })
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    /// Addresses we are currently listening on
    pub async fn listen_addrs(&self) -> TransportResult<Vec<Multiaddr>> {
        self.request(|reply| Command::ListenAddrs { reply }).await
    }

    /// Wait until the routing table has at least one peer, or `wait` passes
    pub async fn wait_for_bootstrap(&self, wait: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let peers = self.routing_table().await.len();
            if peers > 0 || tokio::time::Instant::now() >= deadline {
                info!(peers, "DHT ready");
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl PeerRouting for HostHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn find_peer(&self, peer: PeerId) -> Result<PeerInfo, DiscoveryError> {
        let addrs = self
            .request(|reply| Command::FindPeer { peer, reply })
            .await
            .map_err(|e| DiscoveryError::Routing(e.to_string()))?;
        Ok(PeerInfo { peer, addrs })
    }

    async fn advertise(&self, namespace: &str) -> Result<(), DiscoveryError> {
        let key = namespace.to_string();
        self.request(|reply| Command::StartProviding { key, reply })
            .await
            .map_err(|e| DiscoveryError::Routing(e.to_string()))?
    }

    async fn find_providers(&self, namespace: &str) -> Result<mpsc::Receiver<PeerInfo>, DiscoveryError> {
        let (results, rx) = mpsc::channel(32);
        self.commands
            .send(Command::FindProviders {
                key: namespace.to_string(),
                results,
            })
            .await
            .map_err(|_| DiscoveryError::Routing("overlay host stopped".into()))?;
        Ok(rx)
    }

    async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr> {
        self.request(|reply| Command::CachedAddresses { peer, reply })
            .await
            .unwrap_or_default()
    }

    async fn routing_table(&self) -> Vec<PeerInfo> {
        self.request(|reply| Command::RoutingTable { reply })
            .await
            .unwrap_or_default()
    }
}

fn build_swarm(keypair: Keypair, config: &OverlayConfig) -> TransportResult<Swarm<MurmurBehaviour>> {
    let local_peer_id = keypair.public().to_peer_id();
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| TransportError::ConnectionFailed(format!("TCP transport error: {e}")))?
        .with_quic()
        .with_dns()
        .map_err(|e| TransportError::ConnectionFailed(format!("DNS transport error: {e}")))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| TransportError::ConnectionFailed(format!("Relay transport error: {e}")))?
        .with_behaviour(|keypair, relay_client| MurmurBehaviour {
            relay_client,
            kademlia: kad::Behaviour::with_config(
                local_peer_id,
                MemoryStore::new(local_peer_id),
                kad::Config::default(),
            ),
            identify: identify::Behaviour::new(
                identify::Config::new("/murmur/id/1.0.0".to_string(), keypair.public())
                    .with_agent_version(format!("murmur/{}", env!("CARGO_PKG_VERSION"))),
            ),
            dcutr: dcutr::Behaviour::new(local_peer_id),
            autonat: autonat::Behaviour::new(local_peer_id, autonat::Config::default()),
            upnp: upnp::tokio::Behaviour::default(),
            messaging: request_response::Behaviour::with_codec(
                EnvelopeCodec,
                [(PROTOCOL, ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
            ),
        })
        .map_err(|e| TransportError::ConnectionFailed(format!("Behaviour error: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
        .build();
    Ok(swarm)
}

/// Periodically hand relay candidates to the host once a source exists
async fn maintain_relays(handle: HostHandle, count: usize) {
    let mut ticker = tokio::time::interval(RELAY_REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = handle.stopped.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(source) = handle.relay_source.get() else {
            continue;
        };
        let candidates = source.relay_candidates(count).await;
        debug!(candidates = candidates.len(), "relay candidates");
        if candidates.is_empty() {
            continue;
        }
        if handle
            .commands
            .send(Command::ReserveRelays { candidates })
            .await
            .is_err()
        {
            return;
        }
    }
}

struct Host {
    swarm: Swarm<MurmurBehaviour>,
    commands: mpsc::Receiver<Command>,
    stopped: CancellationToken,
    relay_count: usize,
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<TransportResult<()>>>>,
    pending_requests: HashMap<OutboundRequestId, oneshot::Sender<TransportResult<Envelope>>>,
    pending_finds: HashMap<kad::QueryId, (PeerId, oneshot::Sender<Vec<Multiaddr>>)>,
    pending_providers: HashMap<kad::QueryId, mpsc::Sender<PeerInfo>>,
    inbound: Option<mpsc::Sender<InboundRequest>>,
    relays: HashSet<PeerId>,
}

impl Host {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.stopped.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        self.stopped.cancel();
        info!("overlay host stopped");
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        let known = self.addresses.entry(peer).or_default();
        if !known.contains(&addr) {
            known.push(addr);
        }
    }

    fn cached(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addresses.get(peer).cloned().unwrap_or_default()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let mut addrs = addrs;
                for addr in self.cached(&peer) {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
                let opts = DialOpts::peer_id(peer).addresses(addrs).build();
                match self.swarm.dial(opts) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(TransportError::ConnectionFailed(e.to_string())));
                    }
                }
            }
            Command::SendRequest {
                peer,
                envelope,
                reply,
            } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_request(&peer, envelope);
                self.pending_requests.insert(id, reply);
            }
            Command::Respond {
                channel,
                response,
                reply,
            } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_response(channel, response)
                    .map_err(|_| TransportError::Disconnected);
                let _ = reply.send(result);
            }
            Command::FindPeer { peer, reply } => {
                let cached = self.cached(&peer);
                if !cached.is_empty() {
                    let _ = reply.send(cached);
                    return;
                }
                let id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_finds.insert(id, (peer, reply));
            }
            Command::FindProviders { key, results } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(kad::RecordKey::new(&key));
                self.pending_providers.insert(id, results);
            }
            Command::StartProviding { key, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(kad::RecordKey::new(&key))
                    .map(|_| ())
                    .map_err(|e| DiscoveryError::Routing(e.to_string()));
                let _ = reply.send(result);
            }
            Command::CachedAddresses { peer, reply } => {
                let _ = reply.send(self.cached(&peer));
            }
            Command::RoutingTable { reply } => {
                let mut table = Vec::new();
                for bucket in self.swarm.behaviour_mut().kademlia.kbuckets() {
                    for entry in bucket.iter() {
                        table.push(PeerInfo {
                            peer: *entry.node.key.preimage(),
                            addrs: entry.node.value.iter().cloned().collect(),
                        });
                    }
                }
                let _ = reply.send(table);
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::SetInbound { sink } => {
                debug!(enabled = sink.is_some(), "inbound sink updated");
                self.inbound = sink;
            }
            Command::ReserveRelays { candidates } => self.reserve_relays(candidates),
        }
    }

    fn reserve_relays(&mut self, candidates: Vec<PeerInfo>) {
        if !matches!(
            self.swarm.behaviour().autonat.nat_status(),
            autonat::NatStatus::Private
        ) {
            return;
        }
        for candidate in candidates {
            if self.relays.len() >= self.relay_count {
                break;
            }
            if self.relays.contains(&candidate.peer) {
                continue;
            }
            let Some(addr) = candidate.addrs.first() else {
                continue;
            };
            let circuit = addr
                .clone()
                .with(Protocol::P2p(candidate.peer))
                .with(Protocol::P2pCircuit);
            match self.swarm.listen_on(circuit.clone()) {
                Ok(_) => {
                    info!(relay = %candidate.peer, "requested relay reservation");
                    self.relays.insert(candidate.peer);
                }
                Err(e) => debug!(%circuit, error = %e, "relay reservation failed"),
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<MurmurBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(peer = %peer_id, "connection established");
                if let ConnectedPoint::Dialer { address, .. } = &endpoint {
                    self.remember(peer_id, address.clone());
                }
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(peer = %peer_id, "connection closed");
                self.relays.remove(&peer_id);
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                debug!(peer = %peer_id, error = %error, "outgoing connection failed");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(TransportError::ConnectionFailed(error.to_string())));
                    }
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: MurmurBehaviourEvent) {
        match event {
            MurmurBehaviourEvent::Messaging(event) => self.handle_messaging_event(event),
            MurmurBehaviourEvent::Kademlia(event) => self.handle_kademlia_event(event),
            MurmurBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "identified peer");
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.remember(peer_id, addr);
                }
            }
            MurmurBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!(?old, ?new, "NAT status changed");
            }
            MurmurBehaviourEvent::Dcutr(event) => debug!(?event, "hole punching"),
            _ => {}
        }
    }

    fn handle_messaging_event(&mut self, event: request_response::Event<Envelope, Envelope>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let Some(sink) = &self.inbound else {
                        debug!(%peer, "no listener, dropping inbound request");
                        return;
                    };
                    let inbound = InboundRequest {
                        peer,
                        envelope: request,
                        channel,
                    };
                    if sink.try_send(inbound).is_err() {
                        warn!(%peer, "inbound queue full, dropping request");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!(%peer, error = %error, "outbound request failed");
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(map_outbound_failure(error)));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, error = %error, "inbound request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                for addr in addresses.iter() {
                    self.remember(peer, addr.clone());
                }
                self.settle_finds_for(peer);
            }
            kad::Event::RoutablePeer { peer, address }
            | kad::Event::PendingRoutablePeer { peer, address } => {
                self.remember(peer, address);
                self.settle_finds_for(peer);
            }
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::GetClosestPeers(_) => {
                    if step.last {
                        if let Some((peer, reply)) = self.pending_finds.remove(&id) {
                            let _ = reply.send(self.cached(&peer));
                        }
                    }
                }
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    let Entry::Occupied(entry) = self.pending_providers.entry(id) else {
                        return;
                    };
                    let mut closed = false;
                    for peer in providers {
                        let info = PeerInfo {
                            peer,
                            addrs: self.addresses.get(&peer).cloned().unwrap_or_default(),
                        };
                        if entry.get().try_send(info).is_err() {
                            closed = true;
                            break;
                        }
                    }
                    if closed || step.last {
                        entry.remove();
                        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                            query.finish();
                        }
                    }
                }
                kad::QueryResult::GetProviders(_) => {
                    if step.last {
                        self.pending_providers.remove(&id);
                    }
                }
                kad::QueryResult::StartProviding(Err(e)) => {
                    debug!(error = %e, "providing failed");
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    debug!(remaining = ok.num_remaining, "DHT bootstrap progressed");
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Answer lookups waiting on `peer` as soon as an address shows up
    fn settle_finds_for(&mut self, peer: PeerId) {
        let settled: Vec<kad::QueryId> = self
            .pending_finds
            .iter()
            .filter(|(_, (target, _))| *target == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in settled {
            if let Some((peer, reply)) = self.pending_finds.remove(&id) {
                let _ = reply.send(self.cached(&peer));
            }
            if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                query.finish();
            }
        }
    }
}

fn map_outbound_failure(error: request_response::OutboundFailure) -> TransportError {
    match error {
        request_response::OutboundFailure::DialFailure
        | request_response::OutboundFailure::UnsupportedProtocols => {
            TransportError::ConnectionFailed(error.to_string())
        }
        request_response::OutboundFailure::Timeout => TransportError::Timeout(REQUEST_TIMEOUT),
        _ => TransportError::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_failure_mapping() {
        assert!(matches!(
            map_outbound_failure(request_response::OutboundFailure::DialFailure),
            TransportError::ConnectionFailed(_)
        ));
        assert!(matches!(
            map_outbound_failure(request_response::OutboundFailure::UnsupportedProtocols),
            TransportError::ConnectionFailed(_)
        ));
        assert!(matches!(
            map_outbound_failure(request_response::OutboundFailure::Timeout),
            TransportError::Timeout(_)
        ));
        assert!(matches!(
            map_outbound_failure(request_response::OutboundFailure::ConnectionClosed),
            TransportError::Disconnected
        ));
    }
}
