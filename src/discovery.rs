//! Peer address resolution for the overlay transport
//!
//! A direct DHT lookup is tried first. When it finds nothing, we announce
//! ourselves under the shared rendezvous namespace and scan the peers
//! advertised there for the target. Every stage is bounded in time and is
//! cancelled by dropping the future.

use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::transport::overlay::RelayCandidates;

/// Bound on a direct DHT lookup
pub const FIND_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the whole rendezvous scan
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the follow-up lookup when rendezvous yields a bare peer id
pub const SECONDARY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Discovery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Every stage finished without finding the peer
    #[error("Peer {0} not found")]
    NotFound(PeerId),

    /// A stage ran out of time
    #[error("Lookup for {0} timed out")]
    TimedOut(PeerId),

    /// The routing layer itself failed
    #[error("Routing error: {0}")]
    Routing(String),
}

/// A peer and the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer identity
    pub peer: PeerId,
    /// Known addresses, possibly empty
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    /// Peer with no known addresses
    pub fn bare(peer: PeerId) -> Self {
        PeerInfo {
            peer,
            addrs: Vec::new(),
        }
    }
}

/// The routing primitives discovery is built on
#[async_trait]
pub trait PeerRouting: Send + Sync {
    /// Our own peer id
    fn local_peer_id(&self) -> PeerId;

    /// DHT lookup of one peer's addresses
    async fn find_peer(&self, peer: PeerId) -> Result<PeerInfo, DiscoveryError>;

    /// Announce ourselves as a provider of `namespace`
    async fn advertise(&self, namespace: &str) -> Result<(), DiscoveryError>;

    /// Stream the providers of `namespace` as they are found
    async fn find_providers(&self, namespace: &str) -> Result<mpsc::Receiver<PeerInfo>, DiscoveryError>;

    /// Addresses already learned for `peer` from earlier traffic
    async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr>;

    /// Current routing table contents
    async fn routing_table(&self) -> Vec<PeerInfo>;
}

/// DHT lookup with rendezvous fallback
pub struct Discovery<R> {
    routing: R,
    namespace: String,
    find_timeout: Duration,
    rendezvous_timeout: Duration,
    secondary_timeout: Duration,
}

impl<R: PeerRouting> Discovery<R> {
    /// Discovery over `routing`, advertising under `namespace`
    pub fn new(routing: R, namespace: impl Into<String>) -> Self {
        Discovery {
            routing,
            namespace: namespace.into(),
            find_timeout: FIND_PEER_TIMEOUT,
            rendezvous_timeout: RENDEZVOUS_TIMEOUT,
            secondary_timeout: SECONDARY_LOOKUP_TIMEOUT,
        }
    }

    /// Override the stage bounds
    pub fn with_timeouts(mut self, find: Duration, rendezvous: Duration, secondary: Duration) -> Self {
        self.find_timeout = find;
        self.rendezvous_timeout = rendezvous;
        self.secondary_timeout = secondary;
        self
    }

    /// The routing layer
    pub fn routing(&self) -> &R {
        &self.routing
    }

    /// Namespace we advertise under
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Announce ourselves under the rendezvous namespace
    pub async fn advertise(&self) -> Result<(), DiscoveryError> {
        self.routing.advertise(&self.namespace).await?;
        info!(namespace = %self.namespace, "advertising on rendezvous namespace");
        Ok(())
    }

    /// Direct DHT lookup. A result with no addresses counts as not found.
    pub async fn find_peer(&self, peer: PeerId) -> Result<PeerInfo, DiscoveryError> {
        debug!(%peer, "DHT find_peer");
        let info = tokio::time::timeout(self.find_timeout, self.routing.find_peer(peer))
            .await
            .map_err(|_| DiscoveryError::TimedOut(peer))??;
        if info.addrs.is_empty() {
            return Err(DiscoveryError::NotFound(peer));
        }
        debug!(%peer, addrs = info.addrs.len(), "DHT find_peer succeeded");
        Ok(info)
    }

    /// Scan the rendezvous namespace for `target`
    ///
    /// A hit with zero addresses triggers one more direct lookup, then a
    /// check of the address cache; if both come up empty the bare peer id is
    /// returned and dialing is left to whatever the host already knows.
    pub async fn find_peers_rendezvous(&self, target: PeerId) -> Result<PeerInfo, DiscoveryError> {
        debug!(namespace = %self.namespace, %target, "searching rendezvous namespace");
        let scan = async {
            // advertising is best-effort; the scan can still succeed without it
            if let Err(e) = self.routing.advertise(&self.namespace).await {
                debug!(error = %e, "rendezvous advertise failed");
            }

            let local = self.routing.local_peer_id();
            let mut providers = self.routing.find_providers(&self.namespace).await?;
            while let Some(found) = providers.recv().await {
                if found.peer == local {
                    continue;
                }
                debug!(peer = %found.peer, addrs = found.addrs.len(), "rendezvous peer");
                if found.peer == target {
                    return Ok(self.fill_addresses(found).await);
                }
            }
            Err(DiscoveryError::NotFound(target))
        };

        tokio::time::timeout(self.rendezvous_timeout, scan)
            .await
            .map_err(|_| DiscoveryError::TimedOut(target))?
    }

    async fn fill_addresses(&self, found: PeerInfo) -> PeerInfo {
        if !found.addrs.is_empty() {
            return found;
        }

        let peer = found.peer;
        debug!(%peer, "rendezvous hit without addresses, looking up directly");
        if let Ok(Ok(info)) =
            tokio::time::timeout(self.secondary_timeout, self.routing.find_peer(peer)).await
        {
            if !info.addrs.is_empty() {
                return info;
            }
        }

        let cached = self.routing.cached_addresses(peer).await;
        if !cached.is_empty() {
            debug!(%peer, addrs = cached.len(), "using cached addresses");
            return PeerInfo {
                peer,
                addrs: cached,
            };
        }

        debug!(%peer, "no addresses known, returning peer id only");
        found
    }

    /// Resolve `peer` to dialable addresses: DHT first, then rendezvous
    pub async fn resolve(&self, peer: PeerId) -> Result<PeerInfo, DiscoveryError> {
        match self.find_peer(peer).await {
            Ok(info) => Ok(info),
            Err(e) => {
                debug!(%peer, error = %e, "DHT lookup failed, trying rendezvous");
                self.find_peers_rendezvous(peer).await
            }
        }
    }
}

#[async_trait]
impl<R: PeerRouting> RelayCandidates for Discovery<R> {
    async fn relay_candidates(&self, count: usize) -> Vec<PeerInfo> {
        self.routing
            .routing_table()
            .await
            .into_iter()
            .filter(|info| !info.addrs.is_empty())
            .take(count)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted routing layer
    #[derive(Default)]
    struct FakeRouting {
        local: Option<PeerId>,
        dht: HashMap<PeerId, Vec<Multiaddr>>,
        providers: Vec<PeerInfo>,
        cache: HashMap<PeerId, Vec<Multiaddr>>,
        hang_find: bool,
        advertised: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerRouting for FakeRouting {
        fn local_peer_id(&self) -> PeerId {
            self.local.unwrap_or(PeerId::random())
        }

        async fn find_peer(&self, peer: PeerId) -> Result<PeerInfo, DiscoveryError> {
            if self.hang_find {
                std::future::pending::<()>().await;
            }
            Ok(PeerInfo {
                peer,
                addrs: self.dht.get(&peer).cloned().unwrap_or_default(),
            })
        }

        async fn advertise(&self, namespace: &str) -> Result<(), DiscoveryError> {
            self.advertised.lock().unwrap().push(namespace.to_string());
            Ok(())
        }

        async fn find_providers(
            &self,
            _namespace: &str,
        ) -> Result<mpsc::Receiver<PeerInfo>, DiscoveryError> {
            let (tx, rx) = mpsc::channel(self.providers.len().max(1));
            for info in &self.providers {
                tx.try_send(info.clone()).unwrap();
            }
            Ok(rx)
        }

        async fn cached_addresses(&self, peer: PeerId) -> Vec<Multiaddr> {
            self.cache.get(&peer).cloned().unwrap_or_default()
        }

        async fn routing_table(&self) -> Vec<PeerInfo> {
            self.providers.clone()
        }
    }

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/10.0.0.1/tcp/{port}").parse().unwrap()
    }

    fn discovery(routing: FakeRouting) -> Discovery<FakeRouting> {
        Discovery::new(routing, "murmur/v1").with_timeouts(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_direct_lookup() {
        let target = PeerId::random();
        let mut routing = FakeRouting::default();
        routing.dht.insert(target, vec![addr(1)]);

        let info = discovery(routing).resolve(target).await.unwrap();
        assert_eq!(info.addrs, vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_empty_lookup_is_not_found() {
        let target = PeerId::random();
        let found = discovery(FakeRouting::default()).find_peer(target).await;
        assert_eq!(found, Err(DiscoveryError::NotFound(target)));
    }

    #[tokio::test]
    async fn test_rendezvous_with_addresses() {
        let target = PeerId::random();
        let local = PeerId::random();
        let routing = FakeRouting {
            local: Some(local),
            providers: vec![
                PeerInfo::bare(local),
                PeerInfo {
                    peer: PeerId::random(),
                    addrs: vec![addr(2)],
                },
                PeerInfo {
                    peer: target,
                    addrs: vec![addr(3)],
                },
            ],
            ..Default::default()
        };
        let discovery = discovery(routing);

        let info = discovery.resolve(target).await.unwrap();
        assert_eq!(info.addrs, vec![addr(3)]);
        assert_eq!(
            *discovery.routing().advertised.lock().unwrap(),
            vec!["murmur/v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rendezvous_zero_addresses_uses_cache() {
        let target = PeerId::random();
        let mut routing = FakeRouting {
            providers: vec![PeerInfo::bare(target)],
            ..Default::default()
        };
        routing.cache.insert(target, vec![addr(4)]);

        let info = discovery(routing).find_peers_rendezvous(target).await.unwrap();
        assert_eq!(info.peer, target);
        assert_eq!(info.addrs, vec![addr(4)]);
    }

    #[tokio::test]
    async fn test_rendezvous_zero_addresses_nothing_known() {
        let target = PeerId::random();
        let routing = FakeRouting {
            providers: vec![PeerInfo::bare(target)],
            ..Default::default()
        };

        let info = discovery(routing).find_peers_rendezvous(target).await.unwrap();
        assert_eq!(info, PeerInfo::bare(target));
    }

    #[tokio::test]
    async fn test_rendezvous_exhausted() {
        let target = PeerId::random();
        let routing = FakeRouting {
            providers: vec![PeerInfo::bare(PeerId::random())],
            ..Default::default()
        };

        assert_eq!(
            discovery(routing).resolve(target).await,
            Err(DiscoveryError::NotFound(target))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_is_bounded() {
        let target = PeerId::random();
        let routing = FakeRouting {
            hang_find: true,
            ..Default::default()
        };

        assert_eq!(
            discovery(routing).find_peer(target).await,
            Err(DiscoveryError::TimedOut(target))
        );
    }

    #[tokio::test]
    async fn test_relay_candidates_need_addresses() {
        let reachable = PeerInfo {
            peer: PeerId::random(),
            addrs: vec![addr(5)],
        };
        let routing = FakeRouting {
            providers: vec![PeerInfo::bare(PeerId::random()), reachable.clone()],
            ..Default::default()
        };

        assert_eq!(discovery(routing).relay_candidates(2).await, vec![reachable]);
    }
}
