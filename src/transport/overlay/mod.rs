//! libp2p overlay transport
//!
//! Addresses are peer ids. Dialing resolves the peer through
//! [`Discovery`] and connects; each envelope then travels as one
//! request-response exchange, so a [`Connection`] here is a single
//! request plus its response. Streams are authenticated by noise, so the
//! remote key is already bound to the peer id.

pub mod codec;
pub mod host;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::request_response::ResponseChannel;
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use host::{HostHandle, InboundRequest};

use super::{Connection, Listener, Transport, TransportError, TransportResult};
use crate::config::{OverlayConfig, TransportMode};
use crate::discovery::{Discovery, PeerInfo};
use crate::message::Envelope;

/// Source of peers to request relay reservations from
#[async_trait]
pub trait RelayCandidates: Send + Sync {
    /// Up to `count` peers with known addresses
    async fn relay_candidates(&self, count: usize) -> Vec<PeerInfo>;
}

/// Transport over the libp2p overlay
pub struct OverlayTransport {
    host: HostHandle,
    discovery: Arc<Discovery<HostHandle>>,
    address: String,
}

impl OverlayTransport {
    /// Start the host, then wire discovery in as its relay source
    pub fn start(keypair: Keypair, config: &OverlayConfig) -> TransportResult<Self> {
        let address = keypair.public().to_peer_id().to_string();
        let host = HostHandle::spawn(keypair, config)?;
        let discovery = Arc::new(Discovery::new(host.clone(), config.namespace.clone()));
        host.install_relay_candidates(discovery.clone());
        Ok(OverlayTransport {
            host,
            discovery,
            address,
        })
    }

    /// Handle to the host task
    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    /// Peer resolution
    pub fn discovery(&self) -> &Discovery<HostHandle> {
        &self.discovery
    }

    /// Give the DHT up to `wait` to find its first peers
    pub async fn wait_for_bootstrap(&self, wait: Duration) -> usize {
        self.host.wait_for_bootstrap(wait).await
    }

    fn parse_peer(address: &str) -> TransportResult<PeerId> {
        PeerId::from_str(address).map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }
}

impl Drop for OverlayTransport {
    fn drop(&mut self) {
        self.host.shutdown();
    }
}

#[async_trait]
impl Transport for OverlayTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Overlay
    }

    fn local_address(&self) -> &str {
        &self.address
    }

    fn authenticates_peers(&self) -> bool {
        true
    }

    async fn dial(&self, address: &str) -> TransportResult<Box<dyn Connection>> {
        let peer = Self::parse_peer(address)?;
        let info = self.discovery.resolve(peer).await?;
        debug!(%peer, addrs = info.addrs.len(), "dialing overlay peer");

        let timeout = self.connect_timeout();
        tokio::time::timeout(timeout, self.host.dial(peer, info.addrs))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        Ok(Box::new(OutboundConnection {
            host: self.host.clone(),
            peer,
            response: None,
        }))
    }

    async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
        let (sink, inbound) = mpsc::channel(64);
        self.host.set_inbound(Some(sink)).await?;
        if let Err(e) = self.discovery.advertise().await {
            warn!(error = %e, "rendezvous advertise failed");
        }
        Ok(Box::new(OverlayListener {
            host: self.host.clone(),
            inbound: Mutex::new(inbound),
            closed: CancellationToken::new(),
        }))
    }
}

/// Our side of one outbound request
struct OutboundConnection {
    host: HostHandle,
    peer: PeerId,
    response: Option<oneshot::Receiver<TransportResult<Envelope>>>,
}

#[async_trait]
impl Connection for OutboundConnection {
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<()> {
        if self.response.is_some() {
            return Err(TransportError::ConnectionFailed(
                "one request per overlay connection".into(),
            ));
        }
        let response = self.host.send_request(self.peer, envelope.clone()).await?;
        self.response = Some(response);
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Envelope> {
        let response = self.response.take().ok_or(TransportError::Disconnected)?;
        response.await.map_err(|_| TransportError::Disconnected)?
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.response = None;
        Ok(())
    }
}

/// The remote side's request, answered at most once
struct InboundConnection {
    host: HostHandle,
    request: Option<Envelope>,
    channel: Option<ResponseChannel<Envelope>>,
}

#[async_trait]
impl Connection for InboundConnection {
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<()> {
        let channel = self.channel.take().ok_or(TransportError::Disconnected)?;
        self.host.respond(channel, envelope.clone()).await
    }

    async fn receive(&mut self) -> TransportResult<Envelope> {
        self.request.take().ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> TransportResult<()> {
        // an unanswered channel resets the stream when dropped
        self.channel = None;
        Ok(())
    }
}

/// Receives inbound requests routed from the host task
pub struct OverlayListener {
    host: HostHandle,
    inbound: Mutex<mpsc::Receiver<InboundRequest>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for OverlayListener {
    async fn accept(&self) -> TransportResult<Box<dyn Connection>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            request = inbound.recv() => match request {
                Some(request) => {
                    debug!(peer = %request.peer, "inbound overlay request");
                    Ok(Box::new(InboundConnection {
                        host: self.host.clone(),
                        request: Some(request.envelope),
                        channel: Some(request.channel),
                    }) as Box<dyn Connection>)
                }
                None => Err(TransportError::ListenerClosed),
            },
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
        }
    }

    async fn probe(&self) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }
        if self.host.is_stopped() {
            return Err(TransportError::Control("overlay host stopped".into()));
        }
        let addrs = self.host.listen_addrs().await?;
        if addrs.is_empty() {
            return Err(TransportError::Control("no listen addresses".into()));
        }
        Ok(())
    }

    async fn take_status_socket(&self) -> Option<tokio::net::TcpListener> {
        None
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        self.host.set_inbound(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;

    fn local_config() -> OverlayConfig {
        OverlayConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            bootstrap: Vec::new(),
            ..OverlayConfig::default()
        }
    }

    async fn first_listen_addr(host: &HostHandle) -> libp2p::Multiaddr {
        for _ in 0..100 {
            if let Some(addr) = host.listen_addrs().await.unwrap().into_iter().next() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("host never started listening");
    }

    #[tokio::test]
    async fn test_request_response_between_local_hosts() {
        let server = OverlayTransport::start(Keypair::generate_ed25519(), &local_config()).unwrap();
        let client = OverlayTransport::start(Keypair::generate_ed25519(), &local_config()).unwrap();
        let listener = server.listen().await.unwrap();

        let server_peer = PeerId::from_str(server.local_address()).unwrap();
        let addr = first_listen_addr(server.host()).await;
        client.host().dial(server_peer, vec![addr]).await.unwrap();

        // the peer is now cached, so resolution succeeds without the DHT
        let mut outbound = client.dial(server.local_address()).await.unwrap();
        let ping = Envelope::new(client.local_address(), server.local_address(), kind::PING, "");
        outbound.send(&ping).await.unwrap();

        let mut inbound = listener.accept().await.unwrap();
        let received = inbound.receive().await.unwrap();
        assert_eq!(received, ping);
        let ack = Envelope::ack_for(&received, server.local_address());
        inbound.send(&ack).await.unwrap();

        assert_eq!(outbound.receive().await.unwrap(), ack);
        assert!(listener.probe().await.is_ok());

        listener.close().await.unwrap();
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let transport = OverlayTransport::start(Keypair::generate_ed25519(), &local_config()).unwrap();
        assert!(matches!(
            transport.dial("5jfgyy7ctrjavpxvkb5rglwf7gkuo5vox27hxescd3vgsfcg2iwfmxqd").await,
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(transport.authenticates_peers());
    }
}
