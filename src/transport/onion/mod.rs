//! Tor onion-service transport
//!
//! Outbound connections go through the local SOCKS5 proxy to
//! `<address>.onion:<message port>`. Inbound connections arrive on a
//! loopback socket that the local Tor daemon forwards from our published
//! service. Streams carry length-prefixed envelope frames, see
//! [`framing`](super::framing).
//!
//! Tor does not tell the receiving side who dialed, so peers are not
//! authenticated by the stream and acks must be signature-checked.

pub mod control;
mod listener;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

pub use control::ControlClient;
pub use listener::OnionListener;

use super::framing::FramedConnection;
use super::{Connection, Listener, Transport, TransportError, TransportResult};
use crate::config::{TorConfig, TransportMode};
use crate::crypto::OnionAddress;
use crate::identity::OnionIdentity;

/// Bound on each reachability check in [`check_tor_available`]
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport over the local Tor daemon
pub struct OnionTransport {
    identity: OnionIdentity,
    tor: TorConfig,
}

impl OnionTransport {
    /// Transport publishing `identity` through the daemon described by `tor`
    pub fn new(identity: OnionIdentity, tor: TorConfig) -> Self {
        OnionTransport { identity, tor }
    }
}

#[async_trait]
impl Transport for OnionTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Onion
    }

    fn local_address(&self) -> &str {
        self.identity.address().as_str()
    }

    fn authenticates_peers(&self) -> bool {
        false
    }

    async fn dial(&self, address: &str) -> TransportResult<Box<dyn Connection>> {
        let address = OnionAddress::parse(address)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        let host = format!("{}.onion", address.as_str());
        let timeout = self.connect_timeout();
        debug!(%host, port = self.tor.message_port, "dialing through tor");

        let stream = tokio::time::timeout(
            timeout,
            Socks5Stream::connect(self.tor.socks_addr, (host.as_str(), self.tor.message_port)),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Proxy(format!("{host}: {e}")))?;

        Ok(Box::new(FramedConnection::new(stream)))
    }

    async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
        let listener = OnionListener::bind(&self.identity, &self.tor).await?;
        Ok(Box::new(listener))
    }
}

/// Check that the SOCKS port accepts connections (enough for dialing)
pub async fn check_tor_socks(tor: &TorConfig) -> TransportResult<()> {
    reachable(tor.socks_addr, "SOCKS5").await
}

/// Check that both the SOCKS port and the control port accept connections
pub async fn check_tor_available(tor: &TorConfig) -> TransportResult<()> {
    check_tor_socks(tor).await?;
    reachable(tor.control_addr, "control").await?;
    debug!("tor SOCKS5 and control ports reachable");
    Ok(())
}

async fn reachable(addr: SocketAddr, what: &str) -> TransportResult<()> {
    match tokio::time::timeout(AVAILABILITY_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
            "tor {what} port not reachable on {addr}: {e}"
        ))),
        Err(_) => Err(TransportError::Timeout(AVAILABILITY_TIMEOUT)),
    }
}
