//! Published onion service: two loopback sockets behind one service id

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::ControlClient;
use crate::config::TorConfig;
use crate::identity::OnionIdentity;
use crate::transport::framing::FramedConnection;
use crate::transport::{Connection, Listener, TransportError, TransportResult};

/// A registered onion service
///
/// The message port and the status port are forwarded by Tor to two
/// loopback listeners. The control connection stays open for the lifetime
/// of the service so it can be probed and removed.
pub struct OnionListener {
    service_id: String,
    messages: TcpListener,
    message_addr: SocketAddr,
    status: Mutex<Option<TcpListener>>,
    control: Mutex<Option<ControlClient>>,
    closed: CancellationToken,
}

impl OnionListener {
    /// Bind both loopback sockets and publish them under our own key
    pub async fn bind(identity: &OnionIdentity, tor: &TorConfig) -> TransportResult<Self> {
        let messages = TcpListener::bind("127.0.0.1:0").await?;
        let message_addr = messages.local_addr()?;
        let status = TcpListener::bind("127.0.0.1:0").await?;
        let status_addr = status.local_addr()?;
        debug!(%message_addr, %status_addr, "onion loopback listeners bound");

        let mut control =
            ControlClient::connect(tor.control_addr, tor.control_password.as_deref()).await?;
        let ports = [
            (tor.message_port, message_addr.port()),
            (tor.status_port, status_addr.port()),
        ];
        let service_id = control
            .add_onion(&identity.control_key_blob(), &ports)
            .await
            .map_err(|e| match e {
                TransportError::Control(reason) => TransportError::Registration(reason),
                other => other,
            })?;

        let expected = identity.address().as_str();
        if service_id != expected {
            if let Err(e) = control.del_onion(&service_id).await {
                warn!(error = %e, "failed to remove mismatched onion service");
            }
            return Err(TransportError::Registration(format!(
                "service id mismatch: expected {expected}, got {service_id}"
            )));
        }

        info!(
            service = %format!("{service_id}.onion"),
            message_port = tor.message_port,
            status_port = tor.status_port,
            "onion service published"
        );

        Ok(OnionListener {
            service_id,
            messages,
            message_addr,
            status: Mutex::new(Some(status)),
            control: Mutex::new(Some(control)),
            closed: CancellationToken::new(),
        })
    }

    /// Published service id
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Loopback address Tor forwards the message port to
    pub fn message_addr(&self) -> SocketAddr {
        self.message_addr
    }
}

#[async_trait]
impl Listener for OnionListener {
    async fn accept(&self) -> TransportResult<Box<dyn Connection>> {
        tokio::select! {
            accepted = self.messages.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "inbound onion connection");
                Ok(Box::new(FramedConnection::new(stream)) as Box<dyn Connection>)
            }
            _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
        }
    }

    async fn probe(&self) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }
        match self.control.lock().await.as_mut() {
            Some(control) => control.version().await.map(|_| ()),
            None => Err(TransportError::ListenerClosed),
        }
    }

    async fn take_status_socket(&self) -> Option<TcpListener> {
        self.status.lock().await.take()
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.cancel();
        let control = self.control.lock().await.take();
        if let Some(mut control) = control {
            control.del_onion(&self.service_id).await?;
            info!(service = %self.service_id, "onion service removed");
        }
        Ok(())
    }
}
