//! Transport layer abstraction
//!
//! Two interchangeable implementations sit behind one contract:
//! - [`overlay`]: libp2p streams, addressed by peer id
//! - [`onion`]: Tor onion services, addressed by v3 service id
//!
//! plus an in-memory transport used by tests.
//!
//! # Design
//!
//! A [`Transport`] dials and listens. Both produce [`Connection`]s that move
//! whole [`Envelope`]s; framing and stream semantics stay inside each
//! implementation. The handshake on top lives in [`crate::protocol`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::TransportMode;
use crate::discovery::DiscoveryError;
use crate::message::Envelope;

pub mod framing;
pub mod onion;
pub mod overlay;

/// Violations of the wire protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Zero-length frame
    #[error("Empty frame")]
    EmptyFrame,

    /// Declared frame length above the limit
    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Payload is not an envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Inbound envelope failed verification
    #[error("Envelope signature rejected")]
    InvalidSignature,

    /// Response is not an ack for the envelope we sent
    #[error("Unexpected response: type={kind} body={body}")]
    UnexpectedAck {
        /// Observed type
        kind: String,
        /// Observed body
        body: String,
    },

    /// Ack is correlated but not signed by the addressee
    #[error("Ack signature invalid")]
    InvalidAckSignature,
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The local SOCKS5 proxy refused or failed the request
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// The routing daemon control channel failed
    #[error("Control channel error: {0}")]
    Control(String),

    /// The listening endpoint could not be registered
    #[error("Endpoint registration failed: {0}")]
    Registration(String),

    /// Address is not valid for this transport
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Peer could not be located
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Connection closed
    #[error("Connection closed")]
    Disconnected,

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The listener was closed
    #[error("Listener closed")]
    ListenerClosed,

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violation
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One logical exchange with a peer
#[async_trait]
pub trait Connection: Send {
    /// Send one envelope
    async fn send(&mut self, envelope: &Envelope) -> TransportResult<()>;

    /// Receive one envelope
    ///
    /// Blocks until an envelope arrives, the peer goes away, or the
    /// transport's own read deadline passes.
    async fn receive(&mut self) -> TransportResult<Envelope>;

    /// Close the connection
    async fn close(&mut self) -> TransportResult<()>;
}

/// A registered listening endpoint
///
/// Methods take `&self` so the accept loop, the liveness probe and the
/// supervisor can share one listener.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> TransportResult<Box<dyn Connection>>;

    /// Check that the endpoint is still published
    async fn probe(&self) -> TransportResult<()>;

    /// Hand out the auxiliary status-page socket, if this transport has one
    async fn take_status_socket(&self) -> Option<tokio::net::TcpListener>;

    /// Unregister the endpoint. Pending and later `accept`s fail.
    async fn close(&self) -> TransportResult<()>;
}

/// A network substrate
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which address space this transport serves
    fn mode(&self) -> TransportMode;

    /// Our own address
    fn local_address(&self) -> &str;

    /// Reject addresses this transport cannot dial
    fn validate_address(&self, address: &str) -> TransportResult<()> {
        crate::identity::validate_address(self.mode(), address)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    /// The form of `address` used in envelopes and for dialing
    fn canonical_address(&self, address: &str) -> TransportResult<String> {
        crate::identity::canonical_address(self.mode(), address)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    /// Bound on establishing one outbound connection
    fn connect_timeout(&self) -> Duration {
        self.mode().connect_timeout()
    }

    /// Whether streams are already bound to the remote peer's key
    ///
    /// When false, responses must carry their own verifiable signature.
    fn authenticates_peers(&self) -> bool;

    /// Open a connection to `address`
    async fn dial(&self, address: &str) -> TransportResult<Box<dyn Connection>>;

    /// Publish a listening endpoint
    async fn listen(&self) -> TransportResult<Box<dyn Listener>>;
}

/// In-memory transport for testing
///
/// Uses channels to simulate a network of listening addresses.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;

    /// Create a pair of connected in-memory connections
    pub fn create_pair() -> (MemoryConnection, MemoryConnection) {
        let (tx1, rx1) = mpsc::channel(16);
        let (tx2, rx2) = mpsc::channel(16);

        let connection1 = MemoryConnection {
            tx: tx1,
            rx: rx2,
            connected: true,
        };

        let connection2 = MemoryConnection {
            tx: tx2,
            rx: rx1,
            connected: true,
        };

        (connection1, connection2)
    }

    /// In-memory connection endpoint
    pub struct MemoryConnection {
        tx: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
        connected: bool,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send(&mut self, envelope: &Envelope) -> TransportResult<()> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.tx
                .send(envelope.clone())
                .await
                .map_err(|_| TransportError::Disconnected)
        }

        async fn receive(&mut self) -> TransportResult<Envelope> {
            if !self.connected {
                return Err(TransportError::Disconnected);
            }

            self.rx.recv().await.ok_or(TransportError::Disconnected)
        }

        async fn close(&mut self) -> TransportResult<()> {
            self.connected = false;
            self.rx.close();
            Ok(())
        }
    }

    #[derive(Default)]
    struct NetworkState {
        listeners: HashMap<String, mpsc::Sender<MemoryConnection>>,
        listen_attempts: usize,
        failing_listens: usize,
        unhealthy: bool,
    }

    /// A shared switchboard of listening addresses
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    impl MemoryNetwork {
        /// Empty network
        pub fn new() -> Self {
            Self::default()
        }

        /// A transport that listens as `address`
        pub fn transport(&self, address: impl Into<String>, mode: TransportMode) -> MemoryTransport {
            MemoryTransport {
                address: address.into(),
                mode,
                network: self.clone(),
                authenticates_peers: mode == TransportMode::Overlay,
            }
        }

        /// Make the next `n` calls to `listen` fail
        pub async fn fail_next_listens(&self, n: usize) {
            self.state.lock().await.failing_listens = n;
        }

        /// Make every listener's probe fail (or succeed again)
        pub async fn set_healthy(&self, healthy: bool) {
            self.state.lock().await.unhealthy = !healthy;
        }

        /// Number of `listen` calls so far, failed ones included
        pub async fn listen_attempts(&self) -> usize {
            self.state.lock().await.listen_attempts
        }

        /// Whether `address` currently has a registered listener
        pub async fn is_listening(&self, address: &str) -> bool {
            self.state.lock().await.listeners.contains_key(address)
        }
    }

    /// One node's view of a [`MemoryNetwork`]
    pub struct MemoryTransport {
        address: String,
        mode: TransportMode,
        network: MemoryNetwork,
        authenticates_peers: bool,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        fn mode(&self) -> TransportMode {
            self.mode
        }

        fn local_address(&self) -> &str {
            &self.address
        }

        fn connect_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn authenticates_peers(&self) -> bool {
            self.authenticates_peers
        }

        async fn dial(&self, address: &str) -> TransportResult<Box<dyn Connection>> {
            self.validate_address(address)?;
            let inbound = self.network.state.lock().await.listeners.get(address).cloned();
            let inbound = inbound.ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no listener at {address}"))
            })?;

            let (local, remote) = create_pair();
            inbound
                .send(remote)
                .await
                .map_err(|_| TransportError::ConnectionFailed(format!("{address} stopped listening")))?;
            Ok(Box::new(local))
        }

        async fn listen(&self) -> TransportResult<Box<dyn Listener>> {
            let mut state = self.network.state.lock().await;
            state.listen_attempts += 1;
            if state.failing_listens > 0 {
                state.failing_listens -= 1;
                return Err(TransportError::Registration("simulated failure".into()));
            }
            if state.listeners.contains_key(&self.address) {
                return Err(TransportError::Registration(format!(
                    "{} is already listening",
                    self.address
                )));
            }

            let (tx, rx) = mpsc::channel(16);
            state.listeners.insert(self.address.clone(), tx);
            Ok(Box::new(MemoryListener {
                address: self.address.clone(),
                network: self.network.clone(),
                inbound: Mutex::new(rx),
                closed: CancellationToken::new(),
            }))
        }
    }

    /// Listener registered on a [`MemoryNetwork`]
    pub struct MemoryListener {
        address: String,
        network: MemoryNetwork,
        inbound: Mutex<mpsc::Receiver<MemoryConnection>>,
        closed: CancellationToken,
    }

    #[async_trait]
    impl Listener for MemoryListener {
        async fn accept(&self) -> TransportResult<Box<dyn Connection>> {
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                connection = inbound.recv() => match connection {
                    Some(connection) => Ok(Box::new(connection) as Box<dyn Connection>),
                    None => Err(TransportError::ListenerClosed),
                },
                _ = self.closed.cancelled() => Err(TransportError::ListenerClosed),
            }
        }

        async fn probe(&self) -> TransportResult<()> {
            if self.closed.is_cancelled() {
                return Err(TransportError::ListenerClosed);
            }
            if self.network.state.lock().await.unhealthy {
                return Err(TransportError::Control("probe failed".into()));
            }
            Ok(())
        }

        async fn take_status_socket(&self) -> Option<tokio::net::TcpListener> {
            None
        }

        async fn close(&self) -> TransportResult<()> {
            self.closed.cancel();
            self.network.state.lock().await.listeners.remove(&self.address);
            Ok(())
        }
    }
}
