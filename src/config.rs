//! Runtime configuration
//!
//! One [`Config`] value is built by the binary from flags and environment
//! and handed to every constructor that needs it.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

/// Public libp2p bootstrap nodes used to join the Kademlia DHT
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

/// Shared rendezvous namespace every instance advertises under
pub const RENDEZVOUS_NAMESPACE: &str = "murmur/v1";

/// Which network substrate this process speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// libp2p overlay with DHT discovery
    Overlay,
    /// Tor onion services
    Onion,
}

impl TransportMode {
    /// Interval between outbox sweeps
    pub fn outbox_interval(self) -> Duration {
        match self {
            TransportMode::Overlay => Duration::from_secs(30),
            TransportMode::Onion => Duration::from_secs(60),
        }
    }

    /// Upper bound on establishing one outbound connection
    pub fn connect_timeout(self) -> Duration {
        match self {
            TransportMode::Overlay => Duration::from_secs(30),
            TransportMode::Onion => Duration::from_secs(120),
        }
    }

    /// Lowercase name, as accepted on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Overlay => "overlay",
            TransportMode::Onion => "onion",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overlay" | "libp2p" | "clearnet" => Ok(TransportMode::Overlay),
            "onion" | "tor" => Ok(TransportMode::Onion),
            other => Err(format!("unknown transport mode '{other}' (expected overlay or onion)")),
        }
    }
}

/// Local Tor daemon endpoints and the virtual ports we publish
#[derive(Debug, Clone)]
pub struct TorConfig {
    /// SOCKS5 proxy used for every outbound dial
    pub socks_addr: SocketAddr,
    /// Control port used to publish the hidden service
    pub control_addr: SocketAddr,
    /// Password for `HASHEDPASSWORD` control authentication
    pub control_password: Option<String>,
    /// Virtual port carrying the message protocol
    pub message_port: u16,
    /// Virtual port serving the status page
    pub status_port: u16,
}

impl Default for TorConfig {
    fn default() -> Self {
        TorConfig {
            socks_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9050)),
            control_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9051)),
            control_password: None,
            message_port: 9000,
            status_port: 80,
        }
    }
}

/// libp2p host settings
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Addresses the swarm listens on
    pub listen_addrs: Vec<Multiaddr>,
    /// Kademlia bootstrap peers (must end in `/p2p/<peer id>`)
    pub bootstrap: Vec<Multiaddr>,
    /// Rendezvous namespace for the fallback lookup
    pub namespace: String,
    /// Relay reservations to hold while behind NAT
    pub relay_count: usize,
    /// How long an idle connection is kept open
    pub idle_timeout: Duration,
    /// How long to let the DHT fill before a one-shot send
    pub bootstrap_wait: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        let listen_addrs = [
            "/ip4/0.0.0.0/tcp/0",
            "/ip4/0.0.0.0/udp/0/quic-v1",
            "/ip6/::/tcp/0",
            "/ip6/::/udp/0/quic-v1",
        ];
        OverlayConfig {
            listen_addrs: listen_addrs.iter().filter_map(|a| a.parse().ok()).collect(),
            bootstrap: DEFAULT_BOOTSTRAP
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            namespace: RENDEZVOUS_NAMESPACE.to_string(),
            relay_count: 2,
            idle_timeout: Duration::from_secs(60),
            bootstrap_wait: Duration::from_secs(5),
        }
    }
}

/// Everything a murmur process needs to know about its environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding keys, queues and logs
    pub data_dir: PathBuf,
    /// Transport selected at startup
    pub mode: TransportMode,
    /// Debug-level logging
    pub verbose: bool,
    /// Tor settings (onion mode)
    pub tor: TorConfig,
    /// libp2p settings (overlay mode)
    pub overlay: OverlayConfig,
}

impl Config {
    /// Configuration rooted at `data_dir` with default settings
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            mode: TransportMode::Onion,
            verbose: false,
            tor: TorConfig::default(),
            overlay: OverlayConfig::default(),
        }
    }

    /// `~/.murmur`, if a home directory can be found
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".murmur"))
    }

    /// Select the transport mode
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Toggle debug logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Replace the Tor settings
    pub fn with_tor(mut self, tor: TorConfig) -> Self {
        self.tor = tor;
        self
    }

    /// Replace the libp2p settings
    pub fn with_overlay(mut self, overlay: OverlayConfig) -> Self {
        self.overlay = overlay;
        self
    }

    /// Default `tracing` filter directive for this configuration
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "murmur=debug"
        } else {
            "murmur=info"
        }
    }

    /// Create the data directory (mode 0700) if it does not exist
    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;

        if self.data_dir.is_dir() {
            return Ok(());
        }
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.data_dir)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// The data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Protobuf-encoded libp2p keypair
    pub fn overlay_key_path(&self) -> PathBuf {
        self.path("key.bin")
    }

    /// Onion service ed25519 key
    pub fn onion_key_path(&self) -> PathBuf {
        self.path("tor_key")
    }

    /// Retry queue
    pub fn outbox_path(&self) -> PathBuf {
        self.path("outbox.jsonl")
    }

    /// Received envelopes
    pub fn inbox_path(&self) -> PathBuf {
        self.path("inbox.jsonl")
    }

    /// Delivered envelopes
    pub fn sent_path(&self) -> PathBuf {
        self.path("sent.jsonl")
    }

    /// Alias book
    pub fn contacts_path(&self) -> PathBuf {
        self.path("contacts.json")
    }

    /// Status page profile
    pub fn profile_path(&self) -> PathBuf {
        self.path("profile.json")
    }

    /// User hook scripts
    pub fn hooks_dir(&self) -> PathBuf {
        self.path("hooks")
    }

    /// Daemon pid file
    pub fn pid_path(&self) -> PathBuf {
        self.path("murmur.pid")
    }

    /// Daemon log file
    pub fn log_path(&self) -> PathBuf {
        self.path("murmur.log")
    }
}
