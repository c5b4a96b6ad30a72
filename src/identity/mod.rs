//! Self-certifying local identities
//!
//! A node signs with exactly one of two key types, chosen by transport mode:
//!
//! - **Overlay**: a libp2p ed25519 keypair; the address is its peer id.
//! - **Onion**: a raw ed25519 keypair; the address is the v3 onion service id.
//!
//! In both cases the public key can be recovered from the address alone.

pub mod overlay;

use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use libp2p::PeerId;
use tracing::info;

use crate::config::{Config, TransportMode};
use crate::crypto::{self, CryptoError, CryptoResult, OnionAddress};
use crate::error::IdentityError;

/// Onion-mode key material and its derived address
#[derive(Clone, Debug)]
pub struct OnionIdentity {
    key: crypto::Identity,
    address: OnionAddress,
}

impl OnionIdentity {
    /// Wrap an ed25519 keypair
    pub fn new(key: crypto::Identity) -> Self {
        let address = OnionAddress::from_public_key(key.public_key());
        OnionIdentity { key, address }
    }

    /// The service id this key publishes
    pub fn address(&self) -> &OnionAddress {
        &self.address
    }

    /// `ED25519-V3:` key blob for the Tor control port
    pub fn control_key_blob(&self) -> String {
        crypto::onion::control_key_blob(&self.key)
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let bytes = read_key_file(path)?;
        let key = crypto::Identity::from_bytes(&bytes).map_err(|e| IdentityError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(key))
    }

    fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match Self::load(path) {
            Err(IdentityError::NotFound(_)) => {
                let key = crypto::Identity::generate();
                write_private(path, &key.to_bytes())?;
                let identity = Self::new(key);
                info!(address = %identity.address, "generated onion identity");
                Ok(identity)
            }
            other => other,
        }
    }
}

/// The signing identity of this process
#[derive(Clone, Debug)]
pub enum LocalIdentity {
    /// libp2p keypair, addressed by peer id
    Overlay(libp2p::identity::Keypair),
    /// ed25519 keypair, addressed by onion service id
    Onion(OnionIdentity),
}

impl LocalIdentity {
    /// Load the identity for `config.mode`, creating it on first use
    pub fn load_or_create(config: &Config) -> Result<Self, IdentityError> {
        config.ensure_data_dir().map_err(|source| IdentityError::Io {
            path: config.data_dir.clone(),
            source,
        })?;
        match config.mode {
            TransportMode::Overlay => {
                overlay::load_or_create_keypair(&config.overlay_key_path()).map(Self::Overlay)
            }
            TransportMode::Onion => {
                OnionIdentity::load_or_create(&config.onion_key_path()).map(Self::Onion)
            }
        }
    }

    /// Load the identity for `config.mode`, failing if none exists yet
    pub fn load(config: &Config) -> Result<Self, IdentityError> {
        match config.mode {
            TransportMode::Overlay => {
                overlay::load_keypair(&config.overlay_key_path()).map(Self::Overlay)
            }
            TransportMode::Onion => OnionIdentity::load(&config.onion_key_path()).map(Self::Onion),
        }
    }

    /// Which address space this identity lives in
    pub fn mode(&self) -> TransportMode {
        match self {
            LocalIdentity::Overlay(_) => TransportMode::Overlay,
            LocalIdentity::Onion(_) => TransportMode::Onion,
        }
    }

    /// The self-certifying address peers use to reach us
    pub fn address(&self) -> String {
        match self {
            LocalIdentity::Overlay(keypair) => keypair.public().to_peer_id().to_string(),
            LocalIdentity::Onion(onion) => onion.address.to_string(),
        }
    }

    /// Detached signature over `payload`
    pub fn sign(&self, payload: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            LocalIdentity::Overlay(keypair) => keypair
                .sign(payload)
                .map_err(|e| CryptoError::SigningFailed(e.to_string())),
            LocalIdentity::Onion(onion) => Ok(onion.key.sign(payload).as_bytes().to_vec()),
        }
    }
}

/// Check that `address` is well-formed for `mode`
pub fn validate_address(mode: TransportMode, address: &str) -> CryptoResult<()> {
    match mode {
        TransportMode::Onion => OnionAddress::parse(address).map(|_| ()),
        TransportMode::Overlay => PeerId::from_str(address)
            .map(|_| ())
            .map_err(|e| CryptoError::InvalidPeerId(e.to_string())),
    }
}

/// The bare form of `address` for `mode`: an onion id loses any `.onion`
/// suffix, a peer id is re-encoded
pub fn canonical_address(mode: TransportMode, address: &str) -> CryptoResult<String> {
    match mode {
        TransportMode::Onion => OnionAddress::parse(address).map(|onion| onion.as_str().to_string()),
        TransportMode::Overlay => PeerId::from_str(address)
            .map(|peer| peer.to_string())
            .map_err(|e| CryptoError::InvalidPeerId(e.to_string())),
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, IdentityError> {
    std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            IdentityError::NotFound(path.to_path_buf())
        } else {
            IdentityError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Write key material readable by the owner only
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    use std::os::unix::fs::OpenOptionsExt;

    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: TransportMode) -> (tempfile::TempDir, Config) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::new(tmp.path()).with_mode(mode);
        (tmp, config)
    }

    #[test]
    fn test_onion_identity_is_stable() {
        let (_tmp, config) = config(TransportMode::Onion);

        assert!(matches!(
            LocalIdentity::load(&config),
            Err(IdentityError::NotFound(_))
        ));

        let first = LocalIdentity::load_or_create(&config).unwrap();
        let second = LocalIdentity::load(&config).unwrap();
        assert_eq!(first.address(), second.address());
        assert_eq!(first.mode(), TransportMode::Onion);
        assert!(crypto::is_onion_address(&first.address()));
    }

    #[test]
    fn test_overlay_identity_is_stable() {
        let (_tmp, config) = config(TransportMode::Overlay);

        let first = LocalIdentity::load_or_create(&config).unwrap();
        let second = LocalIdentity::load_or_create(&config).unwrap();
        assert_eq!(first.address(), second.address());
        assert!(validate_address(TransportMode::Overlay, &first.address()).is_ok());
    }

    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_tmp, config) = config(TransportMode::Onion);
        LocalIdentity::load_or_create(&config).unwrap();

        let mode = std::fs::metadata(config.onion_key_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_onion_key() {
        let (_tmp, config) = config(TransportMode::Onion);
        config.ensure_data_dir().unwrap();
        std::fs::write(config.onion_key_path(), [0u8; 12]).unwrap();

        assert!(matches!(
            LocalIdentity::load_or_create(&config),
            Err(IdentityError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_validate_address_by_mode() {
        let onion = OnionIdentity::new(crypto::Identity::from_seed(&[7u8; 32]));
        let peer = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
            .to_string();

        assert!(validate_address(TransportMode::Onion, onion.address().as_str()).is_ok());
        assert!(validate_address(TransportMode::Onion, &peer).is_err());
        assert!(validate_address(TransportMode::Overlay, &peer).is_ok());
        assert!(validate_address(TransportMode::Overlay, onion.address().as_str()).is_err());
    }

    #[test]
    fn test_canonical_address_strips_onion_suffix() {
        let onion = OnionIdentity::new(crypto::Identity::from_seed(&[7u8; 32]));
        let bare = onion.address().as_str();

        assert_eq!(
            canonical_address(TransportMode::Onion, &format!("{bare}.onion")).unwrap(),
            bare
        );
        assert_eq!(canonical_address(TransportMode::Onion, bare).unwrap(), bare);
        assert!(canonical_address(TransportMode::Onion, "nope.onion").is_err());

        let peer = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
            .to_string();
        assert_eq!(canonical_address(TransportMode::Overlay, &peer).unwrap(), peer);
    }
}
