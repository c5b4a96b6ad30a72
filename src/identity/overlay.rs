//! libp2p identities: key persistence and peer id to public key recovery

use std::path::Path;

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;

use crate::error::IdentityError;

/// Multihash code for the identity hash, used when the key is inlined
const IDENTITY_MULTIHASH: u8 = 0x00;

/// Load a protobuf-encoded keypair, generating and saving an ed25519 one
/// when the file does not exist.
pub fn load_or_create_keypair(path: &Path) -> Result<Keypair, IdentityError> {
    match load_keypair(path) {
        Err(IdentityError::NotFound(_)) => {
            let keypair = Keypair::generate_ed25519();
            let encoded = keypair
                .to_protobuf_encoding()
                .map_err(|e| IdentityError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            super::write_private(path, &encoded)?;
            tracing::info!(peer_id = %keypair.public().to_peer_id(), "generated overlay identity");
            Ok(keypair)
        }
        other => other,
    }
}

/// Load a protobuf-encoded keypair
pub fn load_keypair(path: &Path) -> Result<Keypair, IdentityError> {
    let bytes = super::read_key_file(path)?;
    Keypair::from_protobuf_encoding(&bytes).map_err(|e| IdentityError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Recover the public key inlined in a peer id.
///
/// Ed25519 peer ids embed the key under the identity multihash; peer ids
/// that only carry a SHA-256 digest of the key yield `None`.
pub fn public_key_from_peer_id(peer_id: &PeerId) -> Option<PublicKey> {
    // <code varint> <length varint> <digest>; inlined keys are short enough
    // for both varints to be a single byte
    let bytes = peer_id.to_bytes();
    match bytes.as_slice() {
        [IDENTITY_MULTIHASH, len, digest @ ..] if usize::from(*len) == digest.len() => {
            PublicKey::try_decode_protobuf(digest).ok()
        }
        _ => None,
    }
}
