//! Version 3 onion service identifiers
//!
//! An onion address is `base32(pubkey || checksum || version)`, lowercase,
//! where `checksum = SHA3-256(".onion checksum" || pubkey || version)[..2]`
//! and `version = 0x03`. The 56 characters carry the ed25519 public key, so
//! an address is enough to verify anything its owner signed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;

use super::error::{CryptoError, CryptoResult};
use super::identity::{Identity, PublicKey, PUBLIC_KEY_SIZE};

/// Length of a v3 service id, without the `.onion` suffix
pub const ONION_ADDRESS_LEN: usize = 56;

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const VERSION: u8 = 0x03;
const CHECKSUM_LEN: usize = 2;

/// Cheap shape check: exactly 56 chars of the lowercase base32 alphabet.
///
/// Does not verify the embedded checksum; use [`OnionAddress::parse`] for that.
pub fn is_onion_address(s: &str) -> bool {
    s.len() == ONION_ADDRESS_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
}

/// A validated v3 onion service id
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Derive the service id for a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut raw = Vec::with_capacity(PUBLIC_KEY_SIZE + CHECKSUM_LEN + 1);
        raw.extend_from_slice(public_key.as_bytes());
        raw.extend_from_slice(&checksum(public_key.as_bytes()));
        raw.push(VERSION);
        OnionAddress(BASE32_NOPAD.encode(&raw).to_ascii_lowercase())
    }

    /// Parse and fully validate a service id. A trailing `.onion` is accepted.
    pub fn parse(s: &str) -> CryptoResult<Self> {
        let id = s.strip_suffix(".onion").unwrap_or(s);
        if !is_onion_address(id) {
            return Err(CryptoError::InvalidOnionAddress(format!(
                "expected {ONION_ADDRESS_LEN} base32 characters"
            )));
        }

        let raw = BASE32_NOPAD
            .decode(id.to_ascii_uppercase().as_bytes())
            .map_err(|e| CryptoError::InvalidOnionAddress(e.to_string()))?;
        let (key, rest) = raw.split_at(PUBLIC_KEY_SIZE);
        if rest[CHECKSUM_LEN] != VERSION {
            return Err(CryptoError::InvalidOnionAddress(format!(
                "unsupported version {}",
                rest[CHECKSUM_LEN]
            )));
        }
        let key: &[u8; PUBLIC_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        if rest[..CHECKSUM_LEN] != checksum(key) {
            return Err(CryptoError::InvalidOnionAddress("checksum mismatch".into()));
        }

        Ok(OnionAddress(id.to_string()))
    }

    /// The ed25519 public key embedded in the address
    pub fn public_key(&self) -> CryptoResult<PublicKey> {
        let raw = BASE32_NOPAD
            .decode(self.0.to_ascii_uppercase().as_bytes())
            .map_err(|e| CryptoError::InvalidOnionAddress(e.to_string()))?;
        PublicKey::from_bytes(&raw[..PUBLIC_KEY_SIZE])
    }

    /// The 56-character service id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OnionAddress({}...)", &self.0[..16])
    }
}

fn checksum(public_key: &[u8; PUBLIC_KEY_SIZE]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha3_256::new()
        .chain_update(CHECKSUM_PREFIX)
        .chain_update(public_key)
        .chain_update([VERSION])
        .finalize();
    [digest[0], digest[1]]
}

/// The key blob accepted by `ADD_ONION`: `ED25519-V3:` followed by the
/// base64 of the 64-byte expanded secret key (clamped SHA-512 of the seed).
pub fn control_key_blob(identity: &Identity) -> String {
    let mut expanded = [0u8; 64];
    expanded.copy_from_slice(&Sha512::digest(identity.seed()));
    expanded[0] &= 248;
    expanded[31] &= 127;
    expanded[31] |= 64;
    let blob = format!("ED25519-V3:{}", BASE64.encode(expanded));
    zeroize::Zeroize::zeroize(&mut expanded);
    blob
}
