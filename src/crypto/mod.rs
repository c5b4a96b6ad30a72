//! Cryptographic primitives for murmur
//!
//! - `identity`: Ed25519 keypairs and detached signatures
//! - `onion`: v3 onion service ids derived from Ed25519 public keys

pub mod error;
pub mod identity;
pub mod onion;

pub use error::{CryptoError, CryptoResult};
pub use identity::{Identity, PublicKey, SignatureBytes};
pub use onion::{is_onion_address, OnionAddress};
