//! Ed25519 key material
//!
//! The raw keypair behind an onion identity, plus the public key and
//! detached signature newtypes used by envelope verification.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};

/// Size of a public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a secret key in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// An ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(PublicKey(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature against this public key
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Signature::from_bytes(&signature.0);

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A detached ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl SignatureBytes {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; SIGNATURE_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidSignatureLength {
                    expected: SIGNATURE_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(SignatureBytes(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Standard base64, as carried in the envelope `sig` field
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse from standard base64
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| CryptoError::InvalidSignatureEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(&self.0[..8]))
    }
}

/// An ed25519 keypair
///
/// The secret key is automatically zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public_key: PublicKey,
    secret_key: [u8; SECRET_KEY_SIZE],
}

impl Identity {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing_key)
    }

    /// Create from a seed (deterministic generation)
    pub fn from_seed(seed: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_signing_key(&SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        Identity {
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
            secret_key: signing_key.to_bytes(),
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The 32-byte seed the signing key is derived from
    ///
    /// Only used to derive the expanded key handed to the local Tor daemon.
    pub fn seed(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret_key
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        let signing_key = SigningKey::from_bytes(&self.secret_key);
        SignatureBytes(signing_key.sign(message).to_bytes())
    }

    /// Verify a signature (convenience method)
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> CryptoResult<()> {
        self.public_key.verify(message, signature)
    }

    /// Export as `secret || public` (64 bytes)
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE + PUBLIC_KEY_SIZE] {
        let mut bytes = [0u8; SECRET_KEY_SIZE + PUBLIC_KEY_SIZE];
        bytes[..SECRET_KEY_SIZE].copy_from_slice(&self.secret_key);
        bytes[SECRET_KEY_SIZE..].copy_from_slice(&self.public_key.0);
        bytes
    }

    /// Import from `secret || public`, rejecting mismatched halves
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SECRET_KEY_SIZE + PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SECRET_KEY_SIZE + PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut secret_key = [0u8; SECRET_KEY_SIZE];
        secret_key.copy_from_slice(&bytes[..SECRET_KEY_SIZE]);

        let identity = Self::from_seed(&secret_key);
        secret_key.zeroize();

        if identity.public_key.0[..] != bytes[SECRET_KEY_SIZE..] {
            return Err(CryptoError::InvalidSecretKey);
        }

        Ok(identity)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity {
            public_key: self.public_key,
            secret_key: self.secret_key,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
