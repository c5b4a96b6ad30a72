//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// The provided signature has an invalid length
    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength {
        /// Expected signature length in bytes
        expected: usize,
        /// Actual signature length in bytes
        actual: usize,
    },

    /// The signature field is not valid base64
    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// Signature verification failed - the signature is invalid
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// The signing primitive refused to produce a signature
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// The public key format is invalid
    #[error("Invalid public key format")]
    InvalidPublicKey,

    /// The secret key format is invalid
    #[error("Invalid secret key format")]
    InvalidSecretKey,

    /// Not a v3 onion service identifier
    #[error("Invalid onion address: {0}")]
    InvalidOnionAddress(String),

    /// Not a peer id with an inlined public key
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
