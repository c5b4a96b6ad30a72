//! Crate-level error taxonomy

use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::daemon::DaemonError;
use crate::discovery::DiscoveryError;
use crate::transport::{ProtocolError, TransportError};

/// Key material could not be loaded or created
#[derive(Error, Debug)]
pub enum IdentityError {
    /// No key on disk and creation was not requested
    #[error("No identity found at {0} (run `murmur init` first)")]
    NotFound(PathBuf),

    /// Key file exists but does not hold a usable key
    #[error("Corrupt key file {path}: {reason}")]
    Corrupt {
        /// Offending file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Filesystem failure while reading or writing a key
    #[error("Key file {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// A durable file (outbox, inbox, contacts) could not be read or rewritten
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem failure
    #[error("{path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A record could not be encoded or a whole-file document decoded
    #[error("{path}: {source}")]
    Json {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PersistenceError::Json {
            path: path.into(),
            source,
        }
    }
}

/// Any murmur failure
#[derive(Error, Debug)]
pub enum Error {
    /// See [`IdentityError`]
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// See [`CryptoError`]
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// See [`TransportError`]
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [`DiscoveryError`]
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// See [`PersistenceError`]
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// See [`DaemonError`]
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    /// Invalid configuration or arguments
    #[error("{0}")]
    Config(String),
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Transport(TransportError::Protocol(err))
    }
}

/// Result alias for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;
