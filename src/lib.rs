//! # Murmur
//!
//! Serverless peer-to-peer messaging with self-certifying identities.
//!
//! ## Features
//!
//! - **Self-certifying addresses**: a libp2p peer id or a v3 onion service
//!   id, each carrying the Ed25519 key that verifies the sender
//! - **Signed envelopes** acknowledged by the recipient
//! - **Two transports** behind one contract: a libp2p overlay (DHT,
//!   rendezvous, relays, hole punching) or Tor onion services
//! - **Durable outbox** retried with backoff until delivered
//! - **Supervised daemon** that re-registers its endpoint after failures
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use murmur::{kind, Envelope, LocalIdentity, OnionIdentity};
//! use murmur::crypto::Identity;
//!
//! let me = LocalIdentity::Onion(OnionIdentity::new(Identity::generate()));
//! let mut envelope = Envelope::new(me.address(), "5jfgyy7ctrjavpxvkb5rglwf7gkuo5vox27hxescd3vgsfcg2iwfmxqd", kind::MESSAGE, "hello");
//! envelope.sign(&me).unwrap();
//!
//! // anyone can check it against the sender address alone
//! assert!(envelope.verify().unwrap());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │     CLI  |  Supervisor  |  Hooks  |  Page   │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              PROTOCOL LAYER                 │
//! │   Node (send/ping) | Handshake | Outbox     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │         IDENTITY & ENVELOPE LAYER           │
//! │   Ed25519 | Onion ids | Peer ids | JSON     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             TRANSPORT LAYER                 │
//! │    libp2p overlay + Discovery | Tor onion   │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod atomic;
pub mod config;
pub mod contacts;
pub mod crypto;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod outbox;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-export main types at crate root
pub use config::{Config, TransportMode};
pub use error::{Error, Result};
pub use identity::{LocalIdentity, OnionIdentity};
pub use message::{kind, Envelope};
pub use node::{Node, SendOptions, SendOutcome};
pub use outbox::{Outbox, OutboxEntry};
pub use transport::{Transport, TransportError};
