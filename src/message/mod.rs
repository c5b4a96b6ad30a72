//! Envelopes and the local message logs

pub mod envelope;
pub mod inbox;

pub use envelope::{kind, Envelope, PROTOCOL_VERSION};
pub use inbox::{LogFilter, MessageLog};
