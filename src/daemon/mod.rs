//! Collaborators of the long-running listener
//!
//! - [`hooks`]: `hooks/on-receive` run per inbound message
//! - [`pidfile`]: `murmur.pid` for `daemon status` and `daemon stop`
//! - [`status`]: the HTML status page on the onion service

pub mod hooks;
pub mod pidfile;
pub mod status;

use std::io::Write;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

pub use hooks::ReceiveHook;
pub use pidfile::{DaemonStatus, PidFile, StopOutcome};
pub use status::{Profile, StatusPage};

use crate::config::Config;
use crate::error::PersistenceError;
use crate::message::{Envelope, MessageLog};
use crate::protocol::MessageHandler;

/// Daemon process management failures
#[derive(Error, Debug)]
pub enum DaemonError {
    /// A daemon is already recorded as running
    #[error("Daemon already running (pid {0})")]
    AlreadyRunning(i32),

    /// The spawned daemon died right away
    #[error("Daemon exited immediately, see {0}")]
    ExitedEarly(std::path::PathBuf),

    /// Signalling the daemon failed
    #[error("Could not signal pid {pid}: {source}")]
    Signal {
        /// Target process
        pid: i32,
        /// Errno from kill(2)
        source: nix::errno::Errno,
    },

    /// Pid or log file failure
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Stores every verified envelope and runs the receive hook
///
/// With `echo`, each envelope is also printed to stdout as one JSON line.
pub struct InboxHandler {
    inbox: MessageLog,
    hook: Option<ReceiveHook>,
    echo: bool,
}

impl InboxHandler {
    /// Handler over explicit parts
    pub fn new(inbox: MessageLog, hook: Option<ReceiveHook>, echo: bool) -> Self {
        InboxHandler { inbox, hook, echo }
    }

    /// Daemon handler: inbox plus hook, nothing on stdout
    pub fn for_daemon(config: &Config) -> Self {
        Self::new(
            MessageLog::new(config.inbox_path()),
            Some(ReceiveHook::new(&config.hooks_dir())),
            false,
        )
    }

    /// Foreground handler: inbox plus stdout, no hook
    pub fn for_foreground(config: &Config) -> Self {
        Self::new(MessageLog::new(config.inbox_path()), None, true)
    }
}

#[async_trait]
impl MessageHandler for InboxHandler {
    async fn on_message(&self, envelope: &Envelope) {
        info!(id = %envelope.id, from = %envelope.from, kind = %envelope.kind, "received");
        if let Err(e) = self.inbox.append(envelope).await {
            warn!(error = %e, "could not append to inbox");
        }
        if self.echo {
            if let Ok(json) = envelope.to_json() {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(&json);
                let _ = stdout.write_all(b"\n");
                let _ = stdout.flush();
            }
        }
        if let Some(hook) = &self.hook {
            hook.run(envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;

    #[tokio::test]
    async fn test_inbox_handler_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::new(tmp.path());
        let handler = InboxHandler::for_daemon(&config);

        let first = Envelope::new("a", "b", kind::MESSAGE, "one");
        let second = Envelope::new("a", "b", kind::PING, "");
        handler.on_message(&first).await;
        handler.on_message(&second).await;

        let stored = MessageLog::new(config.inbox_path()).read_all().await.unwrap();
        assert_eq!(stored, vec![first, second]);
    }
}
