//! Daemon-mode session supervisor
//!
//! Keeps one listening session alive for the lifetime of the process:
//!
//! ```text
//!            listen ok
//!   Disconnected ────────▶ Connected
//!        ▲  │ listen err       │ probe failed / task exited
//!        │  ▼                  │
//!      backoff ◀───────────────┘
//! ```
//!
//! A session owns the accept loop, the outbox retry loop and the status
//! page in one `JoinSet`, all under a child of the shutdown token. Ending
//! the session cancels them together and unregisters the endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportMode;
use crate::daemon::status::{self, StatusPage};
use crate::node::Node;
use crate::outbox::{run_retry_loop, Deliver};
use crate::protocol::{serve, MessageHandler};
use crate::transport::{Listener, TransportError};

/// How long session tasks get to wind down before they are aborted
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor timings
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// First reconnect delay
    pub reconnect_min: Duration,
    /// Reconnect delay cap
    pub reconnect_max: Duration,
    /// Interval between liveness probes
    pub probe_interval: Duration,
    /// Interval between outbox sweeps
    pub outbox_interval: Duration,
}

impl Timings {
    /// Defaults for `mode`
    pub fn for_mode(mode: TransportMode) -> Self {
        Timings {
            reconnect_min: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            outbox_interval: mode.outbox_interval(),
        }
    }
}

/// Doubling delay between listen attempts
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    /// Backoff starting at `min`, capped at `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        ReconnectBackoff { current: min, min, max }
    }

    /// The delay to wait now; the following one doubles
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the floor after a successful listen
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    ProbeFailed(TransportError),
    TaskExited(&'static str),
}

/// Runs listening sessions until shutdown
pub struct Supervisor {
    node: Arc<Node>,
    handler: Arc<dyn MessageHandler>,
    status_page: Option<StatusPage>,
    timings: Timings,
}

impl Supervisor {
    /// Supervisor for `node`, dispatching inbound envelopes to `handler`
    pub fn new(node: Arc<Node>, handler: Arc<dyn MessageHandler>) -> Self {
        let timings = Timings::for_mode(node.transport().mode());
        Supervisor {
            node,
            handler,
            status_page: None,
            timings,
        }
    }

    /// Serve `page` on the transport's status socket, when it has one
    pub fn with_status_page(mut self, page: StatusPage) -> Self {
        self.status_page = Some(page);
        self
    }

    /// Override the default timings
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Keep a session up until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = ReconnectBackoff::new(self.timings.reconnect_min, self.timings.reconnect_max);

        loop {
            let listening = tokio::select! {
                _ = shutdown.cancelled() => break,
                listening = self.node.transport().listen() => listening,
            };

            let listener: Arc<dyn Listener> = match listening {
                Ok(listener) => Arc::from(listener),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "listen failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            backoff.reset();
            info!(address = %self.node.address(), "session started");
            let end = self.run_session(listener.clone(), &shutdown).await;
            if let Err(e) = listener.close().await {
                warn!(error = %e, "listener close failed");
            }

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ProbeFailed(e) => warn!(error = %e, "liveness probe failed, reconnecting"),
                SessionEnd::TaskExited(task) => warn!(task, "session task exited, reconnecting"),
            }
        }
        info!("supervisor stopped");
    }

    async fn run_session(&self, listener: Arc<dyn Listener>, shutdown: &CancellationToken) -> SessionEnd {
        let session = shutdown.child_token();
        let mut tasks: JoinSet<&'static str> = JoinSet::new();

        {
            let listener = listener.clone();
            let identity = self.node.identity().clone();
            let handler = self.handler.clone();
            let token = session.clone();
            tasks.spawn(async move {
                if let Err(e) = serve(listener, identity, handler, token).await {
                    debug!(error = %e, "accept loop ended");
                }
                "accept loop"
            });
        }

        {
            let outbox = self.node.outbox().clone();
            let deliverer: Arc<dyn Deliver> = self.node.clone();
            let interval = self.timings.outbox_interval;
            let token = session.clone();
            tasks.spawn(async move {
                run_retry_loop(outbox, deliverer, interval, token).await;
                "outbox retry loop"
            });
        }

        if let Some(page) = self.status_page.clone() {
            if let Some(socket) = listener.take_status_socket().await {
                let token = session.clone();
                tasks.spawn(async move {
                    if let Err(e) = status::serve(socket, page, token).await {
                        warn!(error = %e, "status page failed");
                    }
                    "status page"
                });
            }
        }

        let probe_interval = self.timings.probe_interval;
        let mut probe = tokio::time::interval_at(tokio::time::Instant::now() + probe_interval, probe_interval);
        let end = loop {
            tokio::select! {
                _ = session.cancelled() => break SessionEnd::Shutdown,
                _ = probe.tick() => {
                    if let Err(e) = listener.probe().await {
                        break SessionEnd::ProbeFailed(e);
                    }
                    debug!("liveness probe ok");
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(task) => break SessionEnd::TaskExited(task),
                    Err(e) => {
                        warn!(error = %e, "session task panicked");
                        break SessionEnd::TaskExited("panicked task");
                    }
                },
            }
        };

        session.cancel();
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("session tasks did not stop in time, aborting");
            tasks.shutdown().await;
        }
        end
    }
}
