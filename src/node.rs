//! Outbound side of a murmur node
//!
//! A [`Node`] ties the local identity, the active transport and the outbox
//! together: it builds and signs envelopes, runs the handshake, and queues
//! whatever could not be put on the wire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::identity::LocalIdentity;
use crate::message::{kind, Envelope, MessageLog};
use crate::outbox::{Deliver, Outbox, OutboxEntry};
use crate::protocol::{self, Delivery, ACK_TIMEOUT};
use crate::transport::{Transport, TransportError, TransportResult};

/// Optional envelope fields for [`Node::send`]
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Envelope type
    pub kind: String,
    /// Id of the envelope being answered
    pub reply_to: Option<String>,
    /// Explicit thread to continue
    pub thread: Option<String>,
    /// Metadata pairs
    pub meta: Vec<(String, String)>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            kind: kind::MESSAGE.to_string(),
            reply_to: None,
            thread: None,
            meta: Vec::new(),
        }
    }
}

/// What happened to a sent envelope
#[derive(Debug)]
pub enum SendOutcome {
    /// Acknowledged by the addressee
    Delivered {
        /// The envelope as sent
        envelope: Envelope,
        /// The addressee's ack
        ack: Envelope,
    },
    /// Written to the peer, but no valid ack came back
    Unconfirmed {
        /// The envelope as sent
        envelope: Envelope,
        /// Why the ack was missing or rejected
        reason: TransportError,
    },
    /// Could not be sent now; queued for retry
    Queued {
        /// The new outbox entry
        entry: OutboxEntry,
        /// Why the immediate attempt failed
        reason: TransportError,
    },
}

/// Identity, transport and outbox of one running process
pub struct Node {
    transport: Arc<dyn Transport>,
    identity: Arc<LocalIdentity>,
    outbox: Arc<Outbox>,
    sent: MessageLog,
}

impl Node {
    /// Node over explicit parts
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Arc<LocalIdentity>,
        outbox: Arc<Outbox>,
        sent: MessageLog,
    ) -> Self {
        Node {
            transport,
            identity,
            outbox,
            sent,
        }
    }

    /// Node with the outbox and sent log under the configured data directory
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>, identity: Arc<LocalIdentity>) -> Self {
        Node::new(
            transport,
            identity,
            Arc::new(Outbox::new(config.outbox_path())),
            MessageLog::new(config.sent_path()),
        )
    }

    /// Our address
    pub fn address(&self) -> String {
        self.identity.address()
    }

    /// The signing identity
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// The active transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The retry queue
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Build, sign and send one envelope
    ///
    /// An address the transport cannot handle is an error and is not
    /// queued. Anything else that stops the envelope from leaving puts it in
    /// the outbox; only a failure to write the outbox is returned as `Err`.
    pub async fn send(&self, to: &str, body: &str, options: SendOptions) -> crate::Result<SendOutcome> {
        let to = self.transport.canonical_address(to)?;

        let mut envelope = Envelope::new(self.address(), to, options.kind, body);
        if let Some(reply_to) = options.reply_to {
            envelope = envelope.with_reply_to(reply_to);
        }
        if let Some(thread) = options.thread {
            envelope = envelope.with_thread(thread);
        }
        for (key, value) in options.meta {
            envelope = envelope.with_meta(key, value);
        }
        envelope.assign_default_thread();
        envelope.sign(&self.identity)?;

        match protocol::send_envelope(self.transport.as_ref(), &envelope).await {
            Ok(delivery) => {
                self.record_sent(&envelope).await;
                Ok(match delivery {
                    Delivery::Acked(ack) => {
                        info!(id = %envelope.id, to = %envelope.to, "delivered");
                        SendOutcome::Delivered { envelope, ack }
                    }
                    Delivery::Unconfirmed(reason) => {
                        warn!(id = %envelope.id, to = %envelope.to, error = %reason, "sent without ack");
                        SendOutcome::Unconfirmed { envelope, reason }
                    }
                })
            }
            Err(reason) => {
                info!(id = %envelope.id, to = %envelope.to, error = %reason, "send failed, queueing");
                let now = chrono::Utc::now().timestamp();
                let entry = self.outbox.enqueue(envelope, now).await?;
                Ok(SendOutcome::Queued { entry, reason })
            }
        }
    }

    /// Round trip of a signed `ping` to `to`, measured from write to ack
    pub async fn ping(&self, to: &str) -> crate::Result<Duration> {
        let to = self.transport.canonical_address(to)?;

        let mut ping = Envelope::new(self.address(), to.as_str(), kind::PING, "");
        ping.sign(&self.identity)?;

        let mut conn = self.transport.dial(&to).await?;
        let started = Instant::now();
        let exchange: TransportResult<Envelope> = async {
            conn.send(&ping).await?;
            tokio::time::timeout(ACK_TIMEOUT, conn.receive())
                .await
                .map_err(|_| TransportError::Timeout(ACK_TIMEOUT))?
        }
        .await;
        let rtt = started.elapsed();
        let _ = conn.close().await;

        let ack = exchange?;
        protocol::check_ack(&ping, &ack, !self.transport.authenticates_peers())?;
        debug!(%to, ?rtt, "pong");
        Ok(rtt)
    }

    async fn record_sent(&self, envelope: &Envelope) {
        if let Err(e) = self.sent.append(envelope).await {
            warn!(error = %e, "could not append to sent log");
        }
    }
}

#[async_trait]
impl Deliver for Node {
    async fn deliver(&self, envelope: &Envelope) -> crate::Result<()> {
        let to = self.transport.canonical_address(&envelope.to)?;
        let resigned;
        let envelope = if to == envelope.to {
            envelope
        } else {
            // entries queued before addresses were canonical
            let mut copy = envelope.clone();
            copy.to = to;
            copy.sign(&self.identity)?;
            resigned = copy;
            &resigned
        };
        // a missing ack still counts: the envelope is not sent twice
        protocol::send_envelope(self.transport.as_ref(), envelope).await?;
        self.record_sent(envelope).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use crate::error::Error;
    use crate::protocol::tests::{onion, Recorder};
    use crate::protocol::serve;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::Listener;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        tmp: tempfile::TempDir,
        network: MemoryNetwork,
        node: Node,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let identity = Arc::new(onion(1));
        let transport = Arc::new(network.transport(identity.address(), TransportMode::Onion));
        let node = Node::new(
            transport,
            identity,
            Arc::new(Outbox::new(tmp.path().join("outbox.jsonl"))),
            MessageLog::new(tmp.path().join("sent.jsonl")),
        );
        Fixture {
            tmp,
            network,
            node,
        }
    }

    /// Start answering as `seed` on the network, returning the handler and the stop token
    async fn peer(network: &MemoryNetwork, seed: u8) -> (Arc<Recorder>, CancellationToken) {
        let identity = Arc::new(onion(seed));
        let transport = network.transport(identity.address(), TransportMode::Onion);
        let listener: Arc<dyn Listener> = Arc::from(transport.listen().await.unwrap());
        let recorder = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, identity, recorder.clone(), token.clone()));
        (recorder, token)
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_queued() {
        let fx = fixture();
        let to = onion(2).address();

        let before = chrono::Utc::now().timestamp();
        let outcome = fx.node.send(&to, "hello", SendOptions::default()).await.unwrap();
        let after = chrono::Utc::now().timestamp();

        let entry = match outcome {
            SendOutcome::Queued { entry, .. } => entry,
            other => panic!("expected queued, got {other:?}"),
        };
        let entries = fx.node.outbox().entries().await.unwrap();
        assert_eq!(entries, vec![entry.clone()]);
        assert_eq!(entry.attempts, 0);
        assert!(entry.next_retry >= before + 30 && entry.next_retry <= after + 30);
        assert_eq!(entry.envelope.to, to);
        assert!(entry.envelope.verify().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_address_is_not_queued() {
        let fx = fixture();
        let result = fx.node.send("not-an-address", "hello", SendOptions::default()).await;
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::InvalidAddress(_)))
        ));
        assert!(fx.node.outbox().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_delivers_and_logs() {
        let fx = fixture();
        let (recorder, token) = peer(&fx.network, 2).await;

        let options = SendOptions {
            reply_to: Some("abc".into()),
            meta: vec![("lang".into(), "en".into())],
            ..SendOptions::default()
        };
        let outcome = fx.node.send(&onion(2).address(), "hello", options).await.unwrap();
        let (envelope, ack) = match outcome {
            SendOutcome::Delivered { envelope, ack } => (envelope, ack),
            other => panic!("expected delivered, got {other:?}"),
        };
        assert_eq!(ack.body, envelope.id);
        assert_eq!(envelope.thread_id.as_deref(), Some("abc"));
        assert_eq!(envelope.meta.get("lang").map(String::as_str), Some("en"));

        assert_eq!(*recorder.received.lock().await, vec![envelope.clone()]);
        let sent = MessageLog::new(fx.tmp.path().join("sent.jsonl")).read_all().await.unwrap();
        assert_eq!(sent, vec![envelope]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_onion_suffix_is_stripped_before_signing() {
        let fx = fixture();
        let (recorder, token) = peer(&fx.network, 2).await;
        let bare = onion(2).address();
        let suffixed = format!("{bare}.onion");

        let outcome = fx.node.send(&suffixed, "hello", SendOptions::default()).await.unwrap();
        let (envelope, ack) = match outcome {
            SendOutcome::Delivered { envelope, ack } => (envelope, ack),
            other => panic!("expected delivered, got {other:?}"),
        };
        assert_eq!(envelope.to, bare);
        assert_eq!(ack.from, bare);
        assert_eq!(recorder.received.lock().await.len(), 1);

        assert!(fx.node.ping(&suffixed).await.is_ok());
        token.cancel();
    }

    #[tokio::test]
    async fn test_deliver_resigns_suffixed_entry() {
        let fx = fixture();
        let (recorder, token) = peer(&fx.network, 2).await;
        let bare = onion(2).address();

        let mut queued = Envelope::new(fx.node.address(), format!("{bare}.onion"), kind::MESSAGE, "later");
        queued.sign(fx.node.identity()).unwrap();
        fx.node.deliver(&queued).await.unwrap();

        let received = recorder.received.lock().await.clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, queued.id);
        assert_eq!(received[0].to, bare);
        assert!(received[0].verify().unwrap());
        token.cancel();
    }

    #[tokio::test]
    async fn test_ping() {
        let fx = fixture();
        let to = onion(2).address();
        assert!(matches!(
            fx.node.ping(&to).await,
            Err(Error::Transport(TransportError::ConnectionFailed(_)))
        ));

        let (recorder, token) = peer(&fx.network, 2).await;
        let rtt = fx.node.ping(&to).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        assert_eq!(recorder.received.lock().await[0].kind, kind::PING);
        token.cancel();
    }

    #[tokio::test]
    async fn test_outbox_sweep_through_node() {
        let fx = fixture();
        let to = onion(2).address();
        fx.node.send(&to, "later", SendOptions::default()).await.unwrap();

        let (recorder, token) = peer(&fx.network, 2).await;
        let now = chrono::Utc::now().timestamp() + 31;
        let report = fx.node.outbox().process(&fx.node, now).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(recorder.received.lock().await[0].body, "later");
        assert!(fx.node.outbox().entries().await.unwrap().is_empty());
        token.cancel();
    }
}
