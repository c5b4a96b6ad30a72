//! Send-then-ack exchange on top of a [`Connection`]
//!
//! The sender writes one signed envelope and waits for an `ack` whose body
//! is that envelope's id. The responder reads one envelope, drops it
//! silently if its signature does not verify, hands it to the message
//! handler, and answers with a signed ack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::LocalIdentity;
use crate::message::Envelope;
use crate::transport::{
    Connection, Listener, ProtocolError, Transport, TransportError, TransportResult,
};

/// How long the sender waits for the ack once the envelope is written
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause after a transient accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outcome of an envelope that made it onto the wire
#[derive(Debug)]
pub enum Delivery {
    /// The addressee acknowledged it
    Acked(Envelope),
    /// Written, but no valid ack came back. It may still have arrived.
    Unconfirmed(TransportError),
}

impl Delivery {
    /// Whether a correlated ack was received
    pub fn is_acked(&self) -> bool {
        matches!(self, Delivery::Acked(_))
    }
}

/// Receives every verified inbound envelope
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once per verified envelope, before the ack is sent
    async fn on_message(&self, envelope: &Envelope);
}

/// Dial `envelope.to`, send `envelope` and wait for its ack
///
/// `Err` means the envelope never left: the dial failed, the connection
/// could not be established, or the write failed. Dial time is bounded by
/// the transport itself.
pub async fn send_envelope(transport: &dyn Transport, envelope: &Envelope) -> TransportResult<Delivery> {
    let mut conn = transport.dial(&envelope.to).await?;

    if let Err(e) = conn.send(envelope).await {
        let _ = conn.close().await;
        return Err(e);
    }

    let response = tokio::time::timeout(ACK_TIMEOUT, conn.receive()).await;
    let _ = conn.close().await;

    let ack = match response {
        Ok(Ok(ack)) => ack,
        // the request never reached the peer
        Ok(Err(e @ TransportError::ConnectionFailed(_))) => return Err(e),
        Ok(Err(e)) => return Ok(Delivery::Unconfirmed(e)),
        Err(_) => return Ok(Delivery::Unconfirmed(TransportError::Timeout(ACK_TIMEOUT))),
    };

    match check_ack(envelope, &ack, !transport.authenticates_peers()) {
        Ok(()) => Ok(Delivery::Acked(ack)),
        Err(e) => {
            debug!(id = %envelope.id, error = %e, "ack rejected");
            Ok(Delivery::Unconfirmed(e.into()))
        }
    }
}

/// Check that `ack` acknowledges `original`
///
/// With `verify_signature`, the ack must also come from the addressee and
/// carry a valid signature.
pub fn check_ack(original: &Envelope, ack: &Envelope, verify_signature: bool) -> Result<(), ProtocolError> {
    if !ack.is_ack_for(&original.id) {
        return Err(ProtocolError::UnexpectedAck {
            kind: ack.kind.clone(),
            body: ack.body.clone(),
        });
    }
    if verify_signature && (ack.from != original.to || !matches!(ack.verify(), Ok(true))) {
        return Err(ProtocolError::InvalidAckSignature);
    }
    Ok(())
}

/// Answer one inbound connection
///
/// Envelopes that fail verification get no ack and no dispatch; the
/// connection is just closed.
pub async fn respond(
    mut conn: Box<dyn Connection>,
    identity: &LocalIdentity,
    handler: &dyn MessageHandler,
) -> crate::Result<Envelope> {
    let envelope = match conn.receive().await {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = conn.close().await;
            return Err(e.into());
        }
    };

    if !matches!(envelope.verify(), Ok(true)) {
        debug!(id = %envelope.id, from = %envelope.from, "dropping envelope with invalid signature");
        let _ = conn.close().await;
        return Err(ProtocolError::InvalidSignature.into());
    }

    handler.on_message(&envelope).await;

    let mut ack = Envelope::ack_for(&envelope, identity.address());
    ack.sign(identity)?;
    let sent = conn.send(&ack).await;
    let _ = conn.close().await;
    sent?;

    debug!(id = %envelope.id, kind = %envelope.kind, "acked envelope");
    Ok(envelope)
}

/// Accept connections until `token` fires or the listener closes
///
/// Each connection is answered in its own task so a slow peer never holds
/// up the next accept. Returns `Ok` on cancellation and
/// `Err(ListenerClosed)` if the listener went away underneath us.
pub async fn serve(
    listener: Arc<dyn Listener>,
    identity: Arc<LocalIdentity>,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
) -> TransportResult<()> {
    let mut tasks = JoinSet::new();
    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let identity = identity.clone();
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        if let Err(e) = respond(conn, &identity, handler.as_ref()).await {
                            debug!(error = %e, "inbound exchange ended without ack");
                        }
                    });
                }
                Err(TransportError::ListenerClosed) => break Err(TransportError::ListenerClosed),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "connection task failed");
                }
            }
        }
    };

    tasks.shutdown().await;
    info!("accept loop stopped");
    result
}
