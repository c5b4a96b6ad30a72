//! The signed message envelope
//!
//! An envelope is signed once by its sender over a canonical payload and is
//! verifiable by anyone, because the sender's public key is recovered from
//! the `from` address itself.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, CryptoError, CryptoResult, OnionAddress, SignatureBytes};
use crate::identity::{overlay, LocalIdentity};

/// Current envelope format version
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known envelope types. Any other string is allowed.
pub mod kind {
    /// Free-form text message
    pub const MESSAGE: &str = "message";
    /// Receipt for another envelope; `body` holds that envelope's id
    pub const ACK: &str = "ack";
    /// Liveness check, answered with an ack
    pub const PING: &str = "ping";
}

/// A signed, typed unit of communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version
    pub v: u32,
    /// Unique id (UUID v4)
    pub id: String,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Unix timestamp, seconds
    pub ts: i64,
    /// Envelope type, see [`kind`]
    #[serde(rename = "type")]
    pub kind: String,
    /// UTF-8 payload
    pub body: String,
    /// Id of the envelope this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Conversation grouping hint (not covered by the signature)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Application metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Base64 ed25519 signature over [`Envelope::signing_payload`]
    #[serde(default)]
    pub sig: String,
}

impl Envelope {
    /// Create an unsigned envelope with a fresh id and the current time
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Envelope {
            v: PROTOCOL_VERSION,
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            ts: chrono::Utc::now().timestamp(),
            kind: kind.into(),
            body: body.into(),
            reply_to: None,
            thread_id: None,
            meta: BTreeMap::new(),
            sig: String::new(),
        }
    }

    /// Build the ack for `original`, sent back by `from`
    pub fn ack_for(original: &Envelope, from: impl Into<String>) -> Self {
        let mut ack = Envelope::new(from, original.from.clone(), kind::ACK, original.id.clone());
        ack.thread_id = original.thread_id.clone();
        ack
    }

    /// Mark this envelope as a reply. Empty ids are ignored.
    pub fn with_reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to = Some(id.into()).filter(|id| !id.is_empty());
        self
    }

    /// Place this envelope in a thread. Empty ids are ignored.
    pub fn with_thread(mut self, id: impl Into<String>) -> Self {
        self.thread_id = Some(id.into()).filter(|id| !id.is_empty());
        self
    }

    /// Attach one metadata pair
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Fill in the thread id when unset: the reply target if any, else our own id
    pub fn assign_default_thread(&mut self) {
        if self.thread_id.is_none() {
            self.thread_id = Some(self.reply_to.clone().unwrap_or_else(|| self.id.clone()));
        }
    }

    /// Whether this is a correctly correlated ack for envelope `id`
    pub fn is_ack_for(&self, id: &str) -> bool {
        self.kind == kind::ACK && self.body == id
    }

    /// The exact bytes covered by the signature:
    /// `id || from || to || ts || type || body || reply_to [|| meta JSON]`
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = format!(
            "{}{}{}{}{}{}{}",
            self.id,
            self.from,
            self.to,
            self.ts,
            self.kind,
            self.body,
            self.reply_to.as_deref().unwrap_or_default()
        );
        if !self.meta.is_empty() {
            payload.push_str(&canonical_meta(&self.meta));
        }
        payload.into_bytes()
    }

    /// Sign in place with the local identity
    pub fn sign(&mut self, identity: &LocalIdentity) -> CryptoResult<()> {
        let signature = identity.sign(&self.signing_payload())?;
        self.sig = BASE64.encode(signature);
        Ok(())
    }

    /// Check the signature against the key embedded in `from`.
    ///
    /// Returns `Err` when `from` or the signature cannot be decoded and
    /// `Ok(false)` when they decode but do not match.
    pub fn verify(&self) -> CryptoResult<bool> {
        let signature = BASE64
            .decode(&self.sig)
            .map_err(|e| CryptoError::InvalidSignatureEncoding(e.to_string()))?;
        let payload = self.signing_payload();

        if crypto::is_onion_address(&self.from) {
            let public_key = OnionAddress::parse(&self.from)?.public_key()?;
            let signature = SignatureBytes::from_bytes(&signature)?;
            Ok(public_key.verify(&payload, &signature).is_ok())
        } else {
            let peer_id = PeerId::from_str(&self.from)
                .map_err(|e| CryptoError::InvalidPeerId(e.to_string()))?;
            let public_key =
                overlay::public_key_from_peer_id(&peer_id).ok_or(CryptoError::InvalidPublicKey)?;
            Ok(public_key.verify(&payload, &signature))
        }
    }

    /// Single-line JSON, no trailing newline
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse from JSON
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Compact JSON with sorted keys and `<`, `>`, `&`, U+2028, U+2029 escaped,
/// so independent implementations serialize the same map identically.
fn canonical_meta(meta: &BTreeMap<String, String>) -> String {
    let json = serde_json::to_string(meta).unwrap_or_default();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OnionIdentity;
    use proptest::prelude::*;

    fn onion(seed: u8) -> LocalIdentity {
        LocalIdentity::Onion(OnionIdentity::new(crypto::Identity::from_seed(&[seed; 32])))
    }

    fn overlay_identity() -> LocalIdentity {
        LocalIdentity::Overlay(libp2p::identity::Keypair::generate_ed25519())
    }

    fn signed(identity: &LocalIdentity, to: &str) -> Envelope {
        let mut envelope = Envelope::new(identity.address(), to, kind::MESSAGE, "hello")
            .with_meta("lang", "en");
        envelope.sign(identity).unwrap();
        envelope
    }

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = Envelope::new("a", "b", kind::PING, "");
        assert_eq!(envelope.v, PROTOCOL_VERSION);
        assert!(Uuid::parse_str(&envelope.id).is_ok());
        assert!(envelope.sig.is_empty());
        assert!(envelope.reply_to.is_none());
    }

    #[test]
    fn test_onion_sign_verify() {
        let alice = onion(1);
        let bob = onion(2);
        let envelope = signed(&alice, &bob.address());

        assert!(envelope.verify().unwrap());
    }

    #[test]
    fn test_overlay_sign_verify() {
        let alice = overlay_identity();
        let bob = overlay_identity();
        let envelope = signed(&alice, &bob.address());

        assert!(envelope.verify().unwrap());
    }

    #[test]
    fn test_signed_fields_are_covered() {
        let alice = onion(1);
        let envelope = signed(&alice, &onion(2).address());

        let mutations: Vec<Box<dyn Fn(&mut Envelope)>> = vec![
            Box::new(|e: &mut Envelope| e.id.push('x')),
            Box::new(|e: &mut Envelope| e.to = onion(3).address()),
            Box::new(|e: &mut Envelope| e.ts += 1),
            Box::new(|e: &mut Envelope| e.kind = kind::PING.into()),
            Box::new(|e: &mut Envelope| e.body.push('!')),
            Box::new(|e: &mut Envelope| e.reply_to = Some("other".into())),
            Box::new(|e: &mut Envelope| {
                e.meta.insert("lang".into(), "de".into());
            }),
        ];
        for mutate in mutations {
            let mut tampered = envelope.clone();
            mutate(&mut tampered);
            assert!(!tampered.verify().unwrap());
        }

        // the thread id is a routing hint only
        let mut threaded = envelope.clone();
        threaded.thread_id = Some("t-1".into());
        assert!(threaded.verify().unwrap());
    }

    #[test]
    fn test_wrong_signer_fails() {
        let alice = onion(1);
        let mallory = onion(9);
        let mut envelope = Envelope::new(alice.address(), onion(2).address(), kind::MESSAGE, "hi");
        envelope.sign(&mallory).unwrap();

        assert!(!envelope.verify().unwrap());
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        let alice = onion(1);
        let envelope = signed(&alice, &onion(2).address());

        let mut bad_sig = envelope.clone();
        bad_sig.sig = "%%%".into();
        assert!(matches!(
            bad_sig.verify(),
            Err(CryptoError::InvalidSignatureEncoding(_))
        ));

        let mut short_sig = envelope.clone();
        short_sig.sig = BASE64.encode([0u8; 10]);
        assert!(short_sig.verify().is_err());

        let mut bad_from = envelope;
        bad_from.from = "not-an-address".into();
        assert!(bad_from.verify().is_err());
    }

    #[test]
    fn test_json_shape() {
        let alice = onion(1);
        let mut envelope = Envelope::new(alice.address(), onion(2).address(), kind::MESSAGE, "hi")
            .with_reply_to("r-1")
            .with_meta("lang", "en");
        envelope.assign_default_thread();
        envelope.sign(&alice).unwrap();

        let json = String::from_utf8(envelope.to_json().unwrap()).unwrap();
        assert!(!json.contains('\n'));
        let fields = [
            r#""v":1"#,
            r#""type":"message""#,
            r#""reply_to":"r-1""#,
            r#""thread_id":"r-1""#,
            r#""meta":{"lang":"en"}"#,
            r#""sig":""#,
        ];
        for field in fields {
            assert!(json.contains(field), "{field} missing from {json}");
        }

        let plain = Envelope::new("a", "b", kind::PING, "");
        let json = String::from_utf8(plain.to_json().unwrap()).unwrap();
        assert!(!json.contains("reply_to"));
        assert!(!json.contains("thread_id"));
        assert!(!json.contains("meta"));

        let parsed = Envelope::from_json(envelope.to_json().unwrap().as_slice()).unwrap();
        assert_eq!(parsed, envelope);
        assert!(parsed.verify().unwrap());
    }

    #[test]
    fn test_default_thread() {
        let mut fresh = Envelope::new("a", "b", kind::MESSAGE, "x");
        fresh.assign_default_thread();
        assert_eq!(fresh.thread_id.as_deref(), Some(fresh.id.as_str()));

        let mut reply = Envelope::new("a", "b", kind::MESSAGE, "x").with_reply_to("parent");
        reply.assign_default_thread();
        assert_eq!(reply.thread_id.as_deref(), Some("parent"));

        let mut explicit = Envelope::new("a", "b", kind::MESSAGE, "x")
            .with_reply_to("parent")
            .with_thread("thread");
        explicit.assign_default_thread();
        assert_eq!(explicit.thread_id.as_deref(), Some("thread"));
    }

    #[test]
    fn test_ack_correlation() {
        let original = Envelope::new("alice", "bob", kind::MESSAGE, "x").with_thread("t");
        let ack = Envelope::ack_for(&original, "bob");

        assert_eq!(ack.to, "alice");
        assert_eq!(ack.body, original.id);
        assert_eq!(ack.thread_id.as_deref(), Some("t"));
        assert!(ack.is_ack_for(&original.id));
        assert!(!ack.is_ack_for("some-other-id"));
    }

    #[test]
    fn test_canonical_meta_escapes_html() {
        let mut meta = BTreeMap::new();
        meta.insert("z".to_string(), "1".to_string());
        meta.insert("a".to_string(), "<b>&".to_string());
        assert_eq!(
            canonical_meta(&meta),
            r#"{"a":"\u003cb\u003e\u0026","z":"1"}"#
        );
    }

    proptest! {
        #[test]
        fn prop_sign_verify(
            seed in any::<[u8; 32]>(),
            body in ".*",
            kind in "[a-z-]{1,16}",
            reply_to in proptest::option::of("[a-f0-9-]{1,36}"),
            meta in proptest::collection::btree_map("[a-z]{1,8}", ".*", 0..4),
        ) {
            let identity = LocalIdentity::Onion(OnionIdentity::new(crypto::Identity::from_seed(&seed)));
            let mut envelope = Envelope::new(identity.address(), onion(2).address(), kind, body);
            envelope.reply_to = reply_to;
            envelope.meta = meta;
            envelope.sign(&identity).unwrap();

            prop_assert!(envelope.verify().unwrap());

            let mut other_seed = seed;
            other_seed[0] = other_seed[0].wrapping_add(1);
            let other = LocalIdentity::Onion(OnionIdentity::new(crypto::Identity::from_seed(&other_seed)));
            let mut forged = envelope.clone();
            forged.sign(&other).unwrap();
            prop_assert!(!forged.verify().unwrap());

            let mut tampered = envelope;
            tampered.body.push('#');
            prop_assert!(!tampered.verify().unwrap());
        }
    }
}
