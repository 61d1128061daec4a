//! Signed append-only subfeed messages.
//!
//! A feed is identified by the public key of its signing keypair; a
//! subfeed names one ordered message log within it. Every message carries
//! its position, the signature of its predecessor, and an Ed25519
//! signature over its body, so a log can be verified end to end from
//! nothing but the feed id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::hash::Sha1Hash;
use crate::keys::{KeyPair, PublicKeyHex, Signature, verify_signature};

/// A feed id is the feed's public signing key.
pub type FeedId = PublicKeyHex;

/// Names a subfeed within a feed.
pub type SubfeedHash = Sha1Hash;

/// Derive the subfeed hash for a human-readable subfeed name.
pub fn subfeed_hash_for_name(name: &str) -> SubfeedHash {
    Sha1Hash::new(name.as_bytes())
}

/// Milliseconds since the unix epoch; the timestamp form carried in
/// message bodies.
pub fn now_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubfeedMessageBody {
    pub message: Value,

    #[serde(rename = "messageNumber")]
    pub message_number: u64,

    /// Signature of the preceding message; `null` for message 0. Always
    /// serialized, so the canonical form pins the chain position.
    #[serde(rename = "previousSignature")]
    pub previous_signature: Option<Signature>,

    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSubfeedMessage {
    pub body: SubfeedMessageBody,
    pub signature: Signature,
}

impl SignedSubfeedMessage {
    /// Sign a new message extending a chain at the given position.
    pub fn sign_new(
        keypair: &KeyPair,
        message: Value,
        message_number: u64,
        previous_signature: Option<Signature>,
        timestamp: u64,
    ) -> Self {
        let body = SubfeedMessageBody {
            message,
            message_number,
            previous_signature,
            timestamp,
        };
        // Body serialization cannot fail
        let signature = keypair.sign(&serde_json::to_value(&body).unwrap());
        SignedSubfeedMessage { body, signature }
    }

    /// Check the Ed25519 signature against the feed's public key.
    pub fn verify(&self, feed_id: &FeedId) -> bool {
        let body = serde_json::to_value(&self.body).unwrap();
        verify_signature(&body, feed_id, &self.signature)
    }
}

/// Verify that `messages` is a valid chain continuation starting at
/// position `start_number`, whose first message must point back at
/// `previous_signature` (None at the root).
///
/// Used both for full loads (`start_number = 0`, `previous_signature =
/// None`) and for verifying batches that extend an existing tail. Any
/// failure is fatal for the whole batch.
pub fn verify_chain<'a>(
    messages: &'a [SignedSubfeedMessage],
    feed_id: &FeedId,
    start_number: u64,
    mut previous_signature: Option<&'a Signature>,
) -> Result<()> {
    for (i, msg) in messages.iter().enumerate() {
        let expected_number = start_number + i as u64;
        if msg.body.message_number != expected_number {
            return Err(Error::integrity(format!(
                "subfeed message number {} where {} was expected",
                msg.body.message_number, expected_number
            )));
        }
        if msg.body.previous_signature.as_ref() != previous_signature {
            return Err(Error::integrity(format!(
                "subfeed chain break at message {expected_number}"
            )));
        }
        if !msg.verify(feed_id) {
            return Err(Error::integrity(format!(
                "invalid signature on subfeed message {expected_number}"
            )));
        }
        previous_signature = Some(&msg.signature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn signed_chain(keypair: &KeyPair, n: u64) -> Vec<SignedSubfeedMessage> {
        let mut messages = Vec::new();
        let mut prev: Option<Signature> = None;
        for i in 0..n {
            let msg = SignedSubfeedMessage::sign_new(
                keypair,
                json!({"seq": i}),
                i,
                prev.clone(),
                1_700_000_000_000 + i,
            );
            prev = Some(msg.signature.clone());
            messages.push(msg);
        }
        messages
    }

    #[test]
    fn test_chain_verifies() {
        let keypair = KeyPair::generate();
        let messages = signed_chain(&keypair, 3);
        verify_chain(&messages, &keypair.public_key(), 0, None).unwrap();
        assert_eq!(messages[0].body.previous_signature, None);
        assert_eq!(
            messages[2].body.previous_signature.as_ref(),
            Some(&messages[1].signature)
        );
    }

    #[test]
    fn test_tampered_body_fails() {
        let keypair = KeyPair::generate();
        let mut messages = signed_chain(&keypair, 3);
        messages[1].body.message = json!({"seq": 999});
        let err = verify_chain(&messages, &keypair.public_key(), 0, None).unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));
    }

    #[test]
    fn test_reordered_chain_fails() {
        let keypair = KeyPair::generate();
        let mut messages = signed_chain(&keypair, 3);
        messages.swap(1, 2);
        assert!(verify_chain(&messages, &keypair.public_key(), 0, None).is_err());
    }

    #[test]
    fn test_continuation_from_tail() {
        let keypair = KeyPair::generate();
        let messages = signed_chain(&keypair, 5);
        verify_chain(
            &messages[2..],
            &keypair.public_key(),
            2,
            Some(&messages[1].signature),
        )
        .unwrap();
    }

    #[test]
    fn test_wrong_feed_id_fails() {
        let keypair = KeyPair::generate();
        let messages = signed_chain(&keypair, 2);
        let other = KeyPair::generate();
        assert!(verify_chain(&messages, &other.public_key(), 0, None).is_err());
    }

    #[test]
    fn test_body_wire_form() {
        let keypair = KeyPair::generate();
        let msg = SignedSubfeedMessage::sign_new(&keypair, json!("x"), 0, None, 123);
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["body"]["messageNumber"], 0);
        assert_eq!(wire["body"]["previousSignature"], Value::Null);
        assert_eq!(wire["body"]["timestamp"], 123);
    }
}
