//! Ed25519 keypairs and hex-encoded signatures.
//!
//! Node and feed identities are hex-encoded Ed25519 public keys. All
//! signatures are computed over the canonical JSON form of the signed body
//! (see [`crate::canonical`]), and carried as 128 hex characters.

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use serde_json::Value;
use std::fmt;

use crate::canonical::to_canonical_json;

/// A hex-encoded Ed25519 public key (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyHex(String);

/// Node identities are public keys.
pub type NodeId = PublicKeyHex;

impl PublicKeyHex {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        // Reject encodings that do not decompress to a curve point.
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(PublicKeyHex(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn verifying_key(&self) -> VerifyingKey {
        // Validated on construction.
        let bytes: [u8; 32] = hex::decode(&self.0).unwrap().try_into().unwrap();
        VerifyingKey::from_bytes(&bytes).unwrap()
    }
}

impl fmt::Display for PublicKeyHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for PublicKeyHex {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKeyHex {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKeyHex::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A detached Ed25519 signature, hex-encoded (128 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        if bytes.len() != 64 {
            return Err(KeyError::InvalidSignature);
        }
        Ok(Signature(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn dalek(&self) -> ed25519_dalek::Signature {
        let bytes: [u8; 64] = hex::decode(&self.0).unwrap().try_into().unwrap();
        ed25519_dalek::Signature::from_bytes(&bytes)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("invalid secret key: expected 32 bytes")]
    InvalidSecretKey,
}

/// An Ed25519 keypair used to sign pubsub message bodies and subfeed
/// messages.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a keypair from secure random bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        KeyPair {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(KeyPair {
            signing: SigningKey::from_bytes(&arr),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> PublicKeyHex {
        PublicKeyHex(hex::encode(self.signing.verifying_key().as_bytes()))
    }

    /// Sign the canonical JSON form of `body`.
    pub fn sign(&self, body: &Value) -> Signature {
        let encoded = to_canonical_json(body);
        let sig = self.signing.sign(encoded.as_bytes());
        Signature(hex::encode(sig.to_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyPair").field(&self.public_key()).finish()
    }
}

/// Verify `signature` over the canonical JSON form of `body`.
///
/// Returns `false` on any mismatch; callers decide whether that is fatal.
pub fn verify_signature(body: &Value, public_key: &PublicKeyHex, signature: &Signature) -> bool {
    let encoded = to_canonical_json(body);
    public_key
        .verifying_key()
        .verify(encoded.as_bytes(), &signature.dalek())
        .is_ok()
}
