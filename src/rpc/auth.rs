//! Identity verification for the RPC handshake.
//!
//! How peers prove who they are is an external concern behind
//! [`IdentityVerifier`]; the server only needs a verified identity string per
//! connection. The stock [`Ed25519Verifier`] accepts a signature over a
//! domain-separated version/timestamp challenge, with the hex-encoded public
//! key as the identity.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;

use super::wire::{Handshake, VERSION};

const AUTH_CONTEXT: &[u8] = b"webpub/auth/v1";
const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(600);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("access denied")]
pub struct AuthError;

pub trait IdentityVerifier: Send + Sync + 'static {
    /// Turns a handshake into the authenticated identity, or refuses it.
    fn verify(&self, handshake: &Handshake) -> Result<String, AuthError>;
}

/// The signed challenge: context, protocol version, signing time.
pub fn auth_message(version: u64, timestamp: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(AUTH_CONTEXT.len() + 16);
    msg.extend_from_slice(AUTH_CONTEXT);
    msg.extend_from_slice(&version.to_le_bytes());
    msg.extend_from_slice(&timestamp.to_le_bytes());
    msg
}

/// Signs a fresh handshake for the given key.
pub fn signed_handshake(key: &SigningKey) -> Handshake {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let signature = key.sign(&auth_message(VERSION, timestamp));
    Handshake {
        version: VERSION,
        identity: hex::encode(key.verifying_key().to_bytes()),
        timestamp,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Verifies ed25519 handshake signatures with a bounded clock skew.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    max_skew: Duration,
}

impl Default for Ed25519Verifier {
    fn default() -> Self {
        Self {
            max_skew: DEFAULT_MAX_SKEW,
        }
    }
}

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_skew(max_skew: Duration) -> Self {
        Self { max_skew }
    }
}

impl IdentityVerifier for Ed25519Verifier {
    fn verify(&self, handshake: &Handshake) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now.abs_diff(handshake.timestamp) > self.max_skew.as_secs() {
            return Err(AuthError);
        }

        let key_bytes: [u8; 32] = hex::decode(&handshake.identity)
            .map_err(|_| AuthError)?
            .try_into()
            .map_err(|_| AuthError)?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| AuthError)?;
        let signature = Signature::from_slice(&handshake.signature).map_err(|_| AuthError)?;
        key.verify_strict(
            &auth_message(handshake.version, handshake.timestamp),
            &signature,
        )
        .map_err(|_| AuthError)?;
        Ok(handshake.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn valid_handshake_yields_identity() {
        let key = SigningKey::generate(&mut OsRng);
        let handshake = signed_handshake(&key);
        let identity = Ed25519Verifier::new().verify(&handshake).unwrap();
        assert_eq!(identity, hex::encode(key.verifying_key().to_bytes()));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut handshake = signed_handshake(&key);
        handshake.signature[0] ^= 0xff;
        assert_eq!(Ed25519Verifier::new().verify(&handshake), Err(AuthError));
    }

    #[test]
    fn foreign_identity_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mut handshake = signed_handshake(&key);
        handshake.identity = hex::encode(other.verifying_key().to_bytes());
        assert_eq!(Ed25519Verifier::new().verify(&handshake), Err(AuthError));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut handshake = signed_handshake(&key);
        handshake.timestamp -= 3600;
        // re-sign so only the skew check can fail
        let signature = key.sign(&auth_message(handshake.version, handshake.timestamp));
        handshake.signature = signature.to_bytes().to_vec();
        assert_eq!(Ed25519Verifier::new().verify(&handshake), Err(AuthError));
    }
}
