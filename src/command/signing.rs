//! Optional envelope signing
//!
//! Signing is advisory: the dispatcher asks a [`MessageSigner`] for a
//! signature when one is configured and sends the command unsigned if the
//! signer fails. Key material always comes from the caller.

use crate::command::envelope::CommandEnvelope;
use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Signing key rejected: {0}")]
    InvalidKey(String),

    #[error("Failed to canonicalize envelope: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Capability to sign and verify command envelopes
pub trait MessageSigner: Send + Sync {
    fn sign(&self, envelope: &CommandEnvelope) -> Result<String, SigningError>;

    fn verify(&self, envelope: &CommandEnvelope, signature: &str) -> bool;
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the unsigned envelope, hex encoded
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SigningError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SigningError::InvalidKey("key is empty".into()));
        }
        Ok(Self { key })
    }

    /// Key given as a hex string, as stored in the config file
    pub fn from_hex(key: &str) -> Result<Self, SigningError> {
        let bytes = hex::decode(key.trim()).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Self::new(bytes)
    }

    fn mac(&self, envelope: &CommandEnvelope) -> Result<HmacSha256, SigningError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        mac.update(&envelope.signing_payload()?);
        Ok(mac)
    }
}

impl MessageSigner for HmacSigner {
    fn sign(&self, envelope: &CommandEnvelope) -> Result<String, SigningError> {
        Ok(hex::encode(self.mac(envelope)?.finalize().into_bytes()))
    }

    fn verify(&self, envelope: &CommandEnvelope, signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        match self.mac(envelope) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}
