//! Tree Head Signatures
//!
//! Ed25519 over the to-be-signed encodings of tree heads and (in third-party
//! deployments) auditor heads and operator update prefixes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature bytes")]
    InvalidSignature,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// A signing key pair held by the log operator.
pub struct SigningKeyPair {
    key: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn verifier(&self) -> VerifierKey {
        VerifierKey {
            key: self.key.verifying_key(),
        }
    }

    /// Sign a to-be-signed encoding; 64-byte signature.
    pub fn sign(&self, tbs: &[u8]) -> Vec<u8> {
        self.key.sign(tbs).to_bytes().to_vec()
    }
}

/// Verification-only key, as distributed in the public config.
#[derive(Debug, Clone)]
pub struct VerifierKey {
    key: VerifyingKey,
}

impl VerifierKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| SignatureError::InvalidPublicKey)?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verify(&self, tbs: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let sig = Signature::from_slice(signature).map_err(|_| SignatureError::InvalidSignature)?;
        self.key
            .verify(tbs, &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = SigningKeyPair::generate();
        let sig = pair.sign(b"tree head");
        pair.verifier().verify(b"tree head", &sig).unwrap();
        assert!(pair.verifier().verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_verifier_from_bytes() {
        let pair = SigningKeyPair::from_seed(&[7u8; 32]);
        let verifier = VerifierKey::from_bytes(&pair.public_key_bytes()).unwrap();
        let sig = pair.sign(b"payload");
        verifier.verify(b"payload", &sig).unwrap();
    }
}
