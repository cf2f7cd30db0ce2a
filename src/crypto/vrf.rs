//! Verifiable Random Function
//!
//! ECVRF over edwards25519 with SHA-512 and try-and-increment hashing to the
//! curve (RFC 9381 style). The VRF output deterministically indexes prefix
//! tree leaves; the proof lets a client check that the server derived the
//! index honestly without revealing the signing key.
//!
//! Proofs are 80 bytes: gamma (32) || challenge (16) || scalar (32).
//! Outputs are the first 32 bytes of the RFC output hash.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::RngCore;
use sha2::{Digest, Sha512};
use thiserror::Error;

const SUITE_STRING: u8 = 0x03;
const DOMAIN_ENCODE: u8 = 0x01;
const DOMAIN_CHALLENGE: u8 = 0x02;
const DOMAIN_OUTPUT: u8 = 0x03;

/// Serialized proof size in bytes.
pub const PROOF_SIZE: usize = 80;

/// Truncated output size in bytes.
pub const OUTPUT_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum VrfError {
    #[error("invalid VRF public key bytes")]
    InvalidPublicKey,

    #[error("invalid VRF proof encoding")]
    InvalidProof,

    #[error("VRF proof verification failed")]
    VerificationFailed,

    #[error("no curve point found for input")]
    HashToCurveFailed,
}

/// An 80-byte VRF proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfProof {
    gamma: CompressedEdwardsY,
    challenge: [u8; 16],
    scalar: Scalar,
}

impl VrfProof {
    pub fn to_bytes(&self) -> [u8; PROOF_SIZE] {
        let mut out = [0u8; PROOF_SIZE];
        out[..32].copy_from_slice(self.gamma.as_bytes());
        out[32..48].copy_from_slice(&self.challenge);
        out[48..].copy_from_slice(self.scalar.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VrfError> {
        if bytes.len() != PROOF_SIZE {
            return Err(VrfError::InvalidProof);
        }
        let gamma = CompressedEdwardsY::from_slice(&bytes[..32]).map_err(|_| VrfError::InvalidProof)?;
        let mut challenge = [0u8; 16];
        challenge.copy_from_slice(&bytes[32..48]);
        let scalar_bytes: [u8; 32] = bytes[48..].try_into().map_err(|_| VrfError::InvalidProof)?;
        let scalar = Option::<Scalar>::from(Scalar::from_canonical_bytes(scalar_bytes))
            .ok_or(VrfError::InvalidProof)?;
        Ok(Self {
            gamma,
            challenge,
            scalar,
        })
    }
}

/// VRF secret key held by the log operator.
pub struct VrfPrivateKey {
    secret: Scalar,
    nonce_seed: [u8; 32],
    public: VrfPublicKey,
}

impl VrfPrivateKey {
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Derive the key pair from a 32-byte seed, ed25519 style: the first
    /// half of SHA-512(seed) becomes the clamped secret scalar, the second
    /// half seeds nonce generation.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let digest = Sha512::digest(seed);
        let mut scalar_bytes = [0u8; 32];
        scalar_bytes.copy_from_slice(&digest[..32]);
        scalar_bytes[0] &= 248;
        scalar_bytes[31] &= 127;
        scalar_bytes[31] |= 64;
        let secret = Scalar::from_bytes_mod_order(scalar_bytes);
        let mut nonce_seed = [0u8; 32];
        nonce_seed.copy_from_slice(&digest[32..]);
        let point = ED25519_BASEPOINT_POINT * secret;
        Self {
            secret,
            nonce_seed,
            public: VrfPublicKey { point },
        }
    }

    pub fn public_key(&self) -> &VrfPublicKey {
        &self.public
    }

    /// Evaluate the VRF: returns the 32-byte output and the proof.
    pub fn prove(&self, alpha: &[u8]) -> ([u8; OUTPUT_SIZE], VrfProof) {
        let h = self
            .public
            .encode_to_curve(alpha)
            .expect("try-and-increment exhausts only with negligible probability");
        let h_bytes = h.compress();

        let gamma = h * self.secret;
        let k = self.nonce(h_bytes.as_bytes());
        let k_b = ED25519_BASEPOINT_POINT * k;
        let k_h = h * k;

        let challenge = challenge_hash(&self.public.point, &h, &gamma, &k_b, &k_h);
        let c_scalar = challenge_scalar(&challenge);
        let s = k + c_scalar * self.secret;

        let proof = VrfProof {
            gamma: gamma.compress(),
            challenge,
            scalar: s,
        };
        (proof_output(&gamma), proof)
    }

    fn nonce(&self, h_string: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(self.nonce_seed);
        hasher.update(h_string);
        let digest: [u8; 64] = hasher.finalize().into();
        Scalar::from_bytes_mod_order_wide(&digest)
    }
}

/// VRF public key, as distributed in the public config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfPublicKey {
    point: EdwardsPoint,
}

impl VrfPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VrfError> {
        let compressed =
            CompressedEdwardsY::from_slice(bytes).map_err(|_| VrfError::InvalidPublicKey)?;
        let point = compressed.decompress().ok_or(VrfError::InvalidPublicKey)?;
        if point.is_small_order() {
            return Err(VrfError::InvalidPublicKey);
        }
        Ok(Self { point })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.point.compress().to_bytes()
    }

    /// Verify a proof over `alpha`; returns the 32-byte output on success.
    pub fn verify(&self, alpha: &[u8], proof: &VrfProof) -> Result<[u8; OUTPUT_SIZE], VrfError> {
        let gamma = proof.gamma.decompress().ok_or(VrfError::InvalidProof)?;
        let h = self.encode_to_curve(alpha)?;

        let c_scalar = challenge_scalar(&proof.challenge);
        let u = EdwardsPoint::vartime_double_scalar_mul_basepoint(
            &-c_scalar,
            &self.point,
            &proof.scalar,
        );
        let v = h * proof.scalar - gamma * c_scalar;

        let expected = challenge_hash(&self.point, &h, &gamma, &u, &v);
        if expected != proof.challenge {
            return Err(VrfError::VerificationFailed);
        }
        Ok(proof_output(&gamma))
    }

    /// Try-and-increment hashing of `alpha` to a prime-order curve point,
    /// salted with this public key.
    fn encode_to_curve(&self, alpha: &[u8]) -> Result<EdwardsPoint, VrfError> {
        let salt = self.point.compress();
        for ctr in 0u8..=255 {
            let mut hasher = Sha512::new();
            hasher.update([SUITE_STRING, DOMAIN_ENCODE]);
            hasher.update(salt.as_bytes());
            hasher.update(alpha);
            hasher.update([ctr, 0x00]);
            let digest = hasher.finalize();
            let candidate: [u8; 32] = digest[..32].try_into().expect("sha512 output is 64 bytes");
            if let Some(point) = CompressedEdwardsY(candidate).decompress() {
                let cleared = point.mul_by_cofactor();
                if !cleared.is_identity() {
                    return Ok(cleared);
                }
            }
        }
        Err(VrfError::HashToCurveFailed)
    }
}

fn challenge_hash(
    pk: &EdwardsPoint,
    h: &EdwardsPoint,
    gamma: &EdwardsPoint,
    u: &EdwardsPoint,
    v: &EdwardsPoint,
) -> [u8; 16] {
    let mut hasher = Sha512::new();
    hasher.update([SUITE_STRING, DOMAIN_CHALLENGE]);
    for point in [pk, h, gamma, u, v] {
        hasher.update(point.compress().as_bytes());
    }
    hasher.update([0x00]);
    let digest = hasher.finalize();
    digest[..16].try_into().expect("sha512 output is 64 bytes")
}

fn challenge_scalar(challenge: &[u8; 16]) -> Scalar {
    let mut wide = [0u8; 32];
    wide[..16].copy_from_slice(challenge);
    Scalar::from_bytes_mod_order(wide)
}

fn proof_output(gamma: &EdwardsPoint) -> [u8; OUTPUT_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update([SUITE_STRING, DOMAIN_OUTPUT]);
    hasher.update(gamma.mul_by_cofactor().compress().as_bytes());
    hasher.update([0x00]);
    let digest = hasher.finalize();
    digest[..OUTPUT_SIZE]
        .try_into()
        .expect("sha512 output is 64 bytes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prove_verify_roundtrip() {
        let key = VrfPrivateKey::from_seed(&[42u8; 32]);
        let (output, proof) = key.prove(b"alice/0");
        let verified = key.public_key().verify(b"alice/0", &proof).unwrap();
        assert_eq!(output, verified);
    }

    #[test]
    fn test_deterministic() {
        let key = VrfPrivateKey::from_seed(&[1u8; 32]);
        let (o1, p1) = key.prove(b"input");
        let (o2, p2) = key.prove(b"input");
        assert_eq!(o1, o2);
        assert_eq!(p1.to_bytes(), p2.to_bytes());
    }

    #[test]
    fn test_distinct_inputs_distinct_outputs() {
        let key = VrfPrivateKey::from_seed(&[2u8; 32]);
        let (o1, _) = key.prove(b"input-a");
        let (o2, _) = key.prove(b"input-b");
        assert_ne!(o1, o2);
    }

    #[test]
    fn test_wrong_input_rejected() {
        let key = VrfPrivateKey::from_seed(&[3u8; 32]);
        let (_, proof) = key.prove(b"input-a");
        assert!(key.public_key().verify(b"input-b", &proof).is_err());
    }

    #[test]
    fn test_proof_encoding_roundtrip() {
        let key = VrfPrivateKey::from_seed(&[4u8; 32]);
        let (_, proof) = key.prove(b"input");
        let decoded = VrfProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(proof, decoded);
        assert!(VrfProof::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let key = VrfPrivateKey::generate(&mut rand::thread_rng());
        let pk = VrfPublicKey::from_bytes(&key.public_key().to_bytes()).unwrap();
        let (output, proof) = key.prove(b"x");
        assert_eq!(pk.verify(b"x", &proof).unwrap(), output);
    }
}
