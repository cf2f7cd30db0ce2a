//! Value Commitments
//!
//! An HMAC over a random opening and the committed body. The commitment is
//! what the prefix tree stores; the opening is released to searchers so they
//! can check the value they were handed is the one the tree committed to.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::suite::{CipherSuite, Hash};

type HmacSha256 = Hmac<Sha256>;

/// Draw a fresh random opening of the suite-fixed size.
pub fn generate_opening(cs: &CipherSuite, rng: &mut dyn RngCore) -> Vec<u8> {
    let mut opening = vec![0u8; cs.commitment_opening_size()];
    rng.fill_bytes(&mut opening);
    opening
}

/// Commit to `body` under `opening`.
pub fn commit(cs: &CipherSuite, opening: &[u8], body: &[u8]) -> Hash {
    let mut mac = HmacSha256::new_from_slice(&cs.commitment_fixed_bytes())
        .expect("HMAC accepts any key length");
    mac.update(opening);
    mac.update(body);
    let out = mac.finalize().into_bytes();
    let mut commitment = [0u8; 32];
    commitment.copy_from_slice(&out);
    commitment
}

/// Constant-time check that `commitment` opens to `body` under `opening`.
pub fn verify_commitment(cs: &CipherSuite, opening: &[u8], body: &[u8], commitment: &Hash) -> bool {
    let mut mac = HmacSha256::new_from_slice(&cs.commitment_fixed_bytes())
        .expect("HMAC accepts any key length");
    mac.update(opening);
    mac.update(body);
    mac.verify_slice(commitment).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_roundtrip() {
        let cs = CipherSuite::KtEd25519Sha256;
        let mut rng = rand::thread_rng();
        let opening = generate_opening(&cs, &mut rng);
        assert_eq!(opening.len(), cs.commitment_opening_size());

        let commitment = commit(&cs, &opening, b"body");
        assert!(verify_commitment(&cs, &opening, b"body", &commitment));
        assert!(!verify_commitment(&cs, &opening, b"other", &commitment));
    }

    #[test]
    fn test_distinct_openings_distinct_commitments() {
        let cs = CipherSuite::KtEd25519Sha256;
        let a = commit(&cs, &[0u8; 16], b"body");
        let b = commit(&cs, &[1u8; 16], b"body");
        assert_ne!(a, b);
    }
}
