//! Commitment verification.
//!
//! Every oracle hashes the artifact bytes with SHA-256. Because the function
//! is fixed and public, independent oracles holding identical bytes arrive at
//! identical digests and can agree without trusting each other, only the
//! commitment registered on-chain.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::VerificationError;

/// A 32-byte SHA-256 digest, hex-encoded at every text boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProofDigest([u8; 32]);

impl ProofDigest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for ProofDigest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for ProofDigest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ProofDigest {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProofDigest> for String {
    fn from(d: ProofDigest) -> Self {
        d.to_hex()
    }
}

impl fmt::Display for ProofDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Bytes fetched for one verification attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct ProofArtifact {
    pub cid: String,
    pub bytes: Bytes,
    pub digest: ProofDigest,
}

impl ProofArtifact {
    pub fn new(cid: impl Into<String>, bytes: Bytes) -> Self {
        let digest = compute_sha256(&bytes);
        Self {
            cid: cid.into(),
            bytes,
            digest,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    Match,
    Mismatch,
}

/// Compute the SHA-256 digest of `data`.
pub fn compute_sha256(data: &[u8]) -> ProofDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ProofDigest(hasher.finalize().into())
}

/// Compare an artifact's digest to the project's registered commitment.
pub fn check_commitment(artifact: &ProofArtifact, commitment: &ProofDigest) -> Commitment {
    debug!(
        cid = %artifact.cid,
        computed = %artifact.digest,
        expected = %commitment,
        "comparing artifact digest to commitment"
    );
    if artifact.digest == *commitment {
        Commitment::Match
    } else {
        Commitment::Mismatch
    }
}

/// Like [`check_commitment`], but a mismatch becomes an error the caller must stop on.
pub fn verify_commitment(
    artifact: &ProofArtifact,
    commitment: &ProofDigest,
) -> Result<ProofDigest, VerificationError> {
    match check_commitment(artifact, commitment) {
        Commitment::Match => Ok(artifact.digest),
        Commitment::Mismatch => Err(VerificationError::HashMismatch {
            expected: *commitment,
            computed: artifact.digest,
        }),
    }
}
