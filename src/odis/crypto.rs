//! Signing capabilities consumed by the signer and combiner.
//!
//! The rate-limiting core only needs two narrow capabilities: a signer
//! turns a blinded message into a partial signature, and the combiner
//! verifies partials and folds a quorum of them into one result. The
//! Ed25519 backends below are deterministic, so a re-issued partial for a
//! deduplicated request is byte-identical to the first one.
//!
//! The combined Ed25519 result is a quorum certificate: the threshold
//! number of verified partials, each tagged with its signer index.

use std::collections::{BTreeMap, BTreeSet};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use super::types::KeyVersion;
use crate::error::{OdisError, OdisResult};

const SIGNATURE_LEN: usize = 64;
const CERT_ENTRY_LEN: usize = 2 + SIGNATURE_LEN;

/// Signer-side capability: produce a partial signature.
pub trait PartialSigner: Send + Sync {
    /// Version used when the caller does not ask for one.
    fn latest_key_version(&self) -> KeyVersion;

    fn has_key_version(&self, version: KeyVersion) -> bool;

    fn sign(&self, version: KeyVersion, blinded_message: &[u8]) -> OdisResult<Vec<u8>>;
}

/// A verified partial signature from one signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPartial {
    pub signer_index: usize,
    pub signature: Vec<u8>,
}

/// Combiner-side capability: verify partials and aggregate a quorum.
pub trait SignatureCombiner: Send + Sync {
    fn verify_partial(
        &self,
        signer_index: usize,
        blinded_message: &[u8],
        partial: &[u8],
    ) -> OdisResult<()>;

    /// Combine at least `threshold` verified partials.
    fn combine(&self, blinded_message: &[u8], partials: &[VerifiedPartial])
    -> OdisResult<Vec<u8>>;
}

// =============================================================================
// Ed25519 signer keyring
// =============================================================================

/// Versioned Ed25519 signing keys of one signer.
pub struct Ed25519Keyring {
    keys: BTreeMap<KeyVersion, SigningKey>,
}

impl Ed25519Keyring {
    /// Build from `(version, seed)` pairs.
    pub fn from_seeds(seeds: impl IntoIterator<Item = (KeyVersion, [u8; 32])>) -> OdisResult<Self> {
        let keys: BTreeMap<_, _> = seeds
            .into_iter()
            .map(|(version, seed)| (version, SigningKey::from_bytes(&seed)))
            .collect();
        if keys.is_empty() {
            return Err(OdisError::Config("keyring has no keys".to_string()));
        }
        Ok(Self { keys })
    }

    /// Parse comma-separated `version:hexseed` entries.
    pub fn parse(spec: &str) -> OdisResult<Self> {
        let mut seeds = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (version, seed_hex) = entry
                .split_once(':')
                .ok_or_else(|| OdisError::Config("key entry must be version:hexseed".to_string()))?;
            let version: KeyVersion = version
                .trim()
                .parse()
                .map_err(|_| OdisError::Config(format!("invalid key version '{version}'")))?;
            let bytes = Zeroizing::new(
                hex::decode(seed_hex.trim())
                    .map_err(|e| OdisError::Config(format!("key {version}: {e}")))?,
            );
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                OdisError::Config(format!("key {version}: seed must be 32 bytes"))
            })?;
            seeds.push((version, seed));
        }
        Self::from_seeds(seeds)
    }

    /// Hex verifying key for a version, as configured on the combiner.
    pub fn verifying_key_hex(&self, version: KeyVersion) -> Option<String> {
        self.keys
            .get(&version)
            .map(|key| hex::encode(key.verifying_key().as_bytes()))
    }
}

impl PartialSigner for Ed25519Keyring {
    fn latest_key_version(&self) -> KeyVersion {
        self.keys.keys().next_back().copied().unwrap_or_default()
    }

    fn has_key_version(&self, version: KeyVersion) -> bool {
        self.keys.contains_key(&version)
    }

    fn sign(&self, version: KeyVersion, blinded_message: &[u8]) -> OdisResult<Vec<u8>> {
        let key = self
            .keys
            .get(&version)
            .ok_or_else(|| OdisError::InvalidKeyVersion(version.to_string()))?;
        Ok(key.sign(blinded_message).to_bytes().to_vec())
    }
}

// =============================================================================
// Ed25519 quorum combiner
// =============================================================================

/// Verifies Ed25519 partials and emits a quorum certificate.
pub struct Ed25519QuorumCombiner {
    verifying_keys: Vec<VerifyingKey>,
    threshold: usize,
}

impl Ed25519QuorumCombiner {
    pub fn new(verifying_keys: Vec<VerifyingKey>, threshold: usize) -> OdisResult<Self> {
        if threshold == 0 || threshold > verifying_keys.len() {
            return Err(OdisError::InvalidThreshold {
                threshold,
                total: verifying_keys.len(),
            });
        }
        Ok(Self {
            verifying_keys,
            threshold,
        })
    }

    /// Build from hex verifying keys ordered like the signer endpoints.
    pub fn from_hex(keys: &[String], threshold: usize) -> OdisResult<Self> {
        let verifying_keys = keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let bytes: [u8; 32] = hex::decode(key)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| {
                        OdisError::Config(format!("signer {index}: verifying key must be 32 hex bytes"))
                    })?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| OdisError::Config(format!("signer {index}: {e}")))
            })
            .collect::<OdisResult<Vec<_>>>()?;
        Self::new(verifying_keys, threshold)
    }

    /// Check a certificate produced by [`SignatureCombiner::combine`].
    pub fn verify_certificate(&self, blinded_message: &[u8], certificate: &[u8]) -> OdisResult<()> {
        let Some((count, entries)) = certificate.split_first_chunk::<2>() else {
            return Err(OdisError::InvalidInput("certificate too short".to_string()));
        };
        let count = usize::from(u16::from_be_bytes(*count));
        if entries.len() != count * CERT_ENTRY_LEN {
            return Err(OdisError::InvalidInput("certificate length mismatch".to_string()));
        }

        let mut signers = BTreeSet::new();
        for entry in entries.chunks_exact(CERT_ENTRY_LEN) {
            let index = usize::from(u16::from_be_bytes([entry[0], entry[1]]));
            self.verify_partial(index, blinded_message, &entry[2..])?;
            signers.insert(index);
        }

        if signers.len() < self.threshold {
            return Err(OdisError::InsufficientSigners {
                needed: self.threshold,
                have: signers.len(),
            });
        }
        Ok(())
    }
}

impl SignatureCombiner for Ed25519QuorumCombiner {
    fn verify_partial(
        &self,
        signer_index: usize,
        blinded_message: &[u8],
        partial: &[u8],
    ) -> OdisResult<()> {
        let invalid = |reason: String| OdisError::InvalidPartialSignature {
            signer: signer_index,
            reason,
        };
        let key = self
            .verifying_keys
            .get(signer_index)
            .ok_or_else(|| invalid("unknown signer".to_string()))?;
        let signature = Signature::from_slice(partial).map_err(|e| invalid(e.to_string()))?;
        key.verify(blinded_message, &signature)
            .map_err(|e| invalid(e.to_string()))
    }

    fn combine(
        &self,
        blinded_message: &[u8],
        partials: &[VerifiedPartial],
    ) -> OdisResult<Vec<u8>> {
        let mut chosen: BTreeMap<usize, &[u8]> = BTreeMap::new();
        for partial in partials {
            self.verify_partial(partial.signer_index, blinded_message, &partial.signature)?;
            chosen
                .entry(partial.signer_index)
                .or_insert(partial.signature.as_slice());
        }

        if chosen.len() < self.threshold {
            return Err(OdisError::AggregationFailed(format!(
                "need {} distinct partials, have {}",
                self.threshold,
                chosen.len()
            )));
        }

        let count = u16::try_from(self.threshold)
            .map_err(|_| OdisError::AggregationFailed("threshold too large".to_string()))?;
        let mut certificate = Vec::with_capacity(2 + self.threshold * CERT_ENTRY_LEN);
        certificate.extend_from_slice(&count.to_be_bytes());
        for (index, signature) in chosen.into_iter().take(self.threshold) {
            let index = u16::try_from(index)
                .map_err(|_| OdisError::AggregationFailed("signer index too large".to_string()))?;
            certificate.extend_from_slice(&index.to_be_bytes());
            certificate.extend_from_slice(signature);
        }
        Ok(certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyrings(n: u8) -> Vec<Ed25519Keyring> {
        (1..=n)
            .map(|seed| Ed25519Keyring::from_seeds([(1, [seed; 32])]).unwrap())
            .collect()
    }

    fn combiner_for(rings: &[Ed25519Keyring], threshold: usize) -> Ed25519QuorumCombiner {
        let keys: Vec<String> = rings.iter().map(|r| r.verifying_key_hex(1).unwrap()).collect();
        Ed25519QuorumCombiner::from_hex(&keys, threshold).unwrap()
    }

    #[test]
    fn test_keyring_parse() {
        let spec = format!("1:{},2:{}", hex::encode([1u8; 32]), hex::encode([2u8; 32]));
        let ring = Ed25519Keyring::parse(&spec).unwrap();
        assert_eq!(ring.latest_key_version(), 2);
        assert!(ring.has_key_version(1));
        assert!(!ring.has_key_version(3));

        assert!(Ed25519Keyring::parse("").is_err());
        assert!(Ed25519Keyring::parse("1:abcd").is_err());
        assert!(Ed25519Keyring::parse("x:00").is_err());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let ring = &keyrings(1)[0];
        assert_eq!(ring.sign(1, b"msg").unwrap(), ring.sign(1, b"msg").unwrap());
        assert!(matches!(
            ring.sign(9, b"msg"),
            Err(OdisError::InvalidKeyVersion(_))
        ));
    }

    #[test]
    fn test_verify_partial_rejects_wrong_signer() {
        let rings = keyrings(3);
        let combiner = combiner_for(&rings, 2);
        let partial = rings[0].sign(1, b"msg").unwrap();

        assert!(combiner.verify_partial(0, b"msg", &partial).is_ok());
        assert!(combiner.verify_partial(1, b"msg", &partial).is_err());
        assert!(combiner.verify_partial(0, b"other", &partial).is_err());
        assert!(combiner.verify_partial(7, b"msg", &partial).is_err());
    }

    #[test]
    fn test_combine_and_verify_certificate() {
        let rings = keyrings(5);
        let combiner = combiner_for(&rings, 3);
        let partials: Vec<_> = [4, 1, 2]
            .into_iter()
            .map(|i| VerifiedPartial {
                signer_index: i,
                signature: rings[i].sign(1, b"blinded").unwrap(),
            })
            .collect();

        let certificate = combiner.combine(b"blinded", &partials).unwrap();
        assert!(combiner.verify_certificate(b"blinded", &certificate).is_ok());
        assert!(combiner.verify_certificate(b"other", &certificate).is_err());
    }

    #[test]
    fn test_combine_requires_distinct_threshold() {
        let rings = keyrings(5);
        let combiner = combiner_for(&rings, 3);
        let partial = VerifiedPartial {
            signer_index: 0,
            signature: rings[0].sign(1, b"m").unwrap(),
        };
        let partials = vec![partial.clone(), partial.clone(), partial];
        assert!(matches!(
            combiner.combine(b"m", &partials),
            Err(OdisError::AggregationFailed(_))
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let rings = keyrings(2);
        let keys: Vec<String> = rings.iter().map(|r| r.verifying_key_hex(1).unwrap()).collect();
        assert!(Ed25519QuorumCombiner::from_hex(&keys, 3).is_err());
        assert!(Ed25519QuorumCombiner::from_hex(&keys, 0).is_err());
    }
}
