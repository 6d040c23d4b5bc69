//! Rate-limiting domains.
//!
//! A domain is a policy descriptor that clients submit with every request.
//! Its identity is the hash of its canonical encoding, so two clients naming
//! the same stages, address and salt share one quota bucket, and changing
//! any field yields a fresh bucket.

pub mod sequential_delay;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OdisError, OdisResult};

pub use sequential_delay::{SequentialDelayResult, evaluate};

/// Name every sequential-delay domain must carry.
pub const SEQUENTIAL_DELAY_DOMAIN_NAME: &str = "ODIS Sequential Delay Domain";
/// Only supported descriptor version.
pub const SEQUENTIAL_DELAY_DOMAIN_VERSION: &str = "1";

const DOMAIN_HASH_TAG: &[u8] = b"odis-domain-hash-v1";

/// One stage of a sequential-delay policy. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SequentialDelayStage {
    pub delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u64>,
}

impl SequentialDelayStage {
    pub fn new(delay: u64) -> Self {
        Self {
            delay,
            reset_timer: None,
            batch_size: None,
            repetitions: None,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn with_repetitions(mut self, repetitions: u64) -> Self {
        self.repetitions = Some(repetitions);
        self
    }

    #[must_use]
    pub fn with_reset_timer(mut self, reset_timer: bool) -> Self {
        self.reset_timer = Some(reset_timer);
        self
    }

    /// Whether an accepted attempt resets the timer to the attempt time. Defaults to true.
    pub fn resets_timer(&self) -> bool {
        self.reset_timer.unwrap_or(true)
    }

    /// Attempts per batch. Defaults to 1.
    pub fn batch_len(&self) -> u64 {
        self.batch_size.unwrap_or(1)
    }

    /// Number of times the stage repeats. Defaults to 1.
    pub fn repetition_count(&self) -> u64 {
        self.repetitions.unwrap_or(1)
    }

    /// Request indices governed by this stage, `None` on overflow.
    pub fn attempts(&self) -> Option<u64> {
        self.batch_len().checked_mul(self.repetition_count())
    }
}

/// Sequential-delay domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SequentialDelayDomain {
    pub name: String,
    pub version: String,
    pub stages: Vec<SequentialDelayStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl SequentialDelayDomain {
    pub fn new(stages: Vec<SequentialDelayStage>) -> Self {
        Self {
            name: SEQUENTIAL_DELAY_DOMAIN_NAME.to_string(),
            version: SEQUENTIAL_DELAY_DOMAIN_VERSION.to_string(),
            stages,
            address: None,
            salt: None,
        }
    }

    #[must_use]
    pub fn with_salt(mut self, salt: &str) -> Self {
        self.salt = Some(salt.to_string());
        self
    }

    /// Reject descriptors that cannot be evaluated.
    ///
    /// Zero batch sizes or repetitions, and stage lists whose total attempt
    /// count overflows, are configuration errors rather than evaluation-time
    /// rejections.
    pub fn validate(&self) -> OdisResult<()> {
        if self.name != SEQUENTIAL_DELAY_DOMAIN_NAME {
            return Err(OdisError::InvalidDomain(format!(
                "unsupported domain name '{}'",
                self.name
            )));
        }
        if self.version != SEQUENTIAL_DELAY_DOMAIN_VERSION {
            return Err(OdisError::InvalidDomain(format!(
                "unsupported domain version '{}'",
                self.version
            )));
        }

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.batch_len() == 0 {
                return Err(OdisError::InvalidDomain(format!(
                    "stage {index}: batchSize must be at least 1"
                )));
            }
            if stage.repetition_count() == 0 {
                return Err(OdisError::InvalidDomain(format!(
                    "stage {index}: repetitions must be at least 1"
                )));
            }
        }

        if self.total_attempts().is_none() {
            return Err(OdisError::InvalidDomain(
                "total stage attempts overflow".to_string(),
            ));
        }

        Ok(())
    }

    /// Total number of attempts the policy ever grants, `None` on overflow.
    pub fn total_attempts(&self) -> Option<u64> {
        self.stages
            .iter()
            .try_fold(0u64, |total, stage| total.checked_add(stage.attempts()?))
    }

    /// Content hash identifying this domain's quota bucket.
    ///
    /// Fields are length-prefixed so distinct descriptors never share an
    /// encoding. An absent optional differs from any present value,
    /// including the value it defaults to.
    pub fn hash(&self) -> DomainHash {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_HASH_TAG);
        update_str(&mut hasher, &self.name);
        update_str(&mut hasher, &self.version);
        hasher.update((self.stages.len() as u64).to_be_bytes());
        for stage in &self.stages {
            hasher.update(stage.delay.to_be_bytes());
            update_opt(&mut hasher, stage.reset_timer.map(|b| [u8::from(b)]));
            update_opt(&mut hasher, stage.batch_size.map(u64::to_be_bytes));
            update_opt(&mut hasher, stage.repetitions.map(u64::to_be_bytes));
        }
        update_opt(&mut hasher, self.address.as_deref().map(str::as_bytes));
        update_opt(&mut hasher, self.salt.as_deref().map(str::as_bytes));
        DomainHash(hex::encode(hasher.finalize()))
    }
}

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn update_opt(hasher: &mut Sha256, value: Option<impl AsRef<[u8]>>) {
    match value {
        None => hasher.update([0u8]),
        Some(bytes) => {
            let bytes = bytes.as_ref();
            hasher.update([1u8]);
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
    }
}

/// Hex-encoded SHA-256 of a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainHash(String);

impl DomainHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DomainHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted quota state of one domain.
///
/// Absent state is the zero value. `counter` only grows, `timer` only moves
/// forward, and `disabled` is sticky.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainState {
    pub counter: u64,
    pub timer: u64,
    pub disabled: bool,
}
