//! Storage layer for the signer service.
//!
//! Each signer owns its quota state: per-domain counters and timers, the
//! append-only request log that makes client retries idempotent, and the
//! per-account query counts of the phone-number API. The signer only talks
//! to [`QuotaStore`], so tests can wrap the ReDB implementation to inject
//! failures.

pub mod redb;

use serde::{Deserialize, Serialize};

use crate::domain::{DomainHash, DomainState};
use crate::error::OdisResult;

pub use self::redb::Storage;

/// Result of a compare-and-swap commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// State and request record were written together.
    Committed,
    /// Stored state no longer matches what the caller evaluated against.
    Conflict,
    /// The request was already recorded; nothing was written.
    Duplicate,
}

/// One physically distinct domain signing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRequestRecord {
    pub domain_hash: DomainHash,
    pub timestamp: u64,
    pub blinded_message: String,
}

impl DomainRequestRecord {
    pub fn new(domain_hash: DomainHash, timestamp: u64, blinded_message: &str) -> Self {
        Self {
            domain_hash,
            timestamp,
            blinded_message: blinded_message.to_string(),
        }
    }
}

/// Durable quota state with per-key optimistic concurrency.
///
/// Commits compare the stored value against the one the caller read, so
/// concurrent requests for the same domain or account cannot lose updates,
/// and requests for different keys never wait on each other's evaluation.
pub trait QuotaStore: Send + Sync {
    /// Current state of a domain; the zero state if never seen.
    fn domain_state(&self, hash: &DomainHash) -> OdisResult<DomainState>;

    /// Set or clear the kill switch. Returns the resulting state.
    fn set_domain_disabled(&self, hash: &DomainHash, disabled: bool) -> OdisResult<DomainState>;

    /// Whether this exact attempt was already recorded.
    fn domain_request_recorded(&self, record: &DomainRequestRecord) -> OdisResult<bool>;

    /// Swap the domain state and record the attempt as one transaction.
    fn commit_domain_request(
        &self,
        record: &DomainRequestRecord,
        expected: &DomainState,
        new_state: &DomainState,
    ) -> OdisResult<CommitOutcome>;

    /// Queries charged to an account so far.
    fn performed_query_count(&self, account: &str) -> OdisResult<u64>;

    /// Whether the account already paid for this blinded message.
    fn account_request_recorded(&self, account: &str, blinded_message: &str) -> OdisResult<bool>;

    /// Increment the account's count from `expected_count` and record the
    /// blinded message as one transaction.
    fn commit_account_request(
        &self,
        account: &str,
        blinded_message: &str,
        expected_count: u64,
    ) -> OdisResult<CommitOutcome>;
}
