//! ReDB storage implementation for the signer service.
//!
//! Provides persistent storage for:
//! - Domain quota state (counter, timer, disabled)
//! - Domain request records (dedup log, append-only)
//! - Account query counts and their request records (phone-number API)
//!
//! ReDB serializes write transactions, so the compare-and-swap in each
//! commit observes no interleaving writer. Readers never block writers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{CommitOutcome, DomainRequestRecord, QuotaStore};
use crate::domain::{DomainHash, DomainState};
use crate::error::{OdisError, OdisResult};

// Table definitions
const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");
const DOMAIN_REQUESTS: TableDefinition<(&str, u64, &str), ()> =
    TableDefinition::new("domain_requests");
const ACCOUNTS: TableDefinition<&str, u64> = TableDefinition::new("accounts");
const ACCOUNT_REQUESTS: TableDefinition<(&str, &str), ()> =
    TableDefinition::new("account_requests");

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> OdisResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| OdisError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        tracing::info!(path = %path.display(), "Opened storage database");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> OdisResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| OdisError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn init_tables(db: &Database) -> OdisResult<()> {
        let write_txn = db.begin_write()?;
        {
            // Just opening the tables creates them if they don't exist
            let _ = write_txn.open_table(DOMAINS)?;
            let _ = write_txn.open_table(DOMAIN_REQUESTS)?;
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(ACCOUNT_REQUESTS)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn read_domain_state(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    hash: &DomainHash,
) -> OdisResult<DomainState> {
    match table.get(hash.as_str())? {
        Some(value) => Ok(serde_json::from_slice(value.value())?),
        None => Ok(DomainState::default()),
    }
}

fn record_key(record: &DomainRequestRecord) -> (&str, u64, &str) {
    (
        record.domain_hash.as_str(),
        record.timestamp,
        record.blinded_message.as_str(),
    )
}

fn finish(txn: redb::WriteTransaction, outcome: CommitOutcome) -> OdisResult<CommitOutcome> {
    if outcome == CommitOutcome::Committed {
        txn.commit()?;
    } else {
        txn.abort()?;
    }
    Ok(outcome)
}

impl QuotaStore for Storage {
    fn domain_state(&self, hash: &DomainHash) -> OdisResult<DomainState> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOMAINS)?;
        read_domain_state(&table, hash)
    }

    fn set_domain_disabled(&self, hash: &DomainHash, disabled: bool) -> OdisResult<DomainState> {
        let write_txn = self.db.begin_write()?;
        let state = {
            let mut domains = write_txn.open_table(DOMAINS)?;
            let mut state = read_domain_state(&domains, hash)?;
            state.disabled = disabled;
            let value = serde_json::to_vec(&state)?;
            domains.insert(hash.as_str(), value.as_slice())?;
            state
        };
        write_txn.commit()?;
        tracing::debug!(domain_hash = %hash, disabled, "Updated domain disabled flag");
        Ok(state)
    }

    fn domain_request_recorded(&self, record: &DomainRequestRecord) -> OdisResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DOMAIN_REQUESTS)?;
        Ok(table.get(record_key(record))?.is_some())
    }

    fn commit_domain_request(
        &self,
        record: &DomainRequestRecord,
        expected: &DomainState,
        new_state: &DomainState,
    ) -> OdisResult<CommitOutcome> {
        let value = serde_json::to_vec(new_state)?;
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut requests = write_txn.open_table(DOMAIN_REQUESTS)?;
            let mut domains = write_txn.open_table(DOMAINS)?;
            if requests.get(record_key(record))?.is_some() {
                CommitOutcome::Duplicate
            } else if read_domain_state(&domains, &record.domain_hash)? != *expected {
                CommitOutcome::Conflict
            } else {
                domains.insert(record.domain_hash.as_str(), value.as_slice())?;
                requests.insert(record_key(record), ())?;
                CommitOutcome::Committed
            }
        };
        let outcome = finish(write_txn, outcome)?;
        tracing::trace!(
            domain_hash = %record.domain_hash,
            ?outcome,
            "Domain request commit finished"
        );
        Ok(outcome)
    }

    fn performed_query_count(&self, account: &str) -> OdisResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        Ok(table.get(account)?.map_or(0, |v| v.value()))
    }

    fn account_request_recorded(&self, account: &str, blinded_message: &str) -> OdisResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNT_REQUESTS)?;
        Ok(table.get((account, blinded_message))?.is_some())
    }

    fn commit_account_request(
        &self,
        account: &str,
        blinded_message: &str,
        expected_count: u64,
    ) -> OdisResult<CommitOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut requests = write_txn.open_table(ACCOUNT_REQUESTS)?;
            let mut accounts = write_txn.open_table(ACCOUNTS)?;
            let current = accounts.get(account)?.map_or(0, |v| v.value());
            if requests.get((account, blinded_message))?.is_some() {
                CommitOutcome::Duplicate
            } else if current != expected_count {
                CommitOutcome::Conflict
            } else {
                accounts.insert(account, current + 1)?;
                requests.insert((account, blinded_message), ())?;
                CommitOutcome::Committed
            }
        };
        finish(write_txn, outcome)
    }
}
