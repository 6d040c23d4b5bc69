//! Signer request lifecycle.
//!
//! Every signing request walks the same path: validate, check the kill
//! switch, short-circuit retries already on record, evaluate the quota,
//! sign, and commit state plus request record in one transaction. A
//! signature is only returned after its quota charge is durable. If the
//! commit fails the signature is dropped and the caller sees a retryable
//! error.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use super::crypto::PartialSigner;
use super::types::{
    DisableDomainRequest, DisableDomainResponse, DomainQuotaStatusRequest,
    DomainQuotaStatusResponse, DomainSignRequest, DomainSignResponse, KeyVersion,
    SignMessageRequest, SignMessageResponse, service_version,
};
use crate::clock::Clock;
use crate::config::Settings;
use crate::domain::{self, DomainState};
use crate::error::{OdisError, OdisResult};
use crate::storage::{CommitOutcome, DomainRequestRecord, QuotaStore};

const MAX_ACCOUNT_LEN: usize = 128;

/// Per-signer request policy.
#[derive(Debug, Clone)]
pub struct SignerPolicy {
    pub domains_api_enabled: bool,
    pub pnp_api_enabled: bool,
    /// Queries each account may make on the phone-number API.
    pub pnp_quota: u64,
    pub max_timestamp_age_secs: u64,
    pub max_timestamp_skew_secs: u64,
    /// Extra attempts after a concurrent state change.
    pub commit_retries: u32,
}

impl Default for SignerPolicy {
    fn default() -> Self {
        Self {
            domains_api_enabled: true,
            pnp_api_enabled: true,
            pnp_quota: 10,
            max_timestamp_age_secs: 300,
            max_timestamp_skew_secs: 10,
            commit_retries: 3,
        }
    }
}

impl SignerPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            domains_api_enabled: settings.domains_api_enabled(),
            pnp_api_enabled: settings.pnp_api_enabled(),
            pnp_quota: settings.pnp_quota(),
            max_timestamp_age_secs: settings.max_timestamp_age_secs(),
            max_timestamp_skew_secs: settings.max_timestamp_skew_secs(),
            commit_retries: settings.commit_retries(),
        }
    }
}

/// A signing response and the key version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signed<T> {
    pub response: T,
    pub key_version: KeyVersion,
}

/// Signer service: one replica of the quota state plus one key share.
pub struct SignerService {
    signer_id: String,
    store: Arc<dyn QuotaStore>,
    signer: Arc<dyn PartialSigner>,
    clock: Arc<dyn Clock>,
    policy: SignerPolicy,
}

impl SignerService {
    /// Create a new signer service.
    pub fn new(
        signer_id: String,
        store: Arc<dyn QuotaStore>,
        signer: Arc<dyn PartialSigner>,
        clock: Arc<dyn Clock>,
        policy: SignerPolicy,
    ) -> Self {
        Self {
            signer_id,
            store,
            signer,
            clock,
            policy,
        }
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    pub fn policy(&self) -> &SignerPolicy {
        &self.policy
    }

    /// Resolve the requested key version, defaulting to the latest.
    pub fn resolve_key_version(&self, requested: Option<KeyVersion>) -> OdisResult<KeyVersion> {
        match requested {
            None => Ok(self.signer.latest_key_version()),
            Some(version) if self.signer.has_key_version(version) => Ok(version),
            Some(version) => Err(OdisError::InvalidKeyVersion(format!(
                "key version {version} is not available on this signer"
            ))),
        }
    }

    // =========================================================================
    // Domain API
    // =========================================================================

    /// Sign a blinded message under a domain's sequential-delay quota.
    pub fn domain_sign(
        &self,
        request: &DomainSignRequest,
        key_version: Option<KeyVersion>,
    ) -> OdisResult<Signed<DomainSignResponse>> {
        self.ensure_domains_enabled()?;
        request.domain.validate()?;
        let blinded = decode_blinded(&request.blinded_message)?;
        self.check_timestamp(request.timestamp)?;
        let key_version = self.resolve_key_version(key_version)?;

        let record = DomainRequestRecord::new(
            request.domain.hash(),
            request.timestamp,
            &request.blinded_message,
        );

        for attempt in 0..=self.policy.commit_retries {
            let state = self.store.domain_state(&record.domain_hash)?;

            if state.disabled {
                tracing::info!(
                    signer_id = %self.signer_id,
                    domain_hash = %record.domain_hash,
                    "Rejected request for disabled domain"
                );
                return Err(OdisError::DomainDisabled {
                    status: Some(state),
                });
            }

            if self.store.domain_request_recorded(&record)? {
                tracing::debug!(
                    signer_id = %self.signer_id,
                    domain_hash = %record.domain_hash,
                    timestamp = record.timestamp,
                    "Repeated request, re-issuing signature without charging quota"
                );
                return self.domain_signed(key_version, &blinded, state);
            }

            let result = domain::evaluate(&request.domain, request.timestamp, Some(&state));
            if !result.accepted {
                tracing::info!(
                    signer_id = %self.signer_id,
                    domain_hash = %record.domain_hash,
                    counter = state.counter,
                    not_before = ?result.not_before,
                    "Rate limited domain request"
                );
                return Err(OdisError::RateLimited {
                    not_before: result.not_before,
                    status: Some(state),
                });
            }

            let signature = self.sign(key_version, &blinded)?;

            match self
                .store
                .commit_domain_request(&record, &state, &result.state)
            {
                Ok(CommitOutcome::Committed) => {
                    tracing::info!(
                        signer_id = %self.signer_id,
                        domain_hash = %record.domain_hash,
                        counter = result.state.counter,
                        key_version,
                        "Domain request signed"
                    );
                    return Ok(self.domain_response(key_version, signature, result.state));
                }
                Ok(CommitOutcome::Duplicate) => {
                    // A concurrent copy of this request committed first.
                    let current = self.store.domain_state(&record.domain_hash)?;
                    return Ok(self.domain_response(key_version, signature, current));
                }
                Ok(CommitOutcome::Conflict) => {
                    tracing::debug!(
                        signer_id = %self.signer_id,
                        domain_hash = %record.domain_hash,
                        attempt,
                        "Domain state changed concurrently, re-evaluating"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        signer_id = %self.signer_id,
                        domain_hash = %record.domain_hash,
                        error = %e,
                        "Failed to commit domain state, discarding signature"
                    );
                    return Err(e);
                }
            }
        }

        tracing::warn!(
            signer_id = %self.signer_id,
            domain_hash = %record.domain_hash,
            "Gave up after repeated concurrent state changes"
        );
        Err(OdisError::CommitConflict {
            attempts: self.policy.commit_retries + 1,
        })
    }

    /// Current quota state of a domain.
    pub fn domain_quota_status(
        &self,
        request: &DomainQuotaStatusRequest,
    ) -> OdisResult<DomainQuotaStatusResponse> {
        self.ensure_domains_enabled()?;
        request.domain.validate()?;
        let status = self.store.domain_state(&request.domain.hash())?;
        Ok(DomainQuotaStatusResponse {
            success: true,
            version: service_version(),
            status,
        })
    }

    /// Disable a domain permanently. Idempotent.
    pub fn disable_domain(&self, request: &DisableDomainRequest) -> OdisResult<DisableDomainResponse> {
        self.ensure_domains_enabled()?;
        request.domain.validate()?;
        let hash = request.domain.hash();
        let status = self.store.set_domain_disabled(&hash, true)?;
        tracing::info!(
            signer_id = %self.signer_id,
            domain_hash = %hash,
            counter = status.counter,
            "Domain disabled"
        );
        Ok(DisableDomainResponse {
            success: true,
            version: service_version(),
            status,
        })
    }

    // =========================================================================
    // Phone-number API
    // =========================================================================

    /// Sign a blinded phone number, charging the account's query quota.
    pub fn partial_sign_message(
        &self,
        request: &SignMessageRequest,
        key_version: Option<KeyVersion>,
    ) -> OdisResult<Signed<SignMessageResponse>> {
        if !self.policy.pnp_api_enabled {
            return Err(OdisError::ApiUnavailable(
                "phone number API is disabled on this signer".to_string(),
            ));
        }
        let account = request.account.trim();
        if account.is_empty() || account.len() > MAX_ACCOUNT_LEN {
            return Err(OdisError::InvalidInput(format!(
                "account must be 1-{MAX_ACCOUNT_LEN} characters"
            )));
        }
        let blinded = decode_blinded(&request.blinded_query_phone_number)?;
        let key_version = self.resolve_key_version(key_version)?;
        let message = request.blinded_query_phone_number.as_str();

        for attempt in 0..=self.policy.commit_retries {
            let count = self.store.performed_query_count(account)?;

            if self.store.account_request_recorded(account, message)? {
                tracing::debug!(signer_id = %self.signer_id, "Repeated phone number query");
                return self.message_signed(key_version, &blinded, count);
            }

            if count >= self.policy.pnp_quota {
                tracing::info!(
                    signer_id = %self.signer_id,
                    performed_query_count = count,
                    total_quota = self.policy.pnp_quota,
                    "Account out of quota"
                );
                return Err(OdisError::RateLimited {
                    not_before: None,
                    status: None,
                });
            }

            let signature = self.sign(key_version, &blinded)?;

            match self.store.commit_account_request(account, message, count) {
                Ok(CommitOutcome::Committed) => {
                    return Ok(self.message_response(key_version, signature, count + 1));
                }
                Ok(CommitOutcome::Duplicate) => {
                    let current = self.store.performed_query_count(account)?;
                    return Ok(self.message_response(key_version, signature, current));
                }
                Ok(CommitOutcome::Conflict) => {
                    tracing::debug!(signer_id = %self.signer_id, attempt, "Account count changed, retrying");
                }
                Err(e) => {
                    tracing::error!(
                        signer_id = %self.signer_id,
                        error = %e,
                        "Failed to commit account quota, discarding signature"
                    );
                    return Err(e);
                }
            }
        }

        Err(OdisError::CommitConflict {
            attempts: self.policy.commit_retries + 1,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_domains_enabled(&self) -> OdisResult<()> {
        if self.policy.domains_api_enabled {
            Ok(())
        } else {
            Err(OdisError::ApiUnavailable(
                "domains API is disabled on this signer".to_string(),
            ))
        }
    }

    /// Reject attempt times outside `[now - max_age, now + max_skew]`.
    fn check_timestamp(&self, timestamp: u64) -> OdisResult<()> {
        let now = self.clock.now_secs();
        if timestamp.saturating_add(self.policy.max_timestamp_age_secs) < now {
            return Err(OdisError::InvalidInput(format!(
                "timestamp {timestamp} is older than {} seconds",
                self.policy.max_timestamp_age_secs
            )));
        }
        if timestamp > now.saturating_add(self.policy.max_timestamp_skew_secs) {
            return Err(OdisError::InvalidInput(format!(
                "timestamp {timestamp} is in the future"
            )));
        }
        Ok(())
    }

    fn sign(&self, key_version: KeyVersion, blinded: &[u8]) -> OdisResult<String> {
        let signature = self.signer.sign(key_version, blinded).map_err(|e| {
            tracing::error!(signer_id = %self.signer_id, error = %e, "Signing failed");
            match e {
                OdisError::InvalidKeyVersion(_) => e,
                other => OdisError::SigningFailed(other.to_string()),
            }
        })?;
        Ok(BASE64.encode(signature))
    }

    fn domain_signed(
        &self,
        key_version: KeyVersion,
        blinded: &[u8],
        state: DomainState,
    ) -> OdisResult<Signed<DomainSignResponse>> {
        let signature = self.sign(key_version, blinded)?;
        Ok(self.domain_response(key_version, signature, state))
    }

    fn domain_response(
        &self,
        key_version: KeyVersion,
        signature: String,
        status: DomainState,
    ) -> Signed<DomainSignResponse> {
        Signed {
            response: DomainSignResponse {
                success: true,
                version: service_version(),
                signature,
                status,
            },
            key_version,
        }
    }

    fn message_signed(
        &self,
        key_version: KeyVersion,
        blinded: &[u8],
        count: u64,
    ) -> OdisResult<Signed<SignMessageResponse>> {
        let signature = self.sign(key_version, blinded)?;
        Ok(self.message_response(key_version, signature, count))
    }

    fn message_response(
        &self,
        key_version: KeyVersion,
        signature: String,
        performed_query_count: u64,
    ) -> Signed<SignMessageResponse> {
        Signed {
            response: SignMessageResponse {
                success: true,
                version: service_version(),
                signature,
                performed_query_count,
                total_quota: self.policy.pnp_quota,
            },
            key_version,
        }
    }
}

/// Decode a base64 blinded message, rejecting empty payloads.
pub fn decode_blinded(encoded: &str) -> OdisResult<Vec<u8>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| OdisError::InvalidInput(format!("blinded message is not base64: {e}")))?;
    if bytes.is_empty() {
        return Err(OdisError::InvalidInput("blinded message is empty".to_string()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::clock::MockClock;
    use crate::domain::{DomainHash, SequentialDelayDomain, SequentialDelayStage};
    use crate::odis::crypto::Ed25519Keyring;
    use crate::storage::Storage;

    const NOW: u64 = 1_700_000_000;

    /// Store wrapper that can fail commits or inject a concurrent writer.
    struct FlakyStore {
        inner: Storage,
        fail_commits: AtomicBool,
        conflicts_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: Storage) -> Self {
            Self {
                inner,
                fail_commits: AtomicBool::new(false),
                conflicts_left: AtomicUsize::new(0),
            }
        }
    }

    impl QuotaStore for FlakyStore {
        fn domain_state(&self, hash: &DomainHash) -> OdisResult<DomainState> {
            self.inner.domain_state(hash)
        }

        fn set_domain_disabled(&self, hash: &DomainHash, disabled: bool) -> OdisResult<DomainState> {
            self.inner.set_domain_disabled(hash, disabled)
        }

        fn domain_request_recorded(&self, record: &DomainRequestRecord) -> OdisResult<bool> {
            self.inner.domain_request_recorded(record)
        }

        fn commit_domain_request(
            &self,
            record: &DomainRequestRecord,
            expected: &DomainState,
            new_state: &DomainState,
        ) -> OdisResult<CommitOutcome> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(OdisError::Storage("disk unavailable".to_string()));
            }
            if self
                .conflicts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                // Another replica process wins the race with a different request
                let bumped = DomainState {
                    counter: expected.counter + 1,
                    timer: expected.timer,
                    disabled: false,
                };
                let rival =
                    DomainRequestRecord::new(record.domain_hash.clone(), record.timestamp, "rival");
                self.inner.commit_domain_request(&rival, expected, &bumped)?;
            }
            self.inner.commit_domain_request(record, expected, new_state)
        }

        fn performed_query_count(&self, account: &str) -> OdisResult<u64> {
            self.inner.performed_query_count(account)
        }

        fn account_request_recorded(&self, account: &str, blinded_message: &str) -> OdisResult<bool> {
            self.inner.account_request_recorded(account, blinded_message)
        }

        fn commit_account_request(
            &self,
            account: &str,
            blinded_message: &str,
            expected_count: u64,
        ) -> OdisResult<CommitOutcome> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(OdisError::Storage("disk unavailable".to_string()));
            }
            self.inner
                .commit_account_request(account, blinded_message, expected_count)
        }
    }

    fn service_with(store: Arc<dyn QuotaStore>, clock: MockClock, policy: SignerPolicy) -> SignerService {
        let keyring = Ed25519Keyring::from_seeds([(1, [1u8; 32]), (2, [2u8; 32])]).unwrap();
        SignerService::new(
            "signer-test".to_string(),
            store,
            Arc::new(keyring),
            Arc::new(clock),
            policy,
        )
    }

    fn service() -> (SignerService, MockClock) {
        let clock = MockClock::new(NOW);
        let store = Arc::new(Storage::open_memory().unwrap());
        (
            service_with(store, clock.clone(), SignerPolicy::default()),
            clock,
        )
    }

    fn burst_then_minute() -> SequentialDelayDomain {
        SequentialDelayDomain::new(vec![
            SequentialDelayStage::new(0).with_batch_size(2),
            SequentialDelayStage::new(60).with_repetitions(10),
        ])
    }

    fn sign_request(timestamp: u64, message: &[u8]) -> DomainSignRequest {
        DomainSignRequest {
            domain: burst_then_minute(),
            blinded_message: BASE64.encode(message),
            timestamp,
            session_id: None,
        }
    }

    #[test]
    fn test_domain_sign_accepts_then_rate_limits() {
        let (service, _) = service();

        let first = service.domain_sign(&sign_request(NOW, b"a"), None).unwrap();
        assert_eq!(first.key_version, 2);
        assert_eq!(first.response.status.counter, 1);

        let second = service.domain_sign(&sign_request(NOW, b"b"), None).unwrap();
        assert_eq!(second.response.status.counter, 2);

        let err = service.domain_sign(&sign_request(NOW, b"c"), None).unwrap_err();
        match err {
            OdisError::RateLimited { not_before, status } => {
                assert_eq!(not_before, Some(NOW + 60));
                assert_eq!(status.unwrap().counter, 2);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_retry_charges_once() {
        let (service, _) = service();
        let request = sign_request(NOW, b"same");

        let first = service.domain_sign(&request, Some(1)).unwrap();
        let retry = service.domain_sign(&request, Some(1)).unwrap();

        assert_eq!(first.response.signature, retry.response.signature);
        assert_eq!(retry.response.status.counter, 1);

        let status = service
            .domain_quota_status(&DomainQuotaStatusRequest {
                domain: request.domain.clone(),
                session_id: None,
            })
            .unwrap();
        assert_eq!(status.status.counter, 1);
    }

    #[test]
    fn test_retry_after_quota_exhausted_still_succeeds() {
        let (service, _) = service();
        let first = sign_request(NOW, b"one");
        service.domain_sign(&first, None).unwrap();
        service.domain_sign(&sign_request(NOW, b"two"), None).unwrap();

        // Quota is now rate limited, but the recorded attempt is re-issued
        let retry = service.domain_sign(&first, None).unwrap();
        assert_eq!(retry.response.status.counter, 2);
    }

    #[test]
    fn test_commit_failure_fails_closed() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(FlakyStore::new(Storage::open_memory().unwrap()));
        let service = service_with(store.clone(), clock, SignerPolicy::default());
        let request = sign_request(NOW, b"msg");

        store.fail_commits.store(true, Ordering::SeqCst);
        let err = service.domain_sign(&request, None).unwrap_err();
        assert!(matches!(err, OdisError::Storage(_)));
        assert!(err.is_retryable());

        let hash = request.domain.hash();
        assert_eq!(store.domain_state(&hash).unwrap(), DomainState::default());

        // Retrying after recovery sees no phantom increment
        store.fail_commits.store(false, Ordering::SeqCst);
        let ok = service.domain_sign(&request, None).unwrap();
        assert_eq!(ok.response.status.counter, 1);
    }

    #[test]
    fn test_conflict_is_retried_against_fresh_state() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(FlakyStore::new(Storage::open_memory().unwrap()));
        store.conflicts_left.store(1, Ordering::SeqCst);
        let service = service_with(store.clone(), clock, SignerPolicy::default());

        let signed = service.domain_sign(&sign_request(NOW, b"x"), None).unwrap();
        // The concurrent writer took index 0, this request took index 1
        assert_eq!(signed.response.status.counter, 2);
    }

    #[test]
    fn test_conflicts_exhaust_retry_budget() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(FlakyStore::new(Storage::open_memory().unwrap()));
        store.conflicts_left.store(usize::MAX, Ordering::SeqCst);
        let policy = SignerPolicy {
            commit_retries: 1,
            ..SignerPolicy::default()
        };
        let domain = SequentialDelayDomain::new(vec![
            SequentialDelayStage::new(0).with_batch_size(100),
        ]);
        let service = service_with(store, clock, policy);
        let request = DomainSignRequest {
            domain,
            ..sign_request(NOW, b"x")
        };

        let err = service.domain_sign(&request, None).unwrap_err();
        assert!(matches!(err, OdisError::CommitConflict { attempts: 2 }));
    }

    #[test]
    fn test_disabled_domain_rejects_before_dedup() {
        let (service, _) = service();
        let request = sign_request(NOW, b"m");
        service.domain_sign(&request, None).unwrap();

        let disabled = service
            .disable_domain(&DisableDomainRequest {
                domain: request.domain.clone(),
                session_id: None,
            })
            .unwrap();
        assert!(disabled.status.disabled);
        assert_eq!(disabled.status.counter, 1);

        let err = service.domain_sign(&request, None).unwrap_err();
        assert!(matches!(err, OdisError::DomainDisabled { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timestamp_window() {
        let (service, clock) = service();
        clock.set(NOW + 1_000);

        let stale = service.domain_sign(&sign_request(NOW, b"m"), None);
        assert!(matches!(stale, Err(OdisError::InvalidInput(_))));

        let future = service.domain_sign(&sign_request(NOW + 1_011, b"m"), None);
        assert!(matches!(future, Err(OdisError::InvalidInput(_))));

        assert!(service.domain_sign(&sign_request(NOW + 1_010, b"m"), None).is_ok());
    }

    #[test]
    fn test_malformed_requests_touch_no_state() {
        let (service, _) = service();
        let mut request = sign_request(NOW, b"m");
        request.blinded_message = "%%%".to_string();
        assert!(matches!(
            service.domain_sign(&request, None),
            Err(OdisError::InvalidInput(_))
        ));

        let mut request = sign_request(NOW, b"m");
        request.domain.stages[0].batch_size = Some(0);
        assert!(matches!(
            service.domain_sign(&request, None),
            Err(OdisError::InvalidDomain(_))
        ));

        let request = sign_request(NOW, b"m");
        assert!(matches!(
            service.domain_sign(&request, Some(7)),
            Err(OdisError::InvalidKeyVersion(_))
        ));

        let status = service
            .domain_quota_status(&DomainQuotaStatusRequest {
                domain: request.domain,
                session_id: None,
            })
            .unwrap();
        assert_eq!(status.status, DomainState::default());
    }

    #[test]
    fn test_disabled_api_is_unavailable() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(Storage::open_memory().unwrap());
        let policy = SignerPolicy {
            domains_api_enabled: false,
            pnp_api_enabled: false,
            ..SignerPolicy::default()
        };
        let service = service_with(store, clock, policy);

        assert!(matches!(
            service.domain_sign(&sign_request(NOW, b"m"), None),
            Err(OdisError::ApiUnavailable(_))
        ));
        let pnp = SignMessageRequest {
            account: "acct".to_string(),
            blinded_query_phone_number: BASE64.encode(b"phone"),
            session_id: None,
        };
        assert!(matches!(
            service.partial_sign_message(&pnp, None),
            Err(OdisError::ApiUnavailable(_))
        ));
    }

    #[test]
    fn test_phone_number_quota() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(Storage::open_memory().unwrap());
        let policy = SignerPolicy {
            pnp_quota: 2,
            ..SignerPolicy::default()
        };
        let service = service_with(store, clock, policy);
        let request = |msg: &[u8]| SignMessageRequest {
            account: "0xabc".to_string(),
            blinded_query_phone_number: BASE64.encode(msg),
            session_id: None,
        };

        let first = service.partial_sign_message(&request(b"p1"), None).unwrap();
        assert_eq!(first.response.performed_query_count, 1);
        assert_eq!(first.response.total_quota, 2);

        // Repeat of the same query is free
        let repeat = service.partial_sign_message(&request(b"p1"), None).unwrap();
        assert_eq!(repeat.response.performed_query_count, 1);
        assert_eq!(repeat.response.signature, first.response.signature);

        service.partial_sign_message(&request(b"p2"), None).unwrap();
        let err = service.partial_sign_message(&request(b"p3"), None).unwrap_err();
        assert!(matches!(
            err,
            OdisError::RateLimited {
                not_before: None,
                ..
            }
        ));
    }

    #[test]
    fn test_phone_number_commit_failure_fails_closed() {
        let clock = MockClock::new(NOW);
        let store = Arc::new(FlakyStore::new(Storage::open_memory().unwrap()));
        let service = service_with(store.clone(), clock, SignerPolicy::default());
        let request = SignMessageRequest {
            account: "acct".to_string(),
            blinded_query_phone_number: BASE64.encode(b"phone"),
            session_id: None,
        };

        store.fail_commits.store(true, Ordering::SeqCst);
        assert!(service.partial_sign_message(&request, None).is_err());
        assert_eq!(store.performed_query_count("acct").unwrap(), 0);
    }
}
