//! Combiner: public entry point in front of the signer set.
//!
//! Each request is translated to its signer endpoint, sent to every signer
//! concurrently, and aggregated once the threshold policy reaches a
//! verdict. Outstanding signer requests are dropped as soon as the verdict
//! is certain, and every signer call is bounded by a hard timeout.
//!
//! Partials are verified before they count towards the quorum. Responses
//! that fail verification, use an unexpected key version, or cannot be
//! parsed are excluded and logged, never aggregated.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::time::error::Elapsed;
use tracing::Instrument;
use uuid::Uuid;

use super::crypto::{Ed25519QuorumCombiner, SignatureCombiner, VerifiedPartial};
use super::endpoints::{CombinerEndpoint, SignerEndpoint};
use super::quorum::{QuorumDecision, SignerOutcome, ThresholdPolicy, threshold_domain_state};
use super::signer_logic::decode_blinded;
use super::transport::{HttpSignerTransport, SignerReply, SignerTransport};
use super::types::{
    DisableDomainRequest, DisableDomainResponse, DomainQuotaStatusRequest,
    DomainQuotaStatusResponse, DomainSignRequest, DomainSignResponse, KeyVersion,
    SignMessageRequest, SignMessageResponse, service_version,
};
use crate::config::Settings;
use crate::domain::DomainState;
use crate::error::{OdisError, OdisResult};

/// How long a fan-out keeps collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOut {
    /// Stop as soon as the quorum verdict is certain.
    UntilDecided,
    /// Wait for every signer (or its timeout).
    AllSigners,
}

/// Combiner service aggregating signer responses.
pub struct Combiner {
    transport: Arc<dyn SignerTransport>,
    crypto: Arc<dyn SignatureCombiner>,
    policy: ThresholdPolicy,
    key_version: KeyVersion,
    signer_timeout: Duration,
}

impl Combiner {
    /// Create a combiner over `transport.signer_count()` signers.
    pub fn new(
        transport: Arc<dyn SignerTransport>,
        crypto: Arc<dyn SignatureCombiner>,
        threshold: usize,
        key_version: KeyVersion,
        signer_timeout: Duration,
    ) -> OdisResult<Self> {
        let policy = ThresholdPolicy::new(threshold, transport.signer_count())?;
        Ok(Self {
            transport,
            crypto,
            policy,
            key_version,
            signer_timeout,
        })
    }

    /// Build the HTTP combiner described by settings.
    pub fn from_settings(settings: &Settings) -> OdisResult<Self> {
        let transport = HttpSignerTransport::from_settings(settings)?;
        let crypto = Ed25519QuorumCombiner::from_hex(settings.signer_pubkeys(), settings.threshold())?;

        tracing::info!(
            signers = settings.signer_endpoints().len(),
            threshold = settings.threshold(),
            key_version = settings.key_version(),
            timeout = ?settings.signer_timeout(),
            "Combiner configured"
        );

        Self::new(
            Arc::new(transport),
            Arc::new(crypto),
            settings.threshold(),
            settings.key_version(),
            settings.signer_timeout(),
        )
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    /// Key version requested from signers on signing endpoints.
    pub fn key_version(&self) -> KeyVersion {
        self.key_version
    }

    /// Serve a public endpoint with a JSON body.
    pub async fn handle(&self, endpoint: CombinerEndpoint, body: Value) -> OdisResult<Value> {
        match endpoint {
            CombinerEndpoint::SignMessage => {
                let response = self.sign_message(serde_json::from_value(body)?).await?;
                Ok(serde_json::to_value(response)?)
            }
            CombinerEndpoint::DomainSign => {
                let response = self.domain_sign(serde_json::from_value(body)?).await?;
                Ok(serde_json::to_value(response)?)
            }
            CombinerEndpoint::DomainQuotaStatus => {
                let response = self.domain_quota_status(serde_json::from_value(body)?).await?;
                Ok(serde_json::to_value(response)?)
            }
            CombinerEndpoint::DisableDomain => {
                let response = self.disable_domain(serde_json::from_value(body)?).await?;
                Ok(serde_json::to_value(response)?)
            }
            CombinerEndpoint::Matchmaking => {
                let err = OdisError::UnmappedEndpoint(endpoint.to_string());
                tracing::error!(error = %err, "Endpoint has no signer mapping");
                Err(err)
            }
        }
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Aggregate a domain-scoped signature.
    pub async fn domain_sign(&self, mut request: DomainSignRequest) -> OdisResult<DomainSignResponse> {
        let endpoint = CombinerEndpoint::DomainSign.signer_endpoint()?;
        request.domain.validate()?;
        let blinded = decode_blinded(&request.blinded_message)?;
        let session_id = ensure_session_id(&mut request.session_id);
        let body = serde_json::to_value(&request)?;

        let outcomes = self
            .fan_out(endpoint, &body, FanOut::UntilDecided, |signer, body| {
                let response: DomainSignResponse = serde_json::from_value(body)?;
                let partial = self.verified_partial(signer, &blinded, &response.signature)?;
                Ok((partial, response.status))
            })
            .instrument(tracing::info_span!("domain_sign", %session_id))
            .await;

        self.ensure_reached(endpoint, &outcomes)?;
        let (partials, states): (Vec<_>, Vec<_>) = successes(outcomes).unzip();
        log_state_discrepancies(&session_id, &states);

        let signature = self.crypto.combine(&blinded, &partials)?;
        let status = threshold_domain_state(&states, self.policy.threshold(), self.policy.total())?;

        tracing::info!(%session_id, counter = status.counter, "Combined domain signature");
        Ok(DomainSignResponse {
            success: true,
            version: service_version(),
            signature: BASE64.encode(signature),
            status,
        })
    }

    /// Threshold view of a domain's quota state.
    ///
    /// Waits for every signer: a signer that reports the domain disabled
    /// still answers successfully, so the first `t` replies are not enough
    /// to know whether `t` enabled states exist.
    pub async fn domain_quota_status(
        &self,
        mut request: DomainQuotaStatusRequest,
    ) -> OdisResult<DomainQuotaStatusResponse> {
        let endpoint = CombinerEndpoint::DomainQuotaStatus.signer_endpoint()?;
        request.domain.validate()?;
        let session_id = ensure_session_id(&mut request.session_id);
        let body = serde_json::to_value(&request)?;

        let outcomes = self
            .fan_out(endpoint, &body, FanOut::AllSigners, |_, body| {
                let response: DomainQuotaStatusResponse = serde_json::from_value(body)?;
                Ok(response.status)
            })
            .instrument(tracing::info_span!("domain_quota_status", %session_id))
            .await;

        self.ensure_reached(endpoint, &outcomes)?;
        let states: Vec<DomainState> = successes(outcomes).collect();
        log_state_discrepancies(&session_id, &states);

        Ok(DomainQuotaStatusResponse {
            success: true,
            version: service_version(),
            status: threshold_domain_state(&states, self.policy.threshold(), self.policy.total())?,
        })
    }

    /// Disable a domain on every reachable signer.
    ///
    /// Succeeds once a threshold of signers confirmed, since that is enough
    /// to block every future signature for the domain.
    pub async fn disable_domain(
        &self,
        mut request: DisableDomainRequest,
    ) -> OdisResult<DisableDomainResponse> {
        let endpoint = CombinerEndpoint::DisableDomain.signer_endpoint()?;
        request.domain.validate()?;
        let session_id = ensure_session_id(&mut request.session_id);
        let body = serde_json::to_value(&request)?;

        let outcomes = self
            .fan_out(endpoint, &body, FanOut::AllSigners, |_, body| {
                let response: DisableDomainResponse = serde_json::from_value(body)?;
                if !response.status.disabled {
                    return Err(OdisError::InvalidSignerResponse(
                        "signer did not report the domain as disabled".to_string(),
                    ));
                }
                Ok(DomainState {
                    disabled: false,
                    ..response.status
                })
            })
            .instrument(tracing::info_span!("disable_domain", %session_id))
            .await;

        self.ensure_reached(endpoint, &outcomes)?;
        let confirmed = outcomes
            .iter()
            .filter(|o| matches!(o, SignerOutcome::Success(_)))
            .count();
        let states: Vec<DomainState> = successes(outcomes).collect();
        let state = threshold_domain_state(&states, self.policy.threshold(), self.policy.total())?;

        tracing::info!(
            %session_id,
            confirmed,
            total = self.policy.total(),
            "Domain disabled across signers"
        );
        Ok(DisableDomainResponse {
            success: true,
            version: service_version(),
            status: DomainState {
                disabled: true,
                ..state
            },
        })
    }

    /// Aggregate a phone-number signature charged to an account.
    pub async fn sign_message(&self, mut request: SignMessageRequest) -> OdisResult<SignMessageResponse> {
        let endpoint = CombinerEndpoint::SignMessage.signer_endpoint()?;
        let blinded = decode_blinded(&request.blinded_query_phone_number)?;
        if request.account.trim().is_empty() {
            return Err(OdisError::InvalidInput("account is required".to_string()));
        }
        let session_id = ensure_session_id(&mut request.session_id);
        let body = serde_json::to_value(&request)?;

        let outcomes = self
            .fan_out(endpoint, &body, FanOut::UntilDecided, |signer, body| {
                let response: SignMessageResponse = serde_json::from_value(body)?;
                let partial = self.verified_partial(signer, &blinded, &response.signature)?;
                Ok((partial, response.performed_query_count, response.total_quota))
            })
            .instrument(tracing::info_span!("sign_message", %session_id))
            .await;

        self.ensure_reached(endpoint, &outcomes)?;
        let replies: Vec<_> = successes(outcomes).collect();

        let performed_query_count = replies.iter().map(|r| r.1).max().unwrap_or_default();
        let total_quota = replies.iter().map(|r| r.2).min().unwrap_or_default();
        if replies.iter().any(|r| r.1 != performed_query_count || r.2 != total_quota) {
            tracing::warn!(%session_id, "Signers disagree on account quota");
        }

        let partials: Vec<VerifiedPartial> = replies.into_iter().map(|r| r.0).collect();
        let signature = self.crypto.combine(&blinded, &partials)?;

        Ok(SignMessageResponse {
            success: true,
            version: service_version(),
            signature: BASE64.encode(signature),
            performed_query_count,
            total_quota,
        })
    }

    // =========================================================================
    // Fan-out and aggregation
    // =========================================================================

    async fn fan_out<T>(
        &self,
        endpoint: SignerEndpoint,
        body: &Value,
        mode: FanOut,
        accept: impl Fn(usize, Value) -> OdisResult<T>,
    ) -> Vec<SignerOutcome<T>> {
        let transport = &self.transport;
        let mut in_flight: FuturesUnordered<_> = (0..self.policy.total())
            .map(|signer| async move {
                let reply = tokio::time::timeout(
                    self.signer_timeout,
                    transport.call(signer, endpoint, self.key_version, body),
                )
                .await;
                (signer, reply)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(self.policy.total());
        while let Some((signer, reply)) = in_flight.next().await {
            outcomes.push(self.classify(signer, endpoint, reply, &accept));

            if mode == FanOut::UntilDecided && self.policy.decide(&outcomes) != QuorumDecision::Pending {
                if !in_flight.is_empty() {
                    tracing::debug!(
                        %endpoint,
                        cancelled = in_flight.len(),
                        "Verdict reached, cancelling outstanding signer requests"
                    );
                }
                break;
            }
        }
        outcomes
    }

    fn classify<T>(
        &self,
        signer: usize,
        endpoint: SignerEndpoint,
        reply: Result<OdisResult<SignerReply>, Elapsed>,
        accept: &impl Fn(usize, Value) -> OdisResult<T>,
    ) -> SignerOutcome<T> {
        match reply {
            Err(_) => {
                tracing::warn!(
                    signer,
                    %endpoint,
                    timeout = ?self.signer_timeout,
                    "Signer timed out"
                );
                SignerOutcome::Unreachable { timed_out: true }
            }
            Ok(Err(e)) => {
                tracing::warn!(signer, %endpoint, error = %e, "Signer request failed");
                SignerOutcome::Unreachable { timed_out: false }
            }
            Ok(Ok(SignerReply::Success { body, key_version })) => {
                if endpoint.is_signing() && key_version != Some(self.key_version) {
                    tracing::warn!(
                        signer,
                        %endpoint,
                        expected = self.key_version,
                        received = ?key_version,
                        "Signer answered with an unexpected key version"
                    );
                    return SignerOutcome::Rejected { status: 502 };
                }
                match accept(signer, body) {
                    Ok(value) => SignerOutcome::Success(value),
                    Err(e) => {
                        tracing::warn!(signer, %endpoint, error = %e, "Discarding inconsistent signer response");
                        SignerOutcome::Rejected { status: 502 }
                    }
                }
            }
            Ok(Ok(SignerReply::RateLimited { not_before })) => {
                tracing::debug!(signer, %endpoint, ?not_before, "Signer rate limited the request");
                SignerOutcome::RateLimited { not_before }
            }
            Ok(Ok(SignerReply::Disabled)) => {
                tracing::debug!(signer, %endpoint, "Signer reports domain disabled");
                SignerOutcome::Disabled
            }
            Ok(Ok(SignerReply::Rejected { status, message })) => {
                tracing::warn!(signer, %endpoint, status, %message, "Signer rejected the request");
                SignerOutcome::Rejected { status }
            }
        }
    }

    fn verified_partial(
        &self,
        signer: usize,
        blinded: &[u8],
        signature: &str,
    ) -> OdisResult<VerifiedPartial> {
        let partial = BASE64
            .decode(signature)
            .map_err(|e| OdisError::InvalidSignerResponse(format!("signature is not base64: {e}")))?;
        self.crypto.verify_partial(signer, blinded, &partial)?;
        Ok(VerifiedPartial {
            signer_index: signer,
            signature: partial,
        })
    }

    /// Map a round's verdict to success or the error the client sees.
    fn ensure_reached<T>(&self, endpoint: SignerEndpoint, outcomes: &[SignerOutcome<T>]) -> OdisResult<()> {
        let decision = self.policy.decide(outcomes);

        let dissent = outcomes
            .iter()
            .filter(|o| matches!(o, SignerOutcome::RateLimited { .. } | SignerOutcome::Disabled))
            .count();

        match decision {
            QuorumDecision::Reached => {
                if dissent > 0 {
                    tracing::warn!(
                        %endpoint,
                        dissent,
                        "Quorum reached while some signers rejected; signer state has diverged"
                    );
                }
                Ok(())
            }
            QuorumDecision::Disabled => Err(OdisError::DomainDisabled { status: None }),
            QuorumDecision::RateLimited { not_before } => {
                Err(OdisError::RateLimited { not_before, status: None })
            }
            QuorumDecision::Unavailable {
                successes,
                majority_status,
            } => {
                tracing::error!(
                    %endpoint,
                    successes,
                    threshold = self.policy.threshold(),
                    ?majority_status,
                    "Quorum not reached"
                );
                match majority_status {
                    Some(429) => Err(OdisError::RateLimited {
                        not_before: soonest_not_before(outcomes),
                        status: None,
                    }),
                    Some(status) if (400..500).contains(&status) => {
                        Err(OdisError::SignersRejected { status })
                    }
                    _ => Err(OdisError::InsufficientSigners {
                        needed: self.policy.threshold(),
                        have: successes,
                    }),
                }
            }
            QuorumDecision::Pending => Err(OdisError::Internal(
                "fan-out finished without a verdict".to_string(),
            )),
        }
    }
}

fn ensure_session_id(session_id: &mut Option<String>) -> String {
    session_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone()
}

/// Earliest retry time any rate-limited signer reported.
fn soonest_not_before<T>(outcomes: &[SignerOutcome<T>]) -> Option<u64> {
    outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            SignerOutcome::RateLimited { not_before } => *not_before,
            _ => None,
        })
        .min()
}

fn successes<T>(outcomes: Vec<SignerOutcome<T>>) -> impl Iterator<Item = T> {
    outcomes.into_iter().filter_map(|o| match o {
        SignerOutcome::Success(value) => Some(value),
        _ => None,
    })
}

fn log_state_discrepancies(session_id: &str, states: &[DomainState]) {
    let Some(first) = states.first() else {
        return;
    };
    if states.iter().any(|s| s != first) {
        let counters: Vec<u64> = states.iter().map(|s| s.counter).collect();
        let timers: Vec<u64> = states.iter().map(|s| s.timer).collect();
        tracing::warn!(
            %session_id,
            ?counters,
            ?timers,
            "Signer domain states diverge"
        );
    }
}
