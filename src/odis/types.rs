//! Request and response bodies shared by the combiner and signers.
//!
//! Both sides speak the same JSON so the combiner can forward a client
//! request to every signer unchanged. Binary payloads are standard base64.

use serde::{Deserialize, Serialize};

use crate::domain::{DomainState, SequentialDelayDomain};

/// Version of a signing key held by each signer.
pub type KeyVersion = u32;

/// Version string reported in every response body.
pub fn service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// =============================================================================
// Domain API
// =============================================================================

/// Request a signature under a domain's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSignRequest {
    pub domain: SequentialDelayDomain,
    /// Base64 blinded message.
    pub blinded_message: String,
    /// Client attempt time in Unix seconds. Also part of the dedup key.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSignResponse {
    pub success: bool,
    pub version: String,
    /// Base64 partial signature (signer) or combined signature (combiner).
    pub signature: String,
    pub status: DomainState,
}

/// Read a domain's quota state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainQuotaStatusRequest {
    pub domain: SequentialDelayDomain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainQuotaStatusResponse {
    pub success: bool,
    pub version: String,
    pub status: DomainState,
}

/// Permanently disable a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableDomainRequest {
    pub domain: SequentialDelayDomain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableDomainResponse {
    pub success: bool,
    pub version: String,
    pub status: DomainState,
}

// =============================================================================
// Phone-number API
// =============================================================================

/// Request a signature charged to an account's query quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageRequest {
    pub account: String,
    /// Base64 blinded phone number.
    pub blinded_query_phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageResponse {
    pub success: bool,
    pub version: String,
    pub signature: String,
    pub performed_query_count: u64,
    pub total_quota: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SequentialDelayStage;

    #[test]
    fn test_domain_sign_request_wire_names() {
        let request = DomainSignRequest {
            domain: SequentialDelayDomain::new(vec![SequentialDelayStage::new(0)]),
            blinded_message: "AAEC".to_string(),
            timestamp: 1_700_000_000,
            session_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["blindedMessage"], "AAEC");
        assert_eq!(json["timestamp"], 1_700_000_000u64);
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn test_sign_message_response_wire_names() {
        let response = SignMessageResponse {
            success: true,
            version: service_version(),
            signature: "sig".to_string(),
            performed_query_count: 3,
            total_quota: 10,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["performedQueryCount"], 3);
        assert_eq!(json["totalQuota"], 10);
    }
}
