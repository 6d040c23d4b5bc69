//! Combiner-to-signer transport.
//!
//! [`SignerTransport`] is the seam between the combiner's aggregation logic
//! and the network. The HTTP implementation posts JSON to each signer,
//! falls back to a secondary URL when the primary cannot be reached, and
//! classifies error bodies into the reasons the quorum logic cares about.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::endpoints::{KEY_VERSION_HEADER, SignerEndpoint};
use super::types::KeyVersion;
use crate::config::{SignerAddress, Settings};
use crate::error::{CODE_DOMAIN_DISABLED, CODE_RATE_LIMITED, ErrorResponse, OdisError, OdisResult};

/// Classified reply from one signer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignerReply {
    Success {
        body: Value,
        /// Key version the signer reports having used.
        key_version: Option<KeyVersion>,
    },
    RateLimited {
        not_before: Option<u64>,
    },
    Disabled,
    Rejected {
        status: u16,
        message: String,
    },
}

impl SignerReply {
    /// Classify a non-success response from its status and parsed body.
    pub fn rejection(status: u16, body: Option<&ErrorResponse>) -> Self {
        let code = body.and_then(|b| b.code.as_deref());
        if status == 429 || code == Some(CODE_RATE_LIMITED) {
            Self::RateLimited {
                not_before: body.and_then(|b| b.not_before),
            }
        } else if status == 403 && code == Some(CODE_DOMAIN_DISABLED) {
            Self::Disabled
        } else {
            Self::Rejected {
                status,
                message: body.map(|b| b.error.clone()).unwrap_or_default(),
            }
        }
    }
}

/// Sends one request to one signer.
///
/// An `Err` means the signer could not be reached or answered with
/// something unparseable; it is excluded from the round.
#[async_trait]
pub trait SignerTransport: Send + Sync {
    fn signer_count(&self) -> usize;

    async fn call(
        &self,
        signer: usize,
        endpoint: SignerEndpoint,
        key_version: KeyVersion,
        body: &Value,
    ) -> OdisResult<SignerReply>;
}

/// HTTP transport using a shared reqwest client.
pub struct HttpSignerTransport {
    client: Client,
    signers: Vec<SignerAddress>,
    token: Option<String>,
}

impl HttpSignerTransport {
    pub fn new(signers: Vec<SignerAddress>, timeout: Duration, token: Option<String>) -> OdisResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OdisError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            signers,
            token,
        })
    }

    pub fn from_settings(settings: &Settings) -> OdisResult<Self> {
        Self::new(
            settings.signer_endpoints().to_vec(),
            settings.signer_timeout(),
            settings.internal_token().map(String::from),
        )
    }

    async fn post(
        &self,
        base_url: &str,
        endpoint: SignerEndpoint,
        key_version: KeyVersion,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .post(format!("{base_url}{}", endpoint.path()))
            .header(KEY_VERSION_HEADER, key_version.to_string())
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.send().await
    }
}

async fn classify(response: reqwest::Response) -> OdisResult<SignerReply> {
    let status = response.status();
    let key_version = response
        .headers()
        .get(KEY_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    if status.is_success() {
        let body = response.json::<Value>().await.map_err(|e| {
            OdisError::InvalidSignerResponse(format!("Failed to parse signer response: {e}"))
        })?;
        return Ok(SignerReply::Success { body, key_version });
    }

    let text = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ErrorResponse>(&text).ok();
    if parsed.is_none() && status != StatusCode::TOO_MANY_REQUESTS {
        tracing::debug!(%status, body = %text, "Signer error body is not structured");
    }
    Ok(SignerReply::rejection(status.as_u16(), parsed.as_ref()))
}

#[async_trait]
impl SignerTransport for HttpSignerTransport {
    fn signer_count(&self) -> usize {
        self.signers.len()
    }

    async fn call(
        &self,
        signer: usize,
        endpoint: SignerEndpoint,
        key_version: KeyVersion,
        body: &Value,
    ) -> OdisResult<SignerReply> {
        let address = self
            .signers
            .get(signer)
            .ok_or_else(|| OdisError::Internal(format!("no signer at index {signer}")))?;

        match self.post(&address.url, endpoint, key_version, body).await {
            Ok(response) => classify(response).await,
            Err(e) if e.is_connect() || e.is_timeout() => {
                let Some(fallback) = &address.fallback_url else {
                    return Err(e.into());
                };
                tracing::warn!(
                    signer,
                    url = %address.url,
                    fallback = %fallback,
                    error = %e,
                    "Primary signer URL failed, trying fallback"
                );
                let response = self.post(fallback, endpoint, key_version, body).await?;
                classify(response).await
            }
            Err(e) => Err(e.into()),
        }
    }
}
