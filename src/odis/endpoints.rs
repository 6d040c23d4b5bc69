//! Public and signer-facing endpoint identities.
//!
//! The combiner translates each public endpoint to exactly one signer
//! endpoint and back. Matchmaking is served by a separate service built on
//! top of signed identifiers and has no signer counterpart.

use std::fmt;

use crate::error::{OdisError, OdisResult};

/// Header carrying the requested or used key version.
pub const KEY_VERSION_HEADER: &str = "odis-key-version";

/// Endpoints exposed by the combiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CombinerEndpoint {
    SignMessage,
    DomainSign,
    DomainQuotaStatus,
    DisableDomain,
    Matchmaking,
}

/// Endpoints exposed by each signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignerEndpoint {
    PartialSignMessage,
    DomainSign,
    DomainQuotaStatus,
    DisableDomain,
}

impl CombinerEndpoint {
    pub const ALL: [Self; 5] = [
        Self::SignMessage,
        Self::DomainSign,
        Self::DomainQuotaStatus,
        Self::DisableDomain,
        Self::Matchmaking,
    ];

    pub const fn path(self) -> &'static str {
        match self {
            Self::SignMessage => "/sign",
            Self::DomainSign => "/domain/sign",
            Self::DomainQuotaStatus => "/domain/quotaStatus",
            Self::DisableDomain => "/domain/disable",
            Self::Matchmaking => "/getContactMatches",
        }
    }

    /// Signer endpoint this request is forwarded to.
    pub fn signer_endpoint(self) -> OdisResult<SignerEndpoint> {
        match self {
            Self::SignMessage => Ok(SignerEndpoint::PartialSignMessage),
            Self::DomainSign => Ok(SignerEndpoint::DomainSign),
            Self::DomainQuotaStatus => Ok(SignerEndpoint::DomainQuotaStatus),
            Self::DisableDomain => Ok(SignerEndpoint::DisableDomain),
            Self::Matchmaking => Err(OdisError::UnmappedEndpoint(self.to_string())),
        }
    }
}

impl SignerEndpoint {
    pub const ALL: [Self; 4] = [
        Self::PartialSignMessage,
        Self::DomainSign,
        Self::DomainQuotaStatus,
        Self::DisableDomain,
    ];

    pub const fn path(self) -> &'static str {
        match self {
            Self::PartialSignMessage => "/getBlindedMessagePartialSig",
            Self::DomainSign => "/domain/sign",
            Self::DomainQuotaStatus => "/domain/quotaStatus",
            Self::DisableDomain => "/domain/disable",
        }
    }

    pub fn combiner_endpoint(self) -> CombinerEndpoint {
        match self {
            Self::PartialSignMessage => CombinerEndpoint::SignMessage,
            Self::DomainSign => CombinerEndpoint::DomainSign,
            Self::DomainQuotaStatus => CombinerEndpoint::DomainQuotaStatus,
            Self::DisableDomain => CombinerEndpoint::DisableDomain,
        }
    }

    /// Responses must carry the key version the combiner asked for.
    pub fn is_signing(self) -> bool {
        matches!(self, Self::PartialSignMessage | Self::DomainSign)
    }
}

impl fmt::Display for CombinerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl fmt::Display for SignerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
