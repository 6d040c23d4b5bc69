//! Service configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the service starts.
//! The same library backs both binaries; `ODIS_ROLE` selects which side a
//! process runs as.
//!
//! ## Environment Variables
//!
//! ### Common (both roles)
//! - `ODIS_ROLE`: "combiner" or "signer" (required)
//! - `ODIS_PORT`: HTTP port (default: 5002 for combiner, 5101 for signer)
//! - `ODIS_HOST`: Bind address (default: :: for dual-stack IPv4/IPv6)
//! - `ODIS_DB_PATH`: Path to ReDB database file (signer state)
//! - `INTERNAL_SERVICE_TOKEN`: Shared secret for combiner-to-signer and admin calls
//! - `INTERNAL_SERVICE_TOKEN_REQUIRED`: Refuse to start without a token
//! - `ODIS_BODY_LIMIT_KB`: Maximum JSON body size
//! - `RUST_LOG`: Log level filter
//!
//! ### Combiner-specific
//! - `ODIS_SIGNER_ENDPOINTS`: Comma-separated signer URLs, each optionally `url|fallback`
//! - `ODIS_SIGNER_PUBKEYS`: Comma-separated hex verifying keys, same order as endpoints
//! - `ODIS_THRESHOLD`: Number of signer approvals required (t of n)
//! - `ODIS_KEY_VERSION`: Key version requested from signers
//! - `ODIS_SIGNER_TIMEOUT_MS`: Per-signer request timeout
//! - `ODIS_RATE_LIMIT_SECONDS_PER_REQUEST`, `ODIS_RATE_LIMIT_BURST`: Per-IP limiter
//!
//! ### Signer-specific
//! - `ODIS_SIGNER_ID`: Unique identifier for this signer instance
//! - `ODIS_SIGNER_KEYS`: Comma-separated `version:hexseed` signing keys
//! - `ODIS_DOMAINS_API_ENABLED`, `ODIS_PNP_API_ENABLED`: Per-API switches
//! - `ODIS_PNP_QUOTA`: Per-account query quota
//! - `ODIS_MAX_TIMESTAMP_AGE_SECS`, `ODIS_MAX_TIMESTAMP_SKEW_SECS`: Accepted attempt window
//! - `ODIS_COMMIT_RETRIES`: Retries after a concurrent state change

use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// Default ports
const DEFAULT_COMBINER_PORT: u16 = 5002;
const DEFAULT_SIGNER_PORT: u16 = 5101;
const DEFAULT_BODY_LIMIT_KB: usize = 64;
const DEFAULT_SIGNER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_KEY_VERSION: u32 = 1;
const DEFAULT_RATE_LIMIT_SECONDS_PER_REQUEST: u64 = 1;
const DEFAULT_RATE_LIMIT_BURST: u32 = 50;
const DEFAULT_PNP_QUOTA: u64 = 10;
const DEFAULT_MAX_TIMESTAMP_AGE_SECS: u64 = 300;
const DEFAULT_MAX_TIMESTAMP_SKEW_SECS: u64 = 10;
const DEFAULT_COMMIT_RETRIES: u32 = 3;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to get lowercase env var.
fn env_lower(name: &str) -> String {
    env_trim(name).to_lowercase()
}

/// Helper to get a non-empty env var.
fn env_opt(name: &str) -> Option<String> {
    Some(env_trim(name)).filter(|v| !v.is_empty())
}

/// Check if a string value is truthy.
fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

/// Boolean flag with a default when unset.
fn env_flag(name: &str, default: bool) -> bool {
    let value = env_lower(name);
    if value.is_empty() {
        default
    } else {
        is_truthy(&value)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_trim(name).parse::<T>().unwrap_or(default)
}

/// Service role: combiner or signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Public entry point: fans requests out to signers and aggregates a quorum.
    Combiner,
    /// Holds one key share and the authoritative quota state for its replica.
    Signer,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "combiner" => Ok(Self::Combiner),
            "signer" => Ok(Self::Signer),
            other => Err(format!(
                "Invalid role '{other}'. Must be 'combiner' or 'signer'."
            )),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Combiner => write!(f, "combiner"),
            Self::Signer => write!(f, "signer"),
        }
    }
}

/// Address of one signer as seen by the combiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerAddress {
    pub url: String,
    pub fallback_url: Option<String>,
}

impl FromStr for SignerAddress {
    type Err = String;

    /// Parses `url` or `url|fallback`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|').map(str::trim);
        let url = parts
            .next()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| format!("Empty signer endpoint in '{s}'"))?;
        let fallback_url = parts.next().filter(|u| !u.is_empty()).map(String::from);
        if parts.next().is_some() {
            return Err(format!(
                "Signer endpoint '{s}' has more than one fallback"
            ));
        }
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

/// String that never shows up in `Debug` output and is wiped on drop.
#[derive(Clone)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // Common settings
    role: Role,
    port: u16,
    host: IpAddr,
    db_path: PathBuf,
    internal_token: Option<String>,
    internal_token_required: bool,
    body_limit_bytes: usize,

    // Combiner-specific
    signer_endpoints: Vec<SignerAddress>,
    signer_pubkeys: Vec<String>,
    threshold: usize,
    key_version: u32,
    signer_timeout_ms: u64,
    rate_limit_seconds_per_request: u64,
    rate_limit_burst: u32,

    // Signer-specific
    signer_id: Option<String>,
    signer_keys: Option<SecretString>,
    domains_api_enabled: bool,
    pnp_api_enabled: bool,
    pnp_quota: u64,
    max_timestamp_age_secs: u64,
    max_timestamp_skew_secs: u64,
    commit_retries: u32,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Fails if `ODIS_ROLE` is missing or invalid, or a signer endpoint
    /// entry cannot be parsed.
    pub fn from_env() -> Result<Self, String> {
        let role: Role = env_trim("ODIS_ROLE")
            .parse()
            .map_err(|e| format!("ODIS_ROLE configuration error: {e}"))?;

        let default_port = match role {
            Role::Combiner => DEFAULT_COMBINER_PORT,
            Role::Signer => DEFAULT_SIGNER_PORT,
        };
        let port = env_parse("ODIS_PORT", default_port);

        // Default to IPv6 unspecified (::) for dual-stack support.
        let host = env_parse("ODIS_HOST", IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        let default_db_name = match role {
            Role::Combiner => "combiner.redb",
            Role::Signer => "signer.redb",
        };
        let db_path = env_opt("ODIS_DB_PATH")
            .map_or_else(|| PathBuf::from(format!("./.data/{default_db_name}")), PathBuf::from);

        let internal_token = env_opt("INTERNAL_SERVICE_TOKEN");

        // Determine if token is required based on environment
        let is_production = ["APP_ENV", "RUST_ENV"]
            .iter()
            .any(|name| env_lower(name) == "production");
        let internal_token_required =
            is_production || is_truthy(&env_lower("INTERNAL_SERVICE_TOKEN_REQUIRED"));

        let body_limit_bytes = env_parse("ODIS_BODY_LIMIT_KB", DEFAULT_BODY_LIMIT_KB)
            .saturating_mul(1024);

        // Combiner-specific settings
        let signer_endpoints = env_trim("ODIS_SIGNER_ENDPOINTS")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<SignerAddress>)
            .collect::<Result<Vec<_>, _>>()?;

        let signer_pubkeys: Vec<String> = env_trim("ODIS_SIGNER_PUBKEYS")
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let threshold = env_parse("ODIS_THRESHOLD", signer_endpoints.len() / 2 + 1);
        let key_version = env_parse("ODIS_KEY_VERSION", DEFAULT_KEY_VERSION);
        let signer_timeout_ms = env_parse("ODIS_SIGNER_TIMEOUT_MS", DEFAULT_SIGNER_TIMEOUT_MS);
        let rate_limit_seconds_per_request = env_parse(
            "ODIS_RATE_LIMIT_SECONDS_PER_REQUEST",
            DEFAULT_RATE_LIMIT_SECONDS_PER_REQUEST,
        );
        let rate_limit_burst = env_parse("ODIS_RATE_LIMIT_BURST", DEFAULT_RATE_LIMIT_BURST);

        // Signer-specific settings
        Ok(Self {
            role,
            port,
            host,
            db_path,
            internal_token,
            internal_token_required,
            body_limit_bytes,
            signer_endpoints,
            signer_pubkeys,
            threshold,
            key_version,
            signer_timeout_ms,
            rate_limit_seconds_per_request,
            rate_limit_burst,
            signer_id: env_opt("ODIS_SIGNER_ID"),
            signer_keys: env_opt("ODIS_SIGNER_KEYS").map(SecretString::new),
            domains_api_enabled: env_flag("ODIS_DOMAINS_API_ENABLED", true),
            pnp_api_enabled: env_flag("ODIS_PNP_API_ENABLED", true),
            pnp_quota: env_parse("ODIS_PNP_QUOTA", DEFAULT_PNP_QUOTA),
            max_timestamp_age_secs: env_parse(
                "ODIS_MAX_TIMESTAMP_AGE_SECS",
                DEFAULT_MAX_TIMESTAMP_AGE_SECS,
            ),
            max_timestamp_skew_secs: env_parse(
                "ODIS_MAX_TIMESTAMP_SKEW_SECS",
                DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            ),
            commit_retries: env_parse("ODIS_COMMIT_RETRIES", DEFAULT_COMMIT_RETRIES),
        })
    }

    /// Create settings for combiner tests: three signers, threshold two.
    pub fn for_combiner_tests() -> Self {
        let signer_pubkeys = (1u8..=3)
            .map(|seed| {
                let key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
                hex::encode(key.verifying_key().as_bytes())
            })
            .collect();

        Self {
            role: Role::Combiner,
            port: DEFAULT_COMBINER_PORT,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            db_path: PathBuf::from("./.data/test-combiner.redb"),
            internal_token: None,
            internal_token_required: false,
            body_limit_bytes: DEFAULT_BODY_LIMIT_KB * 1024,
            signer_endpoints: (5101..=5103)
                .map(|port| SignerAddress {
                    url: format!("http://localhost:{port}"),
                    fallback_url: None,
                })
                .collect(),
            signer_pubkeys,
            threshold: 2,
            key_version: DEFAULT_KEY_VERSION,
            signer_timeout_ms: 2_000,
            rate_limit_seconds_per_request: DEFAULT_RATE_LIMIT_SECONDS_PER_REQUEST,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            signer_id: None,
            signer_keys: None,
            domains_api_enabled: true,
            pnp_api_enabled: true,
            pnp_quota: DEFAULT_PNP_QUOTA,
            max_timestamp_age_secs: DEFAULT_MAX_TIMESTAMP_AGE_SECS,
            max_timestamp_skew_secs: DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            commit_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    /// Create settings for signer tests. The signing key seed is `[seed; 32]`.
    pub fn for_signer_tests(id: &str, seed: u8) -> Self {
        Self {
            role: Role::Signer,
            port: DEFAULT_SIGNER_PORT,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            db_path: PathBuf::from(format!("./.data/test-{id}.redb")),
            internal_token: None,
            internal_token_required: false,
            body_limit_bytes: DEFAULT_BODY_LIMIT_KB * 1024,
            signer_endpoints: vec![],
            signer_pubkeys: vec![],
            threshold: 1,
            key_version: DEFAULT_KEY_VERSION,
            signer_timeout_ms: DEFAULT_SIGNER_TIMEOUT_MS,
            rate_limit_seconds_per_request: DEFAULT_RATE_LIMIT_SECONDS_PER_REQUEST,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            signer_id: Some(id.to_string()),
            signer_keys: Some(SecretString::new(format!(
                "{DEFAULT_KEY_VERSION}:{}",
                hex::encode([seed; 32])
            ))),
            domains_api_enabled: true,
            pnp_api_enabled: true,
            pnp_quota: DEFAULT_PNP_QUOTA,
            max_timestamp_age_secs: DEFAULT_MAX_TIMESTAMP_AGE_SECS,
            max_timestamp_skew_secs: DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            commit_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    /// Require an internal token on every protected route.
    #[must_use]
    pub fn with_internal_token(mut self, token: &str) -> Self {
        self.internal_token = Some(token.to_string());
        self.internal_token_required = true;
        self
    }

    /// Validate settings for the configured role.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        // Common validation
        if self.internal_token_required && self.internal_token.is_none() {
            return Err("INTERNAL_SERVICE_TOKEN is required in production. \
                 Set INTERNAL_SERVICE_TOKEN or INTERNAL_SERVICE_TOKEN_REQUIRED=0."
                .to_string());
        }

        if self.body_limit_bytes == 0 {
            return Err("ODIS_BODY_LIMIT_KB must be greater than zero".to_string());
        }

        match self.role {
            Role::Combiner => self.validate_combiner(),
            Role::Signer => self.validate_signer(),
        }
    }

    fn validate_combiner(&self) -> Result<(), String> {
        let total = self.signer_endpoints.len();
        if total == 0 {
            return Err("ODIS_SIGNER_ENDPOINTS is required for combiner role. \
                 Provide comma-separated list of signer URLs."
                .to_string());
        }

        if self.threshold == 0 || self.threshold > total {
            return Err(format!(
                "ODIS_THRESHOLD must be between 1 and {total} (got {})",
                self.threshold
            ));
        }

        if self.signer_pubkeys.len() != total {
            return Err(format!(
                "ODIS_SIGNER_PUBKEYS must list one key per signer endpoint \
                 ({total} endpoints, {} keys)",
                self.signer_pubkeys.len()
            ));
        }

        if let Some(bad) = self
            .signer_pubkeys
            .iter()
            .find(|k| k.len() != 64 || !k.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(format!(
                "ODIS_SIGNER_PUBKEYS entry '{bad}' is not a 32-byte hex key"
            ));
        }

        if self.signer_timeout_ms == 0 {
            return Err("ODIS_SIGNER_TIMEOUT_MS must be greater than zero".to_string());
        }

        Ok(())
    }

    fn validate_signer(&self) -> Result<(), String> {
        if self.signer_id.is_none() {
            return Err("ODIS_SIGNER_ID is required for signer role. \
                 Provide a unique identifier for this signer instance."
                .to_string());
        }

        if self.signer_keys.is_none() {
            return Err("ODIS_SIGNER_KEYS is required for signer role. \
                 Provide comma-separated version:hexseed entries."
                .to_string());
        }

        if self.max_timestamp_age_secs == 0 {
            return Err("ODIS_MAX_TIMESTAMP_AGE_SECS must be greater than zero".to_string());
        }

        Ok(())
    }

    // Getters

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn internal_token(&self) -> Option<&str> {
        self.internal_token.as_deref()
    }

    pub fn internal_token_required(&self) -> bool {
        self.internal_token_required
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_bytes
    }

    pub fn signer_endpoints(&self) -> &[SignerAddress] {
        &self.signer_endpoints
    }

    pub fn signer_pubkeys(&self) -> &[String] {
        &self.signer_pubkeys
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub fn signer_timeout(&self) -> Duration {
        Duration::from_millis(self.signer_timeout_ms)
    }

    pub fn rate_limit_seconds_per_request(&self) -> u64 {
        self.rate_limit_seconds_per_request
    }

    pub fn rate_limit_burst(&self) -> u32 {
        self.rate_limit_burst
    }

    pub fn signer_id(&self) -> Option<&str> {
        self.signer_id.as_deref()
    }

    pub fn signer_keys(&self) -> Option<&SecretString> {
        self.signer_keys.as_ref()
    }

    pub fn domains_api_enabled(&self) -> bool {
        self.domains_api_enabled
    }

    pub fn pnp_api_enabled(&self) -> bool {
        self.pnp_api_enabled
    }

    pub fn pnp_quota(&self) -> u64 {
        self.pnp_quota
    }

    pub fn max_timestamp_age_secs(&self) -> u64 {
        self.max_timestamp_age_secs
    }

    pub fn max_timestamp_skew_secs(&self) -> u64 {
        self.max_timestamp_skew_secs
    }

    pub fn commit_retries(&self) -> u32 {
        self.commit_retries
    }
}
