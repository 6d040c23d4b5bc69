// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., OdisError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! ODIS Service
//!
//! An oblivious threshold signing oracle. Clients submit blinded messages;
//! a quorum of independent signers each returns a partial signature, and the
//! combiner aggregates them. Each signer enforces per-domain rate limits
//! derived from a sequential-delay policy carried in the request itself.
//!
//! ## Architecture
//!
//! The service runs as two distinct binaries:
//!
//! - **Combiner** (port 5002): Public entry point. Validates requests, fans
//!   them out to every signer, and aggregates a `t`-of-`n` quorum.
//!
//! - **Signer** (ports 5101+): Holds one signing key and its own replica of
//!   the domain quota state. Signs only when its local quota allows.
//!
//! ## Quota Model
//!
//! - **Sequential delay**: a domain lists stages of delayed batches; the
//!   evaluator is a pure function of the domain, the attempt time and state.
//! - **Replicated state**: signers never coordinate. A request succeeds only
//!   if at least `t` signers independently accept it, so a client cannot
//!   exceed the policy by playing signers against each other.
//! - **Fail closed**: a signature is only returned once the quota charge it
//!   implies is durably committed.

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod middleware;
pub mod odis;
pub mod routes;
pub mod storage;

#[cfg(feature = "otel")]
pub mod telemetry;

#[cfg(not(feature = "otel"))]
pub mod telemetry {
    //! Stub telemetry module when OpenTelemetry is disabled.

    use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

    use crate::config::Role;

    /// Initialize tracing with console output only.
    pub fn init_tracing(_role: Role) {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "odis_service=info,actix_web=info".into());
        let fmt_layer = if super::json_logs() {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    /// No-op shutdown when OpenTelemetry is disabled.
    pub fn shutdown_tracing() {}
}

/// `LOG_FORMAT=json` switches console output to JSON lines.
fn json_logs() -> bool {
    std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

// Re-export commonly used types
pub use config::{Role, Settings};
pub use error::{OdisError, OdisResult};
pub use odis::{Combiner, SignerService};
pub use storage::{QuotaStore, Storage};
