//! HTTP routes for the ODIS service.
//!
//! Routes are organized by role:
//! - `health`: Health check and build info (both roles)
//! - `combiner_routes`: Public client endpoints (combiner)
//! - `signer_routes`: Partial signing and quota endpoints (signer)

pub mod combiner_routes;
pub mod health;
pub mod signer_routes;

use actix_web::web;

use crate::error::OdisError;

pub use health::{build_info, health};

/// JSON extractor config shared by both roles.
///
/// Oversized or malformed bodies are answered with the structured error
/// body instead of actix's plain-text default.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| OdisError::InvalidInput(err.to_string()).into())
}
