//! ODIS Signer
//!
//! Holds one signing key and its own replica of the quota state, and
//! produces partial signatures when the local quota allows.
//!
//! ## Responsibilities
//!
//! - Evaluate sequential-delay domain quotas against durable state
//! - Deduplicate client retries so they are never charged twice
//! - Commit every quota charge before releasing the signature
//!
//! ## Security
//!
//! - Only reachable by the combiner, authenticated via `INTERNAL_SERVICE_TOKEN`
//! - Never coordinates with other signers

use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};
use odis_service::{
    clock::SystemClock,
    config::{Role, Settings},
    middleware::InternalAuth,
    odis::{Ed25519Keyring, PartialSigner, SignerPolicy, SignerService},
    routes,
    storage::Storage,
    telemetry,
};
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing(Role::Signer);

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };

    if settings.role() != Role::Signer {
        tracing::error!(
            role = %settings.role(),
            "This binary must be run with ODIS_ROLE=signer"
        );
        std::process::exit(1);
    }

    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    let storage = match Storage::open(settings.db_path()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open storage database");
            std::process::exit(1);
        }
    };

    let keyring = match settings.signer_keys().map(|keys| Ed25519Keyring::parse(keys.expose())) {
        Some(Ok(keyring)) => keyring,
        Some(Err(e)) => {
            tracing::error!(error = %e, "Failed to load signing keys");
            std::process::exit(1);
        }
        None => {
            tracing::error!("ODIS_SIGNER_KEYS is required");
            std::process::exit(1);
        }
    };

    let addr = settings.socket_addr();
    let signer_id = settings
        .signer_id()
        .map_or_else(|| "unknown".to_string(), String::from);
    let policy = SignerPolicy::from_settings(&settings);
    let key_version = keyring.latest_key_version();

    tracing::info!(
        addr = %addr,
        signer_id = %signer_id,
        key_version,
        verifying_key = ?keyring.verifying_key_hex(key_version),
        domains_api = policy.domains_api_enabled,
        pnp_api = policy.pnp_api_enabled,
        "Starting ODIS Signer"
    );

    if settings.internal_token().is_none() {
        tracing::warn!(
            "Starting signer WITHOUT an internal token - development mode only! \
             Set INTERNAL_SERVICE_TOKEN for production."
        );
    }

    let signer_service = SignerService::new(
        signer_id.clone(),
        Arc::new(storage),
        Arc::new(keyring),
        Arc::new(SystemClock),
        policy,
    );

    let settings_data = web::Data::new(settings.clone());
    let signer_service_data = web::Data::new(signer_service);
    let auth = InternalAuth::new(&settings);
    let body_limit = settings.body_limit_bytes();

    HttpServer::new(move || {
        App::new()
            // Internal authentication
            .wrap(auth.clone())
            // Request tracing
            .wrap(TracingLogger::default())
            // Default headers
            .wrap(
                middleware::DefaultHeaders::new()
                    .add(("X-Service", "odis-signer"))
                    .add(("X-Signer-Id", signer_id.clone())),
            )
            // Shared state
            .app_data(settings_data.clone())
            .app_data(signer_service_data.clone())
            .app_data(routes::json_config(body_limit))
            // Routes
            .configure(routes::health::configure)
            .configure(routes::signer_routes::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    // Shutdown tracing
    telemetry::shutdown_tracing();

    Ok(())
}
