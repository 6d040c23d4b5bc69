//! ODIS Combiner
//!
//! Public entry point. Fans each request out to every signer and
//! aggregates a threshold of verified partial signatures.
//!
//! ## Responsibilities
//!
//! - Validate incoming client requests before contacting signers
//! - Translate public endpoints to signer endpoints
//! - Verify partial signatures and combine a `t`-of-`n` quorum
//! - Derive the threshold domain state reported to clients
//!
//! ## Security
//!
//! - Holds no signing key and no quota state
//! - Authenticates to signers via `INTERNAL_SERVICE_TOKEN`
//! - Rate limits all endpoints per IP to prevent abuse

use actix_governor::Governor;
use actix_web::{App, HttpServer, middleware, web};
use odis_service::{
    config::{Role, Settings},
    middleware::{InternalAuth, RateLimitConfig, general_limiter},
    odis::Combiner,
    routes, telemetry,
};
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing(Role::Combiner);

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };

    if settings.role() != Role::Combiner {
        tracing::error!(
            role = %settings.role(),
            "This binary must be run with ODIS_ROLE=combiner"
        );
        std::process::exit(1);
    }

    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    let combiner = match Combiner::from_settings(&settings) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create combiner");
            std::process::exit(1);
        }
    };

    let rate_config = RateLimitConfig::from_settings(&settings);
    let governor_config = match general_limiter(&rate_config) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build rate limiter");
            std::process::exit(1);
        }
    };
    tracing::info!(
        seconds_per_request = rate_config.seconds_per_request,
        burst = rate_config.burst,
        "Rate limiting enabled"
    );

    let addr = settings.socket_addr();
    tracing::info!(
        addr = %addr,
        signers = settings.signer_endpoints().len(),
        threshold = settings.threshold(),
        "Starting ODIS Combiner"
    );

    let settings_data = web::Data::new(settings.clone());
    let combiner_data = web::Data::new(combiner);
    let auth = InternalAuth::new(&settings);
    let body_limit = settings.body_limit_bytes();

    HttpServer::new(move || {
        App::new()
            // Rate limiting (applied first)
            .wrap(Governor::new(&governor_config))
            // Internal authentication for operator endpoints
            .wrap(auth.clone())
            // Request tracing
            .wrap(TracingLogger::default())
            // Default headers
            .wrap(middleware::DefaultHeaders::new().add(("X-Service", "odis-combiner")))
            // Shared state
            .app_data(settings_data.clone())
            .app_data(combiner_data.clone())
            .app_data(routes::json_config(body_limit))
            // Routes
            .configure(routes::health::configure)
            .configure(routes::combiner_routes::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    // Shutdown tracing
    telemetry::shutdown_tracing();

    Ok(())
}
