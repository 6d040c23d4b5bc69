//! Public combiner endpoints.
//!
//! Every handler forwards the raw JSON body to [`Combiner::handle`], which
//! owns request validation and the translation to signer endpoints.

use actix_web::{HttpResponse, ResponseError, web};
use serde_json::Value;

use crate::odis::{Combiner, CombinerEndpoint, KEY_VERSION_HEADER};

async fn forward(combiner: &Combiner, endpoint: CombinerEndpoint, body: Value) -> HttpResponse {
    match combiner.handle(endpoint, body).await {
        Ok(response) => {
            let mut builder = HttpResponse::Ok();
            if endpoint.signer_endpoint().is_ok_and(|e| e.is_signing()) {
                builder.insert_header((KEY_VERSION_HEADER, combiner.key_version().to_string()));
            }
            builder.json(response)
        }
        Err(e) => {
            if e.status_code().is_server_error() {
                tracing::error!(%endpoint, error = %e, "Combined request failed");
            } else {
                tracing::info!(%endpoint, error = %e, "Combined request rejected");
            }
            e.error_response()
        }
    }
}

/// POST /sign
#[tracing::instrument(skip(combiner, body))]
pub async fn sign_message(combiner: web::Data<Combiner>, body: web::Json<Value>) -> HttpResponse {
    forward(&combiner, CombinerEndpoint::SignMessage, body.into_inner()).await
}

/// POST /domain/sign
#[tracing::instrument(skip(combiner, body))]
pub async fn domain_sign(combiner: web::Data<Combiner>, body: web::Json<Value>) -> HttpResponse {
    forward(&combiner, CombinerEndpoint::DomainSign, body.into_inner()).await
}

/// POST /domain/quotaStatus
#[tracing::instrument(skip(combiner, body))]
pub async fn domain_quota_status(
    combiner: web::Data<Combiner>,
    body: web::Json<Value>,
) -> HttpResponse {
    forward(&combiner, CombinerEndpoint::DomainQuotaStatus, body.into_inner()).await
}

/// POST /domain/disable
#[tracing::instrument(skip(combiner, body))]
pub async fn disable_domain(combiner: web::Data<Combiner>, body: web::Json<Value>) -> HttpResponse {
    forward(&combiner, CombinerEndpoint::DisableDomain, body.into_inner()).await
}

/// POST /getContactMatches
///
/// Served by a separate matchmaking service; always answers with an
/// unmapped-endpoint error here.
#[tracing::instrument(skip(combiner, body))]
pub async fn matchmaking(combiner: web::Data<Combiner>, body: web::Json<Value>) -> HttpResponse {
    forward(&combiner, CombinerEndpoint::Matchmaking, body.into_inner()).await
}

/// Configure combiner routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        CombinerEndpoint::SignMessage.path(),
        web::post().to(sign_message),
    )
    .route(
        CombinerEndpoint::DomainSign.path(),
        web::post().to(domain_sign),
    )
    .route(
        CombinerEndpoint::DomainQuotaStatus.path(),
        web::post().to(domain_quota_status),
    )
    .route(
        CombinerEndpoint::DisableDomain.path(),
        web::post().to(disable_domain),
    )
    .route(
        CombinerEndpoint::Matchmaking.path(),
        web::post().to(matchmaking),
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use async_trait::async_trait;

    use super::*;
    use crate::config::Settings;
    use crate::error::{ErrorResponse, OdisError, OdisResult};
    use crate::odis::crypto::Ed25519QuorumCombiner;
    use crate::odis::types::KeyVersion;
    use crate::odis::{SignerEndpoint, SignerReply, SignerTransport};

    /// Every signer answers with the same canned reply.
    struct CannedTransport(SignerReply);

    #[async_trait]
    impl SignerTransport for CannedTransport {
        fn signer_count(&self) -> usize {
            3
        }

        async fn call(
            &self,
            _signer: usize,
            _endpoint: SignerEndpoint,
            _key_version: KeyVersion,
            _body: &Value,
        ) -> OdisResult<SignerReply> {
            Ok(self.0.clone())
        }
    }

    fn combiner(reply: SignerReply) -> web::Data<Combiner> {
        let keys = Settings::for_combiner_tests().signer_pubkeys().to_vec();
        let crypto = Ed25519QuorumCombiner::from_hex(&keys, 2).unwrap();
        web::Data::new(
            Combiner::new(
                Arc::new(CannedTransport(reply)),
                Arc::new(crypto),
                2,
                1,
                Duration::from_millis(200),
            )
            .unwrap(),
        )
    }

    fn domain_body() -> Value {
        serde_json::json!({
            "domain": {
                "name": "ODIS Sequential Delay Domain",
                "version": "1",
                "stages": [{ "delay": 0 }],
            },
            "blindedMessage": "AAAA",
            "timestamp": 1_700_000_000u64,
        })
    }

    #[actix_rt::test]
    async fn test_rate_limited_signers_surface_as_429() {
        let combiner = combiner(SignerReply::RateLimited {
            not_before: Some(1_700_000_060),
        });
        let app = test::init_service(App::new().app_data(combiner).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(domain_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.not_before, Some(1_700_000_060));
        assert!(body.retryable);
    }

    #[actix_rt::test]
    async fn test_disabled_signers_surface_as_403() {
        let combiner = combiner(SignerReply::Disabled);
        let app = test::init_service(App::new().app_data(combiner).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(domain_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_rt::test]
    async fn test_matchmaking_is_unmapped() {
        let combiner = combiner(SignerReply::Disabled);
        let app = test::init_service(App::new().app_data(combiner).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/getContactMatches")
            .set_json(serde_json::json!({}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(
            body.code.as_deref(),
            OdisError::UnmappedEndpoint(String::new()).error_code()
        );
    }

    #[actix_rt::test]
    async fn test_invalid_domain_is_rejected_locally() {
        let combiner = combiner(SignerReply::Disabled);
        let app = test::init_service(App::new().app_data(combiner).configure(configure)).await;

        let mut body = domain_body();
        body["domain"]["name"] = "Something Else".into();
        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
