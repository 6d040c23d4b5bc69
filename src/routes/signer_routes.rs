//! Signer-specific HTTP endpoints.
//!
//! These endpoints are exposed by signer instances and called by the combiner.
//! Storage work runs on the blocking pool so the redb transactions never stall
//! the actix workers.

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, ResponseError, web};

use crate::error::{OdisError, OdisResult};
use crate::odis::signer_logic::{SignerService, Signed};
use crate::odis::types::{
    DisableDomainRequest, DomainQuotaStatusRequest, DomainSignRequest, KeyVersion,
    SignMessageRequest,
};
use crate::odis::{KEY_VERSION_HEADER, SignerEndpoint};

/// Key version requested through the header, if any.
fn requested_key_version(req: &HttpRequest) -> OdisResult<Option<KeyVersion>> {
    let Some(value) = req.headers().get(KEY_VERSION_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| {
            OdisError::InvalidKeyVersion(format!("{KEY_VERSION_HEADER} header is not a number"))
        })
}

async fn blocking<T, F>(signer: &web::Data<SignerService>, f: F) -> OdisResult<T>
where
    F: FnOnce(&SignerService) -> OdisResult<T> + Send + 'static,
    T: Send + 'static,
{
    let signer: Arc<SignerService> = signer.clone().into_inner();
    web::block(move || f(&signer))
        .await
        .map_err(|e| OdisError::Internal(format!("blocking task failed: {e}")))?
}

fn signed_response<T: serde::Serialize>(result: OdisResult<Signed<T>>) -> HttpResponse {
    match result {
        Ok(signed) => HttpResponse::Ok()
            .insert_header((KEY_VERSION_HEADER, signed.key_version.to_string()))
            .json(signed.response),
        Err(e) => e.error_response(),
    }
}

/// POST /domain/sign
///
/// Partial signature under the domain's sequential-delay quota.
#[tracing::instrument(skip(signer, req, request), fields(signer_id = %signer.signer_id(), session_id = ?request.session_id))]
pub async fn domain_sign(
    signer: web::Data<SignerService>,
    req: HttpRequest,
    request: web::Json<DomainSignRequest>,
) -> HttpResponse {
    let key_version = match requested_key_version(&req) {
        Ok(v) => v,
        Err(e) => return e.error_response(),
    };
    let request = request.into_inner();

    let result = blocking(&signer, move |s| s.domain_sign(&request, key_version)).await;
    if let Err(e) = &result
        && e.status_code().is_server_error()
    {
        tracing::error!(error = %e, "Domain signing failed");
    }
    signed_response(result)
}

/// POST /domain/quotaStatus
#[tracing::instrument(skip(signer, request), fields(signer_id = %signer.signer_id(), session_id = ?request.session_id))]
pub async fn domain_quota_status(
    signer: web::Data<SignerService>,
    request: web::Json<DomainQuotaStatusRequest>,
) -> HttpResponse {
    let request = request.into_inner();
    match blocking(&signer, move |s| s.domain_quota_status(&request)).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => e.error_response(),
    }
}

/// POST /domain/disable
#[tracing::instrument(skip(signer, request), fields(signer_id = %signer.signer_id(), session_id = ?request.session_id))]
pub async fn disable_domain(
    signer: web::Data<SignerService>,
    request: web::Json<DisableDomainRequest>,
) -> HttpResponse {
    let request = request.into_inner();
    match blocking(&signer, move |s| s.disable_domain(&request)).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => {
            tracing::error!(error = %e, "Disabling domain failed");
            e.error_response()
        }
    }
}

/// POST /getBlindedMessagePartialSig
///
/// Partial signature over a blinded phone number, charged to the account.
#[tracing::instrument(skip(signer, req, request), fields(signer_id = %signer.signer_id(), session_id = ?request.session_id))]
pub async fn partial_sign_message(
    signer: web::Data<SignerService>,
    req: HttpRequest,
    request: web::Json<SignMessageRequest>,
) -> HttpResponse {
    let key_version = match requested_key_version(&req) {
        Ok(v) => v,
        Err(e) => return e.error_response(),
    };
    let request = request.into_inner();

    signed_response(blocking(&signer, move |s| s.partial_sign_message(&request, key_version)).await)
}

/// Configure signer routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        SignerEndpoint::DomainSign.path(),
        web::post().to(domain_sign),
    )
    .route(
        SignerEndpoint::DomainQuotaStatus.path(),
        web::post().to(domain_quota_status),
    )
    .route(
        SignerEndpoint::DisableDomain.path(),
        web::post().to(disable_domain),
    )
    .route(
        SignerEndpoint::PartialSignMessage.path(),
        web::post().to(partial_sign_message),
    );
}

#[cfg(test)]
mod tests {
    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

    use super::*;
    use crate::clock::MockClock;
    use crate::domain::{SequentialDelayDomain, SequentialDelayStage};
    use crate::error::ErrorResponse;
    use crate::odis::crypto::Ed25519Keyring;
    use crate::odis::signer_logic::SignerPolicy;
    use crate::odis::types::{DomainQuotaStatusResponse, DomainSignResponse};
    use crate::routes::json_config;
    use crate::storage::Storage;

    const NOW: u64 = 1_700_000_000;

    fn service() -> web::Data<SignerService> {
        let keyring = Ed25519Keyring::from_seeds([(1, [1; 32]), (2, [9; 32])]).unwrap();
        web::Data::new(SignerService::new(
            "signer-1".to_string(),
            Arc::new(Storage::open_memory().unwrap()),
            Arc::new(keyring),
            Arc::new(MockClock::new(NOW)),
            SignerPolicy::default(),
        ))
    }

    fn sign_body() -> serde_json::Value {
        serde_json::to_value(DomainSignRequest {
            domain: SequentialDelayDomain::new(vec![
                SequentialDelayStage::new(60).with_repetitions(5),
            ]),
            blinded_message: BASE64.encode(b"blinded"),
            timestamp: NOW,
            session_id: Some("session-1".to_string()),
        })
        .unwrap()
    }

    macro_rules! app {
        ($signer:expr) => {
            test::init_service(
                App::new()
                    .app_data($signer.clone())
                    .app_data(json_config(64 * 1024))
                    .configure(configure),
            )
            .await
        };
    }

    #[actix_rt::test]
    async fn test_domain_sign_sets_key_version_header() {
        let signer = service();
        let app = app!(signer);

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(sign_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(KEY_VERSION_HEADER).unwrap(),
            "2"
        );

        let body: DomainSignResponse = test::read_body_json(resp).await;
        assert!(body.success);
        assert_eq!(body.status.counter, 1);
    }

    #[actix_rt::test]
    async fn test_requested_key_version_is_honoured() {
        let signer = service();
        let app = app!(signer);

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .insert_header((KEY_VERSION_HEADER, "1"))
            .set_json(sign_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.headers().get(KEY_VERSION_HEADER).unwrap(), "1");

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .insert_header((KEY_VERSION_HEADER, "latest"))
            .set_json(sign_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn test_rate_limited_body_carries_not_before() {
        let signer = service();
        let app = app!(signer);

        let first = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(sign_body())
            .to_request();
        assert!(test::call_service(&app, first).await.status().is_success());

        let mut body = sign_body();
        body["blindedMessage"] = BASE64.encode(b"other").into();
        let second = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(body)
            .to_request();
        let resp = test::call_service(&app, second).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let error: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(error.not_before, Some(NOW + 60));
        assert!(error.status.is_some());
    }

    #[actix_rt::test]
    async fn test_disable_then_status() {
        let signer = service();
        let app = app!(signer);
        let domain = serde_json::json!({
            "domain": sign_body()["domain"].clone(),
        });

        let req = test::TestRequest::post()
            .uri("/domain/disable")
            .set_json(&domain)
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::post()
            .uri("/domain/quotaStatus")
            .set_json(&domain)
            .to_request();
        let body: DomainQuotaStatusResponse =
            test::read_body_json(test::call_service(&app, req).await).await;
        assert!(body.status.disabled);

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .set_json(sign_body())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_rt::test]
    async fn test_malformed_json_is_structured_bad_request() {
        let signer = service();
        let app = app!(signer);

        let req = test::TestRequest::post()
            .uri("/domain/sign")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let error: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(error.code.as_deref(), Some("INVALID_INPUT"));
    }
}
