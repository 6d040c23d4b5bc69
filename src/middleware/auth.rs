//! Internal authentication middleware.
//!
//! Enforces INTERNAL_SERVICE_TOKEN when required (production). Signers only
//! expose health endpoints publicly; the combiner additionally serves its
//! client signing and status endpoints without a token.

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::{Error, ResponseError};
use futures_util::future::{LocalBoxFuture, Ready, ready};

use crate::config::{Role, Settings};
use crate::error::OdisError;
use crate::odis::CombinerEndpoint;

const HEALTH_PATHS: [&str; 2] = ["/health", "/build-info"];

const COMBINER_CLIENT_PATHS: [&str; 3] = [
    CombinerEndpoint::SignMessage.path(),
    CombinerEndpoint::DomainSign.path(),
    CombinerEndpoint::DomainQuotaStatus.path(),
];

/// Middleware enforcing internal service token authentication.
#[derive(Clone)]
pub struct InternalAuth {
    required: bool,
    token: Option<String>,
    role: Role,
}

impl InternalAuth {
    /// Build from service settings.
    pub fn new(settings: &Settings) -> Self {
        Self {
            required: settings.internal_token_required(),
            token: settings.internal_token().map(ToString::to_string),
            role: settings.role(),
        }
    }

    /// Build directly from config (used for tests).
    pub fn from_config(role: Role, required: bool, token: Option<String>) -> Self {
        Self {
            required,
            token,
            role,
        }
    }

    fn is_public_path(role: Role, path: &str) -> bool {
        HEALTH_PATHS.contains(&path)
            || (role == Role::Combiner && COMBINER_CLIENT_PATHS.contains(&path))
    }

    fn extract_token(req: &ServiceRequest) -> Option<String> {
        let headers = req.headers();

        if let Some(value) = headers.get("authorization")
            && let Ok(value) = value.to_str()
            && let Some(token) = value.strip_prefix("Bearer ")
        {
            return Some(token.trim().to_string());
        }

        if let Some(value) = headers.get("x-internal-token")
            && let Ok(value) = value.to_str()
        {
            return Some(value.trim().to_string());
        }

        None
    }
}

impl<S, B> Transform<S, ServiceRequest> for InternalAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = InternalAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(InternalAuthMiddleware {
            service,
            auth: self.clone(),
        }))
    }
}

pub struct InternalAuthMiddleware<S> {
    service: S,
    auth: InternalAuth,
}

impl<S, B> Service<ServiceRequest> for InternalAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !InternalAuth::is_public_path(self.auth.role, req.path()) {
            let provided = InternalAuth::extract_token(&req);
            let expected = self.auth.token.as_deref();

            let authorized = if self.auth.required {
                expected.is_some_and(|expected| provided.as_deref() == Some(expected))
            } else if let (Some(expected), Some(provided)) = (expected, provided.as_deref()) {
                provided == expected
            } else {
                true
            };

            if !authorized {
                tracing::warn!(path = %req.path(), "Rejected unauthenticated internal request");
                let (req, _pl) = req.into_parts();
                let response = OdisError::Unauthorized.error_response();
                return Box::pin(async move {
                    Ok(ServiceResponse::new(req, response.map_into_right_body()))
                });
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}
