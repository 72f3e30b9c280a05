pub mod builder;

use crate::guard::Guard;
use crate::limiter::{Decision, WindowStatus};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::rt::time::Instant;
use actix_web::{HttpResponse, ResponseError};
use builder::RateLimitBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;

type AllowedTransformation = dyn Fn(&mut HeaderMap, &WindowStatus, bool);
type DeniedResponse = dyn Fn(&str, &WindowStatus) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Rate limit middleware, admitting a request only if its [Guard] does.
pub struct RateLimit<G> {
    guard: Rc<G>,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<G> Clone for RateLimit<G> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<G: Guard + 'static> RateLimit<G> {
    /// # Arguments
    ///
    /// * `guard`: One or more limiters, together with how each derives its key.
    pub fn builder(guard: G) -> RateLimitBuilder<G> {
        RateLimitBuilder::new(guard)
    }
}

impl<S, B, G> Transform<S, ServiceRequest> for RateLimit<G>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    G: Guard + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimitMiddleware<S, G>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitMiddleware {
            service: Rc::new(service),
            guard: self.guard.clone(),
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct RateLimitMiddleware<S, G> {
    service: Rc<S>,
    guard: Rc<G>,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, B, G> Service<ServiceRequest> for RateLimitMiddleware<S, G>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    G: Guard + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let guard = self.guard.clone();
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let evaluation = match guard.evaluate(&req, Instant::now()) {
                Ok(evaluation) => evaluation,
                // Fail closed, a request without a usable key is never admitted
                Err(e) => {
                    log::warn!("Rate limit key extraction failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            if let Decision::Rejected(message) = &evaluation.decision {
                log::debug!("Rejected {} {}: {message}", req.method(), req.path());
                let response = (denied_response)(message, &evaluation.status);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let status = evaluation.status;
            let mut service_response = service.call(req).await?;

            let mut rolled_back = false;
            if let Some(rollback_condition) = rollback_condition {
                let code = service_response.status();
                if rollback_condition(code) {
                    rolled_back = evaluation.rollback() > 0;
                    log::debug!("Rolled back rate limit count for response: {code}");
                }
            }

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), &status, rolled_back);
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
