use crate::guard::Guard;
use crate::limiter::WindowStatus;
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimit, RollbackCondition};
use actix_web::http::header::{ContentType, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct RateLimitBuilder<G> {
    guard: G,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<G: Guard + 'static> RateLimitBuilder<G> {
    pub(super) fn new(guard: G) -> Self {
        Self {
            guard,
            allowed_transformation: None,
            denied_response: Rc::new(|message: &str, _: &WindowStatus| {
                too_many_requests(message)
            }),
            rollback_condition: None,
        }
    }

    /// Sets the [RateLimitBuilder::request_allowed_transformation] and
    /// [RateLimitBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    ///
    /// The denied response keeps the rejection message as its body.
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, status: &WindowStatus, rolled_back: bool| {
                let remaining = if rolled_back {
                    (status.remaining() + 1).min(status.limit())
                } else {
                    status.remaining()
                };
                map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
                map.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
                map.insert(
                    X_RATELIMIT_RESET.clone(),
                    HeaderValue::from(status.seconds_until_reset()),
                );
            },
        ));
        self.denied_response = Rc::new(|message: &str, status: &WindowStatus| {
            let mut response = too_many_requests(message);
            let map = response.headers_mut();
            map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
            map.insert(
                X_RATELIMIT_REMAINING.clone(),
                HeaderValue::from(status.remaining()),
            );
            let seconds = status.seconds_until_reset();
            map.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(seconds));
            map.insert(RETRY_AFTER, HeaderValue::from(seconds));
            response
        });
        self
    }

    /// In the event that the request is admitted:
    ///
    /// You can optionally mutate the response headers to include the rate limit status. The
    /// final argument is true if the request was rolled back.
    ///
    /// By default no changes are made to the response.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, &WindowStatus, bool) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is rejected, configure the [HttpResponse] returned.
    ///
    /// Defaults to status 429 with the rejection message as a plain text body.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&str, &WindowStatus) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the request count based on the status code
    /// of the returned response.
    ///
    /// By default the count is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [RateLimitBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimit<G> {
        RateLimit {
            guard: Rc::new(self.guard),
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn too_many_requests(message: &str) -> HttpResponse {
    HttpResponse::TooManyRequests()
        .content_type(ContentType::plaintext())
        .body(message.to_owned())
}

/// A trait that a limiter output should implement in order to use the
/// [RateLimitBuilder::add_headers] function.
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
