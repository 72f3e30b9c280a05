use crate::limiter::key::{ClientKey, KeyError};
use crate::limiter::{Admission, Decision, RateLimiter, WindowStatus};
use actix_web::dev::ServiceRequest;
use actix_web::rt::time::Instant;
use std::rc::Rc;

/// The outcome of evaluating a [Guard] against a request.
pub struct Evaluation {
    /// Admitted only if every limiter consulted admitted.
    pub decision: Decision,
    /// Quota of the most constrained limiter consulted, or of the rejecting limiter.
    pub status: WindowStatus,
    admissions: Vec<Admission>,
}

impl Evaluation {
    /// Rolls back every admission recorded during the evaluation, returning how many applied.
    pub fn rollback(self) -> usize {
        self.admissions
            .into_iter()
            .map(Admission::rollback)
            .filter(|rolled_back| *rolled_back)
            .count()
    }

    fn then(mut self, next: Evaluation) -> Evaluation {
        self.admissions.extend(next.admissions);
        let status = if next.decision.is_rejected() || next.status.remaining < self.status.remaining
        {
            next.status
        } else {
            self.status
        };
        Evaluation {
            decision: next.decision,
            status,
            admissions: self.admissions,
        }
    }
}

/// Decides whether a request may proceed.
///
/// Guards compose with [Guard::and]; the composite admits only if both sides admit.
pub trait Guard {
    fn evaluate(&self, req: &ServiceRequest, now: Instant) -> Result<Evaluation, KeyError>;

    fn and<G>(self, other: G) -> Both<Self, G>
    where
        Self: Sized,
        G: Guard,
    {
        Both(self, other)
    }
}

impl<G: Guard + ?Sized> Guard for Rc<G> {
    fn evaluate(&self, req: &ServiceRequest, now: Instant) -> Result<Evaluation, KeyError> {
        (**self).evaluate(req, now)
    }
}

impl<G: Guard + ?Sized> Guard for Box<G> {
    fn evaluate(&self, req: &ServiceRequest, now: Instant) -> Result<Evaluation, KeyError> {
        (**self).evaluate(req, now)
    }
}

/// A [RateLimiter] paired with the function that derives its [ClientKey].
#[derive(Clone)]
pub struct LimiterGuard<F> {
    limiter: RateLimiter,
    key_fn: F,
}

impl<F> LimiterGuard<F>
where
    F: Fn(&ServiceRequest) -> Result<ClientKey, KeyError>,
{
    pub fn new(limiter: RateLimiter, key_fn: F) -> Self {
        Self { limiter, key_fn }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

impl<F> Guard for LimiterGuard<F>
where
    F: Fn(&ServiceRequest) -> Result<ClientKey, KeyError>,
{
    fn evaluate(&self, req: &ServiceRequest, now: Instant) -> Result<Evaluation, KeyError> {
        let key = (self.key_fn)(req)?;
        let (decision, status, admission) = self.limiter.request(&key, now);
        Ok(Evaluation {
            decision,
            status,
            admissions: admission.into_iter().collect(),
        })
    }
}

/// Two guards evaluated in order, short-circuiting on the first rejection.
///
/// If the second guard rejects, the first guard's admission still counts. If the second guard
/// cannot derive a key, the first guard's admission is rolled back.
#[derive(Clone)]
pub struct Both<A, B>(A, B);

impl<A: Guard, B: Guard> Guard for Both<A, B> {
    fn evaluate(&self, req: &ServiceRequest, now: Instant) -> Result<Evaluation, KeyError> {
        let first = self.0.evaluate(req, now)?;
        if first.decision.is_rejected() {
            return Ok(first);
        }
        let second = match self.1.evaluate(req, now) {
            Ok(second) => second,
            Err(e) => {
                first.rollback();
                return Err(e);
            }
        };
        Ok(first.then(second))
    }
}
