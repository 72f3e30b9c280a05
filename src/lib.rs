pub mod guard;
pub mod limiter;
mod middleware;

pub use guard::{Both, Evaluation, Guard, LimiterGuard};
pub use limiter::config::{ConfigError, LimiterConfig};
pub use limiter::key::{ClientKey, KeyError, KeyFunctionBuilder};
pub use limiter::{Admission, Decision, RateLimiter, RateLimiterBuilder, WindowStatus};
pub use middleware::builder::{HeaderCompatibleOutput, RateLimitBuilder};
pub use middleware::RateLimit;
