//! Distributed rate limiting for the examgate backend.
//!
//! Counters live in the same remote store as the cache (under the `rl`
//! prefix) so every instance enforces one shared budget per client. The
//! remote store being down never blocks a request.

pub mod abuse;
pub mod adaptive;
pub mod counter;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod middleware;
pub mod registry;
pub mod slowdown;

pub use abuse::{AbuseDetector, AbuseVerdict};
pub use adaptive::AdaptiveLimiter;
pub use counter::{WindowCounter, WindowHit};
pub use error::RateLimitError;
pub use limiter::{Allowance, DistributedRateLimiter, RateDecision};
pub use middleware::{Rejection, RouteRateLimit, rate_limit_middleware};
pub use registry::{RateLimiters, start_abuse_pruner};
pub use slowdown::SlowDown;
