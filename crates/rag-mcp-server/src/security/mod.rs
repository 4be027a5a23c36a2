pub mod identity;
pub mod rate_limit;
pub mod threat;

pub use identity::{client_ip, Identity, IdentityKind, IdentityResolver, Plan};
pub use rate_limit::{RateDecision, RateLimitDenial, RateLimiter};
pub use threat::ThreatDetector;
