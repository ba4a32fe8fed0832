pub mod dedup;
pub mod limiter;
pub mod middleware;
pub mod sliding_window;

pub use dedup::{fingerprint, RequestParams};
pub use limiter::{
    spawn_sweeper, DuplicateCheck, LimiterConfig, RateLimitResult, RateLimitStats, RejectReason,
    RequestGuard,
};
pub use middleware::{DedupPolicy, Protection, UNKNOWN_CLIENT};
