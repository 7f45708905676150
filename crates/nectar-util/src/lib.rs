//! # nectar-util
//!
//! Support primitives shared by the nectar dedup engine:
//!
//! - [`Counters`] — a process-wide sink for monotonic event counters
//! - [`RateLimiter`] — a token-bucket limiter with blocking and borrow modes
//! - [`LockSet`] — a set of exclusive locks keyed by value
//! - [`StatsFile`] — atomic whole-file replacement for small reports
//!
//! These are deliberately small and dependency-light; the heavy lifting
//! lives in `nectar-hash`.

mod counters;
mod lockset;
mod ratelimit;
mod statsfile;

pub use counters::Counters;
pub use lockset::{LockSet, LockSetGuard};
pub use ratelimit::RateLimiter;
pub use statsfile::StatsFile;
