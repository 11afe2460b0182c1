//! Admission control applied before a command reaches the queue: a sliding
//! per-minute rate window and an origin allow-list gate.

pub mod domain;
pub mod rate;

pub use domain::allowed;
pub use rate::RateLimiter;
