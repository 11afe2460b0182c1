//! The command execution engine: admission control at the queue edge, a
//! single-consumer drain loop, per-verb handlers with nested sub-action
//! dispatch, and the scenario-level search-task driver.

pub mod events;
pub mod executor;
mod search;

pub use events::CoreEvent;
pub use executor::{Executor, NAVIGATION_TIMEOUT};
