//! Content adapter: the seam where site-specific selectors and JSON-shape
//! transforms live. The executor only sees the narrow `ContentAdapter`
//! contract and the listing schema check.

pub mod adapter;
pub mod schema;
pub mod transform;

pub use adapter::{AdapterOutcome, ContentAdapter, ScriptAdapter};
pub use schema::validate_listing;
pub use transform::{transform_captured, transformer_labels};

/// Site tag stamped on streamed records; lives here with the rest of the
/// target-specific knowledge.
pub const RECORD_SOURCE: &str = "etsy";
