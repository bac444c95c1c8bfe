//! lm-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for the other linkmirror
//! crates. It provides type-safe identifiers, a unified error taxonomy, the
//! inventory/change/operation data model, the path filter, the central retry
//! policy, application configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod ids;
pub mod model;
pub mod retry;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use model::*;
pub use retry::RetryPolicy;
