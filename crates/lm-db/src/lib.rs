//! lm-db: inventory persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, row models, and query modules for the inventory,
//! the durable operation queue, the dead-letter log and resumption cursors.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
