//! Database query modules.

pub mod cursors;
pub mod dead_letters;
pub mod inventory;
pub mod maintenance;
pub mod operations;
