//! linkmirror - keep a symlink mirror of a mounted cloud drive in sync
//!
//! This library crate exposes the service components for integration testing.

pub mod apply;
pub mod config;
pub mod context;
pub mod health;
pub mod maintenance;
pub mod materializer;
pub mod notifications;
pub mod queue;
pub mod reconciler;
pub mod server;
pub mod service;
pub mod sources;
