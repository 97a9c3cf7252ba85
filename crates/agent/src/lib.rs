//! Node agent wiring for the container runtime interaction core
//!
//! The binary in `main.rs` builds the services; the admin API and
//! configuration live here so integration tests can drive them directly.

pub mod api;
pub mod config;
