//! Command handlers, one module per top-level subcommand

pub mod containers;
pub mod health;
pub mod pods;
pub mod portforward;
