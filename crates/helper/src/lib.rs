//! Helper binary shipped into biz containers
//!
//! The library half is shared with the agent: [`protocol`] defines the wire
//! types both sides speak, while [`commands`] and [`proxy`] hold the
//! in-container implementations used by the `cric-helper` binary.

pub mod commands;
pub mod protocol;
pub mod proxy;

pub use protocol::{commands as command_names, Envelope};
