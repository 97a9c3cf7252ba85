//! `cricctl`: operator CLI for the node agent's admin API

pub mod cli;
pub mod client;
pub mod commands;
pub mod output;
