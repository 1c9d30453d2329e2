//! CLI commands

pub mod bootstrap;
pub mod version;
