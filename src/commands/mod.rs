//! CLI command implementations

pub mod flash;
