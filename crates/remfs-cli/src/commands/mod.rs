//! CLI subcommands

pub mod browse;
pub mod config;
pub mod modify;
pub mod sync;
pub mod upload;
