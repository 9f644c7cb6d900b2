//! Subcommand implementations.

pub mod mount;
pub mod render;
pub mod stats;
pub mod validate;
pub mod warm_index;
