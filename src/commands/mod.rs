//! Subcommand implementations.
//!
//! Each module holds its own arguments and handler.
pub mod build;
pub mod completion;
pub mod config;
pub mod order;
