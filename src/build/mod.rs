//! Build orchestration: descriptors, dependency graph, resolvers and execution

pub mod descriptor;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod resolver;

pub use descriptor::BuildDescriptor;
pub use engine::{DockerCli, ImageEngine};
pub use executor::{Builder, Outcome, RunFlags, RunSummary, SkipReason};
pub use graph::BuildGraph;

use std::path::PathBuf;

/// Error types for descriptor loading and scheduling
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to read app config {path}: {source}")]
    ReadDescriptor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid app config {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },

    #[error("The app configs have a circular dependency: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
}

impl BuildError {
    pub(crate) fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        BuildError::InvalidDescriptor {
            path: path.into(),
            message: message.into(),
        }
    }
}
