//! External prerequisites resolved before an image build runs
//!
//! An app declares at most one dependency strategy. Git and script
//! failures fail the owning build; release download failures abort the run.

pub mod driver;
pub mod git;
pub mod release;
pub mod script;

use std::path::{Path, PathBuf};

use git::GitDependency;
use release::{ReleaseDependency, ReleaseHost};
use script::ScriptDependency;

pub use driver::{DriverResolver, HostDriverResolver};

/// The dependency strategy selected for one descriptor at parse time
#[derive(Debug, Clone)]
pub enum DependencyStrategy {
    Git(Vec<GitDependency>),
    Scripts(Vec<ScriptDependency>),
    Releases(Vec<ReleaseDependency>),
}

/// Everything a strategy needs besides its own entries
pub struct ResolveContext<'a> {
    pub build_dir: &'a Path,
    pub fail_on_script_error: bool,
    pub releases: &'a dyn ReleaseHost,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("git dependency {remote_url} ({local_path}): {reason}")]
    Git {
        remote_url: String,
        local_path: PathBuf,
        reason: String,
    },

    #[error("dependency scripts failed: {}", .failed.join(", "))]
    Scripts { failed: Vec<String> },

    #[error("release dependency {repo}@{release}: {reason}")]
    Release {
        repo: String,
        release: String,
        reason: String,
    },

    #[error("GPU driver: {reason}")]
    Driver { reason: String, fatal: bool },
}

impl ResolveError {
    /// Fatal errors abort the whole run instead of just the owning build
    pub fn is_fatal(&self) -> bool {
        match self {
            ResolveError::Git { .. } | ResolveError::Scripts { .. } => false,
            ResolveError::Release { .. } => true,
            ResolveError::Driver { fatal, .. } => *fatal,
        }
    }
}

impl DependencyStrategy {
    /// Config key the strategy was declared under
    pub fn kind(&self) -> &'static str {
        match self {
            DependencyStrategy::Git(_) => "git",
            DependencyStrategy::Scripts(_) => "scripts",
            DependencyStrategy::Releases(_) => "github_releases",
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            DependencyStrategy::Git(entries) => entries.len(),
            DependencyStrategy::Scripts(entries) => entries.len(),
            DependencyStrategy::Releases(entries) => entries.len(),
        }
    }

    /// Static checks run when the descriptor is loaded
    pub fn validate(&self) -> Result<(), String> {
        match self {
            DependencyStrategy::Git(entries) => entries.iter().try_for_each(GitDependency::validate),
            DependencyStrategy::Scripts(_) => Ok(()),
            DependencyStrategy::Releases(entries) => {
                entries.iter().try_for_each(ReleaseDependency::validate)
            }
        }
    }

    pub fn resolve(&self, ctx: &ResolveContext) -> Result<(), ResolveError> {
        match self {
            DependencyStrategy::Git(entries) => git::resolve_git_dependencies(entries, ctx.build_dir),
            DependencyStrategy::Scripts(entries) => {
                script::resolve_script_dependencies(entries, ctx.build_dir, ctx.fail_on_script_error)
            }
            DependencyStrategy::Releases(entries) => {
                release::resolve_release_dependencies(entries, ctx.build_dir, ctx.releases)
            }
        }
    }
}

/// Resolve a configured path against the build directory, expanding `~`
pub(crate) fn resolve_in_build_dir(build_dir: &Path, path: &str) -> PathBuf {
    let expanded = crate::config::expand_path(path);
    if expanded.is_absolute() {
        expanded
    } else {
        build_dir.join(expanded)
    }
}
