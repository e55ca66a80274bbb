//! Vendored git sources: clone or refresh, then pin a branch or tag

use regex::Regex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::process::Command;

use super::{resolve_in_build_dir, ResolveError};
use crate::utils;

pub const SYMVER_PATTERN: &str = r"^\d+(\.\d+)*$";

#[derive(Debug, Clone, Deserialize)]
pub struct GitDependency {
    pub local_path: String,
    pub remote_url: String,
    #[serde(default)]
    pub shallow: bool,
    pub branch: Option<String>,
    #[serde(default)]
    pub get_latest_tag_by_date: bool,
    #[serde(default)]
    pub get_latest_tag_by_symver: bool,
    pub tag_regex: Option<String>,
}

impl GitDependency {
    pub fn validate(&self) -> Result<(), String> {
        if self.get_latest_tag_by_date && self.tag_regex.is_none() {
            return Err(format!(
                "git dependency {}: get_latest_tag_by_date requires tag_regex",
                self.remote_url
            ));
        }
        if let Some(pattern) = &self.tag_regex {
            anchored(pattern).map_err(|e| {
                format!("git dependency {}: invalid tag_regex: {}", self.remote_url, e)
            })?;
        }
        Ok(())
    }
}

/// A tag and the commit time of the commit it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    pub committed: i64,
}

/// Match at the start of the tag name only
fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

/// Resolve every entry, stopping at the first one that fails. Work already
/// done for earlier entries is kept.
pub fn resolve_git_dependencies(
    dependencies: &[GitDependency],
    build_dir: &Path,
) -> Result<(), ResolveError> {
    for dependency in dependencies {
        let local_path = resolve_in_build_dir(build_dir, &dependency.local_path);
        resolve_one(dependency, &local_path).map_err(|reason| {
            utils::print_error(&format!(
                "Git dependency {} failed: {}",
                utils::style_name(&dependency.remote_url),
                reason
            ));
            ResolveError::Git {
                remote_url: dependency.remote_url.clone(),
                local_path: local_path.clone(),
                reason,
            }
        })?;
    }

    utils::print_success("Git dependency resolution complete.");
    Ok(())
}

fn resolve_one(dependency: &GitDependency, local_path: &Path) -> Result<(), String> {
    if !local_path.exists() {
        fs::create_dir_all(local_path).map_err(|e| {
            format!("unable to create directory {}: {}", local_path.display(), e)
        })?;
    }

    if !local_path.join(".git").exists() {
        utils::print_message(&format!(
            "Cloning repository {} into {}",
            utils::style_name(&dependency.remote_url),
            utils::style_path(&local_path.to_string_lossy())
        ));
        let target = local_path.to_string_lossy();
        let mut args = vec!["clone"];
        if dependency.shallow {
            args.extend(["--depth", "1"]);
        }
        args.extend([dependency.remote_url.as_str(), &*target]);
        run_git(None, &args).map_err(|e| format!("unable to clone repository: {}", e))?;
    } else {
        utils::print_message(&format!(
            "Pulling existing repository {}",
            utils::style_name(&dependency.remote_url)
        ));
        refresh(local_path).map_err(|e| format!("unable to pull latest commit: {}", e))?;
    }

    update_submodules(local_path)?;

    if let Some(branch) = &dependency.branch {
        run_git(Some(local_path), &["checkout", branch.as_str()]).map_err(|e| {
            format!(
                "unable to check out branch {}, please specify a correct branch in the dependency config: {}",
                branch, e
            )
        })?;
    } else if dependency.get_latest_tag_by_date || dependency.get_latest_tag_by_symver {
        let tags = list_tags(local_path)?;
        let selected = if dependency.get_latest_tag_by_date {
            let pattern = dependency.tag_regex.as_deref().unwrap_or(".*");
            let regex = anchored(pattern).map_err(|e| e.to_string())?;
            latest_tag_by_date(&tags, &regex)
        } else {
            let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
            latest_tag_by_symver(&names)
        };

        let tag = selected.ok_or_else(|| {
            "could not determine latest tag from repository, please check tag_regex".to_string()
        })?;
        utils::print_message(&format!("Checking out tag {}", utils::style_name(&tag)));
        let tag_ref = format!("tags/{}", tag);
        run_git(Some(local_path), &["checkout", tag_ref.as_str()])
            .map_err(|e| format!("unable to check out tag {}: {}", tag, e))?;
    }

    Ok(())
}

/// Fetch tags, switch to the remote default branch and pull
fn refresh(repo: &Path) -> Result<(), String> {
    run_git(Some(repo), &["fetch", "--tags", "origin"])?;
    let branch = default_branch(repo)?;
    run_git(Some(repo), &["checkout", branch.as_str()])?;
    run_git(Some(repo), &["pull", "origin", branch.as_str()])?;
    Ok(())
}

fn default_branch(repo: &Path) -> Result<String, String> {
    let head = match run_git(Some(repo), &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"]) {
        Ok(head) => head,
        Err(_) => {
            run_git(Some(repo), &["remote", "set-head", "origin", "--auto"])?;
            run_git(Some(repo), &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])?
        }
    };
    let head = head.trim();
    Ok(head.strip_prefix("origin/").unwrap_or(head).to_string())
}

/// Initialize and update every submodule. One failing submodule does not
/// stop the others, but fails the dependency.
fn update_submodules(repo: &Path) -> Result<(), String> {
    if !repo.join(".gitmodules").exists() {
        return Ok(());
    }

    let listing = run_git(
        Some(repo),
        &["config", "--file", ".gitmodules", "--get-regexp", r"^submodule\..*\.path$"],
    )
    .unwrap_or_default();

    let mut failed = Vec::new();
    for path in parse_submodule_paths(&listing) {
        if let Err(e) = run_git(Some(repo), &["submodule", "update", "--init", "--recursive", "--", path.as_str()]) {
            utils::print_error(&format!("Unable to update submodule {}: {}", path, e));
            failed.push(path);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("submodules failed to update: {}", failed.join(", ")))
    }
}

/// Paths from `git config --get-regexp submodule.*.path` output
fn parse_submodule_paths(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(_, path)| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

fn list_tags(repo: &Path) -> Result<Vec<TagInfo>, String> {
    let output = run_git(
        Some(repo),
        &[
            "for-each-ref",
            "--format=%(refname:strip=2)%09%(committerdate:unix)%09%(*committerdate:unix)",
            "refs/tags",
        ],
    )?;
    Ok(parse_tag_listing(&output))
}

/// Parse `name<TAB>date<TAB>peeled-date` lines. Annotated tags carry the
/// commit date in the peeled column.
fn parse_tag_listing(output: &str) -> Vec<TagInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let direct = fields.next().unwrap_or("").trim();
            let peeled = fields.next().unwrap_or("").trim();
            if name.is_empty() {
                return None;
            }
            let committed = if peeled.is_empty() { direct } else { peeled };
            Some(TagInfo {
                name: name.to_string(),
                committed: committed.parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Newest matching tag by commit time; ties go to the greatest tag name
pub fn latest_tag_by_date(tags: &[TagInfo], regex: &Regex) -> Option<String> {
    tags.iter()
        .filter(|t| regex.is_match(&t.name))
        .max_by(|a, b| a.committed.cmp(&b.committed).then_with(|| a.name.cmp(&b.name)))
        .map(|t| t.name.clone())
}

/// Highest dotted-numeric tag; ties (`1.2` vs `1.2.0`) go to the greatest tag name
pub fn latest_tag_by_symver(tags: &[&str]) -> Option<String> {
    let symver = Regex::new(SYMVER_PATTERN).ok()?;
    tags.iter()
        .filter(|t| symver.is_match(t))
        .max_by(|a, b| compare_versions(a, b).then_with(|| a.cmp(b)))
        .map(|t| t.to_string())
}

/// Compare dotted integer versions component by component. Missing
/// components count as zero. Components are compared as decimal strings
/// so arbitrarily long numbers never overflow.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();

    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).map(|c| c.trim_start_matches('0')).unwrap_or("");
        let r = right.get(i).map(|c| c.trim_start_matches('0')).unwrap_or("");
        let ord = l.len().cmp(&r.len()).then_with(|| l.cmp(r));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Run git, returning stdout or a readable error
fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, String> {
    utils::print_debug(&format!("Running git {}", args.join(" ")));

    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    let output = cmd
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .map_err(|e| format!("failed to execute git: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git {} failed: {}", args.first().unwrap_or(&""), stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
