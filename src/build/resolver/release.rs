//! Release assets downloaded from a GitHub-compatible hosting API

use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use super::{resolve_in_build_dir, ResolveError};
use crate::config::AppConfig;
use crate::utils;

pub const LATEST_RELEASE: &str = "latest";

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDependency {
    /// `owner/name`
    pub repo: String,
    #[serde(default = "default_release")]
    pub release: String,
    pub destination: Option<String>,
    #[serde(default)]
    pub files: Vec<ReleaseFile>,
}

fn default_release() -> String {
    LATEST_RELEASE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseFile {
    /// Regex searched for in asset names
    #[serde(rename = "match")]
    pub pattern: Option<String>,
    /// Exact asset name
    pub name: Option<String>,
    /// Alias created next to the asset, pointing at it
    pub symlink: Option<String>,
}

impl ReleaseDependency {
    pub fn validate(&self) -> Result<(), String> {
        if !self.repo.contains('/') {
            return Err(format!("release dependency {}: repo must be owner/name", self.repo));
        }
        for file in &self.files {
            match (&file.name, &file.pattern) {
                (None, None) => {
                    return Err(format!(
                        "release dependency {}: each file needs `name` or `match`",
                        self.repo
                    ))
                }
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "release dependency {}: a file takes either `name` or `match`, not both",
                        self.repo
                    ))
                }
                (None, Some(pattern)) => {
                    Regex::new(pattern).map_err(|e| {
                        format!("release dependency {}: invalid match pattern: {}", self.repo, e)
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Release metadata and asset downloads
pub trait ReleaseHost {
    /// Metadata for `release` ("latest" or a tag) of `repo`
    fn release(&self, repo: &str, release: &str) -> Result<Release, String>;

    /// Download `url` to `dest`
    fn download(&self, url: &str, dest: &Path) -> Result<(), String>;
}

/// GitHub REST API client
pub struct GithubReleases {
    api_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl GithubReleases {
    pub fn new(api_url: &str, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .user_agent(concat!("dxbuild/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            agent,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.github_api_url, config.github_token.clone())
    }

    pub fn release_url(&self, repo: &str, release: &str) -> String {
        if release == LATEST_RELEASE {
            format!("{}/repos/{}/releases/latest", self.api_url, repo)
        } else {
            format!("{}/repos/{}/releases/tags/{}", self.api_url, repo, release)
        }
    }

    fn get(&self, url: &str, accept: &str) -> Result<ureq::Response, String> {
        let mut request = self.agent.get(url).set("Accept", accept);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        match request.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => Err(format!(
                "HTTP {} {} from {}",
                code,
                response.status_text(),
                url
            )),
            Err(e) => Err(format!("request to {} failed: {}", url, e)),
        }
    }
}

impl ReleaseHost for GithubReleases {
    fn release(&self, repo: &str, release: &str) -> Result<Release, String> {
        let url = self.release_url(repo, release);
        utils::print_debug(&format!("Querying {}", url));
        self.get(&url, "application/vnd.github+json")?
            .into_json::<Release>()
            .map_err(|e| format!("invalid release metadata from {}: {}", url, e))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), String> {
        let response = self.get(url, "application/octet-stream")?;
        utils::save_download(&mut response.into_reader(), dest)
            .map_err(|e| format!("failed to save {}: {}", dest.display(), e))
    }
}

/// First asset (in listed order) satisfying the file rule
pub fn find_asset<'r>(assets: &'r [ReleaseAsset], file: &ReleaseFile) -> Option<&'r ReleaseAsset> {
    if let Some(name) = &file.name {
        return assets.iter().find(|a| &a.name == name);
    }
    let regex = Regex::new(file.pattern.as_deref()?).ok()?;
    assets.iter().find(|a| regex.is_match(&a.name))
}

/// Fetch every requested asset. Any API or download failure is fatal for
/// the run. Assets already on disk are not downloaded again.
pub fn resolve_release_dependencies(
    dependencies: &[ReleaseDependency],
    build_dir: &Path,
    host: &dyn ReleaseHost,
) -> Result<(), ResolveError> {
    for dependency in dependencies {
        let fail = |reason: String| ResolveError::Release {
            repo: dependency.repo.clone(),
            release: dependency.release.clone(),
            reason,
        };

        let destination =
            resolve_in_build_dir(build_dir, dependency.destination.as_deref().unwrap_or("."));
        fs::create_dir_all(&destination).map_err(|e| {
            fail(format!("unable to create {}: {}", destination.display(), e))
        })?;

        utils::print_message(&format!(
            "Resolving release {} of {}",
            utils::style_name(&dependency.release),
            utils::style_name(&dependency.repo)
        ));
        let release = host.release(&dependency.repo, &dependency.release).map_err(&fail)?;
        utils::print_debug(&format!(
            "Release {} of {} is {} with {} asset(s)",
            dependency.release,
            dependency.repo,
            release.tag_name,
            release.assets.len()
        ));

        for file in &dependency.files {
            let wanted = file
                .name
                .as_deref()
                .or(file.pattern.as_deref())
                .unwrap_or_default();
            let asset = find_asset(&release.assets, file)
                .ok_or_else(|| fail(format!("no asset matches {}", wanted)))?;

            let target = destination.join(&asset.name);
            if target.exists() {
                utils::print_debug(&format!(
                    "Asset {} already present, not downloading",
                    utils::style_path(&target.to_string_lossy())
                ));
            } else {
                utils::print_message(&format!(
                    "Downloading {} to {}",
                    utils::style_name(&asset.name),
                    utils::style_path(&destination.to_string_lossy())
                ));
                host.download(&asset.browser_download_url, &target).map_err(&fail)?;
            }

            if let Some(alias) = &file.symlink {
                link_alias(&destination, alias, &asset.name).map_err(&fail)?;
            }
        }
    }

    Ok(())
}

/// Point `destination/alias` at `target_name`, replacing an older link
fn link_alias(destination: &Path, alias: &str, target_name: &str) -> Result<(), String> {
    let alias_path = destination.join(alias);

    if let Ok(meta) = fs::symlink_metadata(&alias_path) {
        if !meta.file_type().is_symlink() {
            return Err(format!(
                "{} exists and is not a symlink, refusing to replace it",
                alias_path.display()
            ));
        }
        fs::remove_file(&alias_path)
            .map_err(|e| format!("unable to remove {}: {}", alias_path.display(), e))?;
    }

    create_link(target_name, &alias_path)
        .map_err(|e| format!("unable to link {} -> {}: {}", alias_path.display(), target_name, e))?;
    utils::print_debug(&format!("Linked {} -> {}", alias_path.display(), target_name));
    Ok(())
}

#[cfg(unix)]
fn create_link(target_name: &str, alias_path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target_name, alias_path)
}

#[cfg(not(unix))]
fn create_link(target_name: &str, alias_path: &Path) -> io::Result<()> {
    let source = alias_path.with_file_name(target_name);
    fs::copy(source, alias_path).map(|_| ())
}
