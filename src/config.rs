use anyhow::{Context, Result};
use config as config_crate;
use config_crate::{Config as ConfigLoader, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_FILENAME: &str = "config";
pub const CONFIG_TYPE: &str = "yaml";
pub const BASE_CONFIG_FILENAME: &str = "base_config.yaml";
/// Directory the desktop launcher keeps its base configuration in
pub const LEGACY_CONFIG_DIR: &str = ".py-docker-x11";
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const ENV_PREFIX: &str = "DXBUILD";

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root scanned for descriptors during `--auto` runs
    pub build_dir: PathBuf,
    pub always_push: bool,
    pub fail_on_script_error: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub debug: bool,
    pub version: &'static str,
    pub docker_bin: PathBuf,
    /// Daemon address handed to the docker CLI as DOCKER_HOST
    pub docker_socket: Option<String>,
    pub driver_cache: PathBuf,
    pub github_api_url: String,
    pub github_token: Option<String>,
    pub build: BuildConfig,
    /// Config files that existed and were merged, lowest priority first
    pub sources: Vec<PathBuf>,
}

/// Serializable config structure for `config init`
#[derive(Debug, Serialize, Deserialize)]
struct SaveableConfig {
    docker_bin: String,
    docker_socket: Option<String>,
    build: SaveableBuildConfig,
    app_dirs: SaveableAppDirs,
    github: SaveableGithub,
}

#[derive(Debug, Serialize, Deserialize)]
struct SaveableBuildConfig {
    build_dir: String,
    always_push: bool,
    fail_on_script_error: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SaveableAppDirs {
    driver_cache: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SaveableGithub {
    api_url: String,
}

impl AppConfig {
    pub fn new(debug: bool) -> Result<Self> {
        let mut builder = ConfigLoader::builder().set_default("debug", false)?;
        let mut sources = Vec::new();

        for path in candidate_config_files() {
            if path.exists() {
                sources.push(path.clone());
            }
            if let Some(path_str) = path.to_str() {
                builder = builder
                    .add_source(File::new(path_str, FileFormat::Yaml).required(false));
            }
        }

        // Environment variables (highest priority), e.g. DXBUILD_BUILD__ALWAYS_PUSH=true
        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_override("debug", debug)?;

        let settings: Settings = builder
            .build()
            .context("Failed to load base configuration")?
            .try_deserialize()
            .context("Invalid base configuration")?;

        utils::print_debug(&format!("Loaded settings: {:#?}", settings));

        let docker_bin = settings
            .docker_bin
            .map(|p| expand_path(&p))
            .unwrap_or_else(detect_docker_bin);

        let github_token = settings
            .github
            .token
            .or_else(|| env::var("GITHUB_TOKEN").ok())
            .filter(|t| !t.is_empty());

        Ok(Self {
            debug: settings.debug,
            version: VERSION,
            docker_bin,
            docker_socket: settings.docker_socket.map(|s| normalize_socket(&s)),
            driver_cache: expand_path(&settings.app_dirs.driver_cache),
            github_api_url: settings.github.api_url.trim_end_matches('/').to_string(),
            github_token,
            build: BuildConfig {
                build_dir: expand_path(&settings.build.build_dir),
                always_push: settings.build.always_push,
                fail_on_script_error: settings.build.fail_on_script_error,
            },
            sources,
        })
    }

    /// Get user config path (~/.config/dxbuild/config.yaml or ~/.dxbuild/config.yaml)
    pub fn get_user_config_path() -> Result<PathBuf> {
        let file_name = format!("{}.{}", CONFIG_FILENAME, CONFIG_TYPE);
        if let Some(config_dir) = dirs::config_dir() {
            Ok(config_dir.join("dxbuild").join(file_name))
        } else if let Some(home) = dirs::home_dir() {
            Ok(home.join(".dxbuild").join(file_name))
        } else {
            anyhow::bail!("Cannot determine user config directory")
        }
    }

    /// Save current config to the user config file
    pub fn save_config(&self) -> Result<PathBuf> {
        let config_path = Self::get_user_config_path()?;
        let config_dir = config_path.parent().context("Invalid config path")?;

        fs::create_dir_all(config_dir).context("Failed to create config directory")?;

        let saveable = SaveableConfig {
            docker_bin: self.docker_bin.to_string_lossy().to_string(),
            docker_socket: self.docker_socket.clone(),
            build: SaveableBuildConfig {
                build_dir: self.build.build_dir.to_string_lossy().to_string(),
                always_push: self.build.always_push,
                fail_on_script_error: self.build.fail_on_script_error,
            },
            app_dirs: SaveableAppDirs {
                driver_cache: self.driver_cache.to_string_lossy().to_string(),
            },
            github: SaveableGithub {
                api_url: self.github_api_url.clone(),
            },
        };

        let config_content =
            serde_yaml::to_string(&saveable).context("Failed to serialize config")?;

        fs::write(&config_path, config_content).context("Failed to write config file")?;

        Ok(config_path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    debug: bool,
    docker_bin: Option<String>,
    docker_socket: Option<String>,
    build: BuildSettings,
    #[serde(alias = "appDirs", alias = "appdirs")]
    app_dirs: AppDirSettings,
    github: GithubSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BuildSettings {
    build_dir: String,
    always_push: bool,
    fail_on_script_error: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            build_dir: format!("~/{}/apps", LEGACY_CONFIG_DIR),
            always_push: false,
            fail_on_script_error: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AppDirSettings {
    driver_cache: String,
}

impl Default for AppDirSettings {
    fn default() -> Self {
        Self {
            driver_cache: format!("~/{}/drivers", LEGACY_CONFIG_DIR),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GithubSettings {
    api_url: String,
    token: Option<String>,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_GITHUB_API.to_string(),
            token: None,
        }
    }
}

/// Config files in merge order, lowest priority first
fn candidate_config_files() -> Vec<PathBuf> {
    let file_name = format!("{}.{}", CONFIG_FILENAME, CONFIG_TYPE);
    let mut files = vec![PathBuf::from("/etc/dxbuild").join(&file_name)];

    if let Some(config_dir) = dirs::config_dir() {
        files.push(config_dir.join("dxbuild").join(&file_name));
    }

    if let Some(home) = dirs::home_dir() {
        files.push(home.join(LEGACY_CONFIG_DIR).join(BASE_CONFIG_FILENAME));
    }

    if let Ok(cwd) = env::current_dir() {
        files.push(cwd.join(BASE_CONFIG_FILENAME));
    }

    files
}

/// Expand `~` and environment variables, keeping the input on failure
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(
        shellexpand::full(path)
            .unwrap_or(std::borrow::Cow::Borrowed(path))
            .to_string(),
    )
}

/// A bare socket path gets the `unix://` scheme the docker CLI expects
pub fn normalize_socket(socket: &str) -> String {
    if socket.contains("://") {
        socket.to_string()
    } else {
        format!("unix://{}", socket)
    }
}

fn detect_docker_bin() -> PathBuf {
    which::which("docker").unwrap_or_else(|_| PathBuf::from("docker"))
}

/// Validate if a binary exists and is executable
pub fn validate_binary(bin_path: &Path) -> bool {
    if bin_path.as_os_str().is_empty() {
        return false;
    }

    if bin_path.is_absolute() {
        if let Ok(metadata) = fs::metadata(bin_path) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                return metadata.is_file() && metadata.permissions().mode() & 0o111 != 0;
            }
            #[cfg(not(unix))]
            return metadata.is_file();
        }
        return false;
    }

    which::which(bin_path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_socket() {
        assert_eq!(
            normalize_socket("/var/run/docker.sock"),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(
            normalize_socket("unix:///var/run/docker.sock"),
            "unix:///var/run/docker.sock"
        );
        assert_eq!(normalize_socket("tcp://10.0.0.2:2375"), "tcp://10.0.0.2:2375");
    }

    #[test]
    fn test_settings_accept_launcher_layout() {
        let yaml = r#"
docker_socket: /var/run/docker.sock
appDirs:
  driver_cache: /srv/drivers
build:
  build_dir: /srv/apps
  always_push: true
container:
  user: player
"#;
        let settings: Settings = ConfigLoader::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.app_dirs.driver_cache, "/srv/drivers");
        assert_eq!(settings.build.build_dir, "/srv/apps");
        assert!(settings.build.always_push);
        assert!(!settings.build.fail_on_script_error);
        assert_eq!(settings.github.api_url, DEFAULT_GITHUB_API);
    }

    #[test]
    fn test_validate_binary_rejects_missing() {
        assert!(!validate_binary(Path::new("")));
        assert!(!validate_binary(Path::new("/definitely/not/here/docker")));
    }
}
