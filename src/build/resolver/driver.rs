//! Host GPU driver staged into the build context

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::ResolveError;
use crate::config::AppConfig;
use crate::utils;

pub const NVIDIA_DOWNLOAD_BASE: &str = "https://us.download.nvidia.com/XFree86/Linux-x86_64";
pub const STAGED_DRIVER: &str = "nvidia-driver.run";

/// Makes the host's GPU driver available to an image build
pub trait DriverResolver {
    fn resolve(&self, build_dir: &Path) -> Result<(), ResolveError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Other(String),
}

/// Resolves drivers for the GPU of the machine running the build
pub struct HostDriverResolver {
    cache_dir: PathBuf,
}

impl HostDriverResolver {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.driver_cache.clone())
    }
}

impl DriverResolver for HostDriverResolver {
    fn resolve(&self, build_dir: &Path) -> Result<(), ResolveError> {
        match detect_gpu_vendor() {
            Some(GpuVendor::Nvidia) => {
                let version = loaded_nvidia_version()?;
                utils::print_message(&format!(
                    "Host runs NVIDIA driver {}",
                    utils::style_number(&version)
                ));
                stage_nvidia_driver(&version, &self.cache_dir, build_dir, download)?;
                Ok(())
            }
            Some(GpuVendor::Other(vendor)) => {
                utils::print_debug(&format!("No driver handling for GPU vendor {}", vendor));
                Ok(())
            }
            None => {
                utils::print_debug("No GPU vendor detected, skipping driver resolution");
                Ok(())
            }
        }
    }
}

/// Vendor of the first display controller listed by `lspci -v`
pub fn parse_gpu_vendor(lspci: &str) -> Option<GpuVendor> {
    let re = Regex::new(r"(?m)(?:VGA compatible controller|3D controller): ([A-Za-z]+)").ok()?;
    let vendor = re.captures(lspci)?.get(1)?.as_str().to_lowercase();
    Some(match vendor.as_str() {
        "nvidia" => GpuVendor::Nvidia,
        _ => GpuVendor::Other(vendor),
    })
}

/// `version:` field of `modinfo nvidia`
pub fn parse_nvidia_version(modinfo: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^version:\s+([0-9.]+)").ok()?;
    Some(re.captures(modinfo)?.get(1)?.as_str().to_string())
}

pub fn driver_file_name(version: &str) -> String {
    format!("NVIDIA-Linux-x86_64-{}.run", version)
}

pub fn driver_url(version: &str) -> String {
    format!("{}/{}/{}", NVIDIA_DOWNLOAD_BASE, version, driver_file_name(version))
}

fn detect_gpu_vendor() -> Option<GpuVendor> {
    let output = match Command::new("lspci").arg("-v").output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            utils::print_debug(&format!("lspci exited with {}", output.status));
            return None;
        }
        Err(e) => {
            utils::print_debug(&format!("Unable to run lspci: {}", e));
            return None;
        }
    };
    parse_gpu_vendor(&String::from_utf8_lossy(&output.stdout))
}

fn loaded_nvidia_version() -> Result<String, ResolveError> {
    let fail = |reason: String| ResolveError::Driver { reason, fatal: false };

    let output = Command::new("modinfo")
        .arg("nvidia")
        .output()
        .map_err(|e| fail(format!("unable to run modinfo: {}", e)))?;
    if !output.status.success() {
        return Err(fail(format!(
            "modinfo nvidia failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_nvidia_version(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| fail("modinfo nvidia did not report a version".to_string()))
}

/// Ensure the installer for `version` is cached and copied to
/// `<build_dir>/files/nvidia-driver.run`. Returns true when the staged
/// copy changed.
pub fn stage_nvidia_driver<F>(
    version: &str,
    cache_dir: &Path,
    build_dir: &Path,
    fetch: F,
) -> Result<bool, ResolveError>
where
    F: Fn(&str, &Path) -> Result<(), String>,
{
    let fail = |reason: String| ResolveError::Driver { reason, fatal: false };

    fs::create_dir_all(cache_dir)
        .map_err(|e| fail(format!("unable to create {}: {}", cache_dir.display(), e)))?;
    let cached = cache_dir.join(driver_file_name(version));

    if !cached.exists() {
        let url = driver_url(version);
        utils::print_message(&format!("Pulling driver {}", utils::style_number(version)));
        fetch(&url, &cached).map_err(|e| ResolveError::Driver {
            reason: format!("unable to download {}: {}", url, e),
            fatal: true,
        })?;
    }

    let files_dir = build_dir.join("files");
    fs::create_dir_all(&files_dir)
        .map_err(|e| fail(format!("unable to create {}: {}", files_dir.display(), e)))?;
    let staged = files_dir.join(STAGED_DRIVER);

    if staged.exists() {
        let cached_sum = utils::sha256_file(&cached)
            .map_err(|e| fail(format!("unable to hash {}: {}", cached.display(), e)))?;
        let staged_sum = utils::sha256_file(&staged)
            .map_err(|e| fail(format!("unable to hash {}: {}", staged.display(), e)))?;
        utils::print_debug(&format!("sha256 of cached driver: {}", cached_sum));
        utils::print_debug(&format!("sha256 of staged driver: {}", staged_sum));
        if cached_sum == staged_sum {
            return Ok(false);
        }
    }

    fs::copy(&cached, &staged).map_err(|e| {
        fail(format!("unable to copy {} to {}: {}", cached.display(), staged.display(), e))
    })?;
    utils::print_success(&format!(
        "Staged driver {} in {}",
        utils::style_number(version),
        utils::style_path(&files_dir.to_string_lossy())
    ));
    Ok(true)
}

fn download(url: &str, dest: &Path) -> Result<(), String> {
    let response = ureq::get(url)
        .timeout(Duration::from_secs(600))
        .call()
        .map_err(|e| e.to_string())?;

    utils::save_download(&mut response.into_reader(), dest).map_err(|e| e.to_string())
}
