use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::build::descriptor::{discover_descriptor_files, load_descriptors};
use crate::build::executor::run_schedule;
use crate::build::resolver::release::GithubReleases;
use crate::build::resolver::HostDriverResolver;
use crate::build::{BuildDescriptor, BuildGraph, Builder, DockerCli, RunFlags};
use crate::config::{validate_binary, AppConfig};
use crate::utils;

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(long, help = "Unattended run: only automatic apps, skip images built in the last day")]
    pub auto: bool,
    #[arg(long, help = "Print what would be built without building")]
    pub dry_run: bool,
    #[arg(short, long, help = "Rebuild even if the image is new enough")]
    pub force: bool,
    #[arg(long, help = "Full rebuild: pull base images and skip the layer cache")]
    pub full: bool,
    #[arg(long, help = "Do not use the layer cache")]
    pub no_cache: bool,
    #[arg(long, help = "Always pull newer base images")]
    pub pull: bool,
    #[arg(long, help = "Push images after building")]
    pub push: bool,
    #[arg(short, long, help = "Apply update instructions on top of existing images")]
    pub update: bool,
    #[arg(long, help = "Fail an app when one of its dependency scripts exits non-zero")]
    pub fail_on_script_error: bool,
    #[arg(default_value = ".", help = "App directory holding app_config.yaml and/or configs/")]
    pub path: PathBuf,
}

impl BuildArgs {
    /// `script_policy` is `build.fail_on_script_error` from the base config
    fn run_flags(&self, script_policy: bool) -> RunFlags {
        RunFlags {
            force: self.force,
            dry_run: self.dry_run,
            full: self.full,
            no_cache: self.no_cache,
            pull: self.pull,
            push: self.push,
            update: self.update,
            auto: self.auto,
            fail_on_script_error: self.fail_on_script_error || script_policy,
        }
    }
}

/// Discover and load the descriptors a run works on
pub fn load_run_descriptors(path: &Path, auto: bool, config: &AppConfig) -> Result<Vec<BuildDescriptor>> {
    let files = discover_descriptor_files(path, auto, &config.build.build_dir);
    if files.is_empty() {
        let searched = if auto { &config.build.build_dir } else { path };
        anyhow::bail!(
            "No app configs found in {}",
            utils::style_path(&searched.to_string_lossy())
        );
    }
    utils::print_debug(&format!("Found {} app config(s)", files.len()));

    let mut descriptors = load_descriptors(&files)?;
    if auto {
        descriptors.retain(|d| d.automatic);
        utils::print_debug(&format!(
            "{} app config(s) are marked automatic",
            descriptors.len()
        ));
    }
    Ok(descriptors)
}

pub fn handle_build(args: &BuildArgs, config: &AppConfig) -> Result<()> {
    let descriptors = load_run_descriptors(&args.path, args.auto, config)?;
    if descriptors.is_empty() {
        utils::print_warning("Nothing to build");
        return Ok(());
    }

    let graph = BuildGraph::from_descriptors(&descriptors);
    let order = graph.topological_order()?;

    utils::print_message(&format!(
        "Build order: {}",
        order
            .iter()
            .map(|d| utils::style_name(&d.full_image_name()))
            .collect::<Vec<_>>()
            .join(" -> ")
    ));

    if !args.dry_run && !validate_binary(&config.docker_bin) {
        anyhow::bail!(
            "Cannot find docker at {}. Set docker_bin in {}",
            config.docker_bin.display(),
            AppConfig::get_user_config_path()?.display()
        );
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            utils::print_warning("Interrupt received, stopping after the current image (again to abort)");
        })
        .context("Failed to install interrupt handler")?;
    }

    let engine = DockerCli::from_config(config);
    let releases = GithubReleases::from_config(config);
    let drivers = HostDriverResolver::from_config(config);
    let builder = Builder::new(
        &engine,
        &releases,
        &drivers,
        args.run_flags(config.build.fail_on_script_error),
        config.build.always_push,
    );

    let summary = run_schedule(&builder, &graph, &order, &interrupted)?;
    summary.print();

    if summary.interrupted {
        anyhow::bail!("Build interrupted");
    }
    if summary.has_failures() {
        anyhow::bail!("Failed to build: {}", summary.failed().join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: BuildArgs,
    }

    #[test]
    fn test_flags_merge_config_policy() {
        let parsed = Wrapper::parse_from(["dxbuild", "--full", "--push", "apps/game"]);
        assert_eq!(parsed.args.path, PathBuf::from("apps/game"));

        let flags = parsed.args.run_flags(true);

        assert!(flags.full && flags.push && !flags.auto);
        assert!(flags.pull_base() && flags.skip_cache());
        assert!(flags.fail_on_script_error);
        assert!(!parsed.args.run_flags(false).fail_on_script_error);
    }
}
