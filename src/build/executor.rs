//! Per-image build execution and the sequential run over a schedule

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use super::descriptor::BuildDescriptor;
use super::engine::{BuildRequest, DockerfileSource, ImageEngine};
use super::graph::BuildGraph;
use super::resolver::release::ReleaseHost;
use super::resolver::{DriverResolver, ResolveContext, ResolveError};
use crate::utils;

/// Existing images younger than this are not rebuilt by automatic runs
pub const FRESHNESS_WINDOW_SECS: i64 = 85_900;

/// Image label carrying the unrendered app config
pub const APP_CONFIG_LABEL: &str = "pdx-app-config";

/// Conventional overlay Dockerfile in the build directory
pub const UPDATE_DOCKERFILE: &str = "Dockerfile-update";

const DOCKERFILE_VERBS: [&str; 6] = ["FROM", "RUN", "COPY", "ADD", "ENV", "USER"];

/// Command line switches that shape a run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub force: bool,
    pub dry_run: bool,
    pub full: bool,
    pub no_cache: bool,
    pub pull: bool,
    pub push: bool,
    pub update: bool,
    pub auto: bool,
    pub fail_on_script_error: bool,
}

impl RunFlags {
    /// Whether builds refresh their base images
    pub fn pull_base(&self) -> bool {
        self.full || self.pull
    }

    /// Whether builds ignore the layer cache
    pub fn skip_cache(&self) -> bool {
        self.full || self.no_cache || self.auto
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooNew { age_secs: i64 },
    DryRun,
    /// Holds the image whose failure blocked this one
    UpstreamFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Built { pushed: bool },
    Skipped(SkipReason),
    Failed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::TooNew { age_secs } => {
                write!(f, "too new (built {}s ago)", age_secs)
            }
            SkipReason::DryRun => write!(f, "dry run"),
            SkipReason::UpstreamFailed(image) => write!(f, "{} failed", image),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Built { pushed: true } => write!(f, "built and pushed"),
            Outcome::Built { pushed: false } => write!(f, "built"),
            Outcome::Skipped(reason) => write!(f, "skipped, {}", reason),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Builds one descriptor at a time against an image engine
pub struct Builder<'a> {
    engine: &'a dyn ImageEngine,
    releases: &'a dyn ReleaseHost,
    drivers: &'a dyn DriverResolver,
    flags: RunFlags,
    /// `build.always_push` from the base config
    always_push: bool,
    now: fn() -> i64,
}

impl<'a> Builder<'a> {
    pub fn new(
        engine: &'a dyn ImageEngine,
        releases: &'a dyn ReleaseHost,
        drivers: &'a dyn DriverResolver,
        flags: RunFlags,
        always_push: bool,
    ) -> Self {
        Self {
            engine,
            releases,
            drivers,
            flags,
            always_push,
            now: unix_now,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, now: fn() -> i64) -> Self {
        self.now = now;
        self
    }

    /// Run one descriptor. `Err` means the whole run must stop.
    pub fn run_build(&self, descriptor: &BuildDescriptor) -> Result<Outcome> {
        let name = descriptor.full_image_name();

        let local = match self.engine.images(&name) {
            Ok(local) => local,
            Err(e) if self.flags.dry_run => {
                utils::print_warning(&format!(
                    "Could not check for {}: {}",
                    utils::style_name(&name),
                    e
                ));
                Vec::new()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to look up image {}", name)),
        };
        let exists_locally = !local.is_empty();

        if let Some(image) = local.first() {
            let age_secs = (self.now)() - image.created;
            utils::print_debug(&format!("Found {} ({}), {}s old", name, image.id, age_secs));
            if self.flags.auto && !self.flags.force && age_secs < FRESHNESS_WINDOW_SECS {
                utils::print_message(&format!(
                    "Skipping {} as it's too new",
                    utils::style_name(&name)
                ));
                return Ok(Outcome::Skipped(SkipReason::TooNew { age_secs }));
            }
        }

        if self.flags.dry_run {
            utils::print_message(&format!(
                "Would build {} from {}",
                utils::style_name(&name),
                utils::style_path(&descriptor.build_dir.to_string_lossy())
            ));
            return Ok(Outcome::Skipped(SkipReason::DryRun));
        }

        if let Err(err) = self.resolve_dependencies(descriptor) {
            if err.is_fatal() {
                return Err(err).with_context(|| {
                    format!(
                        "Dependency resolution for {} ({}) failed",
                        name,
                        descriptor.source_path.display()
                    )
                });
            }
            utils::print_error(&format!(
                "Dependencies of {} could not be resolved: {}",
                utils::style_name(&name),
                err
            ));
            return Ok(Outcome::Failed(err.to_string()));
        }

        let mut exists_remotely = false;
        if !exists_locally && descriptor.remote {
            utils::print_warning(&format!(
                "Could not find {} locally, attempting pull...",
                utils::style_name(&name)
            ));
            match self.engine.pull(&descriptor.image, &descriptor.tag) {
                Ok(()) => exists_remotely = true,
                Err(e) => utils::print_warning(&format!(
                    "Could not find {} remotely: {}",
                    utils::style_name(&name),
                    e
                )),
            }
        }

        let dockerfile = select_dockerfile(
            descriptor,
            self.flags.update,
            exists_locally || exists_remotely,
        );
        match &dockerfile {
            DockerfileSource::Path(path) => utils::print_message(&format!(
                "Building {} with {}",
                utils::style_name(&name),
                utils::style_path(&path.to_string_lossy())
            )),
            DockerfileSource::Inline(_) => utils::print_message(&format!(
                "Updating {} with inline instructions",
                utils::style_name(&name)
            )),
        }

        let mut labels = BTreeMap::new();
        labels.insert(APP_CONFIG_LABEL.to_string(), descriptor.raw_source.clone());
        let request = BuildRequest {
            context_dir: &descriptor.build_dir,
            dockerfile,
            tag: name.clone(),
            labels,
            pull: self.flags.pull_base(),
            no_cache: self.flags.skip_cache(),
        };
        self.engine
            .build(&request, &mut |line: &str| utils::print_build_log(line))
            .with_context(|| {
                format!(
                    "Docker build of {} ({}) failed",
                    name,
                    descriptor.source_path.display()
                )
            })?;
        utils::print_success(&format!("Built {}", utils::style_name(&name)));

        let pushed = self.flags.push || self.always_push || descriptor.always_push;
        if !pushed {
            return Ok(Outcome::Built { pushed: false });
        }

        utils::print_message(&format!("Pushing image to {}", utils::style_name(&name)));
        match self.engine.push(&descriptor.image, &descriptor.tag) {
            Ok(()) => {
                utils::print_success("Build successfully pushed.");
                Ok(Outcome::Built { pushed: true })
            }
            Err(e) => {
                utils::print_error(&format!("Push of {} failed: {}", name, e));
                Ok(Outcome::Built { pushed: false })
            }
        }
    }

    fn resolve_dependencies(&self, descriptor: &BuildDescriptor) -> Result<(), ResolveError> {
        if descriptor.install_gpu_driver {
            self.drivers.resolve(&descriptor.build_dir)?;
        }

        if let Some(strategy) = &descriptor.strategy {
            utils::print_message(&format!(
                "Resolving {} {} dependenc{}",
                utils::style_number(strategy.entry_count()),
                strategy.kind(),
                if strategy.entry_count() == 1 { "y" } else { "ies" }
            ));
            let ctx = ResolveContext {
                build_dir: &descriptor.build_dir,
                fail_on_script_error: self.flags.fail_on_script_error,
                releases: self.releases,
            };
            strategy.resolve(&ctx)?;
        }
        Ok(())
    }
}

/// Dockerfile for a build. Overlays only apply to update runs over an
/// existing image that neither forces full updates nor installs a driver.
pub fn select_dockerfile(
    descriptor: &BuildDescriptor,
    update: bool,
    image_exists: bool,
) -> DockerfileSource {
    let overlay_allowed = update
        && image_exists
        && !descriptor.always_full_update
        && !descriptor.install_gpu_driver;

    if overlay_allowed {
        if let Some(file) = &descriptor.dockerfile_update_file {
            return DockerfileSource::Path(descriptor.build_dir.join(file));
        }
        if let Some(lines) = &descriptor.dockerfile_update {
            return DockerfileSource::Inline(render_update_overlay(
                lines,
                &descriptor.image,
                &descriptor.tag,
            ));
        }
        let conventional = descriptor.build_dir.join(UPDATE_DOCKERFILE);
        if conventional.is_file() {
            return DockerfileSource::Path(conventional);
        }
    }

    DockerfileSource::Path(descriptor.dockerfile.clone())
}

fn starts_with_verb(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|word| DOCKERFILE_VERBS.contains(&word))
        .unwrap_or(false)
}

/// Turn `dockerfile_update` lines into a Dockerfile. Bare commands become
/// `RUN` instructions. The first `FROM` moves to the top, or `FROM image:tag`
/// is added when there is none.
pub fn render_update_overlay(lines: &[String], image: &str, tag: &str) -> String {
    let mut from = None;
    let mut body = Vec::with_capacity(lines.len());

    for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        let is_from = line.split_whitespace().next() == Some("FROM");
        if is_from && from.is_none() {
            from = Some(line.to_string());
        } else if starts_with_verb(line) {
            body.push(line.to_string());
        } else {
            body.push(format!("RUN {}", line));
        }
    }

    let mut out = from.unwrap_or_else(|| format!("FROM {}:{}", image, tag));
    out.push('\n');
    for line in body {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Outcomes of a run in schedule order
#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<(String, Outcome)>,
    /// Set when an interrupt stopped the schedule early
    pub interrupted: bool,
}

impl RunSummary {
    pub fn built(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Built { .. }))
            .count()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Failed(_)))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn skipped(&self) -> Vec<(&str, &SkipReason)> {
        self.outcomes
            .iter()
            .filter_map(|(n, o)| match o {
                Outcome::Skipped(reason) => Some((n.as_str(), reason)),
                _ => None,
            })
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| matches!(o, Outcome::Failed(_)))
    }

    pub fn print(&self) {
        println!("{}", utils::style_title("Build summary"));
        println!(
            "  {} built, {} skipped, {} failed",
            utils::style_number(self.built()),
            utils::style_number(self.skipped().len()),
            utils::style_number(self.failed().len())
        );
        for (name, outcome) in &self.outcomes {
            let status = match outcome {
                Outcome::Built { .. } => utils::style_success(&outcome.to_string()),
                Outcome::Skipped(_) => utils::style_warning(&outcome.to_string()),
                Outcome::Failed(_) => utils::style_error(&outcome.to_string()),
            };
            println!("  {:<40} {}", name, status);
        }
        if self.interrupted {
            utils::print_warning("Run was interrupted before every image was processed");
        }
    }
}

/// Build every descriptor in `order`. A failed image causes everything that
/// depends on it to be skipped. Fatal errors stop the run immediately.
pub fn run_schedule(
    builder: &Builder,
    graph: &BuildGraph,
    order: &[&BuildDescriptor],
    interrupted: &AtomicBool,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let mut blocked: HashMap<String, String> = HashMap::new();
    let total = order.len();

    for (index, descriptor) in order.iter().enumerate() {
        if interrupted.load(Ordering::SeqCst) {
            summary.interrupted = true;
            break;
        }

        let name = descriptor.full_image_name();
        println!(
            "{} {}",
            utils::style_title(&format!("[{}/{}]", index + 1, total)),
            utils::style_name(&name)
        );

        let outcome = match blocked.get(&name) {
            Some(upstream) => {
                utils::print_warning(&format!(
                    "Skipping {} because {} failed",
                    utils::style_name(&name),
                    utils::style_name(upstream)
                ));
                Outcome::Skipped(SkipReason::UpstreamFailed(upstream.clone()))
            }
            None => builder.run_build(descriptor)?,
        };

        if matches!(outcome, Outcome::Failed(_)) {
            for dependent in graph.transitive_dependents(&name) {
                blocked.entry(dependent).or_insert_with(|| name.clone());
            }
        }
        summary.outcomes.push((name, outcome));
    }

    Ok(summary)
}
