//! App config (build descriptor) loading and Dockerfile dependency discovery

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::resolver::git::GitDependency;
use super::resolver::release::ReleaseDependency;
use super::resolver::script::ScriptDependency;
use super::resolver::DependencyStrategy;
use super::BuildError;
use crate::utils;

pub const APP_CONFIG_NAMES: [&str; 2] = ["app_config.yaml", "app_config.yml"];
pub const CONFIGS_DIR: &str = "configs";
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Parsed build configuration for one image
#[derive(Debug, Clone)]
pub struct BuildDescriptor {
    /// The app config file this descriptor came from
    pub source_path: PathBuf,
    /// Unmodified file contents, attached to the image as a label
    pub raw_source: String,
    pub image: String,
    pub tag: String,
    /// Build context directory
    pub build_dir: PathBuf,
    /// Resolved Dockerfile used for full builds
    pub dockerfile: PathBuf,
    /// Images named on `FROM` lines of the Dockerfile, in order, without duplicates
    pub depends_on: Vec<String>,
    pub strategy: Option<DependencyStrategy>,
    pub automatic: bool,
    pub always_full_update: bool,
    pub always_push: bool,
    pub remote: bool,
    pub install_gpu_driver: bool,
    pub dockerfile_update: Option<Vec<String>>,
    pub dockerfile_update_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct AppConfigFile {
    build: Option<BuildSection>,
}

#[derive(Debug, Default, Deserialize)]
struct BuildSection {
    image: Option<String>,
    tag: Option<serde_yaml::Value>,
    dockerfile: Option<String>,
    dockerfile_update: Option<Vec<String>>,
    dockerfile_update_file: Option<String>,
    #[serde(default)]
    automatic: bool,
    #[serde(default)]
    always_full_update: bool,
    #[serde(default)]
    always_push: bool,
    #[serde(default)]
    remote: bool,
    #[serde(default)]
    install_gpu_driver: bool,
    dependencies: Option<DependencySection>,
}

#[derive(Debug, Default, Deserialize)]
struct DependencySection {
    git: Option<GitSection>,
    scripts: Option<Vec<ScriptDependency>>,
    github_releases: Option<Vec<ReleaseDependency>>,
}

/// `git` may be a bare list or wrapped in `repositories:`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GitSection {
    List(Vec<GitDependency>),
    Wrapped { repositories: Vec<GitDependency> },
}

impl GitSection {
    fn into_entries(self) -> Vec<GitDependency> {
        match self {
            GitSection::List(entries) => entries,
            GitSection::Wrapped { repositories } => repositories,
        }
    }
}

impl BuildDescriptor {
    /// Read and parse an app config file
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let raw = fs::read_to_string(path).map_err(|source| BuildError::ReadDescriptor {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, raw)
    }

    /// Parse app config text that was read from `path`
    pub fn parse(path: &Path, raw: String) -> Result<Self, BuildError> {
        let yaml = strip_template_lines(&raw);
        let file: AppConfigFile = if yaml.trim().is_empty() {
            AppConfigFile::default()
        } else {
            serde_yaml::from_str(&yaml).map_err(|e| BuildError::invalid(path, e.to_string()))?
        };

        let build = file
            .build
            .ok_or_else(|| BuildError::invalid(path, "missing `build` section"))?;

        let image = build
            .image
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| BuildError::invalid(path, "missing `build.image`"))?;
        let tag = match build.tag {
            Some(serde_yaml::Value::String(s)) if !s.trim().is_empty() => s,
            Some(serde_yaml::Value::Number(n)) => n.to_string(),
            Some(serde_yaml::Value::Bool(b)) => b.to_string(),
            _ => return Err(BuildError::invalid(path, "missing `build.tag`")),
        };

        let build_dir = build_dir_for(path);
        let dockerfile = build_dir.join(build.dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE));

        let strategy = match build.dependencies {
            Some(deps) => select_strategy(path, deps)?,
            None => None,
        };
        if let Some(strategy) = &strategy {
            strategy
                .validate()
                .map_err(|message| BuildError::invalid(path, message))?;
        }

        let depends_on = match fs::read_to_string(&dockerfile) {
            Ok(content) => scan_from_lines(&content),
            Err(_) => {
                utils::print_debug(&format!(
                    "No Dockerfile found at {} for {}:{}",
                    utils::style_path(&dockerfile.to_string_lossy()),
                    image,
                    tag
                ));
                Vec::new()
            }
        };

        Ok(Self {
            source_path: path.to_path_buf(),
            raw_source: raw,
            image,
            tag,
            build_dir,
            dockerfile,
            depends_on,
            strategy,
            automatic: build.automatic,
            always_full_update: build.always_full_update,
            always_push: build.always_push,
            remote: build.remote,
            install_gpu_driver: build.install_gpu_driver,
            dockerfile_update: build.dockerfile_update,
            dockerfile_update_file: build.dockerfile_update_file.map(PathBuf::from),
        })
    }

    /// `image:tag`, the graph identity of this descriptor
    pub fn full_image_name(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

fn select_strategy(
    path: &Path,
    deps: DependencySection,
) -> Result<Option<DependencyStrategy>, BuildError> {
    let mut strategies = Vec::new();
    if let Some(git) = deps.git {
        strategies.push(DependencyStrategy::Git(git.into_entries()));
    }
    if let Some(scripts) = deps.scripts {
        strategies.push(DependencyStrategy::Scripts(scripts));
    }
    if let Some(releases) = deps.github_releases {
        strategies.push(DependencyStrategy::Releases(releases));
    }

    if strategies.len() > 1 {
        let kinds: Vec<&str> = strategies.iter().map(|s| s.kind()).collect();
        return Err(BuildError::invalid(
            path,
            format!(
                "only one dependency type may be declared per app, found: {}",
                kinds.join(", ")
            ),
        ));
    }

    Ok(strategies.pop())
}

/// Directory used as the build context. Descriptors kept in a `configs`
/// directory build from its parent.
pub fn build_dir_for(descriptor_path: &Path) -> PathBuf {
    let parent = match descriptor_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = parent.canonicalize().unwrap_or(parent);

    if parent.file_name().and_then(|n| n.to_str()) == Some(CONFIGS_DIR) {
        if let Some(grandparent) = parent.parent() {
            return grandparent.to_path_buf();
        }
    }
    parent
}

/// Drop lines carrying template directives so the rest parses as YAML
pub fn strip_template_lines(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.contains("{{") && !line.contains("{%"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Image references from the `FROM` lines of a Dockerfile. Flags are
/// skipped and references to earlier build stages are ignored.
pub fn scan_from_lines(content: &str) -> Vec<String> {
    let mut stages: HashSet<String> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut images = Vec::new();

    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("FROM") {
            continue;
        }

        let rest: Vec<&str> = tokens.filter(|t| !t.starts_with("--")).collect();
        let Some(image) = rest.first() else {
            continue;
        };

        let is_stage = stages.contains(*image);
        if rest.len() >= 3 && rest[1].eq_ignore_ascii_case("as") {
            stages.insert(rest[2].to_string());
        }

        if is_stage {
            continue;
        }
        let image = normalize_image_ref(image);
        if seen.insert(image.clone()) {
            images.push(image);
        }
    }

    images
}

/// Give an untagged reference the implicit `:latest` tag so it names the
/// same node as a descriptor with `tag: latest`. Digests, `scratch` and
/// references built from build args are left alone.
pub fn normalize_image_ref(image: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    if name.contains(':') || image.contains('@') || image.contains('$') || image == "scratch" {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Find app config files under `path`.
///
/// Non-recursive lookups only accept `app_config.yaml|yml` directly in
/// `path`. Recursive lookups also accept any YAML file whose directory
/// path mentions `config`.
pub fn find_descriptor_files(path: &Path, recurse: bool) -> Vec<PathBuf> {
    let mut found = Vec::new();

    if recurse {
        walk_descriptor_files(path, &mut found);
    } else if let Some(file) = APP_CONFIG_NAMES
        .iter()
        .map(|name| path.join(name))
        .find(|candidate| candidate.is_file())
    {
        found.push(file);
    }

    found.sort();
    found
}

fn walk_descriptor_files(dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            utils::print_debug(&format!(
                "Skipping unreadable directory {}: {}",
                utils::style_path(&dir.to_string_lossy()),
                err
            ));
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            walk_descriptor_files(&path, found);
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if APP_CONFIG_NAMES.contains(&name) {
            found.push(path);
        } else if utils::is_yaml(name) && dir.to_string_lossy().contains("config") {
            found.push(path);
        }
    }
}

/// Collect descriptor files for a run.
///
/// Auto runs walk `build_root`; other runs read `app_config.yaml` from
/// `path` plus everything below `path/configs`.
pub fn discover_descriptor_files(path: &Path, auto: bool, build_root: &Path) -> Vec<PathBuf> {
    if auto {
        return find_descriptor_files(build_root, true);
    }

    let mut files = find_descriptor_files(path, false);
    let configs = path.join(CONFIGS_DIR);
    if configs.is_dir() {
        files.extend(find_descriptor_files(&configs, true));
    }
    files.dedup();
    files
}

/// Load every descriptor, failing on the first invalid one
pub fn load_descriptors(files: &[PathBuf]) -> Result<Vec<BuildDescriptor>, BuildError> {
    files.iter().map(|f| BuildDescriptor::load(f)).collect()
}

#[cfg(test)]
impl BuildDescriptor {
    /// Bare descriptor for graph and executor tests
    pub(crate) fn stub(image: &str, tag: &str, depends_on: &[&str]) -> Self {
        let build_dir = std::env::temp_dir();
        Self {
            source_path: build_dir.join(format!("{}-{}.yaml", image, tag)),
            raw_source: format!("build:\n  image: {}\n  tag: {}\n", image, tag),
            image: image.to_string(),
            tag: tag.to_string(),
            dockerfile: build_dir.join(DEFAULT_DOCKERFILE),
            build_dir,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            strategy: None,
            automatic: false,
            always_full_update: false,
            always_push: false,
            remote: false,
            install_gpu_driver: false,
            dockerfile_update: None,
            dockerfile_update_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_minimal_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("app_config.yaml");
        write(&dir.path().join("Dockerfile"), "FROM ubuntu:22.04\nRUN true\n");
        write(&config, "build:\n  image: steam\n  tag: latest\n  automatic: true\n");

        let desc = BuildDescriptor::load(&config).unwrap();
        assert_eq!(desc.full_image_name(), "steam:latest");
        assert_eq!(desc.depends_on, vec!["ubuntu:22.04"]);
        assert!(desc.automatic);
        assert!(desc.strategy.is_none());
        assert_eq!(desc.build_dir, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_untagged_from_orders_after_latest_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a-game/Dockerfile"), "FROM zz-base\n");
        write(&dir.path().join("a-game/app_config.yaml"), "build:\n  image: game\n  tag: 1\n");
        write(&dir.path().join("zz-base/Dockerfile"), "FROM ubuntu:22.04\n");
        write(&dir.path().join("zz-base/app_config.yaml"), "build:\n  image: zz-base\n  tag: latest\n");

        let descriptors = load_descriptors(&[
            dir.path().join("a-game/app_config.yaml"),
            dir.path().join("zz-base/app_config.yaml"),
        ])
        .unwrap();
        let graph = crate::build::BuildGraph::from_descriptors(&descriptors);
        let order: Vec<String> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|d| d.full_image_name())
            .collect();

        assert_eq!(order, vec!["zz-base:latest", "game:1"]);
        assert!(!graph.is_external("zz-base:latest"));
    }

    #[test]
    fn test_configs_dir_builds_from_parent() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("configs").join("firefox.yaml");
        write(&dir.path().join("Dockerfile.firefox"), "FROM base:1\n");
        write(
            &config,
            "build:\n  image: firefox\n  tag: 1\n  dockerfile: Dockerfile.firefox\n",
        );

        let desc = BuildDescriptor::load(&config).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(desc.build_dir, root);
        assert_eq!(desc.dockerfile, root.join("Dockerfile.firefox"));
        assert_eq!(desc.tag, "1");
        assert_eq!(desc.depends_on, vec!["base:1"]);
    }

    #[test]
    fn test_missing_dockerfile_yields_no_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("app_config.yml");
        write(&config, "build:\n  image: tool\n  tag: v2\n");

        let desc = BuildDescriptor::load(&config).unwrap();
        assert!(desc.depends_on.is_empty());
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        let path = Path::new("/nowhere/app_config.yaml");

        let err = BuildDescriptor::parse(path, "other: 1\n".to_string()).unwrap_err();
        assert!(err.to_string().contains("missing `build` section"));

        let err =
            BuildDescriptor::parse(path, "build:\n  image: x\n".to_string()).unwrap_err();
        assert!(err.to_string().contains("build.tag"));

        let err = BuildDescriptor::parse(path, "build:\n  tag: 1\n".to_string()).unwrap_err();
        assert!(err.to_string().contains("build.image"));
    }

    #[test]
    fn test_template_lines_are_dropped_but_kept_raw() {
        let raw = "{% set user = 'me' %}\nbuild:\n  image: app\n  tag: \"{{ tag }}\"\n  tag: 3\n";
        let stripped = strip_template_lines(raw);
        assert!(!stripped.contains("{%"));
        assert!(!stripped.contains("{{"));

        let desc = BuildDescriptor::parse(Path::new("/x/app_config.yaml"), raw.to_string())
            .unwrap();
        assert_eq!(desc.tag, "3");
        assert_eq!(desc.raw_source, raw);
    }

    #[test]
    fn test_dependency_strategies() {
        let path = Path::new("/x/app_config.yaml");

        let git = r#"
build:
  image: a
  tag: 1
  dependencies:
    git:
      repositories:
        - local_path: src/engine
          remote_url: https://example.com/engine.git
          shallow: true
"#;
        let desc = BuildDescriptor::parse(path, git.to_string()).unwrap();
        match desc.strategy {
            Some(DependencyStrategy::Git(entries)) => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].shallow);
            }
            other => panic!("expected git strategy, got {:?}", other),
        }

        let scripts = r#"
build:
  image: a
  tag: 1
  dependencies:
    scripts:
      - script: fetch.sh
        args: ["--fast"]
"#;
        let desc = BuildDescriptor::parse(path, scripts.to_string()).unwrap();
        assert!(matches!(desc.strategy, Some(DependencyStrategy::Scripts(ref s)) if s[0].args == vec!["--fast"]));

        let both = r#"
build:
  image: a
  tag: 1
  dependencies:
    scripts:
      - script: fetch.sh
    github_releases:
      - repo: owner/tool
        files:
          - name: tool.tar.gz
"#;
        let err = BuildDescriptor::parse(path, both.to_string()).unwrap_err();
        assert!(err.to_string().contains("only one dependency type"));
    }

    #[test]
    fn test_invalid_release_file_rule_rejected() {
        let raw = r#"
build:
  image: a
  tag: 1
  dependencies:
    github_releases:
      - repo: owner/tool
        files:
          - symlink: tool
"#;
        let err = BuildDescriptor::parse(Path::new("/x/a.yaml"), raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("match"));
    }

    #[test]
    fn test_scan_from_lines() {
        let dockerfile = r#"
# FROM commented:out
FROM --platform=linux/amd64 golang:1.22 AS builder
RUN go build
FROM builder AS tested
FROM debian:bookworm
COPY --from=builder /out /app
FROM debian:bookworm
"#;
        assert_eq!(
            scan_from_lines(dockerfile),
            vec!["golang:1.22", "debian:bookworm"]
        );
    }

    #[test]
    fn test_untagged_from_means_latest() {
        let dockerfile = "FROM steam\nFROM steam:latest\nFROM scratch\nFROM ${BASE}\n";
        assert_eq!(scan_from_lines(dockerfile), vec!["steam:latest", "scratch", "${BASE}"]);

        assert_eq!(normalize_image_ref("localhost:5000/base"), "localhost:5000/base:latest");
        assert_eq!(normalize_image_ref("registry/base:2"), "registry/base:2");
        assert_eq!(normalize_image_ref("base@sha256:abc"), "base@sha256:abc");
    }

    #[test]
    fn test_find_descriptor_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("app_config.yaml"), "build: {}\n");
        write(&root.join("configs").join("b.yml"), "build: {}\n");
        write(&root.join("configs").join("nested").join("a.yaml"), "build: {}\n");
        write(&root.join("configs").join("notes.txt"), "");
        write(&root.join("other").join("stray.yaml"), "");

        let flat = find_descriptor_files(root, false);
        assert_eq!(flat, vec![root.join("app_config.yaml")]);

        let files = discover_descriptor_files(root, false, Path::new("/unused"));
        assert_eq!(
            files,
            vec![
                root.join("app_config.yaml"),
                root.join("configs").join("b.yml"),
                root.join("configs").join("nested").join("a.yaml"),
            ]
        );

        let auto = discover_descriptor_files(Path::new("/unused"), true, root);
        assert!(auto.contains(&root.join("app_config.yaml")));
        assert!(auto.contains(&root.join("configs").join("b.yml")));
        assert!(!auto.iter().any(|p| p.ends_with("stray.yaml")));
    }
}
