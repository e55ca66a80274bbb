//! Setup scripts run from `<build_dir>/scripts` before the image build

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use super::ResolveError;
use crate::utils;

pub const SCRIPTS_DIR: &str = "scripts";

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptDependency {
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Path a script entry refers to
pub fn script_path(build_dir: &Path, dependency: &ScriptDependency) -> PathBuf {
    build_dir.join(SCRIPTS_DIR).join(&dependency.script)
}

/// Run each script with the build directory as its working directory and
/// an empty environment.
///
/// Missing scripts are skipped with a warning. A script that exits non-zero
/// is reported and the remaining scripts still run; the failures only fail
/// the dependency when `fail_on_error` is set.
pub fn resolve_script_dependencies(
    scripts: &[ScriptDependency],
    build_dir: &Path,
    fail_on_error: bool,
) -> Result<(), ResolveError> {
    utils::print_debug(&format!(
        "Running {} dependency script(s) in {}",
        scripts.len(),
        utils::style_path(&build_dir.to_string_lossy())
    ));

    let mut failed = Vec::new();

    for dependency in scripts {
        let path = script_path(build_dir, dependency);
        if !path.exists() {
            utils::print_warning(&format!(
                "Script {} not found in {}. Skipping.",
                utils::style_name(&dependency.script),
                utils::style_path(&build_dir.join(SCRIPTS_DIR).to_string_lossy())
            ));
            continue;
        }

        let display = std::iter::once(path.to_string_lossy().to_string())
            .chain(dependency.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        utils::print_message(&format!("Executing {}", utils::style_command(&display)));

        let status = run_script(&path, &dependency.args, build_dir);

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                utils::print_error(&format!(
                    "Error encountered while running {} ({})",
                    utils::style_command(&display),
                    status
                ));
                failed.push(dependency.script.clone());
            }
            Err(e) => {
                utils::print_error(&format!(
                    "Unable to execute {}: {}",
                    utils::style_command(&display),
                    e
                ));
                failed.push(dependency.script.clone());
            }
        }
    }

    if !failed.is_empty() && fail_on_error {
        return Err(ResolveError::Scripts { failed });
    }
    Ok(())
}

fn run_script(path: &Path, args: &[String], build_dir: &Path) -> std::io::Result<ExitStatus> {
    Command::new(path)
        .args(args)
        .current_dir(build_dir)
        .env_clear()
        .status()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    /// Written by a child shell so no descriptor open for writing can leak
    /// into processes other tests fork, which would make exec fail with ETXTBSY
    fn write_script(build_dir: &Path, name: &str, body: &str) {
        let dir = build_dir.join(SCRIPTS_DIR);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let output = Command::new("/bin/sh")
            .args(["-c", r#"printf '#!/bin/sh\n%s\n' "$2" > "$1" && chmod 755 "$1""#, "sh"])
            .arg(&path)
            .arg(body)
            .output()
            .unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    }

    fn entry(script: &str, args: &[&str]) -> ScriptDependency {
        ScriptDependency {
            script: script.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_scripts_run_in_build_dir_with_args() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "fetch.sh", r#"printf '%s|%s' "$1" "$2" > fetched.txt"#);

        resolve_script_dependencies(&[entry("fetch.sh", &["one", "two"])], dir.path(), false)
            .unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("fetched.txt")).unwrap(), "one|two");
    }

    #[test]
    fn test_scripts_get_empty_environment() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "env.sh", r#"printf '%s' "${HOME:-unset}" > home.txt"#);

        resolve_script_dependencies(&[entry("env.sh", &[])], dir.path(), false).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("home.txt")).unwrap(), "unset");
    }

    #[test]
    fn test_missing_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "after.sh", ": > after.txt");

        resolve_script_dependencies(
            &[entry("missing.sh", &[]), entry("after.sh", &[])],
            dir.path(),
            true,
        )
        .unwrap();

        assert!(dir.path().join("after.txt").exists());
    }

    #[test]
    fn test_failures_continue_and_respect_policy() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "broken.sh", "exit 3");
        write_script(dir.path(), "after.sh", ": > after.txt");
        let scripts = [entry("broken.sh", &[]), entry("after.sh", &[])];

        resolve_script_dependencies(&scripts, dir.path(), false).unwrap();
        assert!(dir.path().join("after.txt").exists());

        fs::remove_file(dir.path().join("after.txt")).unwrap();
        match resolve_script_dependencies(&scripts, dir.path(), true) {
            Err(ResolveError::Scripts { failed }) => assert_eq!(failed, vec!["broken.sh"]),
            other => panic!("expected script failure, got {:?}", other),
        }
        assert!(dir.path().join("after.txt").exists());
    }
}
