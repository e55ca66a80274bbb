//! Image engine boundary and its docker CLI implementation

use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

use crate::config::AppConfig;
use crate::utils;

/// Lines of engine output kept for error reports
const ERROR_TAIL_LINES: usize = 20;

/// A local image as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub id: String,
    /// Creation time, seconds since the Unix epoch
    pub created: i64,
}

/// Where the Dockerfile for a build comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerfileSource {
    Path(PathBuf),
    /// In-memory content sent to the engine directly
    Inline(String),
}

#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub context_dir: &'a Path,
    pub dockerfile: DockerfileSource,
    /// `image:tag`
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    pub pull: bool,
    pub no_cache: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}{}", format_tail(.output))]
    Failed {
        command: String,
        status: ExitStatus,
        output: Vec<String>,
    },

    #[error("unexpected output from {command}: {reason}")]
    Parse { command: String, reason: String },
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\n{}", lines.join("\n"))
    }
}

/// Operations the build executor needs from a container engine
pub trait ImageEngine {
    /// Local images named `image:tag`, empty when there are none
    fn images(&self, name: &str) -> Result<Vec<ImageSummary>, EngineError>;

    /// Build an image, handing every output line to `on_line` as it arrives
    fn build(&self, request: &BuildRequest, on_line: &mut dyn FnMut(&str)) -> Result<(), EngineError>;

    fn pull(&self, image: &str, tag: &str) -> Result<(), EngineError>;

    fn push(&self, repository: &str, tag: &str) -> Result<(), EngineError>;
}

/// Drives the `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: PathBuf,
    /// Value for `DOCKER_HOST`
    host: Option<String>,
}

impl DockerCli {
    pub fn new(bin: PathBuf, host: Option<String>) -> Self {
        Self { bin, host }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.docker_bin.clone(), config.docker_socket.clone())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.bin.display(), args.join(" "))
    }

    /// Run docker with `args`, streaming combined output line by line
    fn run_streaming(
        &self,
        args: &[String],
        stdin: Option<&str>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        let command = self.describe(args);
        utils::print_debug(&format!("Running {}", utils::style_command(&command)));

        let mut child = self
            .command()
            .args(args)
            .env("BUILDKIT_PROGRESS", "plain")
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        // The pipe is dropped after the write so the engine sees EOF
        let stdin_error = match (stdin, child.stdin.take()) {
            (Some(content), Some(mut pipe)) => pipe.write_all(content.as_bytes()).err(),
            _ => None,
        };

        let mut tail = VecDeque::with_capacity(ERROR_TAIL_LINES);
        for line in rx {
            on_line(&line);
            if tail.len() == ERROR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait().map_err(|source| EngineError::Spawn {
            command: command.clone(),
            source,
        })?;
        if !status.success() {
            return Err(EngineError::Failed {
                command,
                status,
                output: tail.into_iter().collect(),
            });
        }
        if let Some(source) = stdin_error {
            return Err(EngineError::Spawn { command, source });
        }
        Ok(())
    }
}

fn forward_lines<R: Read + Send + 'static>(stream: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        // Drain to EOF even when the receiver is gone, or the child blocks on a full pipe
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if forwarding {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']).to_string();
                        forwarding = tx.send(line).is_ok();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

impl ImageEngine for DockerCli {
    fn images(&self, name: &str) -> Result<Vec<ImageSummary>, EngineError> {
        let args = vec!["image".to_string(), "inspect".to_string(), name.to_string()];
        let command = self.describe(&args);
        let output = self
            .command()
            .args(&args)
            .output()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such image") || stderr.contains("No such object") {
                return Ok(Vec::new());
            }
            return Err(EngineError::Failed {
                command,
                status: output.status,
                output: stderr.lines().map(String::from).collect(),
            });
        }

        parse_inspect_output(&String::from_utf8_lossy(&output.stdout))
            .map_err(|reason| EngineError::Parse { command, reason })
    }

    fn build(&self, request: &BuildRequest, on_line: &mut dyn FnMut(&str)) -> Result<(), EngineError> {
        let stdin = match &request.dockerfile {
            DockerfileSource::Inline(content) => Some(content.as_str()),
            DockerfileSource::Path(_) => None,
        };
        self.run_streaming(&build_args(request), stdin, on_line)
    }

    fn pull(&self, image: &str, tag: &str) -> Result<(), EngineError> {
        let args = vec!["pull".to_string(), format!("{}:{}", image, tag)];
        self.run_streaming(&args, None, &mut |line: &str| utils::print_build_log(line))
    }

    fn push(&self, repository: &str, tag: &str) -> Result<(), EngineError> {
        let args = vec!["push".to_string(), format!("{}:{}", repository, tag)];
        self.run_streaming(&args, None, &mut |line: &str| utils::print_build_log(line))
    }
}

/// Arguments for `docker build`
pub fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec!["build".to_string(), "-t".to_string(), request.tag.clone()];
    for (key, value) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    if request.pull {
        args.push("--pull".to_string());
    }
    if request.no_cache {
        args.push("--no-cache".to_string());
    }
    args.push("-f".to_string());
    match &request.dockerfile {
        DockerfileSource::Path(path) => args.push(path.to_string_lossy().into_owned()),
        DockerfileSource::Inline(_) => args.push("-".to_string()),
    }
    args.push(request.context_dir.to_string_lossy().into_owned());
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    created: String,
}

/// Parse the JSON array printed by `docker image inspect`
pub fn parse_inspect_output(json: &str) -> Result<Vec<ImageSummary>, String> {
    let images: Vec<InspectedImage> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    images
        .into_iter()
        .map(|image| {
            let created = chrono::DateTime::parse_from_rfc3339(&image.created)
                .map_err(|e| format!("bad creation time {:?}: {}", image.created, e))?;
            Ok(ImageSummary {
                id: image.id,
                created: created.timestamp(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_output() {
        let json = r#"[{"Id":"sha256:abc","RepoTags":["app:1"],"Created":"2024-03-01T12:00:00.123456789Z"}]"#;
        let images = parse_inspect_output(json).unwrap();
        assert_eq!(
            images,
            vec![ImageSummary {
                id: "sha256:abc".into(),
                created: 1_709_294_400,
            }]
        );
        assert!(parse_inspect_output("[]").unwrap().is_empty());
        assert!(parse_inspect_output(r#"[{"Id":"x","Created":"yesterday"}]"#).is_err());
    }

    #[test]
    fn test_build_args_for_file() {
        let context = PathBuf::from("/srv/app");
        let mut labels = BTreeMap::new();
        labels.insert("pdx-app-config".to_string(), "build:\n  image: app\n".to_string());
        let request = BuildRequest {
            context_dir: &context,
            dockerfile: DockerfileSource::Path(context.join("Dockerfile")),
            tag: "app:1".into(),
            labels,
            pull: true,
            no_cache: false,
        };

        assert_eq!(
            build_args(&request),
            vec![
                "build",
                "-t",
                "app:1",
                "--label",
                "pdx-app-config=build:\n  image: app\n",
                "--pull",
                "-f",
                "/srv/app/Dockerfile",
                "/srv/app",
            ]
        );
    }

    #[test]
    fn test_build_args_for_inline_content() {
        let context = PathBuf::from("/srv/app");
        let request = BuildRequest {
            context_dir: &context,
            dockerfile: DockerfileSource::Inline("FROM app:1\n".into()),
            tag: "app:1".into(),
            labels: BTreeMap::new(),
            pull: false,
            no_cache: true,
        };

        assert_eq!(
            build_args(&request),
            vec!["build", "-t", "app:1", "--no-cache", "-f", "-", "/srv/app"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_streaming_reports_output_tail() {
        let cli = DockerCli::new(PathBuf::from("/bin/sh"), None);
        let args = vec!["-c".to_string(), "cat; echo oops >&2; exit 4".to_string()];
        let mut seen = Vec::new();

        let err = cli
            .run_streaming(&args, Some("from stdin\n"), &mut |line: &str| seen.push(line.to_string()))
            .unwrap_err();

        seen.sort();
        assert_eq!(seen, vec!["from stdin", "oops"]);
        match err {
            EngineError::Failed { output, .. } => assert_eq!(output.len(), 2),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_streaming_survives_non_utf8_output() {
        let cli = DockerCli::new(PathBuf::from("/bin/sh"), None);
        let script = "printf 'step \\377\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; echo done";
        let args = vec!["-c".to_string(), script.to_string()];
        let mut seen = Vec::new();

        cli.run_streaming(&args, None, &mut |line: &str| seen.push(line.to_string()))
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "step \u{FFFD}");
        assert_eq!(seen[1].len(), 300_000);
        assert_eq!(seen[2], "done");
    }

    #[cfg(unix)]
    #[test]
    fn test_early_exit_reports_engine_output_over_broken_stdin() {
        let cli = DockerCli::new(PathBuf::from("/bin/sh"), None);
        let args = vec!["-c".to_string(), "echo refused >&2; exit 3".to_string()];
        let dockerfile = "RUN true\n".repeat(100_000);

        let err = cli
            .run_streaming(&args, Some(&dockerfile), &mut |_: &str| {})
            .unwrap_err();

        match err {
            EngineError::Failed { output, .. } => assert_eq!(output, vec!["refused"]),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
