use colored::*;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

/// Debug mode flag - controls whether debug output is visible
static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/// Project prefix for all log messages
const PROJECT_PREFIX: &str = "[DXB]";

/// Set debug mode
pub fn set_debug_mode(enabled: bool) {
    DEBUG_MODE.store(enabled, Ordering::Relaxed);
}

/// Check if debug mode is enabled
pub fn is_debug_mode() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

// ---------------------------------------------------------
// Semantic Styles - Simple one-line color functions
// ---------------------------------------------------------

pub fn style_error(msg: &str) -> String { msg.red().to_string() }
pub fn style_success(msg: &str) -> String { msg.green().to_string() }
pub fn style_warning(msg: &str) -> String { msg.yellow().to_string() }
pub fn style_info(msg: &str) -> String { msg.magenta().to_string() }
pub fn style_debug(msg: &str) -> String { msg.bright_black().to_string() }
pub fn style_command(cmd: &str) -> String { cmd.bright_black().to_string() }
pub fn style_title(title: &str) -> String { title.cyan().bold().to_string() }
pub fn style_name(name: &str) -> String { name.yellow().to_string() }

pub fn style_number<T: std::fmt::Display>(num: T) -> String {
    format!("{}", num).magenta().to_string()
}

pub fn style_path(path: &str) -> String {
    if is_yaml(path) { path.magenta().bold().to_string() }
    else if is_dockerfile(path) { path.cyan().bold().to_string() }
    else { path.blue().bold().to_string() }
}

// ---------------------------------------------------------
// Log Printers
// ---------------------------------------------------------

pub fn print_message(msg: &str) {
    println!("{} {}", PROJECT_PREFIX, msg);
}

pub fn print_success(msg: &str) {
    println!("{}{} {}", PROJECT_PREFIX, style_success("[PASS]"), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{}{} {}", PROJECT_PREFIX, style_error("[ERR] "), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{}{} {}", PROJECT_PREFIX, style_warning("[WARN]"), msg);
}

pub fn print_debug(msg: &str) {
    if is_debug_mode() {
        eprintln!("{}{} {}", PROJECT_PREFIX, style_debug("[DBG] "), msg);
    }
}

/// Print one line of engine output without the project prefix
pub fn print_build_log(line: &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    if !line.is_empty() {
        println!("{}", line);
    }
}

// ---------------------------------------------------------
// File Kind Checks
// ---------------------------------------------------------

/// Check if the path has a YAML extension (.yaml, .yml)
pub fn is_yaml(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Check if the file name looks like a Dockerfile (Dockerfile, Dockerfile-update, foo.Dockerfile)
pub fn is_dockerfile(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("Dockerfile") || name.ends_with(".Dockerfile"))
        .unwrap_or(false)
}

// ---------------------------------------------------------
// Checksums
// ---------------------------------------------------------

/// Hex-encoded SHA-256 of a file, read in fixed-size chunks
pub fn sha256_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = fs::File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

// ---------------------------------------------------------
// Downloads
// ---------------------------------------------------------

/// `<dest>.part`, where a download lands before it is complete
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Copy `body` to `dest`. `dest` only appears once the whole body is on disk.
pub fn save_download(body: &mut dyn Read, dest: &Path) -> io::Result<()> {
    let partial = partial_path(dest);
    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&partial)?;
        io::copy(body, &mut file)?;
        file.sync_all()?;
        fs::rename(&partial, dest)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kinds() {
        assert!(is_yaml("configs/app.yml"));
        assert!(is_yaml("app_config.YAML"));
        assert!(!is_yaml("Dockerfile"));

        assert!(is_dockerfile("/srv/app/Dockerfile"));
        assert!(is_dockerfile("Dockerfile-update"));
        assert!(is_dockerfile("web.Dockerfile"));
        assert!(!is_dockerfile("app_config.yaml"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/srv/files/tool.tgz")),
            PathBuf::from("/srv/files/tool.tgz.part")
        );
    }

    #[test]
    fn test_save_download_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("driver.run");

        save_download(&mut &b"driver-bits"[..], &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"driver-bits");
        assert!(!partial_path(&dest).exists());

        let missing = dir.path().join("no-such-dir").join("driver.run");
        assert!(save_download(&mut &b"x"[..], &missing).is_err());
        assert!(!missing.exists());
    }
}
