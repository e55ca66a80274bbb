//! Shell completion scripts

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::Shell;
use std::io;
use std::path::Path;

use crate::utils;
use crate::Cli;

/// Shell named by a `$SHELL` path such as `/usr/bin/zsh`
pub fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "powershell" | "pwsh" => Some(Shell::PowerShell),
        _ => None,
    }
}

pub fn handle_completion(shell: Option<Shell>) -> Result<()> {
    let shell = match shell {
        Some(shell) => shell,
        None => {
            let shell_path = std::env::var("SHELL").unwrap_or_default();
            match shell_from_path(&shell_path) {
                Some(shell) => shell,
                None => {
                    utils::print_error(&format!(
                        "Could not auto-detect shell from SHELL={:?}. Supported shells: bash, zsh, fish, elvish, powershell",
                        shell_path
                    ));
                    utils::print_message("Example: dxbuild completion bash");
                    return Ok(());
                }
            }
        }
    };

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, bin_name, &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/local/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }
}
