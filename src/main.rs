use anyhow::Result;
use clap::{Parser, Subcommand};

mod build;
mod commands;
mod config;
mod utils;

use commands::build::{handle_build, BuildArgs};
use commands::config::{handle_config, ConfigArgs};
use commands::order::{handle_order, OrderArgs};
use config::AppConfig;

fn main() -> Result<()> {
    let Cli { debug, command } = Cli::parse();

    utils::set_debug_mode(debug);

    if let Command::Completion { shell } = command {
        return commands::completion::handle_completion(shell);
    }

    let config = AppConfig::new(debug)?;

    if debug {
        utils::print_debug(&format!("dxbuild version: {}", config.version));
        utils::print_debug(&format!("Docker binary: {}", config.docker_bin.display()));
        utils::print_debug(&format!("Build directory: {}", config.build.build_dir.display()));
        utils::print_debug(&format!("{config:#?}"));
    }

    run_command(command, &config)
}

fn run_command(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Build(args) => handle_build(&args, config),
        Command::Order(args) => handle_order(&args, config),
        Command::Config(args) => handle_config(&args, config),
        Command::Completion { shell } => commands::completion::handle_completion(shell),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dxbuild",
    author,
    version,
    about = "Build docker app images in dependency order."
)]
struct Cli {
    #[arg(short, long, global = true, help = "Enable debug mode with verbose output")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Resolve dependencies and build images", alias = "b")]
    Build(BuildArgs),
    #[command(about = "Show the order images would be built in")]
    Order(OrderArgs),
    #[command(about = "Manage dxbuild configuration")]
    Config(ConfigArgs),
    #[command(
        about = "Generate shell completion scripts",
        long_about = "Generate shell completion scripts.

Auto-detects your shell from $SHELL if no argument is provided.

Examples:
  source <(dxbuild completion)
  dxbuild completion fish > ~/.config/fish/completions/dxbuild.fish"
    )]
    Completion {
        #[arg(value_enum, help = "Shell to generate completion for (auto-detected if omitted)")]
        shell: Option<clap_complete::Shell>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_build_command() {
        let cli = Cli::parse_from(["dxbuild", "build", "--auto", "--push", "-d", "apps"]);
        assert!(cli.debug);
        match cli.command {
            Command::Build(args) => {
                assert!(args.auto && args.push && !args.update);
                assert_eq!(args.path, std::path::PathBuf::from("apps"));
            }
            other => panic!("expected build, got {:?}", other),
        }
    }
}
