use anyhow::Result;
use clap::{Args, Subcommand};
use std::env;
use std::io::{self, Write};

use crate::config::{validate_binary, AppConfig, ENV_PREFIX};
use crate::utils::{self, style_info, style_success, style_warning};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    #[command(about = "Show current configuration")]
    Show {
        #[arg(long, help = "Show only the user config file path")]
        path: bool,
    },
    #[command(about = "Create a user config file with the current settings")]
    Init,
}

pub fn handle_config(args: &ConfigArgs, config: &AppConfig) -> Result<()> {
    match &args.subcommand {
        ConfigSubcommand::Show { path } => handle_show(*path, config),
        ConfigSubcommand::Init => handle_init(config),
    }
}

fn handle_show(show_path: bool, config: &AppConfig) -> Result<()> {
    let config_path = AppConfig::get_user_config_path()?;

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    println!("User config: {}", utils::style_path(&config_path.display().to_string()));
    if config_path.exists() {
        println!("  {}\n", style_success("exists"));
    } else {
        println!("  {} (use 'dxbuild config init' to create)\n", style_warning("not found"));
    }

    println!("{}", utils::style_title("Loaded from:"));
    if config.sources.is_empty() {
        println!("  {}", style_info("defaults only"));
    }
    for source in &config.sources {
        println!("  {}", utils::style_path(&source.display().to_string()));
    }
    println!();

    println!("{}", utils::style_title("Docker:"));
    let docker_state = if validate_binary(&config.docker_bin) {
        style_success("found")
    } else {
        style_warning("not found")
    };
    println!("  docker_bin:      {} ({})", config.docker_bin.display(), docker_state);
    match &config.docker_socket {
        Some(socket) => println!("  docker_socket:   {}", socket),
        None => println!("  docker_socket:   {}", style_info("docker default")),
    }
    println!();

    println!("{}", utils::style_title("Build:"));
    println!("  build_dir:             {}", config.build.build_dir.display());
    println!("  always_push:           {}", config.build.always_push);
    println!("  fail_on_script_error:  {}", config.build.fail_on_script_error);
    println!("  driver_cache:          {}", config.driver_cache.display());
    println!();

    println!("{}", utils::style_title("GitHub:"));
    println!("  api_url:  {}", config.github_api_url);
    println!(
        "  token:    {}",
        if config.github_token.is_some() { style_success("set") } else { style_info("not set") }
    );
    println!();

    println!("{}", utils::style_title("Environment Variable Overrides:"));
    let prefix = format!("{}_", ENV_PREFIX);
    let mut overrides: Vec<(String, String)> = env::vars()
        .filter(|(key, _)| key.starts_with(&prefix))
        .collect();
    overrides.sort();
    if overrides.is_empty() {
        println!("  {}", style_info("none"));
    }
    for (key, value) in overrides {
        println!("  {}={}", key, value);
    }

    Ok(())
}

fn handle_init(config: &AppConfig) -> Result<()> {
    let config_path = AppConfig::get_user_config_path()?;

    if config_path.exists() {
        print!(
            "{} Config file already exists: {}\nOverwrite? [y/N]: ",
            style_warning("Warning:"),
            config_path.display()
        );
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().read_line(&mut response)?;
        let response = response.trim().to_lowercase();

        if response != "y" && response != "yes" {
            utils::print_message("Cancelled");
            return Ok(());
        }
    }

    if !validate_binary(&config.docker_bin) {
        utils::print_warning("Cannot find docker. Set docker_bin in the config file before building.");
    }

    let written = config.save_config()?;
    utils::print_success(&format!(
        "Config file created: {}",
        utils::style_path(&written.display().to_string())
    ));

    Ok(())
}
