use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::build::load_run_descriptors;
use crate::build::BuildGraph;
use crate::config::AppConfig;
use crate::utils;

#[derive(Args, Debug)]
pub struct OrderArgs {
    #[arg(long, help = "Use the automatic apps under the configured build_dir")]
    pub auto: bool,
    #[arg(default_value = ".", help = "App directory holding app_config.yaml and/or configs/")]
    pub path: PathBuf,
}

pub fn handle_order(args: &OrderArgs, config: &AppConfig) -> Result<()> {
    let descriptors = load_run_descriptors(&args.path, args.auto, config)?;
    let graph = BuildGraph::from_descriptors(&descriptors);
    let order = graph.topological_order()?;
    utils::print_debug(&format!(
        "Graph has {} images and {} dependencies",
        graph.node_count(),
        graph.edge_count()
    ));

    println!("{}", utils::style_title("Build order:"));
    for (index, descriptor) in order.iter().enumerate() {
        let name = descriptor.full_image_name();
        println!(
            "{:>3}. {}  {}",
            index + 1,
            utils::style_name(&name),
            utils::style_path(&descriptor.source_path.to_string_lossy())
        );
        let dependencies: Vec<String> = graph
            .dependencies_of(&name)
            .into_iter()
            .map(|dep| {
                if graph.is_external(dep) {
                    format!("{} (external)", dep)
                } else {
                    dep.to_string()
                }
            })
            .collect();
        if !dependencies.is_empty() {
            println!("       FROM {}", dependencies.join(", "));
        }
    }

    let external = graph.external_nodes();
    if !external.is_empty() {
        println!();
        println!("{}", utils::style_title("External base images:"));
        for image in external {
            println!("  {}", image);
        }
    }

    Ok(())
}
