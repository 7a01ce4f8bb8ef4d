//! Isolator inspection CLI

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cgroups2_isolator::container::parse_container_id;
use cgroups2_isolator::CgroupFs;

#[derive(Parser)]
#[command(name = "isolator-ctl")]
#[command(about = "Inspect the cgroups v2 hierarchy of a container agent", long_about = None)]
struct Cli {
    /// cgroup2 mount point
    #[arg(long, default_value = "/sys/fs/cgroup")]
    mount: PathBuf,

    /// Agent root cgroup, relative to the mount point
    #[arg(long, default_value = "containers")]
    cgroups_root: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check cgroup v2 requirements
    Check,

    /// Show available and enabled controllers at the root cgroup
    Controllers,

    /// List container cgroups under the root
    List,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let fs = CgroupFs::with_mount(&cli.mount);
    let result = match cli.command {
        Commands::Check => check(&fs, &cli.cgroups_root),
        Commands::Controllers => controllers(&fs, &cli.cgroups_root),
        Commands::List => list(&fs, &cli.cgroups_root),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn check(fs: &CgroupFs, root: &str) -> cgroups2_isolator::Result<()> {
    println!(
        "cgroup2 kernel support: {}",
        if CgroupFs::enabled() { "yes" } else { "no" }
    );
    println!(
        "cgroup2 mounted: {}",
        if fs.mounted()? { "yes" } else { "no" }
    );
    println!(
        "root cgroup '{}': {}",
        root,
        if fs.exists(root) { "present" } else { "missing" }
    );
    Ok(())
}

fn controllers(fs: &CgroupFs, root: &str) -> cgroups2_isolator::Result<()> {
    let available = fs.available_controllers(root)?;
    let enabled = fs.enabled_controllers(root)?;

    println!("available: {}", Vec::from_iter(available).join(" "));
    println!("enabled:   {}", Vec::from_iter(enabled).join(" "));
    Ok(())
}

fn list(fs: &CgroupFs, root: &str) -> cgroups2_isolator::Result<()> {
    for cgroup in fs.list_descendants(root)? {
        if let Some(container_id) = parse_container_id(root, &cgroup) {
            println!("{container_id}\t{cgroup}");
        }
    }
    Ok(())
}
