// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod config;
mod control;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use memtier::{ClassMap, Policy, PolicyOptions, ResourceManager, SysfsSystem};

use config::Config;
use server::Server;

/// memtierd: topology-aware CPU and memory-tier placement for
/// containers.
///
/// Sits between the orchestration agent and the container runtime,
/// decides per-container CPU and memory pinning from the host topology,
/// and hands the resulting cgroup knobs back for enforcement.
#[derive(Debug, Parser)]
#[command(version)]
struct Opts {
    /// Unix socket the runtime shim connects to.
    #[arg(long, default_value = "/var/run/memtierd/events.sock")]
    socket: PathBuf,

    /// File the grant snapshot is kept in.
    #[arg(long, default_value = "/var/lib/memtierd/allocations.json")]
    state_file: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Do not write cpuset.cpus/cpu.shares decisions.
    #[arg(long)]
    no_pin_cpu: bool,

    /// Do not write cpuset.mems decisions.
    #[arg(long)]
    no_pin_memory: bool,

    /// Skip direct cgroup writes for Kata sandboxes.
    #[arg(long)]
    no_kata_enforcement: bool,

    /// Path to the cgroup-v2 mountpoint.
    #[arg(long, default_value = "/sys/fs/cgroup/unified")]
    cgroupv2_path: PathBuf,

    /// The --cgroup-root the kubelet was started with.
    #[arg(long, default_value = "")]
    kubelet_cgroup_root: String,

    /// Increase logging verbosity (-v: debug, -vv: trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_log(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_log(opts.verbose)?;

    let config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let classes = config.classes.clone().map_or_else(ClassMap::default, |classes| {
        ClassMap { classes }
    });
    classes.validate()?;

    let sys = SysfsSystem::discover_at("", &config.mem_overrides()?)
        .context("host topology discovery failed")?;

    let options = PolicyOptions {
        pin_cpu: config.pin_cpu.unwrap_or(!opts.no_pin_cpu),
        pin_memory: config.pin_memory.unwrap_or(!opts.no_pin_memory),
        default_mem_type: config
            .default_memory_type
            .unwrap_or(memtier::MemType::DRAM),
        fake_hints: config.fake_hints.clone(),
        state_file: Some(opts.state_file.clone()),
    };

    let policy = Policy::new(Box::new(sys), options)?;
    let mgr = Arc::new(ResourceManager::new(policy));
    mgr.restore().context("failed to restore saved state")?;

    let mounts = control::CgroupMounts::discover();
    let cgroupv2 = mounts
        .controller_dir("cgroup2")
        .map(PathBuf::from)
        .unwrap_or_else(|| opts.cgroupv2_path.clone());
    info!(
        "cgroup v2 at {:?}, kubelet cgroup root {:?}",
        cgroupv2, opts.kubelet_cgroup_root
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let server = Arc::new(Server::new(
        mgr,
        classes,
        !opts.no_kata_enforcement,
    ));
    server.serve(&opts.socket, shutdown)
}
