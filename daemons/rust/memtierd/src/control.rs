// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Enforcement backend. Most containers get their knobs applied by the
//! runtime from the returned updates; Kata-classed containers run in a
//! VM whose sandbox cgroups the runtime does not touch, so the daemon
//! writes those directly under the well-known `/vc/kata_<podId>` paths.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use log::{debug, info, warn};

use memtier::LinuxResources;

/// Sysfs parent directory of all cgroup controllers.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Cgroup controller mount points, discovered from /proc/mounts.
#[derive(Debug, Default)]
pub struct CgroupMounts {
    mounts: HashMap<String, PathBuf>,
}

impl CgroupMounts {
    pub fn discover() -> Self {
        match fs::read_to_string("/proc/mounts") {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                warn!("failed to read /proc/mounts: {e}");
                Self::default()
            }
        }
    }

    /// Parse a /proc/mounts listing. Each cgroup v1 mount maps its
    /// controller options to the path; a cgroup2 mount maps "cgroup2".
    pub fn parse(content: &str) -> Self {
        let mut mounts = HashMap::new();

        for entry in content.lines() {
            let fields: Vec<&str> = entry.split(' ').collect();
            if fields.len() < 4 {
                continue;
            }
            let (path, fstype, options) = (fields[1], fields[2], fields[3]);

            match fstype {
                "cgroup2" => {
                    mounts.insert("cgroup2".to_string(), PathBuf::from(path));
                }
                "cgroup" => {
                    for option in options.split(',') {
                        if matches!(
                            option,
                            "cpu" | "cpuset" | "cpuacct" | "memory" | "blkio" | "pids"
                        ) {
                            mounts.insert(option.to_string(), PathBuf::from(path));
                        }
                    }
                }
                _ => {}
            }
        }

        Self { mounts }
    }

    pub fn controller_dir(&self, controller: &str) -> Option<&Path> {
        self.mounts.get(controller).map(PathBuf::as_path)
    }
}

/// The sandbox cgroup directory of a Kata pod, relative to a
/// controller mount.
pub fn kata_cgroup_dir(pod_id: &str) -> String {
    format!("/vc/kata_{pod_id}")
}

/// Write one value into a cgroup entry.
fn write_cgroup_entry(entry: &Path, value: &str) -> Result<()> {
    info!("writing {:?} to {:?}", value, entry);
    fs::write(entry, format!("{value}\n"))
        .with_context(|| format!("{entry:?}: failed to write {value:?}"))
}

/// Apply a container's assigned resources to the Kata sandbox cgroups
/// of its pod. Zero or empty knobs are left alone.
pub fn apply_kata(pod_id: &str, resources: &LinuxResources) -> Result<()> {
    let cgroup = kata_cgroup_dir(pod_id);
    let cpu = PathBuf::from(CGROUP_ROOT).join("cpu").join(cgroup.trim_start_matches('/'));
    let cpuset = PathBuf::from(CGROUP_ROOT)
        .join("cpuset")
        .join(cgroup.trim_start_matches('/'));

    if resources.cpu_shares != 0 {
        write_cgroup_entry(&cpu.join("cpu.shares"), &resources.cpu_shares.to_string())?;
    }
    if resources.cpu_period != 0 {
        write_cgroup_entry(
            &cpu.join("cpu.cfs_period_us"),
            &resources.cpu_period.to_string(),
        )?;
    }
    if resources.cpu_quota != 0 {
        write_cgroup_entry(
            &cpu.join("cpu.cfs_quota_us"),
            &resources.cpu_quota.to_string(),
        )?;
    }
    if !resources.cpuset_cpus.is_empty() {
        write_cgroup_entry(&cpuset.join("cpuset.cpus"), &resources.cpuset_cpus)?;
    }
    if !resources.cpuset_mems.is_empty() {
        write_cgroup_entry(&cpuset.join("cpuset.mems"), &resources.cpuset_mems)?;
    }

    debug!("kata enforcement done for pod {pod_id}");
    Ok(())
}
