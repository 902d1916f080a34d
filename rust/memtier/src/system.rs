// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host topology description. The policy consumes the host through the
//! [`System`] trait: CPU packages, NUMA nodes with their CPU spans and
//! memory tiers, and the kernel-isolated CPU set. [`SysfsSystem`] reads
//! the real host from `/sys/devices/system`; [`mock::MockSystem`] builds
//! synthetic hosts for tests and dry runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use idxset::IdxSet;
use log::warn;
use sscanf::sscanf;

use crate::memory::MemType;

/// One NUMA node of the host.
#[derive(Debug, Clone)]
pub struct SysNode {
    pub id: usize,
    /// The CPU package this node belongs to.
    pub package_id: usize,
    /// CPUs attached to this node; empty for memory-only nodes.
    pub cpus: IdxSet,
    pub mem_type: MemType,
    pub mem_total: u64,
}

/// Point-in-time memory statistics of one NUMA node.
#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
}

/// The host hardware as seen by the policy.
pub trait System: Send {
    /// Sorted CPU package ids.
    fn package_ids(&self) -> Vec<usize>;
    /// Sorted NUMA node ids.
    fn node_ids(&self) -> Vec<usize>;
    fn node(&self, id: usize) -> Option<&SysNode>;
    /// CPUs excluded from normal scheduling (`isolcpus=`).
    fn isolated_cpus(&self) -> &IdxSet;
    /// Current memory statistics of a node. Re-read on every call; the
    /// policy caches the result per decision.
    fn node_meminfo(&self, id: usize) -> Result<MemInfo>;

    fn socket_count(&self) -> usize {
        self.package_ids().len()
    }

    fn numa_node_count(&self) -> usize {
        self.node_ids().len()
    }
}

/// The real host, discovered from sysfs.
pub struct SysfsSystem {
    root: String,
    packages: Vec<usize>,
    nodes: BTreeMap<usize, SysNode>,
    isolated: IdxSet,
}

impl SysfsSystem {
    /// Discover the host topology under the default sysfs mount.
    pub fn discover() -> Result<Self> {
        Self::discover_at("", &BTreeMap::new())
    }

    /// Discover the host topology under `root` (usually empty; tests
    /// point this at an unpacked sysfs snapshot). `mem_overrides` remaps
    /// the detected memory type of individual nodes, for hosts whose
    /// HBM/PMEM tiering is not visible in sysfs.
    pub fn discover_at(root: &str, mem_overrides: &BTreeMap<usize, MemType>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let mut packages = Vec::new();

        let pattern = format!("{root}/sys/devices/system/node/node*");
        for node_path in glob(&pattern)?.filter_map(Result::ok) {
            let node_str = node_path.to_str().unwrap_or_default().trim();
            let id = if root.is_empty() {
                match sscanf!(node_str, "/sys/devices/system/node/node{usize}") {
                    Ok(id) => id,
                    Err(_) => bail!("failed to parse NUMA node id from {:?}", node_str),
                }
            } else {
                match sscanf!(node_str, "{str}/sys/devices/system/node/node{usize}") {
                    Ok((_, id)) => id,
                    Err(_) => bail!("failed to parse NUMA node id from {:?}", node_str),
                }
            };

            let cpulist = read_trimmed(&node_path.join("cpulist")).unwrap_or_default();
            let cpus: IdxSet = cpulist.parse()?;

            let package_id = match cpus.iter().next() {
                Some(cpu) => read_package_id(root, cpu)?,
                // memory-only node, no CPU to read the package from
                None => 0,
            };

            let mem_total = read_node_memtotal(&node_path.join("meminfo"), id)?;
            let mem_type = match mem_overrides.get(&id) {
                Some(&t) => t,
                None if cpus.is_empty() => MemType::PMEM,
                None => MemType::DRAM,
            };

            nodes.insert(
                id,
                SysNode {
                    id,
                    package_id,
                    cpus,
                    mem_type,
                    mem_total,
                },
            );
        }

        if nodes.is_empty() {
            bail!("no NUMA nodes found under {root}/sys/devices/system/node");
        }

        let cpu_pattern = format!("{root}/sys/devices/system/cpu/cpu[0-9]*");
        for cpu_path in glob(&cpu_pattern)?.filter_map(Result::ok) {
            let cpu_str = cpu_path.to_str().unwrap_or_default().trim();
            let cpu = if root.is_empty() {
                match sscanf!(cpu_str, "/sys/devices/system/cpu/cpu{usize}") {
                    Ok(id) => id,
                    Err(_) => continue,
                }
            } else {
                match sscanf!(cpu_str, "{str}/sys/devices/system/cpu/cpu{usize}") {
                    Ok((_, id)) => id,
                    Err(_) => continue,
                }
            };
            match read_package_id(root, cpu) {
                Ok(pkg) if !packages.contains(&pkg) => packages.push(pkg),
                Ok(_) => {}
                Err(e) => warn!("cpu{cpu}: no package id: {e:#}"),
            }
        }
        packages.sort_unstable();

        let isolated = match read_trimmed(Path::new(&format!(
            "{root}/sys/devices/system/cpu/isolated"
        ))) {
            Ok(list) => list.parse()?,
            Err(_) => IdxSet::new(),
        };

        Ok(Self {
            root: root.to_string(),
            packages,
            nodes,
            isolated,
        })
    }
}

impl System for SysfsSystem {
    fn package_ids(&self) -> Vec<usize> {
        self.packages.clone()
    }

    fn node_ids(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    fn node(&self, id: usize) -> Option<&SysNode> {
        self.nodes.get(&id)
    }

    fn isolated_cpus(&self) -> &IdxSet {
        &self.isolated
    }

    fn node_meminfo(&self, id: usize) -> Result<MemInfo> {
        let path = format!("{}/sys/devices/system/node/node{id}/meminfo", self.root);
        read_node_meminfo(Path::new(&path), id)
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)
        .with_context(|| format!("failed to read {path:?}"))?
        .trim()
        .to_string())
}

fn read_package_id(root: &str, cpu: usize) -> Result<usize> {
    let path = format!("{root}/sys/devices/system/cpu/cpu{cpu}/topology/physical_package_id");
    read_trimmed(Path::new(&path))?
        .parse()
        .with_context(|| format!("bad physical_package_id for cpu{cpu}"))
}

/// Pick one `Node <id> <field>: <n> kB` line out of a per-node meminfo
/// file and return it in bytes.
fn read_meminfo_field(content: &str, id: usize, field: &str) -> Result<u64> {
    for line in content.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("Node") {
            continue;
        }
        if words.next() != Some(id.to_string().as_str()) {
            continue;
        }
        if words.next() != Some(field) {
            continue;
        }
        let kb: u64 = match words.next() {
            Some(v) => v.parse().with_context(|| format!("bad {field} value in {line:?}"))?,
            None => bail!("truncated meminfo line {:?}", line),
        };
        return Ok(kb * 1024);
    }
    bail!("no {} for node {} in meminfo", field, id);
}

fn read_node_memtotal(path: &Path, id: usize) -> Result<u64> {
    let content = read_trimmed(path)?;
    read_meminfo_field(&content, id, "MemTotal:")
}

fn read_node_meminfo(path: &Path, id: usize) -> Result<MemInfo> {
    let content = read_trimmed(path)?;
    Ok(MemInfo {
        mem_total: read_meminfo_field(&content, id, "MemTotal:")?,
        mem_free: read_meminfo_field(&content, id, "MemFree:")?,
    })
}

pub mod mock {
    //! Synthetic hosts for tests and dry runs.

    use super::*;
    use std::sync::Mutex;

    /// A synthetic host, assembled node by node.
    pub struct MockSystem {
        packages: Vec<usize>,
        nodes: BTreeMap<usize, SysNode>,
        isolated: IdxSet,
        free: Mutex<BTreeMap<usize, u64>>,
    }

    impl Default for MockSystem {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockSystem {
        pub fn new() -> Self {
            Self {
                packages: Vec::new(),
                nodes: BTreeMap::new(),
                isolated: IdxSet::new(),
                free: Mutex::new(BTreeMap::new()),
            }
        }

        /// Add a NUMA node. Memory-only tiers pass an empty cpu list.
        pub fn node(
            mut self,
            id: usize,
            package_id: usize,
            cpus: &str,
            mem_type: MemType,
            mem_total: u64,
        ) -> Self {
            let cpus: IdxSet = cpus.parse().expect("bad cpu list");
            if !self.packages.contains(&package_id) {
                self.packages.push(package_id);
                self.packages.sort_unstable();
            }
            self.free.lock().unwrap().insert(id, mem_total);
            self.nodes.insert(
                id,
                SysNode {
                    id,
                    package_id,
                    cpus,
                    mem_type,
                    mem_total,
                },
            );
            self
        }

        pub fn isolated(mut self, cpus: &str) -> Self {
            self.isolated = cpus.parse().expect("bad cpu list");
            self
        }

        /// Override the free memory a node reports.
        pub fn set_free_mem(&self, id: usize, free: u64) {
            self.free.lock().unwrap().insert(id, free);
        }
    }

    impl System for MockSystem {
        fn package_ids(&self) -> Vec<usize> {
            self.packages.clone()
        }

        fn node_ids(&self) -> Vec<usize> {
            self.nodes.keys().copied().collect()
        }

        fn node(&self, id: usize) -> Option<&SysNode> {
            self.nodes.get(&id)
        }

        fn isolated_cpus(&self) -> &IdxSet {
            &self.isolated
        }

        fn node_meminfo(&self, id: usize) -> Result<MemInfo> {
            let node = match self.nodes.get(&id) {
                Some(n) => n,
                None => bail!("no NUMA node {}", id),
            };
            let free = *self.free.lock().unwrap().get(&id).unwrap_or(&node.mem_total);
            Ok(MemInfo {
                mem_total: node.mem_total,
                mem_free: free,
            })
        }
    }
}
