// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Daemon configuration file. Everything here is optional; values from
//! the file override the built-in defaults and the command line
//! overrides both.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use anyhow::Context;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use memtier::runtimes::Class;
use memtier::{MemType, TopologyHint};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pin_cpu: Option<bool>,
    pub pin_memory: Option<bool>,
    pub default_memory_type: Option<MemType>,
    /// Runtime-class table; replaces the built-in one when present.
    pub classes: Option<Vec<Class>>,
    /// Per-NUMA-node memory type overrides, keyed by node id.
    pub mem_type_overrides: BTreeMap<String, MemType>,
    /// Synthetic topology hints keyed by "<pod>:<container>" or by
    /// container name.
    pub fake_hints: HashMap<String, BTreeMap<String, TopologyHint>>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config {path:?}"))?;
        Self::parse(&content).with_context(|| format!("failed to parse config {path:?}"))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The memory-type override table with node ids parsed out.
    pub fn mem_overrides(&self) -> Result<BTreeMap<usize, MemType>> {
        let mut overrides = BTreeMap::new();
        for (node, &mem_type) in &self.mem_type_overrides {
            let id: usize = node
                .parse()
                .with_context(|| format!("bad NUMA node id {node:?} in mem_type_overrides"))?;
            if mem_type.tiers().count() != 1 {
                anyhow::bail!(
                    "override for NUMA node {} must name exactly one tier, got {}",
                    id,
                    mem_type
                );
            }
            overrides.insert(id, mem_type);
        }
        Ok(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config() {
        let config = Config::parse(
            r#"
            pin_cpu = true
            pin_memory = false
            default_memory_type = "dram"

            [[classes]]
            name = "kata"
            handler_pattern = "kata*"

            [[classes]]
            name = "cri"
            handler_pattern = ""

            [mem_type_overrides]
            2 = "hbm"

            [fake_hints."pod0:c0".gpu]
            cpus = "0-3"
            "#,
        )
        .unwrap();

        assert_eq!(config.pin_cpu, Some(true));
        assert_eq!(config.pin_memory, Some(false));
        assert_eq!(config.default_memory_type, Some(MemType::DRAM));
        assert_eq!(config.classes.as_ref().unwrap().len(), 2);
        assert_eq!(config.mem_overrides().unwrap()[&2], MemType::HBM);
        assert_eq!(
            config.fake_hints["pod0:c0"]["gpu"].cpus,
            "0-3".to_string()
        );
    }

    #[test]
    fn empty_config() {
        let config = Config::parse("").unwrap();
        assert!(config.pin_cpu.is_none());
        assert!(config.classes.is_none());
        assert!(config.mem_overrides().unwrap().is_empty());
    }

    #[test]
    fn bad_override_key() {
        let config = Config::parse("[mem_type_overrides]\nnode2 = \"hbm\"\n").unwrap();
        assert!(config.mem_overrides().is_err());
    }
}
