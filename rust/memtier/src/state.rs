// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Grant persistence. After every successful allocate or release the
//! policy rewrites a snapshot of its grants; on startup the snapshot is
//! replayed against the freshly discovered topology. Grants are stored
//! by value with pool references resolved by name, so a reboot that
//! changes pool ids cannot corrupt the accounting. The schema carries an
//! explicit version; unknown versions refuse to load.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::memory::MemType;
use crate::pools::PoolTree;
use crate::resources::{Grant, Request};

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub timestamp: u64,
    pub grants: Vec<GrantRecord>,
}

/// One grant, serialized by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRecord {
    pub container: String,
    pub cpu_node: String,
    pub memory_node: String,
    pub exclusive: String,
    pub shared_portion: usize,
    pub mem_type: MemType,
    pub mem_limit: u64,
}

impl GrantRecord {
    fn from_grant(tree: &PoolTree, grant: &Grant) -> Self {
        Self {
            container: grant.container.clone(),
            cpu_node: tree.get(grant.cpu_node).name.clone(),
            memory_node: tree.get(grant.memory_node).name.clone(),
            exclusive: grant.exclusive.to_string(),
            shared_portion: grant.portion,
            mem_type: grant.mem_type,
            mem_limit: grant.mem_limit,
        }
    }

    /// Rebuild the grant against the given pool of a fresh tree.
    pub fn into_grant(self, tree: &PoolTree, pool: usize) -> Result<Grant> {
        let exclusive: idxset::IdxSet = self
            .exclusive
            .parse()
            .with_context(|| format!("bad exclusive cpuset for {}", self.container))?;

        let noderes = &tree.get(pool).noderes;
        let isolate = !exclusive.is_empty()
            && noderes
                .isolated()
                .contains_all(&exclusive.indices());

        let request = Request {
            container: self.container.clone(),
            full: exclusive.len(),
            fraction: self.shared_portion,
            isolate,
            mem_req: self.mem_limit,
            mem_lim: self.mem_limit,
            mem_type: self.mem_type,
            elevate: 0,
        };

        Ok(Grant {
            container: self.container,
            cpu_node: pool,
            memory_node: pool,
            exclusive,
            portion: self.shared_portion,
            mem_type: self.mem_type,
            memset: tree.grant_memset(pool, self.mem_type),
            mem_limit: self.mem_limit,
            request,
        })
    }
}

/// Rewrite the snapshot file with the current grants.
pub fn save(path: &Path, tree: &PoolTree, allocations: &HashMap<String, Grant>) -> Result<()> {
    let mut grants: Vec<GrantRecord> = allocations
        .values()
        .map(|g| GrantRecord::from_grant(tree, g))
        .collect();
    grants.sort_by(|a, b| a.container.cmp(&b.container));

    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        grants,
    };

    let data = serde_json::to_vec_pretty(&snapshot)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).with_context(|| format!("failed to write snapshot {tmp:?}"))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace snapshot {path:?}"))?;

    Ok(())
}

/// Load a snapshot. A snapshot that cannot be parsed, or whose version
/// is unknown, is a fatal error: refusing to start beats silently
/// double-booking resources.
pub fn load(path: &Path) -> Result<Snapshot> {
    let data =
        fs::read(path).with_context(|| format!("failed to read snapshot {path:?}"))?;
    let snapshot: Snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse snapshot {path:?}"))?;

    if snapshot.version != SNAPSHOT_VERSION {
        bail!(
            "unsupported snapshot version {} in {:?} (expected {})",
            snapshot.version,
            path,
            SNAPSHOT_VERSION
        );
    }

    Ok(snapshot)
}
