// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The memtier placement policy. One decision per lifecycle event:
//! build a request from the container, weigh the pools by affinity,
//! score, filter and sort them, book the winner's supply, and push the
//! resulting cpuset/memset knobs back into the container cache.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::{debug, info, warn};

use crate::affinity::calculate_container_affinity;
use crate::cache::{milli_cpu_to_shares, Cache, TopologyHint, NAMESPACE_SYSTEM};
use crate::memory::MemType;
use crate::pools::PoolTree;
use crate::resources::{Grant, Request, Score};
use crate::state;
use crate::system::{MemInfo, System};

/// Name the policy goes by in annotations and logs.
pub const POLICY_NAME: &str = "memtier";

pub struct PolicyOptions {
    /// Write cpuset.cpus/cpu.shares decisions.
    pub pin_cpu: bool,
    /// Write cpuset.mems decisions.
    pub pin_memory: bool,
    /// Memory type used when a request does not express one.
    pub default_mem_type: MemType,
    /// Synthetic topology hints keyed by "<pod>:<container>" or by
    /// container name, evaluated alongside the real ones.
    pub fake_hints: HashMap<String, BTreeMap<String, TopologyHint>>,
    /// Where grants are snapshotted for crash recovery; `None` disables
    /// persistence.
    pub state_file: Option<PathBuf>,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            pin_cpu: true,
            pin_memory: true,
            default_mem_type: MemType::DRAM,
            fake_hints: HashMap::new(),
            state_file: None,
        }
    }
}

pub struct Policy {
    sys: Box<dyn System>,
    tree: PoolTree,
    allocations: HashMap<String, Grant>,
    options: PolicyOptions,
}

impl Policy {
    pub fn new(sys: Box<dyn System>, options: PolicyOptions) -> Result<Self> {
        let tree = PoolTree::build(sys.as_ref())?;
        info!("{}: built a tree of {} pools", POLICY_NAME, tree.len());
        Ok(Self {
            sys,
            tree,
            allocations: HashMap::new(),
            options,
        })
    }

    pub fn tree(&self) -> &PoolTree {
        &self.tree
    }

    pub fn allocation(&self, container: &str) -> Option<&Grant> {
        self.allocations.get(container)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Pick a pool for the container and allocate its resources there.
    pub fn allocate(&mut self, cache: &mut Cache, container_id: &str) -> Result<Grant> {
        let (request, hints, namespace) = {
            let container = match cache.lookup_container(container_id) {
                Some(c) => c,
                None => bail!("can't allocate unknown container {}", container_id),
            };
            let pod = match cache.pod_of(container) {
                Some(p) => p,
                None => bail!("container {} has no cached pod", container_id),
            };

            let request = Request::new(container, pod, self.options.default_mem_type);

            let mut hints = container.hints.clone();
            for key in [
                format!("{}:{}", pod.name, container.name),
                container.name.clone(),
            ] {
                if let Some(fake) = self.options.fake_hints.get(&key) {
                    hints.extend(fake.iter().map(|(p, h)| (p.clone(), h.clone())));
                }
            }

            (request, hints, container.namespace.clone())
        };

        let pool = if namespace == NAMESPACE_SYSTEM {
            // system workloads always get the broadest placement
            self.tree.root()
        } else {
            let affinity = self.pool_affinities(cache, container_id);
            let pools = self.sort_pools_by_score(&request, &affinity, &hints);

            debug!("* pool fitting for {request}");
            for (idx, &id) in pools.iter().enumerate() {
                debug!(
                    "    - #{idx}: {}, affinity {}",
                    self.tree.get(id).name,
                    affinity.get(&id).copied().unwrap_or(0)
                );
            }

            match pools.first() {
                Some(&id) => id,
                None => bail!("insufficient resources: no pool can satisfy {}", request),
            }
        };

        let grant = self
            .tree
            .allocate(pool, &request)
            .with_context(|| format!("failed to allocate {} from pool #{}", request, pool))?;

        info!("allocated {} => {}", request, grant);

        self.allocations
            .insert(container_id.to_string(), grant.clone());
        self.apply_grant(cache, &grant);
        self.update_shared_allocations(cache);
        self.save_allocations()?;

        Ok(grant)
    }

    /// Release whatever was allocated to the container. Returns false
    /// if it held no grant.
    pub fn release(&mut self, cache: &mut Cache, container_id: &str) -> Result<bool> {
        let grant = match self.allocations.remove(container_id) {
            Some(grant) => grant,
            None => {
                debug!("no grant for {}, nothing to release", container_id);
                return Ok(false);
            }
        };

        info!("releasing {}", grant);
        self.tree.release(&grant);
        self.update_shared_allocations(cache);
        self.save_allocations()?;

        Ok(true)
    }

    /// Translate a grant into the container's cgroup knobs.
    fn apply_grant(&self, cache: &mut Cache, grant: &Grant) {
        let container = match cache.container_mut(&grant.container) {
            Some(c) => c,
            None => {
                warn!("grant {} for a container not in the cache", grant);
                return;
            }
        };

        let pool = self.tree.get(grant.cpu_node);
        let shared = pool.freeres.sharable();
        let cpus = if grant.exclusive.is_empty() {
            shared.to_string()
        } else {
            grant.exclusive.union(shared).to_string()
        };

        if self.options.pin_cpu {
            if cpus.is_empty() {
                debug!("not pinning {}: empty cpuset", container.pretty_name());
            } else {
                container.set_cpuset_cpus(&cpus);
            }
            container.set_cpu_shares(milli_cpu_to_shares(grant.portion));
        }

        if self.options.pin_memory && !pool.is_root() {
            let mems = grant.memset.to_string();
            if !mems.is_empty() {
                container.set_cpuset_mems(&mems);
            }
        }
    }

    /// Refresh the effective cpuset of every grant drawing on a shared
    /// pool; an allocate or release next to them may have changed what
    /// the shared set contains.
    fn update_shared_allocations(&self, cache: &mut Cache) {
        if !self.options.pin_cpu {
            return;
        }
        for grant in self.allocations.values() {
            if grant.portion == 0 {
                continue;
            }
            let shared = self.tree.get(grant.cpu_node).freeres.sharable();
            let cpus = grant.exclusive.union(shared).to_string();
            if let Some(container) = cache.container_mut(&grant.container) {
                container.set_cpuset_cpus(&cpus);
            }
        }
    }

    /// Per-pool affinity weights for a container: the weights of its
    /// matching peers, summed over the pools those peers are placed in.
    pub fn pool_affinities(&self, cache: &Cache, container_id: &str) -> HashMap<usize, i32> {
        let container = match cache.lookup_container(container_id) {
            Some(c) => c,
            None => return HashMap::new(),
        };

        let mut result = HashMap::new();
        for (peer, weight) in calculate_container_affinity(container, cache) {
            if let Some(grant) = self.allocations.get(&peer) {
                *result.entry(grant.cpu_node).or_insert(0) += weight;
            }
        }
        result
    }

    fn score_pool(&self, id: usize, req: &Request, hints: &BTreeMap<String, TopologyHint>) -> Score {
        let pool = self.tree.get(id);
        let (isolated, shared) = pool
            .freeres
            .score(req, self.tree.granted_shared_cpu(id));
        let colocated = self
            .allocations
            .values()
            .filter(|g| g.cpu_node == id)
            .count();
        let hints = hints
            .iter()
            .map(|(provider, hint)| (provider.clone(), pool.hint_score(hint)))
            .collect();

        Score {
            pool: id,
            isolated,
            shared,
            colocated,
            hints,
        }
    }

    /// Free memory of a pool: the sum over its physical NUMA nodes,
    /// each fetched at most once per decision.
    fn pool_free_memory(&self, id: usize, infos: &mut HashMap<usize, MemInfo>) -> Result<u64> {
        let mut free = 0;
        for &node in &self.tree.get(id).physical_nodes {
            let info = match infos.get(&node) {
                Some(info) => *info,
                None => {
                    let info = self.sys.node_meminfo(node)?;
                    infos.insert(node, info);
                    info
                }
            };
            free += info.mem_free;
        }
        Ok(free)
    }

    /// Drop pools without enough uncompressible (memory) capacity for
    /// the request.
    fn filter_insufficient_resources(&self, req: &Request) -> Vec<usize> {
        let mut infos = HashMap::new();
        let mut filtered = Vec::new();

        for pool in self.tree.pools() {
            match self.pool_free_memory(pool.id, &mut infos) {
                Ok(free) if free >= req.mem_lim => filtered.push(pool.id),
                Ok(free) => debug!(
                    "filtering out {}: {} bytes free < {} requested",
                    pool.name, free, req.mem_lim
                ),
                Err(e) => warn!("filtering out {}: {:#}", pool.name, e),
            }
        }

        filtered
    }

    /// Score every pool, drop the ones that cannot hold the request's
    /// memory, and sort the survivors best first.
    pub fn sort_pools_by_score(
        &self,
        req: &Request,
        affinity: &HashMap<usize, i32>,
        hints: &BTreeMap<String, TopologyHint>,
    ) -> Vec<usize> {
        let scores: HashMap<usize, Score> = self
            .tree
            .pools()
            .map(|p| (p.id, self.score_pool(p.id, req, hints)))
            .collect();

        let mut filtered = self.filter_insufficient_resources(req);
        filtered.sort_by(|&a, &b| self.compare_scores(req, &scores, affinity, a, b));
        filtered
    }

    /// The total order deciding between two candidate pools; the first
    /// satisfied rule wins:
    ///
    ///  1. insufficient isolated or shared capacity loses
    ///  2. higher affinity wins
    ///  3. matching memory type wins
    ///  4. better topology-hint score wins (ties by lower node, then id)
    ///  5. a pool lower in the tree wins
    ///  6. isolated allocations: more isolated capacity, then smaller id
    ///  7. exclusive allocations: more slicable capacity, then smaller id
    ///  8. shared allocations: fewer colocated containers, more shared
    ///     capacity, smaller id
    fn compare_scores(
        &self,
        req: &Request,
        scores: &HashMap<usize, Score>,
        affinity: &HashMap<usize, i32>,
        id1: usize,
        id2: usize,
    ) -> Ordering {
        let (pool1, pool2) = (self.tree.get(id1), self.tree.get(id2));
        let (depth1, depth2) = (pool1.depth, pool2.depth);
        let (score1, score2) = (&scores[&id1], &scores[&id2]);
        let (isolated1, shared1) = (score1.isolated, score1.shared);
        let (isolated2, shared2) = (score2.isolated, score2.shared);
        let affinity1 = affinity.get(&id1).copied().unwrap_or(0);
        let affinity2 = affinity.get(&id2).copied().unwrap_or(0);

        // 1) a pool with insufficient isolated or shared capacity loses
        let starved1 = isolated1 < 0 || shared1 < 0;
        let starved2 = isolated2 < 0 || shared2 < 0;
        match (starved1, starved2) {
            (true, true) => return id1.cmp(&id2),
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (false, false) => {}
        }

        // 2) higher affinity wins
        if affinity1 != affinity2 {
            return affinity2.cmp(&affinity1);
        }

        // 3) matching memory type wins
        if !req.mem_type.is_unspec() {
            let match1 = pool1.mem_type.contains(req.mem_type);
            let match2 = pool2.mem_type.contains(req.mem_type);
            if match1 && !match2 {
                return Ordering::Less;
            }
            if !match1 && match2 {
                return Ordering::Greater;
            }
        }

        // 4) better topology hint score wins
        if !score1.hints.is_empty() {
            let (hs1, nz1) = combine_hint_scores(&score1.hints);
            let (hs2, nz2) = combine_hint_scores(&score2.hints);

            if hs1 != hs2 {
                return hs2.total_cmp(&hs1);
            }
            if hs1 == 0.0 && nz1 != nz2 {
                return nz2.total_cmp(&nz1);
            }

            // a meaningful tie settles on the lower pool, then the
            // smaller id
            if nz1 == nz2 && (hs1 != 0.0 || nz1 != 0.0) {
                if depth1 != depth2 {
                    return depth2.cmp(&depth1);
                }
                return id1.cmp(&id2);
            }
        }

        // 5) a pool lower in the tree wins
        if depth1 != depth2 {
            return depth2.cmp(&depth1);
        }

        // 6) more isolated capacity wins
        if req.isolate {
            if isolated1 != isolated2 {
                return isolated2.cmp(&isolated1);
            }
            return id1.cmp(&id2);
        }

        // 7) more slicable shared capacity wins
        if req.full > 0 {
            if shared1 != shared2 {
                return shared2.cmp(&shared1);
            }
            return id1.cmp(&id2);
        }

        // 8) fewer colocated containers win
        if score1.colocated != score2.colocated {
            return score1.colocated.cmp(&score2.colocated);
        }
        if shared1 != shared2 {
            return shared2.cmp(&shared1);
        }
        id1.cmp(&id2)
    }

    /// Snapshot the current grants after a successful change.
    fn save_allocations(&self) -> Result<()> {
        if let Some(path) = &self.options.state_file {
            state::save(path, &self.tree, &self.allocations)?;
        }
        Ok(())
    }

    /// Replay a snapshot against the freshly discovered topology:
    /// re-book every grant whose pool and container still exist, drop
    /// the rest. Called once at startup, before any new events.
    pub fn restore(&mut self, cache: &mut Cache) -> Result<()> {
        let path = match &self.options.state_file {
            Some(path) if path.exists() => path.clone(),
            _ => return Ok(()),
        };

        let snapshot = state::load(&path)?;
        let mut grants = Vec::new();

        for record in snapshot.grants {
            if self.allocations.contains_key(&record.container) {
                continue;
            }
            let pool = match self.tree.by_name(&record.cpu_node) {
                Some(pool) => pool.id,
                None => {
                    warn!(
                        "dropping stale grant for {}: unknown pool {:?}",
                        record.container, record.cpu_node
                    );
                    continue;
                }
            };
            if cache.lookup_container(&record.container).is_none() {
                warn!(
                    "dropping grant for unknown container {}",
                    record.container
                );
                continue;
            }
            match record.into_grant(&self.tree, pool) {
                Ok(grant) => grants.push(grant),
                Err(e) => warn!("dropping unrestorable grant: {:#}", e),
            }
        }

        for grant in grants {
            if let Err(e) = self.tree.rebook(&grant) {
                warn!("dropping grant {}: {:#}", grant, e);
                continue;
            }
            info!("restored {}", grant);
            self.apply_grant(cache, &grant);
            self.allocations.insert(grant.container.clone(), grant);
        }

        self.update_shared_allocations(cache);
        self.save_allocations()
    }
}

/// Combine per-provider hint scores into the full product and the
/// product of the non-zero scores.
pub fn combine_hint_scores(scores: &BTreeMap<String, f64>) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, 0.0);
    }

    let mut combined = 1.0;
    let mut filtered = 0.0;
    for &score in scores.values() {
        combined *= score;
        if score != 0.0 {
            if filtered == 0.0 {
                filtered = score;
            } else {
                filtered *= score;
            }
        }
    }
    (combined, filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_score_combination() {
        let scores = |vals: &[(&str, f64)]| -> BTreeMap<String, f64> {
            vals.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        };

        assert_eq!(combine_hint_scores(&scores(&[])), (0.0, 0.0));
        assert_eq!(combine_hint_scores(&scores(&[("a", 1.0)])), (1.0, 1.0));
        assert_eq!(
            combine_hint_scores(&scores(&[("a", 0.5), ("b", 0.5)])),
            (0.25, 0.25)
        );
        // a zero hint kills the combined score but not the filtered one
        assert_eq!(
            combine_hint_scores(&scores(&[("a", 0.0), ("b", 0.5)])),
            (0.0, 0.5)
        );
        assert_eq!(
            combine_hint_scores(&scores(&[("a", 0.0), ("b", 0.0)])),
            (0.0, 0.0)
        );
    }
}
