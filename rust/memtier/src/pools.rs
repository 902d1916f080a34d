// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The pool tree. Pools are the vertices of the topology hierarchy the
//! policy places containers into: a virtual root (on multi-socket
//! hosts), one pool per socket, and one pool per NUMA node that is not a
//! memory-only tier. Memory-only PMEM nodes contribute their capacity
//! and controllers to the parent socket instead of becoming pools.
//!
//! Pools live in a single arena indexed by pool id. Ids are assigned by
//! one depth-first enumeration at discovery time, so a pool's subtree is
//! the contiguous id range starting at the pool itself; every tree walk
//! derives from that enumeration.

use std::fmt;

use anyhow::bail;
use anyhow::Result;
use idxset::IdxSet;
use log::debug;

use crate::cache::TopologyHint;
use crate::memory::{MemAmounts, MemType};
use crate::resources::{Grant, Request, Supply};
use crate::system::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Virtual,
    Socket,
    Numa,
    Die,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Virtual => write!(f, "virtual"),
            PoolKind::Socket => write!(f, "socket"),
            PoolKind::Numa => write!(f, "NUMA node"),
            PoolKind::Die => write!(f, "die"),
        }
    }
}

/// Per-tier memory controller sets of a pool.
#[derive(Debug, Clone, Default)]
pub struct MemControllers {
    pub dram: IdxSet,
    pub pmem: IdxSet,
    pub hbm: IdxSet,
}

impl MemControllers {
    fn cumulate(&mut self, more: &MemControllers) {
        self.dram.unite(&more.dram);
        self.pmem.unite(&more.pmem);
        self.hbm.unite(&more.hbm);
    }

    fn add(&mut self, tier: MemType, id: usize) {
        match tier {
            MemType::DRAM => self.dram.add(&[id]),
            MemType::PMEM => self.pmem.add(&[id]),
            MemType::HBM => self.hbm.add(&[id]),
            _ => {}
        }
    }

    /// Controllers of the tiers selected by the mask.
    pub fn by_type(&self, mask: MemType) -> IdxSet {
        let mut set = IdxSet::new();
        if mask.contains(MemType::DRAM) {
            set.unite(&self.dram);
        }
        if mask.contains(MemType::PMEM) {
            set.unite(&self.pmem);
        }
        if mask.contains(MemType::HBM) {
            set.unite(&self.hbm);
        }
        set
    }

    fn mem_type(&self) -> MemType {
        let mut mask = MemType::UNSPEC;
        if !self.dram.is_empty() {
            mask |= MemType::DRAM;
        }
        if !self.pmem.is_empty() {
            mask |= MemType::PMEM;
        }
        if !self.hbm.is_empty() {
            mask |= MemType::HBM;
        }
        mask
    }
}

/// One vertex of the topology tree. Immutable after discovery except
/// for the free-resource accounting.
#[derive(Debug, Clone)]
pub struct Pool {
    pub id: usize,
    pub name: String,
    pub kind: PoolKind,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Distance from the root; the root is 0.
    pub depth: usize,
    /// Number of pools in this pool's subtree, itself included.
    subtree: usize,
    /// Union of the memory tiers reachable through this pool.
    pub mem_type: MemType,
    /// Memory controllers of this pool, by tier.
    pub controllers: MemControllers,
    /// Physical NUMA node ids contributing memory to this pool.
    pub physical_nodes: Vec<usize>,
    /// CPU packages this pool spans.
    pub packages: IdxSet,
    /// Declared capacity of this pool.
    pub noderes: Supply,
    /// Capacity still free.
    pub freeres: Supply,
}

impl Pool {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// All memory controllers of this pool.
    pub fn memset(&self) -> IdxSet {
        self.controllers.by_type(MemType::ALL)
    }

    /// Score a topology hint against this pool: the fraction of the
    /// hinted ids this pool covers, in [0, 1]. The tightest provided
    /// dimension decides.
    pub fn hint_score(&self, hint: &TopologyHint) -> f64 {
        if !hint.cpus.is_empty() {
            return overlap_score(&hint.cpus, &self.noderes.cpus());
        }
        if !hint.numas.is_empty() {
            return overlap_score(&hint.numas, &self.memset());
        }
        if !hint.sockets.is_empty() {
            return overlap_score(&hint.sockets, &self.packages);
        }
        0.0
    }
}

fn overlap_score(hinted: &str, have: &IdxSet) -> f64 {
    let hinted: IdxSet = match hinted.parse() {
        Ok(set) => set,
        Err(_) => return 0.0,
    };
    if hinted.is_empty() {
        return 0.0;
    }
    hinted.intersection(have).len() as f64 / hinted.len() as f64
}

/// The hardware share a pool owns directly, before folding in its
/// descendants.
#[derive(Default)]
struct OwnShare {
    cpus: IdxSet,
    mem: MemAmounts,
    controllers: MemControllers,
    physical_nodes: Vec<usize>,
    packages: IdxSet,
}

/// The pool arena. Pool ids are array indices in depth-first order.
pub struct PoolTree {
    pools: Vec<Pool>,
}

impl PoolTree {
    /// Build the pool tree from the host topology.
    pub fn build(sys: &dyn System) -> Result<Self> {
        let socket_cnt = sys.socket_count();
        if socket_cnt == 0 {
            bail!("invalid topology: no CPU packages");
        }

        // With fewer than two NUMA nodes the socket level already is the
        // bottom of the hierarchy.
        let with_numa_pools = sys.numa_node_count() >= 2;

        let mut builder = TreeBuilder {
            sys,
            pools: Vec::new(),
            shares: Vec::new(),
        };

        let root = if socket_cnt > 1 {
            Some(builder.push("root", PoolKind::Virtual, None, OwnShare::default()))
        } else {
            None
        };

        for pkg in sys.package_ids() {
            builder.push_socket(pkg, root, with_numa_pools)?;
        }

        let mut tree = PoolTree {
            pools: builder.finish(sys.isolated_cpus()),
        };
        tree.compute_subtree_sizes();

        for pool in &tree.pools {
            debug!(
                "pool #{} {:?} ({}, depth {}): {}",
                pool.id, pool.name, pool.kind, pool.depth, pool.noderes
            );
        }

        Ok(tree)
    }

    fn compute_subtree_sizes(&mut self) {
        for id in (0..self.pools.len()).rev() {
            let size = 1 + self.pools[id]
                .children
                .clone()
                .iter()
                .map(|&c| self.pools[c].subtree)
                .sum::<usize>();
            self.pools[id].subtree = size;
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn get(&self, id: usize) -> &Pool {
        &self.pools[id]
    }

    /// All pools in depth-first order; this is the single enumeration
    /// every walk derives from.
    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// The depth-first id range covering a pool and its descendants.
    pub fn subtree_ids(&self, id: usize) -> std::ops::Range<usize> {
        id..id + self.pools[id].subtree
    }

    /// Strict ancestors of a pool, nearest first.
    pub fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut up = Vec::new();
        let mut cursor = self.pools[id].parent;
        while let Some(parent) = cursor {
            up.push(parent);
            cursor = self.pools[parent].parent;
        }
        up
    }

    /// Milli-CPUs granted from the shared capacity of a pool's subtree.
    pub fn granted_shared_cpu(&self, id: usize) -> usize {
        self.subtree_ids(id)
            .map(|p| self.pools[p].freeres.granted())
            .sum()
    }

    /// The memory controllers a grant from this pool should pin to,
    /// falling back from the requested tiers to DRAM and finally to any
    /// tier the pool has.
    pub fn grant_memset(&self, id: usize, mem_type: MemType) -> IdxSet {
        let pool = &self.pools[id];
        for mask in [mem_type, MemType::DRAM, MemType::ALL] {
            let mems = pool.controllers.by_type(mask);
            if !mems.is_empty() {
                return mems;
            }
        }
        IdxSet::new()
    }

    /// Allocate a request from a pool's free supply, then propagate the
    /// accounting: descendants lose the sliced exclusive CPUs, ancestors
    /// book an extra memory reservation for the grant.
    pub fn allocate(&mut self, id: usize, req: &Request) -> Result<Grant> {
        let name = self.pools[id].name.clone();
        let exclusive = self.pools[id].freeres.allocate(req, &name)?;

        let grant = Grant {
            container: req.container.clone(),
            cpu_node: id,
            memory_node: id,
            exclusive,
            portion: req.fraction,
            mem_type: req.mem_type,
            memset: self.grant_memset(id, req.mem_type),
            mem_limit: req.mem_lim,
            request: req.clone(),
        };

        for other in self.subtree_ids(id) {
            if other != id {
                self.pools[other].freeres.account_allocate(&grant);
            }
        }
        for up in self.ancestors(id) {
            self.pools[up].freeres.set_extra_mem_reservation(&grant);
        }

        Ok(grant)
    }

    /// Re-book a grant restored from a snapshot against the fresh
    /// tree, with the same downstream accounting as [`Self::allocate`].
    pub fn rebook(&mut self, grant: &Grant) -> Result<()> {
        let id = grant.cpu_node;
        self.pools[id].freeres.rebook(grant)?;

        for other in self.subtree_ids(id) {
            if other != id {
                self.pools[other].freeres.account_allocate(grant);
            }
        }
        for up in self.ancestors(id) {
            self.pools[up].freeres.set_extra_mem_reservation(grant);
        }

        Ok(())
    }

    /// Release a grant: restore the originating pool's booking, give
    /// descendants their CPUs back, and drop the extra memory
    /// reservations from the rest of the tree.
    pub fn release(&mut self, grant: &Grant) {
        let id = grant.cpu_node;

        let noderes = self.pools[id].noderes.clone();
        self.pools[id].freeres.release(grant, &noderes);

        for other in self.subtree_ids(id) {
            if other == id {
                continue;
            }
            let noderes = self.pools[other].noderes.clone();
            self.pools[other].freeres.account_release(grant, &noderes);
            self.pools[other]
                .freeres
                .release_extra_mem_reservation(&grant.container);
        }
        for up in self.ancestors(id) {
            self.pools[up]
                .freeres
                .release_extra_mem_reservation(&grant.container);
        }
    }
}

struct TreeBuilder<'a> {
    sys: &'a dyn System,
    pools: Vec<Pool>,
    shares: Vec<OwnShare>,
}

impl TreeBuilder<'_> {
    fn push(&mut self, name: &str, kind: PoolKind, parent: Option<usize>, share: OwnShare) -> usize {
        let id = self.pools.len();
        let depth = parent.map(|p| self.pools[p].depth + 1).unwrap_or(0);

        if let Some(parent) = parent {
            self.pools[parent].children.push(id);
        }

        self.pools.push(Pool {
            id,
            name: name.to_string(),
            kind,
            parent,
            children: Vec::new(),
            depth,
            subtree: 1,
            mem_type: MemType::UNSPEC,
            controllers: MemControllers::default(),
            physical_nodes: Vec::new(),
            packages: IdxSet::new(),
            noderes: Supply::default(),
            freeres: Supply::default(),
        });
        self.shares.push(share);

        id
    }

    fn push_socket(&mut self, pkg: usize, root: Option<usize>, with_numa_pools: bool) -> Result<()> {
        let mut share = OwnShare::default();
        share.packages.add(&[pkg]);

        let mut numa_children = Vec::new();
        for node_id in self.sys.node_ids() {
            let node = match self.sys.node(node_id) {
                Some(n) => n,
                None => bail!("NUMA node {} vanished during discovery", node_id),
            };
            if node.package_id != pkg {
                continue;
            }
            if with_numa_pools && node.mem_type != MemType::PMEM {
                numa_children.push(node_id);
                continue;
            }
            // memory-only tiers and, on flat topologies, the plain NUMA
            // nodes fold straight into the socket
            share.cpus.unite(&node.cpus);
            share.mem.add(node.mem_type, node.mem_total);
            share.controllers.add(node.mem_type, node_id);
            share.physical_nodes.push(node_id);
        }

        let socket = self.push(&format!("socket #{pkg}"), PoolKind::Socket, root, share);

        for node_id in numa_children {
            let node = self.sys.node(node_id).unwrap().clone();
            let mut share = OwnShare::default();
            share.cpus = node.cpus;
            share.mem.add(node.mem_type, node.mem_total);
            share.controllers.add(node.mem_type, node_id);
            share.physical_nodes.push(node_id);
            share.packages.add(&[pkg]);
            self.push(
                &format!("NUMA node #{node_id}"),
                PoolKind::Numa,
                Some(socket),
                share,
            );
        }

        Ok(())
    }

    /// Turn the collected own-shares into per-pool supplies: each pool's
    /// declared capacity is its own share plus everything below it, and
    /// the free supply starts out equal to it. Kernel-isolated CPUs land
    /// in the isolated bucket of the pools that span them.
    fn finish(mut self, isolated: &IdxSet) -> Vec<Pool> {
        for id in (0..self.pools.len()).rev() {
            let share = &self.shares[id];

            let own_isolated = share.cpus.intersection(isolated);
            let own_sharable = share.cpus.difference(&own_isolated);
            let mut noderes = Supply::new(own_isolated, own_sharable, share.mem);
            let mut controllers = share.controllers.clone();
            let mut physical = share.physical_nodes.clone();
            let mut packages = share.packages.clone();

            for child in self.pools[id].children.clone() {
                noderes.cumulate(&self.pools[child].noderes);
                controllers.cumulate(&self.pools[child].controllers);
                physical.extend(&self.pools[child].physical_nodes);
                packages.unite(&self.pools[child].packages);
            }
            physical.sort_unstable();
            physical.dedup();

            let pool = &mut self.pools[id];
            pool.mem_type = controllers.mem_type();
            pool.controllers = controllers;
            pool.physical_nodes = physical;
            pool.packages = packages;
            pool.freeres = noderes.clone();
            pool.noderes = noderes;
        }

        self.pools
    }
}
