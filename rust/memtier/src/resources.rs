// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Resource accounting. A [`Supply`] is the CPU and memory capacity a
//! pool owns or still has free; a [`Request`] is what a container asks
//! for; a [`Grant`] binds a successful allocation to a pool; a [`Score`]
//! captures how well a supply fits a request.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::bail;
use anyhow::Result;
use idxset::IdxSet;

use crate::cache::{Container, Pod};
use crate::memory::{MemAmounts, MemType};

/// CPU and memory capacity of one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Supply {
    isolated: IdxSet,
    sharable: IdxSet,
    /// Milli-CPUs already handed out from the sharable set.
    granted: usize,
    mem: MemAmounts,
    granted_mem: u64,
    /// Memory booked here on behalf of grants placed elsewhere in the
    /// tree, keyed by container cache-id.
    extra_mem: BTreeMap<String, (MemType, u64)>,
}

impl Supply {
    pub fn new(isolated: IdxSet, sharable: IdxSet, mem: MemAmounts) -> Self {
        Self {
            isolated,
            sharable,
            granted: 0,
            mem,
            granted_mem: 0,
            extra_mem: BTreeMap::new(),
        }
    }

    pub fn isolated(&self) -> &IdxSet {
        &self.isolated
    }

    pub fn sharable(&self) -> &IdxSet {
        &self.sharable
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    pub fn granted_mem(&self) -> u64 {
        self.granted_mem
    }

    pub fn mem(&self) -> &MemAmounts {
        &self.mem
    }

    /// Total memory capacity over all tiers.
    pub fn mem_limit(&self) -> u64 {
        self.mem.total()
    }

    /// All CPUs of this supply, isolated and sharable alike.
    pub fn cpus(&self) -> IdxSet {
        self.isolated.union(&self.sharable)
    }

    /// Fold another supply into this one.
    pub fn cumulate(&mut self, more: &Supply) {
        self.isolated.unite(&more.isolated);
        self.sharable.unite(&more.sharable);
        self.granted += more.granted;
        self.mem.cumulate(&more.mem);
        self.granted_mem += more.granted_mem;
    }

    /// Book the local share of a request: slice exclusive CPUs, reserve
    /// the fractional milli-CPUs, and reserve memory. Returns the sliced
    /// exclusive set. A failed allocation leaves the supply untouched.
    pub fn allocate(&mut self, req: &Request, pool: &str) -> Result<IdxSet> {
        enum Source {
            None,
            Isolated,
            Sharable,
        }

        let source = if req.full == 0 {
            Source::None
        } else if req.isolate && self.isolated.len() >= req.full {
            Source::Isolated
        } else if self.slicable_milli() / 1000 > req.full as i64 {
            Source::Sharable
        } else {
            bail!(
                "insufficient CPU: can't slice {} exclusive CPUs from {} of {}",
                req.full,
                self,
                pool
            );
        };

        if req.fraction > 0 {
            let mut slicable = self.slicable_milli();
            if matches!(source, Source::Sharable) {
                slicable -= 1000 * req.full as i64;
            }
            if slicable < req.fraction as i64 {
                bail!(
                    "insufficient shared CPU: not enough for {} milli-CPU in {} of {}",
                    req.fraction,
                    self,
                    pool
                );
            }
        }

        if req.mem_lim > self.mem.total() - self.granted_mem {
            bail!(
                "insufficient memory: no room for {} bytes in {} of {}",
                req.mem_lim,
                self,
                pool
            );
        }

        let exclusive = match source {
            Source::None => IdxSet::new(),
            Source::Isolated => take_cpus(&mut self.isolated, req.full)?,
            Source::Sharable => take_cpus(&mut self.sharable, req.full)?,
        };
        self.granted += req.fraction;
        self.granted_mem += req.mem_lim;

        Ok(exclusive)
    }

    /// Undo the local booking of a grant made from this supply. The
    /// pool's declared resources decide which bucket each released CPU
    /// returns to.
    pub fn release(&mut self, grant: &Grant, noderes: &Supply) {
        let isolated = grant.exclusive.intersection(&noderes.isolated);
        let sharable = grant.exclusive.difference(&isolated);

        self.isolated.unite(&isolated);
        self.sharable.unite(&sharable);
        self.granted = self.granted.saturating_sub(grant.portion);
        self.granted_mem = self.granted_mem.saturating_sub(grant.mem_limit);
    }

    /// Account for exclusive capacity granted from another pool: those
    /// CPUs are no longer ours to give.
    pub fn account_allocate(&mut self, grant: &Grant) {
        self.isolated.subtract(&grant.exclusive);
        self.sharable.subtract(&grant.exclusive);
    }

    /// Reinsert exclusive capacity released by another pool, limited to
    /// the CPUs this pool actually owns.
    pub fn account_release(&mut self, grant: &Grant, noderes: &Supply) {
        let owned = grant.exclusive.intersection(&noderes.cpus());
        self.isolated.unite(&owned.intersection(&noderes.isolated));
        self.sharable.unite(&owned.intersection(&noderes.sharable));
    }

    /// Milli-CPUs still slicable from the sharable set.
    fn slicable_milli(&self) -> i64 {
        1000 * self.sharable.len() as i64 - self.granted as i64
    }

    /// Re-book a restored grant, taking the exact CPUs it names rather
    /// than slicing fresh ones. Fails without side effects if the
    /// supply no longer covers the grant.
    pub fn rebook(&mut self, grant: &Grant) -> Result<()> {
        if !self.cpus().contains_all(&grant.exclusive.indices()) {
            bail!(
                "stale grant: exclusive CPUs {} no longer free",
                grant.exclusive
            );
        }
        let sharable_left = self.sharable.difference(&grant.exclusive);
        if 1000 * sharable_left.len() as i64 - (self.granted as i64) < grant.portion as i64 {
            bail!(
                "stale grant: {} shared milli-CPU no longer available",
                grant.portion
            );
        }
        if grant.mem_limit > self.mem.total() - self.granted_mem {
            bail!(
                "stale grant: {} bytes of memory no longer available",
                grant.mem_limit
            );
        }

        self.isolated.subtract(&grant.exclusive);
        self.sharable.subtract(&grant.exclusive);
        self.granted += grant.portion;
        self.granted_mem += grant.mem_limit;

        Ok(())
    }

    pub fn set_extra_mem_reservation(&mut self, grant: &Grant) {
        self.extra_mem
            .insert(grant.container.clone(), (grant.mem_type, grant.mem_limit));
    }

    pub fn release_extra_mem_reservation(&mut self, container: &str) {
        self.extra_mem.remove(container);
    }

    /// Memory reserved here for grants of the given type placed
    /// elsewhere. `ALL` sums every reservation.
    pub fn extra_mem_reservation(&self, mem_type: MemType) -> u64 {
        self.extra_mem
            .values()
            .filter(|(t, _)| mem_type == MemType::ALL || *t == mem_type)
            .map(|(_, bytes)| bytes)
            .sum()
    }

    /// The two supply-local score components for a request: remaining
    /// isolated CPUs (when isolation is asked for) and remaining shared
    /// milli-CPU capacity. `granted_shared` is the milli-CPU total
    /// already granted in this pool's subtree.
    pub fn score(&self, req: &Request, granted_shared: usize) -> (i64, i64) {
        let mut part = req.fraction;
        if req.full == 0 && part == 0 {
            part = 1;
        }

        let mut shared = 1000 * self.sharable.len() as i64 - granted_shared as i64;
        let mut isolated = 0;

        if req.isolate {
            isolated = self.isolated.len() as i64 - req.full as i64;
        }
        if !req.isolate || isolated < 0 {
            shared -= 1000 * req.full as i64;
        }
        shared -= part as i64;

        (isolated, shared)
    }
}

impl fmt::Display for Supply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        write!(f, "<CPU: ")?;
        if self.isolated.is_empty() && self.sharable.is_empty() {
            write!(f, "-")?;
        }
        if !self.isolated.is_empty() {
            write!(f, "isolated:{}", self.isolated)?;
            sep = ", ";
        }
        if !self.sharable.is_empty() {
            write!(
                f,
                "{sep}sharable:{} (granted:{}, free:{})",
                self.sharable,
                self.granted,
                self.slicable_milli()
            )?;
        }
        write!(
            f,
            ", Mem: limit:{}, granted:{}>",
            self.mem.total(),
            self.granted_mem
        )
    }
}

/// Take `cnt` CPUs out of a set. Slicing happens from the tail of the id
/// order, so the remaining set keeps its low, contiguous ids; the result
/// is deterministic for identical inputs.
pub fn take_cpus(from: &mut IdxSet, cnt: usize) -> Result<IdxSet> {
    let ids = from.indices();
    if ids.len() < cnt {
        bail!("can't take {} CPUs out of {}", cnt, from);
    }
    let taken = &ids[ids.len() - cnt..];
    from.del(taken);
    Ok(IdxSet::from_indices(taken))
}

/// CPU and memory resources requested by one container.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Cache-id of the requesting container.
    pub container: String,
    /// Number of whole exclusive CPUs.
    pub full: usize,
    /// Shared-pool milli-CPUs.
    pub fraction: usize,
    /// Prefer kernel-isolated CPUs for the exclusive part.
    pub isolate: bool,
    pub mem_req: u64,
    pub mem_lim: u64,
    pub mem_type: MemType,
    /// How many levels above the best-fitting pool to place the
    /// container. Reserved; currently ignored.
    pub elevate: i32,
}

impl Request {
    /// Build the request for a container from its declared resources
    /// and pod annotations. An unspecified memory type is rewritten to
    /// the configured default here, so no later stage sees `UNSPEC`
    /// from a regular container.
    pub fn new(container: &Container, pod: &Pod, default_mem_type: MemType) -> Self {
        let (full, fraction, isolate) = container.cpu_preferences(pod);
        let (mem_req, mem_lim, mut mem_type) = container.memory_preferences(pod);

        if mem_type.is_unspec() {
            mem_type = default_mem_type;
        }

        Self {
            container: container.cache_id().to_string(),
            full,
            fraction,
            isolate,
            mem_req,
            mem_lim,
            mem_type,
            elevate: 0,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let isolated = if self.isolate { "isolated " } else { "" };
        write!(f, "<request {}: ", self.container)?;
        match (self.full, self.fraction) {
            (0, 0) => write!(f, "-")?,
            (full, 0) => write!(f, "{isolated}full:{full}")?,
            (0, fraction) => write!(f, "shared:{fraction}")?,
            (full, fraction) => write!(f, "{isolated}full:{full}, shared:{fraction}")?,
        }
        write!(
            f,
            ", mem:{}/{} ({})>",
            self.mem_req, self.mem_lim, self.mem_type
        )
    }
}

/// The allocation decision binding a container to a pool's resources.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Cache-id of the container the grant belongs to.
    pub container: String,
    /// Pool the CPUs come from.
    pub cpu_node: usize,
    /// Pool the memory controllers come from.
    pub memory_node: usize,
    /// Exclusively granted CPUs, sliced from the pool's isolated or
    /// sharable set.
    pub exclusive: IdxSet,
    /// Milli-CPUs granted from the shared pool.
    pub portion: usize,
    pub mem_type: MemType,
    /// Memory controllers the container is pinned to.
    pub memset: IdxSet,
    pub mem_limit: u64,
    /// The request this grant was made for.
    pub request: Request,
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<grant for {}: ", self.container)?;
        let mut sep = "";
        if !self.exclusive.is_empty() {
            write!(f, "exclusive:{}", self.exclusive)?;
            sep = ", ";
        }
        if self.portion > 0 {
            write!(f, "{sep}shared:{} milli-CPU", self.portion)?;
        }
        write!(
            f,
            ", mems:{} ({}), mem limit:{}>",
            self.memset, self.mem_type, self.mem_limit
        )
    }
}

/// How well one pool's supply fits a request.
#[derive(Debug, Clone)]
pub struct Score {
    pub pool: usize,
    /// Isolated CPUs remaining after the request; 0 when isolation was
    /// not asked for.
    pub isolated: i64,
    /// Shared milli-CPU capacity remaining after the request.
    pub shared: i64,
    /// Existing grants already placed on this pool.
    pub colocated: usize,
    /// Per-provider topology hint scores in [0, 1].
    pub hints: BTreeMap<String, f64>,
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<score: pool #{}, isolated:{}, shared:{}, colocated:{}, hints:{:?}>",
            self.pool, self.isolated, self.shared, self.colocated, self.hints
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supply(isolated: &str, sharable: &str, dram: u64) -> Supply {
        Supply::new(
            isolated.parse().unwrap(),
            sharable.parse().unwrap(),
            MemAmounts {
                dram,
                ..Default::default()
            },
        )
    }

    fn request(full: usize, fraction: usize, isolate: bool, mem_lim: u64) -> Request {
        Request {
            container: "c0".into(),
            full,
            fraction,
            isolate,
            mem_req: mem_lim,
            mem_lim,
            mem_type: MemType::DRAM,
            elevate: 0,
        }
    }

    #[test]
    fn exclusive_from_sharable() {
        let mut s = supply("", "0-7", 1 << 30);
        let exclusive = s.allocate(&request(2, 0, false, 1 << 20), "test").unwrap();
        assert_eq!(exclusive.len(), 2);
        assert_eq!(s.sharable().len(), 6);
        assert_eq!(s.granted(), 0);
        assert_eq!(s.granted_mem(), 1 << 20);
    }

    #[test]
    fn exclusive_from_isolated() {
        let mut s = supply("6-7", "0-5", 1 << 30);
        let exclusive = s.allocate(&request(2, 0, true, 0), "test").unwrap();
        assert_eq!(exclusive, "6-7".parse().unwrap());
        assert!(s.isolated().is_empty());
        assert_eq!(s.sharable().len(), 6);
    }

    #[test]
    fn isolation_requires_opt_in() {
        // without the opt-in the isolated set stays untouched
        let mut s = supply("6-7", "0-5", 1 << 30);
        let exclusive = s.allocate(&request(2, 0, false, 0), "test").unwrap();
        assert_eq!(s.isolated().len(), 2);
        assert!(exclusive.intersection(&"6-7".parse().unwrap()).is_empty());
    }

    #[test]
    fn insufficient_cpu() {
        let mut s = supply("", "0-1", 1 << 30);
        let err = s.allocate(&request(2, 0, false, 0), "test").unwrap_err();
        assert!(err.to_string().starts_with("insufficient CPU"));

        // fractional overcommit
        let mut s = supply("", "0", 1 << 30);
        s.allocate(&request(0, 900, false, 0), "test").unwrap();
        let err = s.allocate(&request(0, 200, false, 0), "test").unwrap_err();
        assert!(err.to_string().starts_with("insufficient shared CPU"));
    }

    #[test]
    fn insufficient_memory() {
        let mut s = supply("", "0-3", 1 << 30);
        let before = s.clone();
        let err = s.allocate(&request(0, 100, false, 2 << 30), "test").unwrap_err();
        assert!(err.to_string().starts_with("insufficient memory"));
        // a failed allocation must not leave partial bookings behind
        assert_eq!(s, before);
    }

    #[test]
    fn mixed_request_overcommit_fails_cleanly() {
        // the exclusive slice would fit, but not together with the
        // fraction
        let mut s = supply("", "0-3", 1 << 30);
        let before = s.clone();
        let err = s
            .allocate(&request(3, 1500, false, 1 << 20), "test")
            .unwrap_err();
        assert!(err.to_string().starts_with("insufficient shared CPU"));
        assert_eq!(s, before);
    }

    #[test]
    fn allocate_release_roundtrip() {
        let noderes = supply("6-7", "0-5", 4 << 30);
        let mut free = noderes.clone();

        let req = request(1, 250, true, 1 << 30);
        let exclusive = free.allocate(&req, "test").unwrap();
        let grant = Grant {
            container: "c0".into(),
            cpu_node: 0,
            memory_node: 0,
            exclusive,
            portion: req.fraction,
            mem_type: req.mem_type,
            memset: IdxSet::new(),
            mem_limit: req.mem_lim,
            request: req,
        };

        assert_ne!(free, noderes);
        free.release(&grant, &noderes);
        assert_eq!(free, noderes);
    }

    #[test]
    fn take_cpus_is_deterministic() {
        let mut a: IdxSet = "0-7".parse().unwrap();
        let mut b: IdxSet = "0-7".parse().unwrap();
        assert_eq!(take_cpus(&mut a, 3).unwrap(), take_cpus(&mut b, 3).unwrap());
        assert_eq!(a, b);
        // the low ids stay behind
        assert_eq!(a, "0-4".parse().unwrap());
    }

    #[test]
    fn score_components() {
        let s = supply("2-3", "0-1", 1 << 30);

        // shared-only: remaining shared capacity minus the fraction
        let (isolated, shared) = s.score(&request(0, 500, false, 0), 0);
        assert_eq!((isolated, shared), (0, 1500));

        // empty request costs one milli-CPU
        let (_, shared) = s.score(&request(0, 0, false, 0), 0);
        assert_eq!(shared, 1999);

        // isolated request with enough isolated CPUs leaves shared alone
        let (isolated, shared) = s.score(&request(1, 0, true, 0), 0);
        assert_eq!((isolated, shared), (1, 2000));

        // isolation overflow spills into the sharable set
        let (isolated, shared) = s.score(&request(3, 0, true, 0), 0);
        assert_eq!((isolated, shared), (-1, -1000));

        // already-granted milli-CPUs reduce the shared capacity
        let (_, shared) = s.score(&request(0, 500, false, 0), 600);
        assert_eq!(shared, 900);
    }

    #[test]
    fn extra_mem_reservations() {
        let mut s = supply("", "0-3", 4 << 30);
        let grant = Grant {
            container: "c0".into(),
            cpu_node: 1,
            memory_node: 1,
            exclusive: IdxSet::new(),
            portion: 0,
            mem_type: MemType::PMEM,
            memset: IdxSet::new(),
            mem_limit: 2 << 30,
            request: request(0, 0, false, 2 << 30),
        };

        s.set_extra_mem_reservation(&grant);
        assert_eq!(s.extra_mem_reservation(MemType::PMEM), 2 << 30);
        assert_eq!(s.extra_mem_reservation(MemType::DRAM), 0);
        assert_eq!(s.extra_mem_reservation(MemType::ALL), 2 << 30);
        s.release_extra_mem_reservation("c0");
        assert_eq!(s.extra_mem_reservation(MemType::ALL), 0);
    }
}
