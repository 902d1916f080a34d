// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Index sets
//!
//! An [`IdxSet`] is an unordered set of non-negative integer ids (CPU ids,
//! memory controller ids, and the like) with set algebra and parse/print
//! support for the Linux range-list notation used by cpuset and memory
//! controller interfaces:
//!
//!```
//!     use idxset::IdxSet;
//!     let cpus: IdxSet = "0-3,7,10-12".parse().unwrap();
//!     assert_eq!(cpus.len(), 8);
//!     assert_eq!(cpus.to_string(), "0-3,7,10-12");
//!```
//!
//! Two interchangeable representations back the same API: a dense bitmap
//! (one bit per id, cheap for compact id ranges) and a sparse hash (one
//! entry per member, cheap for a few ids scattered over a large id space).
//! Binary operations accept operands of either representation and equality
//! is representation-independent, so callers never need to care which one
//! they hold. [`IdxSet::with_density`] picks a representation from the
//! expected shape of the set.

mod dense;
mod sparse;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Result;

use dense::DenseRepr;
use sparse::SparseRepr;

pub use dense::DenseIter;
pub use sparse::SparseIter;

#[derive(Debug, Clone)]
enum Repr {
    Dense(DenseRepr),
    Sparse(SparseRepr),
}

/// An unordered set of non-negative integer ids.
#[derive(Debug, Clone)]
pub struct IdxSet {
    repr: Repr,
}

impl Default for IdxSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IdxSet {
    /// Create an empty set with the dense representation.
    pub fn new() -> Self {
        Self {
            repr: Repr::Dense(DenseRepr::new()),
        }
    }

    /// Create an empty set with the sparse representation.
    pub fn sparse() -> Self {
        Self {
            repr: Repr::Sparse(SparseRepr::new()),
        }
    }

    /// Create a dense set holding the given ids.
    pub fn from_indices(indices: &[usize]) -> Self {
        let mut set = Self::new();
        set.add(indices);
        set
    }

    /// Create a sparse set holding the given ids.
    pub fn sparse_from_indices(indices: &[usize]) -> Self {
        let mut set = Self::sparse();
        set.add(indices);
        set
    }

    /// Create an empty set, picking the representation from the expected
    /// shape: sets whose maximum id is far larger than their cardinality
    /// are kept sparse, everything else dense.
    pub fn with_density(max_id: usize, cardinality: usize) -> Self {
        if max_id > 4 * cardinality {
            Self::sparse()
        } else {
            Self::new()
        }
    }

    /// Reset the set to be empty, keeping its representation.
    pub fn reset(&mut self) {
        match &mut self.repr {
            Repr::Dense(d) => d.reset(),
            Repr::Sparse(s) => s.reset(),
        }
    }

    /// The number of ids in the set.
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Dense(d) => d.len(),
            Repr::Sparse(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sorted slice of ids in the set.
    pub fn indices(&self) -> Vec<usize> {
        match &self.repr {
            Repr::Dense(d) => d.indices(),
            Repr::Sparse(s) => s.indices(),
        }
    }

    /// Add the given ids to the set.
    pub fn add(&mut self, indices: &[usize]) {
        match &mut self.repr {
            Repr::Dense(d) => d.add(indices),
            Repr::Sparse(s) => s.add(indices),
        }
    }

    /// Remove the given ids from the set.
    pub fn del(&mut self, indices: &[usize]) {
        match &mut self.repr {
            Repr::Dense(d) => d.del(indices),
            Repr::Sparse(s) => s.del(indices),
        }
    }

    /// Test whether a single id is in the set.
    pub fn contains(&self, idx: usize) -> bool {
        match &self.repr {
            Repr::Dense(d) => d.contains(idx),
            Repr::Sparse(s) => s.contains(idx),
        }
    }

    /// Test whether all of the given ids are in the set.
    pub fn contains_all(&self, indices: &[usize]) -> bool {
        indices.iter().all(|&idx| self.contains(idx))
    }

    /// The union of this and the given set.
    pub fn union(&self, other: &IdxSet) -> IdxSet {
        let mut result = self.clone();
        result.unite(other);
        result
    }

    /// The intersection of this and the given set.
    pub fn intersection(&self, other: &IdxSet) -> IdxSet {
        let mut result = self.clone();
        result.intersect(other);
        result
    }

    /// The difference of this and the given set.
    pub fn difference(&self, other: &IdxSet) -> IdxSet {
        let mut result = self.clone();
        result.subtract(other);
        result
    }

    /// Mutating union, updating this set in place.
    pub fn unite(&mut self, other: &IdxSet) {
        match (&mut self.repr, &other.repr) {
            (Repr::Dense(d), Repr::Dense(o)) => return d.unite(o),
            (Repr::Sparse(s), Repr::Sparse(o)) => return s.unite(o),
            (_, _) => {}
        }
        self.add(&other.indices());
    }

    /// Mutating intersection, updating this set in place.
    pub fn intersect(&mut self, other: &IdxSet) {
        match (&mut self.repr, &other.repr) {
            (Repr::Dense(d), Repr::Dense(o)) => return d.intersect(o),
            (Repr::Sparse(s), Repr::Sparse(o)) => return s.intersect(o),
            (_, _) => {}
        }
        let gone: Vec<usize> = self
            .indices()
            .into_iter()
            .filter(|&idx| !other.contains(idx))
            .collect();
        self.del(&gone);
    }

    /// Mutating difference, updating this set in place.
    pub fn subtract(&mut self, other: &IdxSet) {
        match (&mut self.repr, &other.repr) {
            (Repr::Dense(d), Repr::Dense(o)) => return d.subtract(o),
            (Repr::Sparse(s), Repr::Sparse(o)) => return s.subtract(o),
            (_, _) => {}
        }
        self.del(&other.indices());
    }

    /// Iterate the ids of the set in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        match &self.repr {
            Repr::Dense(d) => Iter::Dense(d.iter()),
            Repr::Sparse(s) => Iter::Sparse(s.iter()),
        }
    }
}

/// Ascending-order iterator over the ids of an [`IdxSet`].
pub enum Iter<'a> {
    Dense(DenseIter<'a>),
    Sparse(SparseIter),
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            Iter::Dense(it) => it.next(),
            Iter::Sparse(it) => it.next(),
        }
    }
}

impl PartialEq for IdxSet {
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Dense(a), Repr::Dense(b)) => a.equals(b),
            (Repr::Sparse(a), Repr::Sparse(b)) => a.equals(b),
            (_, _) => self.len() == other.len() && self.contains_all(&other.indices()),
        }
    }
}

impl Eq for IdxSet {}

impl fmt::Display for IdxSet {
    /// Canonical range-list form: consecutive ids collapse into ranges,
    /// the empty set prints as the empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut beg: Option<usize> = None;
        let mut end: Option<usize> = None;
        let mut sep = "";

        let write_range = |f: &mut fmt::Formatter<'_>,
                               beg: Option<usize>,
                               end: Option<usize>,
                               sep: &str|
         -> fmt::Result {
            if let Some(beg) = beg {
                write!(f, "{sep}{beg}")?;
                if let Some(end) = end {
                    write!(f, "-{end}")?;
                }
            }
            Ok(())
        };

        for idx in self.iter() {
            match (beg, end) {
                (None, _) => beg = Some(idx),
                (Some(b), None) if idx == b + 1 => end = Some(idx),
                (Some(_), Some(e)) if idx == e + 1 => end = Some(idx),
                (_, _) => {
                    write_range(f, beg, end, sep)?;
                    sep = ",";
                    beg = Some(idx);
                    end = None;
                }
            }
        }
        write_range(f, beg, end, sep)
    }
}

impl FromStr for IdxSet {
    type Err = anyhow::Error;

    /// Parse a range-list string into a dense set. The grammar is a
    /// comma-separated list of items, each either a single id or a
    /// `beg-end` range with `beg <= end`; the empty string is the empty
    /// set.
    fn from_str(s: &str) -> Result<Self> {
        let mut set = IdxSet::new();
        set.add(&parse_list(s)?);
        Ok(set)
    }
}

/// Parse Linux range-list notation into an id list, in input order.
pub fn parse_list(s: &str) -> Result<Vec<usize>> {
    let mut indices = Vec::new();

    if s.is_empty() {
        return Ok(indices);
    }

    for item in s.split(',') {
        if let Some((beg, end)) = item.split_once('-') {
            let beg: usize = match beg.trim().parse() {
                Ok(v) => v,
                Err(e) => bail!("invalid range {:?} in {:?}: {}", item, s, e),
            };
            let end: usize = match end.trim().parse() {
                Ok(v) => v,
                Err(e) => bail!("invalid range {:?} in {:?}: {}", item, s, e),
            };
            if beg > end {
                bail!("invalid range {:?} in {:?}", item, s);
            }
            indices.extend(beg..=end);
        } else {
            match item.trim().parse::<usize>() {
                Ok(idx) => indices.push(idx),
                Err(e) => bail!("invalid index {:?} in {:?}: {}", item, s, e),
            }
        }
    }

    Ok(indices)
}

pub(crate) fn sorted(members: &HashSet<usize>) -> Vec<usize> {
    let mut indices: Vec<usize> = members.iter().copied().collect();
    indices.sort_unstable();
    indices
}
