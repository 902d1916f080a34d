// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Memory tier types. A [`MemType`] is a bitmask over the DRAM, PMEM and
//! HBM tiers; requests and pools carry one to express which controllers
//! they want or offer.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use anyhow::bail;
use anyhow::Result;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A bitmask of memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemType(u8);

impl MemType {
    /// No preference expressed.
    pub const UNSPEC: MemType = MemType(0);
    pub const DRAM: MemType = MemType(1 << 0);
    pub const PMEM: MemType = MemType(1 << 1);
    pub const HBM: MemType = MemType(1 << 2);
    /// Any memory type.
    pub const ALL: MemType = MemType(1 << 0 | 1 << 1 | 1 << 2);

    pub fn is_unspec(self) -> bool {
        self == Self::UNSPEC
    }

    /// True if every tier bit of `other` is present in `self`.
    pub fn contains(self, other: MemType) -> bool {
        !other.is_unspec() && self.0 & other.0 == other.0
    }

    /// The individual tier bits set in this mask.
    pub fn tiers(self) -> impl Iterator<Item = MemType> {
        [Self::DRAM, Self::PMEM, Self::HBM]
            .into_iter()
            .filter(move |t| self.0 & t.0 != 0)
    }
}

impl BitOr for MemType {
    type Output = MemType;

    fn bitor(self, rhs: MemType) -> MemType {
        MemType(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemType {
    fn bitor_assign(&mut self, rhs: MemType) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MemType {
    type Output = MemType;

    fn bitand(self, rhs: MemType) -> MemType {
        MemType(self.0 & rhs.0)
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unspec() {
            return write!(f, "unspec");
        }
        let mut sep = "";
        for (tier, name) in [
            (Self::DRAM, "dram"),
            (Self::PMEM, "pmem"),
            (Self::HBM, "hbm"),
        ] {
            if self.contains(tier) {
                write!(f, "{sep}{name}")?;
                sep = ",";
            }
        }
        Ok(())
    }
}

impl FromStr for MemType {
    type Err = anyhow::Error;

    /// Parse the annotation syntax: a comma-separated subset of
    /// `dram`, `pmem` and `hbm`.
    fn from_str(s: &str) -> Result<MemType> {
        let mut mask = MemType::UNSPEC;
        for tier in s.split(',') {
            match tier.trim() {
                "dram" => mask |= Self::DRAM,
                "pmem" => mask |= Self::PMEM,
                "hbm" => mask |= Self::HBM,
                "unspec" => {}
                other => bail!("invalid memory type {:?} in {:?}", other, s),
            }
        }
        Ok(mask)
    }
}

impl Serialize for MemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Bytes of memory broken down by tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemAmounts {
    pub dram: u64,
    pub pmem: u64,
    pub hbm: u64,
}

impl MemAmounts {
    pub fn total(&self) -> u64 {
        self.dram + self.pmem + self.hbm
    }

    /// Bytes available in the tiers selected by the mask.
    pub fn by_type(&self, mask: MemType) -> u64 {
        let mut bytes = 0;
        if mask.contains(MemType::DRAM) {
            bytes += self.dram;
        }
        if mask.contains(MemType::PMEM) {
            bytes += self.pmem;
        }
        if mask.contains(MemType::HBM) {
            bytes += self.hbm;
        }
        bytes
    }

    pub fn add(&mut self, mask: MemType, bytes: u64) {
        match mask {
            MemType::DRAM => self.dram += bytes,
            MemType::PMEM => self.pmem += bytes,
            MemType::HBM => self.hbm += bytes,
            _ => panic!("cannot account memory for compound type {mask}"),
        }
    }

    pub fn cumulate(&mut self, more: &MemAmounts) {
        self.dram += more.dram;
        self.pmem += more.pmem;
        self.hbm += more.hbm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        assert_eq!("dram".parse::<MemType>().unwrap(), MemType::DRAM);
        assert_eq!(
            "dram,pmem".parse::<MemType>().unwrap(),
            MemType::DRAM | MemType::PMEM
        );
        assert_eq!(
            "dram,pmem,hbm".parse::<MemType>().unwrap(),
            MemType::ALL
        );
        assert!("dimm".parse::<MemType>().is_err());
        assert_eq!((MemType::DRAM | MemType::PMEM).to_string(), "dram,pmem");
        assert_eq!(MemType::UNSPEC.to_string(), "unspec");
    }

    #[test]
    fn containment() {
        assert!(MemType::ALL.contains(MemType::PMEM));
        assert!((MemType::DRAM | MemType::PMEM).contains(MemType::DRAM));
        assert!(!MemType::DRAM.contains(MemType::PMEM));
        assert!(!MemType::DRAM.contains(MemType::UNSPEC));
    }

    #[test]
    fn amounts_by_type() {
        let amounts = MemAmounts {
            dram: 16,
            pmem: 128,
            hbm: 4,
        };
        assert_eq!(amounts.total(), 148);
        assert_eq!(amounts.by_type(MemType::DRAM), 16);
        assert_eq!(amounts.by_type(MemType::DRAM | MemType::HBM), 20);
        assert_eq!(amounts.by_type(MemType::UNSPEC), 0);
    }
}
