//! Ranks and rank sets.
//!
//! A [`Rank`] identifies one engine process cluster-wide. A [`RankSet`] is
//! an ordered, deduplicated collection of ranks with a compact range-string
//! form (`"0-3,6"`) used on the wire and in operator input.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when parsing ranks or rank ranges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankParseError {
    #[error("invalid rank {0:?}")]
    Invalid(String),

    #[error("rank {0} is reserved")]
    Reserved(u32),

    #[error("invalid rank range {0:?}: start is greater than end")]
    Reversed(String),

    #[error("rank range {0:?} spans more than {max} ranks", max = MAX_RANGE)]
    TooLarge(String),
}

/// Most ranks a single `lo-hi` range may expand to.
pub const MAX_RANGE: u32 = 1 << 16;

/// Cluster-wide identifier of one engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(u32);

impl Rank {
    /// Sentinel meaning "not yet assigned".
    pub const NIL: Rank = Rank(u32::MAX);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_nil(self) -> bool {
        self.0 == u32::MAX
    }
}

impl From<u32> for Rank {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("NilRank")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Rank {
    type Err = RankParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value: u32 = s
            .parse()
            .map_err(|_| RankParseError::Invalid(s.to_string()))?;
        if value == u32::MAX {
            return Err(RankParseError::Reserved(value));
        }
        Ok(Rank(value))
    }
}

/// Ordered, deduplicated set of ranks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RankSet(BTreeSet<Rank>);

impl RankSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rank: Rank) -> bool {
        self.0.insert(rank)
    }

    pub fn remove(&mut self, rank: Rank) -> bool {
        self.0.remove(&rank)
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.0.contains(&rank)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        self.0.iter().copied()
    }

    pub fn ranks(&self) -> Vec<Rank> {
        self.0.iter().copied().collect()
    }

    /// Ranks in `self` that are not in `other`.
    pub fn difference(&self, other: &RankSet) -> RankSet {
        RankSet(self.0.difference(&other.0).copied().collect())
    }

    /// Add every rank in `other` to `self`.
    pub fn merge(&mut self, other: &RankSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Compact range representation, e.g. `"0-3,6"`. Empty set yields `""`.
    pub fn ranged_string(&self) -> String {
        let mut out = String::new();
        let mut iter = self.0.iter().map(|r| r.get()).peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if end.checked_add(1) != Some(next) {
                    break;
                }
                end = next;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{start}-{end}"));
            }
        }

        out
    }
}

impl fmt::Display for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ranged_string())
    }
}

impl FromStr for RankSet {
    type Err = RankParseError;

    /// Parse `"0-3,6"`, optionally wrapped in brackets (`"[0-3,6]"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed);

        let mut set = RankSet::new();
        for token in inner.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: Rank = lo.parse()?;
                    let hi: Rank = hi.parse()?;
                    if lo > hi {
                        return Err(RankParseError::Reversed(token.to_string()));
                    }
                    if hi.get() - lo.get() >= MAX_RANGE {
                        return Err(RankParseError::TooLarge(token.to_string()));
                    }
                    for value in lo.get()..=hi.get() {
                        set.insert(Rank(value));
                    }
                }
                None => {
                    set.insert(token.parse()?);
                }
            }
        }
        Ok(set)
    }
}

impl FromIterator<Rank> for RankSet {
    fn from_iter<T: IntoIterator<Item = Rank>>(iter: T) -> Self {
        RankSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RankSet {
    type Item = &'a Rank;
    type IntoIter = std::collections::btree_set::Iter<'a, Rank>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for RankSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.ranged_string())
    }
}

impl<'de> Deserialize<'de> for RankSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
