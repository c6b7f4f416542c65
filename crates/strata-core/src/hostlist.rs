//! Host sets with compact bracket notation.
//!
//! Hosts that differ only in a trailing number collapse into a single entry:
//! `node1:10001,node2:10001,node3:10001` prints as `node[1-3]:10001`.
//! Parsing accepts one bracket range per comma-separated entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::rank::MAX_RANGE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostParseError {
    #[error("unbalanced brackets in host entry {0:?}")]
    Unbalanced(String),

    #[error("invalid host range {0:?}")]
    InvalidRange(String),

    #[error("empty host name in {0:?}")]
    Empty(String),

    #[error("host range {0:?} spans more than {max} hosts", max = MAX_RANGE)]
    TooLarge(String),
}

/// Ordered, deduplicated set of host addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSet(BTreeSet<String>);

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>) -> bool {
        self.0.insert(host.into())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    /// Hosts in `self` that are not in `other`.
    pub fn difference(&self, other: &HostSet) -> HostSet {
        HostSet(self.0.difference(&other.0).cloned().collect())
    }

    /// Compact bracket representation. Empty set yields `""`.
    pub fn ranged_string(&self) -> String {
        // (prefix, suffix, zero-pad width) -> numbers
        let mut groups: BTreeMap<(String, String, usize), BTreeSet<u64>> = BTreeMap::new();
        let mut plain: Vec<&str> = Vec::new();

        for host in &self.0 {
            match split_numeric(host) {
                // A bare number has nothing to hang a bracket range on.
                Some(("", _, "")) => plain.push(host),
                Some((prefix, digits, suffix)) => {
                    let width = if digits.len() > 1 && digits.starts_with('0') {
                        digits.len()
                    } else {
                        0
                    };
                    match digits.parse::<u64>() {
                        Ok(n) => {
                            groups
                                .entry((prefix.to_string(), suffix.to_string(), width))
                                .or_default()
                                .insert(n);
                        }
                        Err(_) => plain.push(host),
                    }
                }
                None => plain.push(host),
            }
        }

        let mut entries: Vec<String> = plain.into_iter().map(str::to_string).collect();
        for ((prefix, suffix, width), numbers) in groups {
            if numbers.len() == 1 {
                let n = numbers.iter().next().copied().unwrap_or_default();
                entries.push(format!("{prefix}{n:0width$}{suffix}"));
                continue;
            }
            entries.push(format!(
                "{prefix}[{}]{suffix}",
                compact_numbers(&numbers, width)
            ));
        }
        entries.sort();
        entries.join(",")
    }
}

/// Split `node12:10001` into (`node`, `12`, `:10001`), using the last run of
/// digits in the host part (before any `:port`).
fn split_numeric(host: &str) -> Option<(&str, &str, &str)> {
    let host_end = host.rfind(':').unwrap_or(host.len());
    let name = &host[..host_end];
    let digits_end = name.len();
    let digits_start = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    if digits_start == digits_end {
        return None;
    }
    Some((
        &host[..digits_start],
        &host[digits_start..digits_end],
        &host[host_end..],
    ))
}

fn compact_numbers(numbers: &BTreeSet<u64>, width: usize) -> String {
    let mut parts = Vec::new();
    let mut iter = numbers.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if end.checked_add(1) != Some(next) {
                break;
            }
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(format!("{start:0width$}"));
        } else {
            parts.push(format!("{start:0width$}-{end:0width$}"));
        }
    }
    parts.join(",")
}

/// Split on commas that are not inside brackets.
fn split_entries(s: &str) -> Result<Vec<&str>, HostParseError> {
    let mut entries = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                entries.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(HostParseError::Unbalanced(s.to_string()));
        }
    }
    if depth != 0 {
        return Err(HostParseError::Unbalanced(s.to_string()));
    }
    entries.push(&s[start..]);
    Ok(entries)
}

fn expand_entry(entry: &str, set: &mut HostSet) -> Result<(), HostParseError> {
    let Some(open) = entry.find('[') else {
        if entry.contains(']') {
            return Err(HostParseError::Unbalanced(entry.to_string()));
        }
        set.insert(entry);
        return Ok(());
    };
    let close = entry
        .find(']')
        .filter(|&c| c > open)
        .ok_or_else(|| HostParseError::Unbalanced(entry.to_string()))?;

    let prefix = &entry[..open];
    let suffix = &entry[close + 1..];
    if prefix.is_empty() && suffix.is_empty() {
        return Err(HostParseError::Empty(entry.to_string()));
    }

    for token in entry[open + 1..close].split(',').map(str::trim) {
        let (lo, hi) = token.split_once('-').unwrap_or((token, token));
        let width = if lo.len() > 1 && lo.starts_with('0') { lo.len() } else { 0 };
        let lo_n: u64 = lo
            .parse()
            .map_err(|_| HostParseError::InvalidRange(token.to_string()))?;
        let hi_n: u64 = hi
            .parse()
            .map_err(|_| HostParseError::InvalidRange(token.to_string()))?;
        if lo_n > hi_n {
            return Err(HostParseError::InvalidRange(token.to_string()));
        }
        if hi_n - lo_n >= u64::from(MAX_RANGE) {
            return Err(HostParseError::TooLarge(token.to_string()));
        }
        for n in lo_n..=hi_n {
            set.insert(format!("{prefix}{n:0width$}{suffix}"));
        }
    }
    Ok(())
}

impl fmt::Display for HostSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ranged_string())
    }
}

impl FromStr for HostSet {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = HostSet::new();
        for entry in split_entries(s.trim())? {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            expand_entry(entry, &mut set)?;
        }
        Ok(set)
    }
}

impl<S: Into<String>> FromIterator<S> for HostSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        HostSet(iter.into_iter().map(Into::into).collect())
    }
}

impl Serialize for HostSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.ranged_string())
    }
}

impl<'de> Deserialize<'de> for HostSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bracket_range() {
        let hosts: HostSet = "node[1-3]:10001".parse().unwrap();
        let expected: HostSet = ["node1:10001", "node2:10001", "node3:10001"]
            .into_iter()
            .collect();
        assert_eq!(hosts, expected);
    }

    #[test]
    fn parse_mixed_entries() {
        let hosts: HostSet = "node[1,3]:10001, other:10001".parse().unwrap();
        assert_eq!(hosts.len(), 3);
        assert!(hosts.contains("other:10001"));
        assert!(hosts.contains("node3:10001"));
    }

    #[test]
    fn parse_zero_padded() {
        let hosts: HostSet = "r[08-10]".parse().unwrap();
        assert!(hosts.contains("r08"));
        assert!(hosts.contains("r09"));
        assert!(hosts.contains("r10"));
    }

    #[test]
    fn ranged_string_compacts() {
        let hosts: HostSet = ["node1:10001", "node2:10001", "node3:10001", "node5:10001"]
            .into_iter()
            .collect();
        assert_eq!(hosts.ranged_string(), "node[1-3,5]:10001");
    }

    #[test]
    fn ranged_string_ip_addresses() {
        let hosts: HostSet = ["10.0.0.1:10001", "10.0.0.2:10001"].into_iter().collect();
        assert_eq!(hosts.ranged_string(), "10.0.0.[1-2]:10001");
    }

    #[test]
    fn ranged_string_single_and_plain() {
        let hosts: HostSet = ["alpha", "node7:1"].into_iter().collect();
        assert_eq!(hosts.ranged_string(), "alpha,node7:1");
    }

    #[test]
    fn ranged_string_round_trips_through_parse() {
        let hosts: HostSet = "node[1-4]:10001,beta:10001".parse().unwrap();
        let again: HostSet = hosts.ranged_string().parse().unwrap();
        assert_eq!(hosts, again);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!("node[1-3".parse::<HostSet>(), Err(HostParseError::Unbalanced(_))));
        assert!(matches!("node[3-1]".parse::<HostSet>(), Err(HostParseError::InvalidRange(_))));
        assert!(matches!("node[a]".parse::<HostSet>(), Err(HostParseError::InvalidRange(_))));
        assert!(matches!("[1-2]".parse::<HostSet>(), Err(HostParseError::Empty(_))));
    }

    #[test]
    fn bare_numbers_stay_uncompressed() {
        let hosts: HostSet = ["1", "2", "3"].into_iter().collect();
        assert_eq!(hosts.ranged_string(), "1,2,3");
        let again: HostSet = hosts.ranged_string().parse().unwrap();
        assert_eq!(hosts, again);

        let ported: HostSet = ["1:10001", "2:10001"].into_iter().collect();
        assert_eq!(ported.ranged_string(), "[1-2]:10001");
        assert_eq!(ported.ranged_string().parse::<HostSet>().unwrap(), ported);
    }

    #[test]
    fn parse_bounds_range_span() {
        let widest = format!("n[0-{}]", MAX_RANGE - 1);
        assert_eq!(widest.parse::<HostSet>().unwrap().len(), MAX_RANGE as usize);

        assert_eq!(
            format!("n[0-{MAX_RANGE}]").parse::<HostSet>(),
            Err(HostParseError::TooLarge(format!("0-{MAX_RANGE}")))
        );
        assert!(matches!(
            "n[0-18446744073709551615]".parse::<HostSet>(),
            Err(HostParseError::TooLarge(_))
        ));
    }

    #[test]
    fn difference_yields_absent_hosts() {
        let requested: HostSet = "node[1-3]:10001".parse().unwrap();
        let known: HostSet = "node1:10001".parse().unwrap();
        assert_eq!(requested.difference(&known).ranged_string(), "node[2-3]:10001");
    }
}
