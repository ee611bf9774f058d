//! Table of contents: the coarse content summary exchanged for replication.
//!
//! A TOC maps group names to day timestamps to sizes, where `size` is the
//! producer's written size for that time entry. On the wire it serializes
//! as `{"group": {"86400": {"size": 123}}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-entry summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryToc {
    /// Written size of the entry in bytes
    pub size: u64,
}

/// Per-group summary, keyed by day timestamp.
pub type GroupToc = BTreeMap<u64, EntryToc>;

/// Whole-database summary, keyed by group name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Toc {
    pub groups: BTreeMap<String, GroupToc>,
}

impl Toc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written size recorded for `(group, day_timestamp)`, zero if absent.
    pub fn entry_size(&self, group: &str, day_timestamp: u64) -> u64 {
        self.groups
            .get(group)
            .and_then(|g| g.get(&day_timestamp))
            .map(|e| e.size)
            .unwrap_or(0)
    }

    pub fn set_size(&mut self, group: &str, day_timestamp: u64, size: u64) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(day_timestamp, EntryToc { size });
    }

    pub fn remove_entry(&mut self, group: &str, day_timestamp: u64) {
        if let Some(g) = self.groups.get_mut(group) {
            g.remove(&day_timestamp);
        }
    }

    pub fn remove_group(&mut self, group: &str) {
        self.groups.remove(group);
    }

    /// Drop every entry of `group` with a day timestamp strictly below
    /// `day_timestamp`.
    pub fn remove_before(&mut self, group: &str, day_timestamp: u64) {
        if let Some(g) = self.groups.get_mut(group) {
            g.retain(|dst, _| *dst >= day_timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let mut toc = Toc::new();
        toc.set_size("metrics", 86_400, 100);
        toc.set_size("metrics", 172_800, 200);
        toc.set_size("logs", 86_400, 50);

        let json = serde_json::to_value(&toc).unwrap();
        assert_eq!(json["metrics"]["86400"]["size"], 100);
        assert_eq!(json["metrics"]["172800"]["size"], 200);
        assert_eq!(json["logs"]["86400"]["size"], 50);

        let back: Toc = serde_json::from_value(json).unwrap();
        assert_eq!(back, toc);
    }

    #[test]
    fn entry_size_defaults_to_zero() {
        let toc = Toc::new();
        assert_eq!(toc.entry_size("missing", 0), 0);
    }

    #[test]
    fn remove_before_keeps_boundary() {
        let mut toc = Toc::new();
        toc.set_size("g", 86_400, 1);
        toc.set_size("g", 172_800, 2);
        toc.set_size("g", 259_200, 3);

        toc.remove_before("g", 172_800);
        assert_eq!(toc.entry_size("g", 86_400), 0);
        assert_eq!(toc.entry_size("g", 172_800), 2);
        assert_eq!(toc.entry_size("g", 259_200), 3);
    }
}
