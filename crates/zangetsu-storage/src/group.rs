//! Group - Named Container of Time Entries
//!
//! A group owns the directory `<root>/<name>` and the map of day
//! timestamps to time entries inside it. Entry removal is two-phase: a
//! synchronous rename to a hidden tombstone (so the name is immediately
//! free for reuse) followed by a background close-and-unlink once active
//! readers are gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::time_entry::TimeEntry;
use crate::toc::{EntryToc, GroupToc};

/// Check a group name: `[A-Za-z0-9_.-]` only, non-empty, and it must not
/// start with a dot (dot-prefixed names are reserved for tombstones).
pub fn validate_group_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') {
        return Err(Error::InvalidGroupName(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(Error::InvalidGroupName(name.to_string()));
    }
    Ok(())
}

/// Named container of time entries.
pub struct Group {
    name: String,
    path: PathBuf,
    entries: RwLock<HashMap<u64, Arc<TimeEntry>>>,
    closed: AtomicBool,
}

impl Group {
    /// Open (or create) a group directory and load its existing entries.
    ///
    /// Directory names that parse as day timestamps become entries;
    /// tombstones and anything else are skipped.
    pub async fn open(parent: &Path, name: &str) -> Result<Arc<Self>> {
        validate_group_name(name)?;

        let path = parent.join(name);
        tokio::fs::create_dir_all(&path).await?;

        let mut entries = HashMap::new();
        let mut dir = tokio::fs::read_dir(&path).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let file_name = item.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            let Ok(day_timestamp) = file_name.parse::<u64>() else {
                continue;
            };
            let entry = TimeEntry::open(item.path(), day_timestamp).await?;
            entries.insert(day_timestamp, entry);
        }

        Ok(Arc::new(Self {
            name: name.to_string(),
            path,
            entries: RwLock::new(entries),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn entry(&self, day_timestamp: u64) -> Option<Arc<TimeEntry>> {
        self.entries.read().await.get(&day_timestamp).cloned()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Get the entry for `day_timestamp`, creating it lazily.
    pub async fn ensure_entry(&self, day_timestamp: u64) -> Result<Arc<TimeEntry>> {
        if self.is_closed() {
            return Err(Error::GroupClosed(self.name.clone()));
        }
        if let Some(entry) = self.entry(day_timestamp).await {
            return Ok(entry);
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&day_timestamp) {
            return Ok(entry.clone());
        }
        let entry = TimeEntry::open(self.path.join(day_timestamp.to_string()), day_timestamp).await?;
        entries.insert(day_timestamp, entry.clone());
        Ok(entry)
    }

    /// Destroy exactly one entry.
    pub async fn remove_one(&self, day_timestamp: u64) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            entries
                .remove(&day_timestamp)
                .ok_or_else(|| Error::EntryNotFound {
                    group: self.name.clone(),
                    day_timestamp,
                })?
        };
        entry.mark_closed();
        retire_dir(entry.path().to_path_buf(), vec![entry]).await
    }

    /// Destroy every entry with a day timestamp strictly below
    /// `day_timestamp`.
    pub async fn remove_before(&self, day_timestamp: u64) -> Result<()> {
        let removed: Vec<Arc<TimeEntry>> = {
            let mut entries = self.entries.write().await;
            let doomed: Vec<u64> = entries
                .keys()
                .copied()
                .filter(|dst| *dst < day_timestamp)
                .collect();
            doomed
                .into_iter()
                .filter_map(|dst| entries.remove(&dst))
                .collect()
        };

        for entry in removed {
            entry.mark_closed();
            retire_dir(entry.path().to_path_buf(), vec![entry]).await?;
        }
        Ok(())
    }

    /// Destroy the whole group directory, two-phase like entry removal.
    pub async fn retire(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let entries: Vec<Arc<TimeEntry>> = {
            let mut map = self.entries.write().await;
            map.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry.mark_closed();
        }
        retire_dir(self.path.clone(), entries).await
    }

    /// Written sizes of every live entry.
    pub async fn toc(&self) -> GroupToc {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(dst, entry)| {
                (
                    *dst,
                    EntryToc {
                        size: entry.written_size(),
                    },
                )
            })
            .collect()
    }
}

/// Rename `path` to a dot-prefixed tombstone, then unlink it in the
/// background once the given entries have no readers left.
async fn retire_dir(path: PathBuf, entries: Vec<Arc<TimeEntry>>) -> Result<()> {
    let tombstone = path.with_file_name(format!(".removed-{}", Uuid::new_v4()));
    tokio::fs::rename(&path, &tombstone).await?;

    tokio::spawn(async move {
        for entry in entries {
            entry.close().await;
        }
        match tokio::fs::remove_dir_all(&tombstone).await {
            Ok(()) => debug!(path = %tombstone.display(), "removed retired directory"),
            Err(e) => {
                warn!(path = %tombstone.display(), error = %e, "failed to remove retired directory")
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn group_name_charset() {
        validate_group_name("metrics").unwrap();
        validate_group_name("a-b_c.d9").unwrap();

        assert!(validate_group_name("").is_err());
        assert!(validate_group_name(".hidden").is_err());
        assert!(validate_group_name("has space").is_err());
        assert!(validate_group_name("sla/sh").is_err());
        assert!(validate_group_name("\u{00E9}").is_err());
    }

    #[tokio::test]
    async fn entries_created_lazily() {
        let dir = TempDir::new().unwrap();
        let group = Group::open(dir.path(), "metrics").await.unwrap();
        assert_eq!(group.entry_count().await, 0);

        let entry = group.ensure_entry(86_400).await.unwrap();
        entry.add(&[b"data"], 86_400, false).await.unwrap();
        assert_eq!(group.entry_count().await, 1);

        // Same entry comes back on the next call.
        let again = group.ensure_entry(86_400).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
    }

    #[tokio::test]
    async fn remove_one_frees_the_name_immediately() {
        let dir = TempDir::new().unwrap();
        let group = Group::open(dir.path(), "metrics").await.unwrap();

        let entry = group.ensure_entry(86_400).await.unwrap();
        entry.add(&[b"old"], 86_400, false).await.unwrap();
        group.remove_one(86_400).await.unwrap();

        // The directory name is reusable right away, before the
        // background unlink has run.
        let fresh = group.ensure_entry(86_400).await.unwrap();
        let (offset, _) = fresh.add(&[b"new"], 86_400, false).await.unwrap();
        assert_eq!(offset, 0);
        let rec = fresh.get(0).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"new");
    }

    #[tokio::test]
    async fn remove_one_unlinks_in_background() {
        let dir = TempDir::new().unwrap();
        let group = Group::open(dir.path(), "metrics").await.unwrap();
        group
            .ensure_entry(86_400)
            .await
            .unwrap()
            .add(&[b"x"], 86_400, false)
            .await
            .unwrap();

        group.remove_one(86_400).await.unwrap();

        // Wait for the tombstone to disappear.
        for _ in 0..100 {
            let mut names = Vec::new();
            let mut rd = tokio::fs::read_dir(group.path()).await.unwrap();
            while let Some(item) = rd.next_entry().await.unwrap() {
                names.push(item.file_name().to_string_lossy().into_owned());
            }
            if names.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tombstone was never unlinked");
    }

    #[tokio::test]
    async fn remove_one_missing_entry_errors() {
        let dir = TempDir::new().unwrap();
        let group = Group::open(dir.path(), "metrics").await.unwrap();
        assert!(matches!(
            group.remove_one(86_400).await,
            Err(Error::EntryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn remove_before_is_strict() {
        let dir = TempDir::new().unwrap();
        let group = Group::open(dir.path(), "metrics").await.unwrap();
        for dst in [86_400u64, 172_800, 259_200] {
            group
                .ensure_entry(dst)
                .await
                .unwrap()
                .add(&[b"x"], dst, false)
                .await
                .unwrap();
        }

        group.remove_before(172_800).await.unwrap();

        assert!(group.entry(86_400).await.is_none());
        assert!(group.entry(172_800).await.is_some());
        assert!(group.entry(259_200).await.is_some());
    }

    #[tokio::test]
    async fn reopen_loads_existing_entries() {
        let dir = TempDir::new().unwrap();
        {
            let group = Group::open(dir.path(), "metrics").await.unwrap();
            group
                .ensure_entry(86_400)
                .await
                .unwrap()
                .add(&[b"persisted"], 86_400, false)
                .await
                .unwrap();
        }

        let group = Group::open(dir.path(), "metrics").await.unwrap();
        let entry = group.entry(86_400).await.expect("entry reloaded");
        assert_eq!(entry.get(0).await.unwrap().payload.as_ref(), b"persisted");

        let toc = group.toc().await;
        assert_eq!(toc[&86_400].size, entry.written_size());
    }
}
