//! Database - Top-Level Map of Groups
//!
//! The database owns the group map, the write barrier used to quiesce the
//! store, and the mutation event stream that replication fans out from.
//!
//! ## Events
//!
//! `Adding` is emitted *before* the disk write commits, under the target
//! entry's append lock, so subscribers observe events in exactly file
//! order and can mirror the same bytes. `Remove` / `RemoveOne` are emitted
//! after the removal. Delivery is a broadcast channel: subscribers that
//! cannot keep up see a lag error on their receiver and must resynchronize.
//!
//! ## Lock barrier
//!
//! Every mutating call holds a read guard on the barrier. [`Database::lock`]
//! takes the write guard: it resolves only once all in-flight mutations
//! have finished, and while the returned [`DatabaseLock`] is alive no new
//! mutation (and therefore no event) can start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use zangetsu_core::record::{self, FOOTER_SIZE, HEADER_SIZE};

use crate::error::{Error, Result};
use crate::group::{validate_group_name, Group};
use crate::time_entry::{RecordData, TimeEntry};
use crate::toc::Toc;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A mutation observed by subscribers.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// A record is about to be appended; `framed` is exactly what will
    /// land on disk.
    Adding {
        group: String,
        day_timestamp: u64,
        framed: Bytes,
    },

    /// A `remove` ran: with `before`, entries below that day timestamp are
    /// gone; without, the whole group is gone.
    Remove {
        group: String,
        before: Option<u64>,
    },

    /// A `remove_one` destroyed a single entry.
    RemoveOne { group: String, day_timestamp: u64 },
}

/// Holding this keeps the database quiesced. Dropping it unlocks.
pub struct DatabaseLock {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Top-level store: a directory of groups.
pub struct Database {
    root: PathBuf,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    barrier: Arc<RwLock<()>>,
    events: broadcast::Sender<DatabaseEvent>,
}

impl Database {
    /// Open (or create) the database root and load existing groups.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut groups = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if validate_group_name(name).is_err() {
                continue;
            }
            let group = Group::open(&root, name).await?;
            groups.insert(name.to_string(), group);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(root = %root.display(), groups = groups.len(), "database opened");

        Ok(Arc::new(Self {
            root,
            groups: RwLock::new(groups),
            barrier: Arc::new(RwLock::new(())),
            events,
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to the mutation event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.events.subscribe()
    }

    /// Quiesce the database: resolves once all in-flight mutations have
    /// finished; no new mutation or event until the guard drops.
    pub async fn lock(&self) -> DatabaseLock {
        debug!("locking database");
        let guard = self.barrier.clone().write_owned().await;
        debug!("database locked");
        DatabaseLock { _guard: guard }
    }

    /// On-disk size one record with these payload buffers will occupy.
    pub fn calculate_record_size(buffers: &[&[u8]]) -> u64 {
        let payload: usize = buffers.iter().map(|b| b.len()).sum();
        (HEADER_SIZE + payload + FOOTER_SIZE) as u64
    }

    pub async fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn entry(&self, group: &str, day_timestamp: u64) -> Option<Arc<TimeEntry>> {
        match self.group(group).await {
            Some(g) => g.entry(day_timestamp).await,
            None => None,
        }
    }

    /// Append one record, creating group and entry lazily.
    pub async fn add(
        &self,
        group: &str,
        day_timestamp: u64,
        buffers: &[&[u8]],
        timestamp: u64,
        corrupted: bool,
    ) -> Result<(u64, u64)> {
        let framed = record::encode_record(buffers, timestamp, corrupted);
        self.add_framed(group, day_timestamp, framed).await
    }

    /// Append an already-framed record verbatim (replication apply path).
    pub async fn add_framed(
        &self,
        group: &str,
        day_timestamp: u64,
        framed: Bytes,
    ) -> Result<(u64, u64)> {
        let _barrier = self.barrier.read().await;

        let group_arc = self.ensure_group(group).await?;
        let entry = group_arc.ensure_entry(day_timestamp).await?;

        // The event must carry the bytes in the order they hit the file;
        // the append lock pins emission order to file order.
        let _order = entry.append_order().lock().await;
        self.emit(DatabaseEvent::Adding {
            group: group.to_string(),
            day_timestamp,
            framed: framed.clone(),
        });
        entry.append_framed(framed).await
    }

    /// Read a single record.
    pub async fn get(&self, group: &str, day_timestamp: u64, offset: u64) -> Result<RecordData> {
        let group_arc = self
            .group(group)
            .await
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        let entry = group_arc
            .entry(day_timestamp)
            .await
            .ok_or_else(|| Error::EntryNotFound {
                group: group.to_string(),
                day_timestamp,
            })?;
        entry.get(offset).await
    }

    /// Remove entries of a group below `before`, or the whole group when
    /// `before` is `None`.
    pub async fn remove(&self, group: &str, before: Option<u64>) -> Result<()> {
        let _barrier = self.barrier.read().await;

        match before {
            None => {
                let group_arc = {
                    let mut groups = self.groups.write().await;
                    groups
                        .remove(group)
                        .ok_or_else(|| Error::GroupNotFound(group.to_string()))?
                };
                group_arc.retire().await?;
                info!(group, "group removed");
            }
            Some(day_timestamp) => {
                let group_arc = self
                    .group(group)
                    .await
                    .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
                group_arc.remove_before(day_timestamp).await?;
                info!(group, before = day_timestamp, "entries removed");
            }
        }

        self.emit(DatabaseEvent::Remove {
            group: group.to_string(),
            before,
        });
        Ok(())
    }

    /// Destroy exactly one entry.
    pub async fn remove_one(&self, group: &str, day_timestamp: u64) -> Result<()> {
        let _barrier = self.barrier.read().await;

        let group_arc = self
            .group(group)
            .await
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        group_arc.remove_one(day_timestamp).await?;
        info!(group, day_timestamp, "entry removed");

        self.emit(DatabaseEvent::RemoveOne {
            group: group.to_string(),
            day_timestamp,
        });
        Ok(())
    }

    /// Written sizes of everything in the store.
    pub async fn get_toc(&self) -> Toc {
        let groups: Vec<(String, Arc<Group>)> = {
            let map = self.groups.read().await;
            map.iter().map(|(n, g)| (n.clone(), g.clone())).collect()
        };

        let mut toc = Toc::new();
        for (name, group) in groups {
            toc.groups.insert(name, group.toc().await);
        }
        toc
    }

    async fn ensure_group(&self, name: &str) -> Result<Arc<Group>> {
        if let Some(group) = self.group(name).await {
            if group.is_closed() {
                return Err(Error::GroupClosed(name.to_string()));
            }
            return Ok(group);
        }

        validate_group_name(name)?;
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(name) {
            return Ok(group.clone());
        }
        let group = Group::open(&self.root, name).await?;
        groups.insert(name.to_string(), group.clone());
        Ok(group)
    }

    fn emit(&self, event: DatabaseEvent) {
        // A send error only means nobody is subscribed.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn temp_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path()).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn add_then_get_round_trip() {
        let (_dir, db) = temp_db().await;

        let (offset, size) = db
            .add("metrics", 86_400, &[b"hello world"], 86_400, false)
            .await
            .unwrap();
        assert_eq!(offset, 0);
        assert_eq!(size, Database::calculate_record_size(&[b"hello world"]));

        let rec = db.get("metrics", 86_400, 0).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn get_missing_group_and_entry() {
        let (_dir, db) = temp_db().await;
        assert!(matches!(
            db.get("nope", 0, 0).await,
            Err(Error::GroupNotFound(_))
        ));

        db.add("metrics", 86_400, &[b"x"], 86_400, false)
            .await
            .unwrap();
        assert!(matches!(
            db.get("metrics", 172_800, 0).await,
            Err(Error::EntryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_group_name_rejected() {
        let (_dir, db) = temp_db().await;
        assert!(matches!(
            db.add(".dot", 0, &[b"x"], 0, false).await,
            Err(Error::InvalidGroupName(_))
        ));
    }

    #[tokio::test]
    async fn toc_reports_written_sizes() {
        let (_dir, db) = temp_db().await;
        db.add("a", 86_400, &[b"12345"], 86_400, false)
            .await
            .unwrap();
        db.add("a", 172_800, &[b"1234567"], 172_800, false)
            .await
            .unwrap();
        db.add("b", 86_400, &[b"1"], 86_400, false).await.unwrap();

        let toc = db.get_toc().await;
        assert_eq!(
            toc.entry_size("a", 86_400),
            Database::calculate_record_size(&[b"12345"])
        );
        assert_eq!(
            toc.entry_size("a", 172_800),
            Database::calculate_record_size(&[b"1234567"])
        );
        assert_eq!(
            toc.entry_size("b", 86_400),
            Database::calculate_record_size(&[b"1"])
        );
    }

    #[tokio::test]
    async fn adding_event_carries_the_file_bytes() {
        let (_dir, db) = temp_db().await;
        let mut events = db.subscribe();

        db.add("metrics", 86_400, &[b"payload"], 86_400, false)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        let DatabaseEvent::Adding {
            group,
            day_timestamp,
            framed,
        } = event
        else {
            panic!("expected Adding event");
        };
        assert_eq!(group, "metrics");
        assert_eq!(day_timestamp, 86_400);

        let on_disk = db.get("metrics", 86_400, 0).await.unwrap();
        assert_eq!(framed, on_disk.framed);
    }

    #[tokio::test]
    async fn remove_events_follow_removals() {
        let (_dir, db) = temp_db().await;
        db.add("metrics", 86_400, &[b"x"], 86_400, false)
            .await
            .unwrap();
        let mut events = db.subscribe();

        db.remove_one("metrics", 86_400).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DatabaseEvent::RemoveOne { day_timestamp: 86_400, .. }
        ));

        db.remove("metrics", None).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DatabaseEvent::Remove { before: None, .. }
        ));
    }

    #[tokio::test]
    async fn lock_blocks_mutations_until_dropped() {
        let (_dir, db) = temp_db().await;
        db.add("metrics", 86_400, &[b"x"], 86_400, false)
            .await
            .unwrap();

        let lock = db.lock().await;

        let blocked = {
            let db = db.clone();
            tokio::spawn(async move {
                db.add("metrics", 86_400, &[b"y"], 86_400, false)
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "add must wait for the lock");

        drop(lock);
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("add should resume after unlock")
            .unwrap();
    }

    #[tokio::test]
    async fn lock_waits_for_in_flight_mutations() {
        let (_dir, db) = temp_db().await;

        // A mutation that is already past the barrier must finish before
        // lock() resolves; afterwards the store is quiescent.
        db.add("metrics", 86_400, &[b"x"], 86_400, false)
            .await
            .unwrap();
        let lock = timeout(Duration::from_secs(1), db.lock())
            .await
            .expect("lock should resolve on a quiet database");
        drop(lock);
    }

    #[tokio::test]
    async fn remove_whole_group_frees_the_name() {
        let (_dir, db) = temp_db().await;
        db.add("metrics", 86_400, &[b"old"], 86_400, false)
            .await
            .unwrap();

        db.remove("metrics", None).await.unwrap();
        assert!(db.group("metrics").await.is_none());

        // The name is immediately reusable.
        let (offset, _) = db
            .add("metrics", 86_400, &[b"new"], 86_400, false)
            .await
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn reopen_recovers_groups_and_entries() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(dir.path()).await.unwrap();
            db.add("metrics", 86_400, &[b"persisted"], 86_400, false)
                .await
                .unwrap();
        }

        let db = Database::open(dir.path()).await.unwrap();
        let rec = db.get("metrics", 86_400, 0).await.unwrap();
        assert_eq!(rec.payload.as_ref(), b"persisted");
    }
}
