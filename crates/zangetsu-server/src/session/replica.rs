//! Master-side replica-slave session.
//!
//! One task per connected slave drives it to parity and then forwards
//! live mutations. The session moves through the phases
//!
//! ```text
//! UNINITIALIZED -> BACKGROUND_SYNCHRONIZING -> LOCKED_SYNCHRONIZING -> READY
//! ```
//!
//! In the background phase the diff between the local TOC and the mirror
//! of the slave's TOC is turned into a FIFO of prune/fill work and
//! drained; writes keep landing meanwhile, so the loop re-diffs until a
//! pass comes up empty. The database is then locked (quiescing all
//! mutations), one final diff closes whatever slipped in, and a ping
//! round-trip confirms the slave has consumed everything. Only then does
//! the session subscribe to the mutation stream, unlock, and start
//! forwarding; the subscription happens under the lock, so no event is
//! ever missed or double-applied.
//!
//! Exactly one work item is in flight at a time. Fill items sourced from
//! disk hold a read guard on their entry from the moment they are
//! scheduled, so the entry cannot be destroyed before the stream runs.
//! The guards, the database lock, and the event subscription are all
//! released when the item (or, on disconnect, the whole session) is
//! dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use zangetsu_core::record::RecordHeader;
use zangetsu_storage::{
    Database, DatabaseEvent, DatabaseLock, ReadGuard, RecordData, TimeEntry, Toc,
};

use crate::codec::Connection;
use crate::error::{Error, Result};
use crate::message::{Command, Reply, RoleAssignment, STATUS_OK};

/// One queued replication step.
enum WorkItem {
    /// Remove one entry (`Some`) or a whole group (`None`) on the slave.
    PruneOne {
        group: String,
        day_timestamp: Option<u64>,
    },

    /// Forwarded `remove`: entries below `before`, or the whole group.
    PruneAll {
        group: String,
        before: Option<u64>,
    },

    /// Ship records for one entry.
    Fill {
        group: String,
        day_timestamp: u64,
        source: FillSource,
    },

    /// Verify every unacknowledged `add` with a `results` round-trip.
    CheckResults,
}

enum FillSource {
    /// Stream from the local file, starting at the slave's size. The
    /// guard pins the entry until the item is done or discarded.
    Stream {
        entry: Arc<TimeEntry>,
        _guard: ReadGuard,
    },

    /// A single live record forwarded from the mutation stream.
    Record { framed: Bytes },
}

/// Master-side driver for one connected replica slave.
pub struct ReplicaSession<S> {
    conn: Connection<S>,
    db: Arc<Database>,
    peer: String,

    /// Mirror of the slave's TOC, advanced as work items complete
    slave_toc: Toc,

    queue: VecDeque<WorkItem>,
    next_opid: u64,
    unchecked_adds: usize,
    result_check_threshold: usize,

    /// Held across the locked-synchronization phase
    lock: Option<DatabaseLock>,

    /// Present from READY onward
    events: Option<broadcast::Receiver<DatabaseEvent>>,
}

enum Wake {
    Event(std::result::Result<DatabaseEvent, broadcast::error::RecvError>),
    Frame(Result<Option<serde_json::Value>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicaSession<S> {
    pub fn new(
        conn: Connection<S>,
        db: Arc<Database>,
        peer: String,
        result_check_threshold: usize,
    ) -> Self {
        Self {
            conn,
            db,
            peer,
            slave_toc: Toc::new(),
            queue: VecDeque::new(),
            next_opid: 0,
            unchecked_adds: 0,
            result_check_threshold,
            lock: None,
            events: None,
        }
    }

    /// Drive the slave to parity and forward mutations until it
    /// disconnects. Guards, lock, and subscription are all released when
    /// the session is dropped, whichever way it ends.
    pub async fn run(mut self) -> Result<()> {
        self.conn
            .send_message(&RoleAssignment::master_to_slave())
            .await?;

        self.conn.send_message(&Command::GetToc).await?;
        let reply: Reply = self.conn.read_message().await?;
        self.check_ok(&reply)?;
        self.slave_toc = reply.toc.unwrap_or_default();
        info!(peer = %self.peer, "replica slave synchronizing in background");

        // BACKGROUND_SYNCHRONIZING: diff and drain until a pass is clean.
        loop {
            let work = self.diff().await;
            if work.is_empty() {
                break;
            }
            debug!(peer = %self.peer, items = work.len(), "scheduled synchronization commands");
            self.queue.extend(work);
            self.drain_queue().await?;
        }

        // LOCKED_SYNCHRONIZING: quiesce, then close the remaining gap.
        self.lock = Some(self.db.lock().await);
        loop {
            let work = self.diff().await;
            if work.is_empty() {
                break;
            }
            debug!(peer = %self.peer, items = work.len(), "scheduled commands under lock");
            self.queue.extend(work);
            self.drain_queue().await?;
        }

        // The ping round-trip proves the slave has consumed every frame
        // sent so far.
        self.conn.send_message(&Command::Ping { sleep: None }).await?;
        let reply: Reply = self.conn.read_message().await?;
        self.check_ok(&reply)?;

        // Subscribe before unlocking: no event can fire while the lock is
        // held, so nothing slips between parity and the subscription.
        self.events = Some(self.db.subscribe());
        self.lock = None;
        info!(peer = %self.peer, "replica slave ready, forwarding live mutations");

        self.forward_live().await
    }

    /// READY: forward mutation events, watching the socket for close.
    async fn forward_live(&mut self) -> Result<()> {
        loop {
            while let Some(item) = self.queue.pop_front() {
                self.process(item).await?;
            }

            let wake = {
                let events = self
                    .events
                    .as_mut()
                    .expect("event subscription exists from READY onward");
                let conn = &mut self.conn;
                tokio::select! {
                    event = events.recv() => Wake::Event(event),
                    frame = conn.read_value() => Wake::Frame(frame),
                }
            };

            match wake {
                Wake::Event(Ok(event)) => self.enqueue_event(event),
                Wake::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    return Err(Error::QueueInvariant(format!(
                        "mutation stream lagged by {skipped} events"
                    )));
                }
                Wake::Event(Err(broadcast::error::RecvError::Closed)) => return Ok(()),
                Wake::Frame(Ok(None)) => {
                    info!(peer = %self.peer, "replica slave disconnected");
                    return Ok(());
                }
                Wake::Frame(Ok(Some(_))) => {
                    return Err(Error::QueueInvariant(
                        "unsolicited frame from replica slave".to_string(),
                    ));
                }
                Wake::Frame(Err(e)) => return Err(e),
            }
        }
    }

    fn enqueue_event(&mut self, event: DatabaseEvent) {
        let item = match event {
            DatabaseEvent::Adding {
                group,
                day_timestamp,
                framed,
            } => WorkItem::Fill {
                group,
                day_timestamp,
                source: FillSource::Record { framed },
            },
            DatabaseEvent::Remove { group, before } => WorkItem::PruneAll { group, before },
            DatabaseEvent::RemoveOne {
                group,
                day_timestamp,
            } => WorkItem::PruneOne {
                group,
                day_timestamp: Some(day_timestamp),
            },
        };
        self.queue.push_back(item);
    }

    /// Compare the local TOC against the slave mirror and produce the
    /// work that closes the gap: prune what the slave has and we don't
    /// (or has too much of), fill what it is missing or behind on.
    async fn diff(&self) -> Vec<WorkItem> {
        let local = self.db.get_toc().await;
        let mut work = Vec::new();

        for (group, slave_group) in &self.slave_toc.groups {
            let Some(local_group) = local.groups.get(group) else {
                work.push(WorkItem::PruneOne {
                    group: group.clone(),
                    day_timestamp: None,
                });
                continue;
            };
            for (day_timestamp, slave_entry) in slave_group {
                match local_group.get(day_timestamp) {
                    None => work.push(WorkItem::PruneOne {
                        group: group.clone(),
                        day_timestamp: Some(*day_timestamp),
                    }),
                    Some(local_entry) if slave_entry.size > local_entry.size => {
                        // The slave has bytes we never wrote: wipe the
                        // entry and refill it from scratch.
                        work.push(WorkItem::PruneOne {
                            group: group.clone(),
                            day_timestamp: Some(*day_timestamp),
                        });
                        if let Some(item) = self.stream_fill(group, *day_timestamp).await {
                            work.push(item);
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        for (group, local_group) in &local.groups {
            for (day_timestamp, local_entry) in local_group {
                let slave_size = self.slave_toc.entry_size(group, *day_timestamp);
                if local_entry.size > slave_size {
                    if let Some(item) = self.stream_fill(group, *day_timestamp).await {
                        work.push(item);
                    }
                }
            }
        }

        work
    }

    async fn stream_fill(&self, group: &str, day_timestamp: u64) -> Option<WorkItem> {
        let entry = self.db.entry(group, day_timestamp).await?;
        let guard = entry.read_guard();
        Some(WorkItem::Fill {
            group: group.to_string(),
            day_timestamp,
            source: FillSource::Stream {
                entry,
                _guard: guard,
            },
        })
    }

    async fn drain_queue(&mut self) -> Result<()> {
        while let Some(item) = self.queue.pop_front() {
            self.process(item).await?;
        }
        Ok(())
    }

    async fn process(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::PruneOne {
                group,
                day_timestamp: Some(day_timestamp),
            } => {
                self.send_expect_ok(&Command::RemoveOne {
                    group: group.clone(),
                    day_timestamp,
                })
                .await?;
                self.slave_toc.remove_entry(&group, day_timestamp);
            }
            WorkItem::PruneOne {
                group,
                day_timestamp: None,
            } => {
                self.send_expect_ok(&Command::Remove {
                    group: group.clone(),
                    day_timestamp: None,
                })
                .await?;
                self.slave_toc.remove_group(&group);
            }
            WorkItem::PruneAll { group, before } => {
                self.send_expect_ok(&Command::Remove {
                    group: group.clone(),
                    day_timestamp: before,
                })
                .await?;
                match before {
                    Some(day_timestamp) => self.slave_toc.remove_before(&group, day_timestamp),
                    None => self.slave_toc.remove_group(&group),
                }
            }
            WorkItem::Fill {
                group,
                day_timestamp,
                source: FillSource::Record { framed },
            } => {
                self.send_add(&group, day_timestamp, framed).await?;
                self.unchecked_adds += 1;
                if self.unchecked_adds >= self.result_check_threshold {
                    self.queue.push_back(WorkItem::CheckResults);
                    self.unchecked_adds = 0;
                }
            }
            WorkItem::Fill {
                group,
                day_timestamp,
                source: FillSource::Stream { entry, _guard },
            } => {
                self.fill_from_disk(&group, day_timestamp, &entry).await?;
            }
            WorkItem::CheckResults => self.exchange_results().await?,
        }
        Ok(())
    }

    /// Stream an entry's records from the slave's current size to the
    /// written frontier.
    async fn fill_from_disk(
        &mut self,
        group: &str,
        day_timestamp: u64,
        entry: &Arc<TimeEntry>,
    ) -> Result<()> {
        if entry.is_closed() {
            // Removed since the item was scheduled; the removal reaches
            // the slave through the next diff or forwarded event.
            return Ok(());
        }

        let mut pruned_once = false;
        loop {
            let start = self.slave_toc.entry_size(group, day_timestamp);
            if start >= entry.written_size() {
                return Ok(());
            }

            // The record at the slave's size must exist and decode; if it
            // does not, the slave's prefix diverged from ours and the only
            // safe move is to wipe the entry and refill from zero.
            if start > 0 {
                if let Err(e) = entry.get(start).await {
                    if e.is_corruption() && !pruned_once {
                        warn!(
                            peer = %self.peer,
                            group,
                            day_timestamp,
                            offset = start,
                            error = %e,
                            "replica prefix does not line up, pruning and refilling"
                        );
                        self.send_expect_ok(&Command::RemoveOne {
                            group: group.to_string(),
                            day_timestamp,
                        })
                        .await?;
                        self.slave_toc.set_size(group, day_timestamp, 0);
                        pruned_once = true;
                        continue;
                    }
                    return Err(e.into());
                }
            }

            let mut scanner = entry.scan(start).await?;
            while let Some(record) = scanner.next().await? {
                self.send_record(group, day_timestamp, record).await?;
                self.unchecked_adds += 1;
                if self.unchecked_adds >= self.result_check_threshold {
                    self.exchange_results().await?;
                }
            }
            if self.unchecked_adds > 0 {
                self.exchange_results().await?;
            }
            return Ok(());
        }
    }

    async fn send_record(
        &mut self,
        group: &str,
        day_timestamp: u64,
        record: RecordData,
    ) -> Result<()> {
        self.send_add_inner(group, day_timestamp, record.framed, record.corrupted)
            .await
    }

    async fn send_add(&mut self, group: &str, day_timestamp: u64, framed: Bytes) -> Result<()> {
        let corrupted = RecordHeader::decode(&framed)
            .map(|h| h.corrupted)
            .unwrap_or(false);
        self.send_add_inner(group, day_timestamp, framed, corrupted)
            .await
    }

    async fn send_add_inner(
        &mut self,
        group: &str,
        day_timestamp: u64,
        framed: Bytes,
        corrupted: bool,
    ) -> Result<()> {
        let size = framed.len() as u64;
        let opid = self.next_opid;
        self.next_opid += 1;

        self.conn
            .send_message(&Command::Add {
                group: group.to_string(),
                timestamp: day_timestamp,
                size,
                opid,
                corrupted,
            })
            .await?;
        self.conn.send_payload(framed).await?;

        let mirrored = self.slave_toc.entry_size(group, day_timestamp) + size;
        self.slave_toc.set_size(group, day_timestamp, mirrored);
        Ok(())
    }

    /// `results` round-trip covering every unacknowledged `add`.
    async fn exchange_results(&mut self) -> Result<()> {
        self.conn
            .send_message(&Command::Results { discard: false })
            .await?;
        let reply: Reply = self.conn.read_message().await?;
        self.check_ok(&reply)?;

        if let Some(results) = &reply.results {
            for (opid, op) in results {
                if op.status != STATUS_OK {
                    return Err(Error::PeerError(format!(
                        "replica add {opid} failed: {}",
                        op.message.as_deref().unwrap_or("unknown error")
                    )));
                }
            }
        }

        self.next_opid = 0;
        self.unchecked_adds = 0;
        Ok(())
    }

    async fn send_expect_ok(&mut self, command: &Command) -> Result<()> {
        self.conn.send_message(command).await?;
        let reply: Reply = self.conn.read_message().await?;
        self.check_ok(&reply)
    }

    fn check_ok(&self, reply: &Reply) -> Result<()> {
        if reply.is_ok() {
            Ok(())
        } else {
            Err(Error::PeerError(
                reply
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("peer replied with status {:?}", reply.status)),
            ))
        }
    }
}
