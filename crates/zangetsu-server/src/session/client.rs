//! Command loop shared by client sessions and the slave-side applier.
//!
//! A connected client and a slave applying its master's stream speak the
//! same command set; the only difference is what `add` does with its
//! payload. A client hands over a bare payload that gets framed here; a
//! master streams records exactly as they sit in its own files, so the
//! applier appends the bytes verbatim.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use zangetsu_storage::{validate_group_name, Database};

use crate::codec::Connection;
use crate::error::{Error, Result};
use crate::message::{Command, Reply};
use crate::session::{OpOutcome, OpidTable};

/// How `add` payloads are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Payload is the record payload; frame it before appending.
    Client,

    /// Payload is a complete framed record from a master; append verbatim.
    ReplicaApply,
}

/// Sequential command loop over one connection.
pub struct CommandLoop<S> {
    conn: Connection<S>,
    db: Arc<Database>,
    mode: ApplyMode,
    peer: String,
    opids: OpidTable,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CommandLoop<S> {
    pub fn new(conn: Connection<S>, db: Arc<Database>, mode: ApplyMode, peer: String) -> Self {
        Self {
            conn,
            db,
            mode,
            peer,
            opids: OpidTable::new(),
        }
    }

    /// Serve commands until the peer disconnects or a fatal reply is sent.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let value = match self.conn.read_value().await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    debug!(peer = %self.peer, "peer disconnected");
                    return Ok(());
                }
                Err(Error::InvalidJson(message)) => {
                    self.conn
                        .send_message(&Reply::fatal(format!("invalid JSON: {message}")))
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let command: Command = match serde_json::from_value(value) {
                Ok(command) => command,
                Err(e) => {
                    self.conn
                        .send_message(&Reply::fatal(format!("invalid command: {e}")))
                        .await?;
                    return Ok(());
                }
            };

            if !self.dispatch(command).await? {
                return Ok(());
            }
        }
    }

    /// Handle one command; `Ok(false)` means a fatal reply was sent and
    /// the connection must close.
    async fn dispatch(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Add {
                group,
                timestamp,
                size,
                opid,
                corrupted,
            } => self.handle_add(group, timestamp, size, opid, corrupted).await,
            Command::Results { discard } => {
                let drained = self.opids.drain();
                let results = if discard { Default::default() } else { drained };
                let reply = Reply {
                    results: Some(results),
                    ..Reply::ok()
                };
                self.conn.send_message(&reply).await?;
                Ok(true)
            }
            Command::Get {
                group,
                timestamp,
                offset,
            } => self.handle_get(group, timestamp, offset).await,
            Command::Remove {
                group,
                day_timestamp,
            } => {
                let result = self.db.remove(&group, day_timestamp).await;
                self.reply_removal(result).await
            }
            Command::RemoveOne {
                group,
                day_timestamp,
            } => {
                let result = self.db.remove_one(&group, day_timestamp).await;
                self.reply_removal(result).await
            }
            Command::GetToc => {
                let reply = Reply {
                    toc: Some(self.db.get_toc().await),
                    ..Reply::ok()
                };
                self.conn.send_message(&reply).await?;
                Ok(true)
            }
            Command::Ping { sleep } => {
                // The sleep stalls only this connection; nothing else is
                // read from it until the reply goes out.
                if let Some(millis) = sleep {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                self.conn.send_message(&Reply::ok()).await?;
                Ok(true)
            }
        }
    }

    async fn handle_add(
        &mut self,
        group: String,
        timestamp: u64,
        size: u64,
        opid: u64,
        corrupted: bool,
    ) -> Result<bool> {
        let payload = self.conn.read_payload(size as usize).await?;

        if let Some(reply) = self.preflight_add(&group, opid).await {
            self.conn.send_message(&reply).await?;
            return Ok(false);
        }

        // Asynchronous by contract: no reply here. The outcome is parked
        // under the opid until the next `results`.
        let outcome = match self.apply_add(&group, timestamp, payload, corrupted).await {
            Ok((offset, _)) => OpOutcome::Done { offset },
            Err(e) => {
                debug!(peer = %self.peer, group, opid, error = %e, "add failed");
                OpOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        self.opids.record(opid, outcome);
        Ok(true)
    }

    async fn preflight_add(&self, group: &str, opid: u64) -> Option<Reply> {
        if self.opids.contains(opid) {
            return Some(Reply::fatal(format!("opid is already in use: {opid}")));
        }
        if let Err(e) = validate_group_name(group) {
            return Some(Reply::fatal(e.to_string()));
        }
        if let Some(existing) = self.db.group(group).await {
            if existing.is_closed() {
                return Some(Reply::fatal(format!("group is closed: {group}")));
            }
        }
        None
    }

    async fn apply_add(
        &self,
        group: &str,
        timestamp: u64,
        payload: Bytes,
        corrupted: bool,
    ) -> zangetsu_storage::Result<(u64, u64)> {
        match self.mode {
            ApplyMode::Client => {
                self.db
                    .add(group, timestamp, &[&payload], timestamp, corrupted)
                    .await
            }
            ApplyMode::ReplicaApply => self.db.add_framed(group, timestamp, payload).await,
        }
    }

    async fn handle_get(&mut self, group: String, timestamp: u64, offset: u64) -> Result<bool> {
        match self.db.get(&group, timestamp, offset).await {
            Ok(record) => {
                let reply = Reply {
                    size: Some(record.payload.len() as u64),
                    timestamp: Some(record.timestamp),
                    corrupted: Some(record.corrupted),
                    ..Reply::ok()
                };
                self.conn.send_message(&reply).await?;
                self.conn.send_payload(record.payload).await?;
            }
            Err(e) => {
                self.conn.send_message(&Reply::error(e.to_string())).await?;
            }
        }
        Ok(true)
    }

    async fn reply_removal(&mut self, result: zangetsu_storage::Result<()>) -> Result<bool> {
        let reply = match result {
            Ok(()) => Reply::ok(),
            // A master re-sends removals it has already applied locally;
            // removing something that is already gone is success there.
            Err(e) if self.mode == ApplyMode::ReplicaApply && e.is_not_found() => Reply::ok(),
            Err(e) => Reply::error(e.to_string()),
        };
        self.conn.send_message(&reply).await?;
        Ok(true)
    }
}
