//! Slave-side applier: dials the master and applies its stream.
//!
//! The slave connects out as a `replica-slave`, then serves the master's
//! command stream (`getToc`, `add`, `results`, `remove`, `removeOne`,
//! `ping`) against the local database. This is the same command loop a
//! client session uses, with `add` payloads appended verbatim since they
//! arrive pre-framed from the master's files.
//!
//! The protocol is idempotent under replay: on any disconnect the slave
//! simply reconnects, sends its TOC again, and the master re-derives the
//! diff. So the recovery policy here is nothing more than a delayed
//! reconnect loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use zangetsu_storage::Database;

use crate::codec::Connection;
use crate::error::{Error, Result};
use crate::message::{Greeting, Hello, PeerRole, Reply, RoleAssignment, STATUS_NOT_MASTER};
use crate::session::{ApplyMode, CommandLoop};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Outbound replication link from a slave to its master.
pub struct ReplicationClient {
    master_host: String,
    master_port: u16,
    db: Arc<Database>,
}

impl ReplicationClient {
    pub fn new(master_host: impl Into<String>, master_port: u16, db: Arc<Database>) -> Self {
        Self {
            master_host: master_host.into(),
            master_port,
            db,
        }
    }

    /// Keep the replication link alive, reconnecting after failures.
    ///
    /// Returns only on a `not-master` redirect, which means the process
    /// is pointed at the wrong server and retrying cannot help.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.apply_once().await {
                Ok(()) => {
                    info!(master = %self.master_addr(), "master closed the replication stream")
                }
                Err(e @ Error::NotMaster { .. }) => {
                    warn!(master = %self.master_addr(), error = %e, "refusing to replicate from a non-master");
                    return Err(e);
                }
                Err(e) => {
                    warn!(master = %self.master_addr(), error = %e, "replication link failed")
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    /// One full session: handshake, role assignment, then serve the
    /// master's commands until the link drops.
    async fn apply_once(&self) -> Result<()> {
        let stream = TcpStream::connect(self.master_addr()).await?;
        let mut conn = Connection::new(stream);

        let greeting: Greeting = conn.read_message().await?;
        debug!(
            server = %greeting.server_name,
            role = %greeting.role,
            "connected to master"
        );

        conn.send_message(&Hello {
            role: PeerRole::ReplicaSlave,
        })
        .await?;

        let reply: Reply = conn.read_message().await?;
        if reply.status == STATUS_NOT_MASTER {
            return Err(Error::NotMaster {
                host: reply.master_host.unwrap_or_default(),
                port: reply.master_port.unwrap_or_default(),
            });
        }
        if !reply.is_ok() {
            return Err(Error::PeerError(
                reply
                    .message
                    .unwrap_or_else(|| "master rejected the handshake".to_string()),
            ));
        }

        let assignment: RoleAssignment = conn.read_message().await?;
        info!(
            master = %self.master_addr(),
            role = %assignment.your_role,
            "joined replication stream"
        );

        CommandLoop::new(
            conn,
            self.db.clone(),
            ApplyMode::ReplicaApply,
            self.master_addr(),
        )
        .run()
        .await
    }
}
