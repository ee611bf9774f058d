//! TCP server: accept loop, handshake, session dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use zangetsu_storage::Database;

use crate::codec::Connection;
use crate::config::{ServerConfig, ServerRole};
use crate::error::Result;
use crate::message::{Greeting, Hello, PeerRole, Reply, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use crate::session::{ApplyMode, CommandLoop, ReplicaSession};

/// Shared state for all connections.
pub struct ServerState {
    pub config: ServerConfig,
    pub db: Arc<Database>,
}

impl ServerState {
    fn greeting(&self) -> Greeting {
        Greeting {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            server_name: self.config.server_name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            role: self.config.role_name().to_string(),
        }
    }
}

/// The record store server.
pub struct Server;

impl Server {
    /// Bind the listener; the returned server accepts until dropped.
    pub async fn bind(config: ServerConfig, db: Arc<Database>) -> Result<BoundServer> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, role = config.role_name(), "server listening");

        Ok(BoundServer {
            listener,
            state: Arc::new(ServerState { config, db }),
        })
    }
}

/// A server bound to its port.
pub struct BoundServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, addr, state).await {
                            Ok(()) => debug!(peer = %addr, "connection closed"),
                            Err(e) if e.is_clean_close() => {
                                debug!(peer = %addr, "connection closed: {e}")
                            }
                            Err(e) => warn!(peer = %addr, error = %e, "connection error"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            }
        }
    }
}

/// Greet the peer, learn its role, and hand the connection to the right
/// session.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let mut conn = Connection::new(stream);
    conn.send_message(&state.greeting()).await?;

    let Some(hello) = conn.read_value().await? else {
        return Ok(());
    };
    let hello: Hello = match serde_json::from_value(hello) {
        Ok(hello) => hello,
        Err(e) => {
            conn.send_message(&Reply::fatal(format!("invalid hello: {e}")))
                .await?;
            return Ok(());
        }
    };

    match hello.role {
        PeerRole::Client => {
            conn.send_message(&Reply::ok()).await?;
            debug!(peer = %addr, "client connected");
            CommandLoop::new(conn, state.db.clone(), ApplyMode::Client, addr.to_string())
                .run()
                .await
        }
        PeerRole::ReplicaSlave => match &state.config.role {
            ServerRole::Slave {
                master_host,
                master_port,
            } => {
                // Replicas must talk to the actual master.
                info!(peer = %addr, "redirecting replica slave to the master");
                conn.send_message(&Reply::not_master(master_host.clone(), *master_port))
                    .await?;
                Ok(())
            }
            ServerRole::Master => {
                conn.send_message(&Reply::ok()).await?;
                info!(peer = %addr, "replica slave connected");
                ReplicaSession::new(
                    conn,
                    state.db.clone(),
                    addr.to_string(),
                    state.config.result_check_threshold,
                )
                .run()
                .await
            }
        },
    }
}
