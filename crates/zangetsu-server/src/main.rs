//! Zangetsu server binary.
//!
//! ```bash
//! # Serve a database as a master
//! zangetsu serve ./data --port 7878
//!
//! # Serve a database as a slave of a running master
//! zangetsu replicate-from 10.0.0.1:7878 ./replica-data --port 7879
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use zangetsu_server::{ReplicationClient, Server, ServerConfig, ServerRole};
use zangetsu_storage::Database;

#[derive(Parser)]
#[command(name = "zangetsu")]
#[command(about = "Append-only, time-partitioned record store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a database as a master
    Serve {
        /// Database root directory
        dbroot: PathBuf,

        /// Port to listen on
        #[arg(long, default_value_t = 7878)]
        port: u16,

        /// Host to bind and advertise
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Name advertised in the protocol greeting
        #[arg(long, default_value = "zangetsu")]
        name: String,
    },

    /// Serve a database as a slave replicating from a master
    ReplicateFrom {
        /// Master address as host:port
        master: String,

        /// Database root directory
        dbroot: PathBuf,

        /// Port to listen on for local reads
        #[arg(long, default_value_t = 7879)]
        port: u16,

        /// Host to bind and advertise
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Name advertised in the protocol greeting
        #[arg(long, default_value = "zangetsu")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            dbroot,
            port,
            host,
            name,
        } => {
            let config = ServerConfig {
                host,
                port,
                server_name: name,
                data_dir: dbroot,
                role: ServerRole::Master,
                ..ServerConfig::default()
            };
            let db = Database::open(&config.data_dir)
                .await
                .context("failed to open database")?;
            let server = Server::bind(config, db)
                .await
                .context("failed to bind server")?;
            server.run().await?;
            Ok(())
        }
        Commands::ReplicateFrom {
            master,
            dbroot,
            port,
            host,
            name,
        } => {
            let (master_host, master_port) = parse_host_port(&master)?;
            let config = ServerConfig {
                host,
                port,
                server_name: name,
                data_dir: dbroot,
                role: ServerRole::Slave {
                    master_host: master_host.clone(),
                    master_port,
                },
                ..ServerConfig::default()
            };
            let db = Database::open(&config.data_dir)
                .await
                .context("failed to open database")?;

            let server = Server::bind(config, db.clone())
                .await
                .context("failed to bind server")?;
            let applier = ReplicationClient::new(master_host, master_port, db);

            tokio::select! {
                result = server.run() => {
                    result.context("server failed")?;
                }
                result = applier.run() => {
                    if let Err(e) = result {
                        error!(error = %e, "replication stopped");
                        bail!("replication stopped: {e}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {addr:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {addr:?}"))?;
    if host.is_empty() {
        bail!("expected host:port, got {addr:?}");
    }
    Ok((host.to_string(), port))
}
