//! Server configuration.

use std::path::PathBuf;

/// How many replicated `add`s may go unverified before the master forces
/// a `results` round-trip.
pub const DEFAULT_RESULT_CHECK_THRESHOLD: usize = 32;

/// Role of this server in a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRole {
    /// Accepts writes and drives replica slaves.
    Master,

    /// Applies a master's stream; redirects replica handshakes to it.
    Slave {
        master_host: String,
        master_port: u16,
    },
}

/// Configuration for one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind and to advertise in the greeting
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Name advertised in the greeting
    pub server_name: String,

    /// Database root directory
    pub data_dir: PathBuf,

    pub role: ServerRole,

    pub result_check_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7878,
            server_name: "zangetsu".to_string(),
            data_dir: PathBuf::from("data"),
            role: ServerRole::Master,
            result_check_threshold: DEFAULT_RESULT_CHECK_THRESHOLD,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            ServerRole::Master => "master",
            ServerRole::Slave { .. } => "slave",
        }
    }
}
