//! Zangetsu server: wire protocol, sessions, replication, TCP front-end.

pub mod applier;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod server;
pub mod session;

pub use applier::ReplicationClient;
pub use codec::{Connection, Frame, WireCodec};
pub use config::{ServerConfig, ServerRole, DEFAULT_RESULT_CHECK_THRESHOLD};
pub use error::{Error, Result};
pub use server::{BoundServer, Server};
