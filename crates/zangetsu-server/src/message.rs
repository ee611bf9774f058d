//! Wire protocol messages
//!
//! Every frame on the wire is a single-line JSON object (see
//! [`crate::codec`]). The dialogue starts with the server's greeting, the
//! peer's hello, and a status reply; after that the peer's role decides
//! who sends commands and who answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zangetsu_storage::Toc;

pub const PROTOCOL_MAJOR: u64 = 1;
pub const PROTOCOL_MINOR: u64 = 0;

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_NOT_MASTER: &str = "not-master";

/// First frame the server writes on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(rename = "protocolMajor")]
    pub protocol_major: u64,
    #[serde(rename = "protocolMinor")]
    pub protocol_minor: u64,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub role: String,
}

/// What a connecting peer wants to be. Absent means plain client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    #[serde(rename = "client")]
    Client,
    #[serde(rename = "replica-slave")]
    ReplicaSlave,
}

/// The peer's answer to the greeting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub role: PeerRole,
}

/// Role assignment a master sends to an accepted replica slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub your_role: String,
    pub my_role: String,
}

impl RoleAssignment {
    pub fn master_to_slave() -> Self {
        Self {
            your_role: "slave".to_string(),
            my_role: "master".to_string(),
        }
    }
}

/// The command set. `add` is followed by exactly `size` payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    #[serde(rename = "add")]
    Add {
        group: String,
        timestamp: u64,
        size: u64,
        opid: u64,
        #[serde(default)]
        corrupted: bool,
    },

    #[serde(rename = "results")]
    Results {
        #[serde(default)]
        discard: bool,
    },

    #[serde(rename = "get")]
    Get {
        group: String,
        timestamp: u64,
        offset: u64,
    },

    #[serde(rename = "remove")]
    Remove {
        group: String,
        #[serde(rename = "dayTimestamp", default, skip_serializing_if = "Option::is_none")]
        day_timestamp: Option<u64>,
    },

    #[serde(rename = "removeOne")]
    RemoveOne {
        group: String,
        #[serde(rename = "dayTimestamp")]
        day_timestamp: u64,
    },

    #[serde(rename = "getToc")]
    GetToc,

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep: Option<u64>,
    },
}

/// Outcome of one asynchronous `add`, reported by `results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OpReply {
    pub fn ok(offset: u64) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            offset: Some(offset),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            offset: None,
            message: Some(message.into()),
        }
    }
}

/// Generic status reply. Optional fields are present only when the
/// command they belong to produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, OpReply>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toc: Option<Toc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// An error that ends the connection after the reply is flushed.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            disconnect: Some(true),
            ..Self::error(message)
        }
    }

    pub fn not_master(host: impl Into<String>, port: u16) -> Self {
        Self {
            status: STATUS_NOT_MASTER.to_string(),
            disconnect: Some(true),
            master_host: Some(host.into()),
            master_port: Some(port),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}
