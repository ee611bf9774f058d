//! Error types for the record codec.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record header")]
    MalformedHeader,

    #[error("malformed record footer")]
    MalformedFooter,

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("record truncated")]
    TruncatedRecord,
}

pub type Result<T> = std::result::Result<T, Error>;
