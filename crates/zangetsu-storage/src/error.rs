//! Storage error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record error: {0}")]
    Record(#[from] zangetsu_core::Error),

    #[error("invalid group name: {0:?}")]
    InvalidGroupName(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("group is closed: {0}")]
    GroupClosed(String),

    #[error("time entry not found: {group}/{day_timestamp}")]
    EntryNotFound { group: String, day_timestamp: u64 },

    #[error("time entry is closed")]
    EntryClosed,

    #[error("offset {offset} is beyond written size {written_size}")]
    OffsetOutOfRange { offset: u64, written_size: u64 },
}

impl Error {
    /// True for errors that mean the bytes at an offset do not form a valid
    /// record (as opposed to the offset simply not existing or plain IO
    /// failure).
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Record(
                zangetsu_core::Error::MalformedHeader
                    | zangetsu_core::Error::MalformedFooter
                    | zangetsu_core::Error::CrcMismatch { .. }
                    | zangetsu_core::Error::TruncatedRecord
            )
        )
    }

    /// True when the target group or entry does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::GroupNotFound(_) | Error::EntryNotFound { .. }
        )
    }
}
