//! Time-partitioned append-only record storage.
//!
//! The layout on disk is `<root>/<group>/<day_timestamp>/data`, where each
//! `data` file is a sequence of framed records in the `zangetsu-core` codec.
//! A [`Database`] owns the groups, a [`Group`] owns its time entries, and a
//! [`TimeEntry`] owns one append-only data file.

pub mod database;
pub mod error;
pub mod group;
pub mod time_entry;
pub mod toc;

pub use database::{Database, DatabaseEvent, DatabaseLock};
pub use error::{Error, Result};
pub use group::{validate_group_name, Group};
pub use time_entry::{EntryScanner, ReadGuard, RecordData, TimeEntry};
pub use toc::{EntryToc, GroupToc, Toc};
