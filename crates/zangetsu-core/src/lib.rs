pub mod error;
pub mod record;

pub use error::{Error, Result};
pub use record::{RecordHeader, FOOTER_SIZE, HEADER_SIZE};
