//! Dead-letter queue: terminal store for deliveries that failed after
//! retries, with query/acknowledge/retry bookkeeping.

mod error;
mod log;
mod memory;
mod traits;
mod types;

pub use error::DlqError;
pub use log::JournalDlq;
pub use memory::MemoryDlq;
pub use traits::DlqAdapter;
pub use types::{DeadLetter, DlqOrder, DlqQuery, DlqReason, DlqStats};
