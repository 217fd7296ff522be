//! Write-ahead log.
//!
//! A single append-only file laid out as
//! `[RunningChecksum:4][Record]*[IncompleteTail?]` with
//! `Record = [Size:4][Checksum:4][Payload]`. Payloads are bincode-encoded
//! [`LogRecord`]s written around every in-place data item mutation.

pub mod manager;
pub mod record;

pub use manager::{checksum, WalManager};
pub use record::{BeforeRecord, InsertRecord, LogRecord, UpdateRecord};
