//! Crash recovery.
//!
//! Runs once at open when page 1 shows the previous run did not shut down
//! cleanly, before any reader or writer is admitted:
//! - Redo: reapply committed and system effects in log order
//! - Undo: revert effects of transactions still active at the crash
//!
//! Both passes are idempotent, so a crash during recovery is handled by
//! simply recovering again.

pub mod replay;

pub use replay::{recover, LogReplay, RecoveryStats};
