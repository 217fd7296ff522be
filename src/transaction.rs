//! Transaction identifiers and the status-provider interface.
//!
//! Transaction bookkeeping lives in the layer above; the storage engine only
//! tags log records with a [`TransactionId`] and, during recovery, asks a
//! [`TransactionStatus`] provider which of them committed.

pub mod id;
pub mod state;

pub use id::TransactionId;
pub use state::{MemoryStatusTable, TransactionState, TransactionStatus};
