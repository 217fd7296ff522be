//! Storage layer for raindb.
//!
//! Everything below the transaction layer lives here:
//!
//! - **ResourceCache**: reference-counted cache with single-flight loading
//! - **PageStore**: fixed-size (8KB) pages in one file, cached on demand
//! - **FreeSpaceIndex**: buckets of pages by spare room, used for placement
//! - **WalManager**: checksummed append-only log, repaired on open
//! - **DataItem**: a record at a stable uid, mutated under a before/after bracket
//!
//! Recovery over these pieces lives in [`crate::recovery`].

pub mod cache;
pub mod data_item;
pub mod disk;
pub mod error;
pub mod free_space;
pub mod page;
pub mod page_store;
pub mod wal;

pub use cache::{CacheBackend, ResourceCache};
pub use data_item::{DataItem, MutationGuard};
pub use disk::{PageFile, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use free_space::FreeSpaceIndex;
pub use page::{Page, PageId};
pub use page_store::PageStore;
pub use wal::{LogRecord, WalManager};
