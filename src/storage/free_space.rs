//! In-memory catalogue of pages with spare room.
//!
//! Free-byte counts are partitioned into `FREE_SPACE_BUCKETS` ranges of width
//! `PAGE_SIZE / FREE_SPACE_BUCKETS`, plus one overflow bucket for nearly empty
//! pages. The index is rebuilt from a page scan at every open and never
//! persisted.

use crate::storage::PAGE_SIZE;
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub const FREE_SPACE_BUCKETS: usize = 40;
const BUCKET_WIDTH: usize = PAGE_SIZE / FREE_SPACE_BUCKETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: PageId,
    pub free_space: usize,
}

pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<PageInfo>>>,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![VecDeque::new(); FREE_SPACE_BUCKETS + 1]),
        }
    }

    fn bucket_of(free_space: usize) -> usize {
        (free_space / BUCKET_WIDTH).min(FREE_SPACE_BUCKETS)
    }

    pub fn add(&self, page_id: PageId, free_space: usize) {
        let bucket = Self::bucket_of(free_space);
        self.buckets.lock()[bucket].push_back(PageInfo {
            page_id,
            free_space,
        });
    }

    /// Remove and return a page with at least `required` free bytes.
    ///
    /// The scan starts one bucket above `required`'s own, since a page in the
    /// same bucket may hold slightly less. The caller must `add` the page back
    /// once it is done with it.
    pub fn select(&self, required: usize) -> Option<PageInfo> {
        let mut buckets = self.buckets.lock();
        let start = (Self::bucket_of(required) + 1).min(FREE_SPACE_BUCKETS);
        for bucket in buckets[start..].iter_mut() {
            if let Some(pos) = bucket.iter().position(|info| info.free_space >= required) {
                return bucket.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}
