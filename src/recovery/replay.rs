//! Redo/undo replay of the write-ahead log against the page store.

use std::collections::HashSet;

use crate::storage::data_item::{set_raw_invalid, uid_to_address};
use crate::storage::error::StorageResult;
use crate::storage::page::{data_page, DataPage, PageId};
use crate::storage::page_store::PageStore;
use crate::storage::wal::{LogRecord, WalManager};
use crate::transaction::{TransactionId, TransactionStatus};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of log records read.
    pub records_scanned: usize,
    /// Number of images rewritten by the redo pass.
    pub redone: usize,
    /// Number of images rewritten by the undo pass.
    pub undone: usize,
    /// Mutation brackets still open at the crash, rolled back to their pre-image.
    pub brackets_restored: usize,
    /// Page count the page file was cut to.
    pub max_page: u32,
}

/// How an image is written back into its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Apply {
    /// May extend the page's used region.
    Insert,
    /// Overwrites bytes in place.
    Update,
}

/// Replays one log against one page store.
pub struct LogReplay<'a> {
    status: &'a dyn TransactionStatus,
    wal: &'a WalManager,
    pages: &'a PageStore,
}

impl<'a> LogReplay<'a> {
    pub fn new(status: &'a dyn TransactionStatus, wal: &'a WalManager, pages: &'a PageStore) -> Self {
        Self { status, wal, pages }
    }

    pub fn recover(&self) -> StorageResult<RecoveryStats> {
        log::info!("Recovery started");
        let mut stats = RecoveryStats::default();

        let records = self.scan()?;
        stats.records_scanned = records.len();
        let max_page = records
            .iter()
            .map(|record| record.page_id().0)
            .max()
            .unwrap_or(0)
            .max(PageId::MARKER.0);
        stats.max_page = max_page;

        if self.pages.page_count() < max_page {
            log::warn!(
                "Page file holds {} pages but the log references {}, extending",
                self.pages.page_count(),
                max_page
            );
            self.pages.truncate(max_page)?;
        }

        self.redo_phase(&records, &mut stats)?;
        self.undo_phase(&records, &mut stats)?;

        self.pages.flush_all()?;
        self.pages.truncate(max_page)?;

        log::info!(
            "Recovery finished: {} records, {} redone, {} undone, {} open brackets restored, {} pages",
            stats.records_scanned,
            stats.redone,
            stats.undone,
            stats.brackets_restored,
            stats.max_page
        );
        Ok(stats)
    }

    fn committed(&self, xid: TransactionId) -> bool {
        xid.is_system() || self.status.is_committed(xid)
    }

    fn scan(&self) -> StorageResult<Vec<LogRecord>> {
        self.wal.rewind();
        let mut records = Vec::new();
        while let Some(record) = self.wal.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Forward pass. Committed and system effects are reapplied; inserts of
    /// aborted transactions are laid down as tombstones so the page's used
    /// region stays contiguous.
    fn redo_phase(&self, records: &[LogRecord], stats: &mut RecoveryStats) -> StorageResult<()> {
        for record in records {
            let changed = match record {
                LogRecord::Insert(r) if self.committed(r.xid) => {
                    self.apply(r.uid, &r.raw, Apply::Insert)?
                }
                LogRecord::Insert(r) if self.status.is_aborted(r.xid) => {
                    let mut raw = r.raw.clone();
                    set_raw_invalid(&mut raw);
                    self.apply(r.uid, &raw, Apply::Insert)?
                }
                LogRecord::Update(r) if self.committed(r.xid) => {
                    self.apply(r.uid, &r.post_image, Apply::Update)?
                }
                _ => false,
            };
            if changed {
                stats.redone += 1;
            }
        }
        Ok(())
    }

    /// Reverse pass. Active transactions' effects are reverted; a `Before`
    /// record with nothing after it for the same uid marks a bracket that
    /// was still open and gets its pre-image back.
    fn undo_phase(&self, records: &[LogRecord], stats: &mut RecoveryStats) -> StorageResult<()> {
        let mut seen = HashSet::new();

        for record in records.iter().rev() {
            match record {
                LogRecord::Insert(r) if self.status.is_active(r.xid) => {
                    let mut raw = r.raw.clone();
                    set_raw_invalid(&mut raw);
                    if self.apply(r.uid, &raw, Apply::Insert)? {
                        stats.undone += 1;
                    }
                }
                LogRecord::Update(r) if self.status.is_active(r.xid) => {
                    if self.apply(r.uid, &r.pre_image, Apply::Update)? {
                        stats.undone += 1;
                    }
                }
                LogRecord::Before(r) if !seen.contains(&r.uid) => {
                    log::warn!("Restoring item {:#x} left mid-mutation", r.uid);
                    self.apply(r.uid, &r.pre_image, Apply::Update)?;
                    stats.brackets_restored += 1;
                }
                _ => {}
            }
            seen.insert(record.uid());
        }
        Ok(())
    }

    /// Write `image` at the uid's slot. Returns false when the page already
    /// holds exactly these bytes.
    fn apply(&self, uid: u64, image: &[u8], mode: Apply) -> StorageResult<bool> {
        let (page_id, offset) = uid_to_address(uid);
        let page = self.pages.get_page(page_id)?;

        let result = {
            let mut data = page.write();
            let start = offset as usize;
            let end = start + image.len();
            let covered = mode == Apply::Update || data_page::free_space_offset(&data) >= end;
            if covered && data.get(start..end) == Some(image) {
                Ok(false)
            } else {
                let mut dp = DataPage::from_data(&mut data);
                match mode {
                    Apply::Insert => dp.recover_insert(offset, image),
                    Apply::Update => dp.recover_update(offset, image),
                }
                .map(|_| true)
            }
        };

        if let Ok(true) = result {
            page.set_dirty(true);
        }
        self.pages.release(&page)?;
        result
    }
}

/// Replay `wal` into `pages`, consulting `status` for every xid.
pub fn recover(
    status: &dyn TransactionStatus,
    wal: &WalManager,
    pages: &PageStore,
) -> StorageResult<RecoveryStats> {
    LogReplay::new(status, wal, pages).recover()
}
