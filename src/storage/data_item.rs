//! Data items: variable-length records at a fixed slot inside a data page.
//!
//! Slot layout: `[ValidFlag:1][Length:2][Payload]`. An item is never moved
//! or reclaimed; deleting it only flips the flag.
//!
//! Mutation follows a strict bracket. [`DataItem::before`] takes the item's
//! exclusive lock and logs the pre-image before anything changes; the caller
//! edits the bytes through the returned [`MutationGuard`] and then either
//! commits the change with [`MutationGuard::after`] (logs pre- and
//! post-image under the caller's xid) or reverts it with
//! [`MutationGuard::un_before`]. Both consume the guard, so neither can be
//! called twice or without a matching `before`.

use std::ops::Deref;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{data_page, Page, PageId};
use crate::storage::wal::{LogRecord, WalManager};
use crate::transaction::TransactionId;

pub const ITEM_VALID: u8 = 0;
pub const ITEM_INVALID: u8 = 1;

const OF_VALID: usize = 0;
const OF_SIZE: usize = 1;
const OF_DATA: usize = 3;

/// Bytes of slot header in front of every payload.
pub const ITEM_HEADER_SIZE: usize = OF_DATA;

/// `uid = page_number << 32 | offset`.
pub fn address_to_uid(page_id: PageId, offset: u16) -> u64 {
    ((page_id.0 as u64) << 32) | offset as u64
}

pub fn uid_to_address(uid: u64) -> (PageId, u16) {
    (PageId((uid >> 32) as u32), (uid & 0xffff) as u16)
}

/// Build the on-page bytes of a new, valid item.
pub fn wrap_raw(payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; ITEM_HEADER_SIZE + payload.len()];
    raw[OF_VALID] = ITEM_VALID;
    LittleEndian::write_u16(&mut raw[OF_SIZE..OF_DATA], payload.len() as u16);
    raw[OF_DATA..].copy_from_slice(payload);
    raw
}

/// Mark raw item bytes as deleted.
pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OF_VALID] = ITEM_INVALID;
}

pub struct DataItem {
    uid: u64,
    page: Arc<Page>,
    /// Start of the slot within the page.
    offset: usize,
    /// Length of the whole slot, header included.
    len: usize,
    lock: RwLock<()>,
    wal: Arc<WalManager>,
}

impl DataItem {
    /// Locate the item at `offset` in `page`. Offsets outside the page's used
    /// region are reported as [`StorageError::ItemNotFound`].
    pub fn parse(page: Arc<Page>, offset: u16, wal: Arc<WalManager>) -> StorageResult<Self> {
        let uid = address_to_uid(page.id(), offset);
        let start = offset as usize;

        let len = {
            let data = page.read();
            let used = data_page::free_space_offset(&data);
            if start < data_page::HEADER_SIZE || start + ITEM_HEADER_SIZE > used {
                return Err(StorageError::ItemNotFound(uid));
            }
            let size = LittleEndian::read_u16(&data[start + OF_SIZE..start + OF_DATA]) as usize;
            if start + ITEM_HEADER_SIZE + size > used {
                return Err(StorageError::ItemNotFound(uid));
            }
            ITEM_HEADER_SIZE + size
        };

        Ok(Self {
            uid,
            page,
            offset: start,
            len,
            lock: RwLock::new(()),
            wal,
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    /// Safe to call while this thread holds a [`DataView`] of the item.
    pub fn is_valid(&self) -> bool {
        let _shared = self.lock.read_recursive();
        self.page.read()[self.offset + OF_VALID] == ITEM_VALID
    }

    /// Payload under the item's shared lock. No bracket can open on this
    /// item while the view is alive.
    ///
    /// The lock is fair: a thread holding a view must drop it before taking
    /// another view of the same item, or it can block behind a waiting
    /// `before()`.
    pub fn data(&self) -> DataView<'_> {
        let shared = self.lock.read();
        let payload = self.page.read()[self.offset + OF_DATA..self.offset + self.len].to_vec();
        DataView {
            payload,
            _shared: shared,
        }
    }

    /// Copy of the whole slot, header included.
    pub fn raw(&self) -> Vec<u8> {
        let _shared = self.lock.read_recursive();
        self.raw_unlocked()
    }

    fn raw_unlocked(&self) -> Vec<u8> {
        self.page.read()[self.offset..self.offset + self.len].to_vec()
    }

    /// Open a mutation bracket: take the exclusive right and log the
    /// pre-image before any byte changes.
    pub fn before(&self) -> StorageResult<MutationGuard<'_>> {
        let exclusive = self.lock.write();
        let pre_image = self.raw_unlocked();
        self.wal
            .log(&LogRecord::before(self.uid, pre_image.clone()))?;
        self.page.set_dirty(true);

        Ok(MutationGuard {
            item: self,
            pre_image,
            finished: false,
            _exclusive: exclusive,
        })
    }
}

impl std::fmt::Debug for DataItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataItem")
            .field("uid", &format_args!("{:#x}", self.uid))
            .field("len", &self.len)
            .finish()
    }
}

/// Read-only payload of an item, held under its shared lock.
pub struct DataView<'a> {
    payload: Vec<u8>,
    _shared: RwLockReadGuard<'a, ()>,
}

impl Deref for DataView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.payload
    }
}

/// An open mutation bracket on one data item.
///
/// Dropping the guard without `after` or `un_before` restores the pre-image.
pub struct MutationGuard<'a> {
    item: &'a DataItem,
    pre_image: Vec<u8>,
    finished: bool,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

impl<'a> MutationGuard<'a> {
    pub fn pre_image(&self) -> &[u8] {
        &self.pre_image
    }

    /// Mutable payload bytes, written straight into the page.
    pub fn data_mut(&mut self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let start = self.item.offset + OF_DATA;
        let end = self.item.offset + self.item.len;
        RwLockWriteGuard::map(self.item.page.write(), |data| &mut data[start..end])
    }

    pub fn set_valid(&mut self, valid: bool) {
        let flag = if valid { ITEM_VALID } else { ITEM_INVALID };
        self.item.page.write()[self.item.offset + OF_VALID] = flag;
    }

    /// Close the bracket, logging both images under `xid`. If the log write
    /// fails the pre-image is restored.
    pub fn after(mut self, xid: TransactionId) -> StorageResult<()> {
        let post_image = self.item.raw_unlocked();
        self.item.wal.log(&LogRecord::update(
            xid,
            self.item.uid,
            self.pre_image.clone(),
            post_image,
        ))?;
        self.item.page.set_dirty(true);
        self.finished = true;
        Ok(())
    }

    /// Close the bracket by restoring the pre-image. Nothing is logged.
    pub fn un_before(mut self) {
        self.restore();
        self.finished = true;
    }

    fn restore(&self) {
        let item = self.item;
        item.page.write()[item.offset..item.offset + item.len].copy_from_slice(&self.pre_image);
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!(
                "Mutation bracket on item {:#x} abandoned, restoring pre-image",
                self.item.uid
            );
            self.restore();
        }
    }
}
