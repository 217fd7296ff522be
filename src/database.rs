use crate::recovery;
use crate::storage::cache::{CacheBackend, ResourceCache};
use crate::storage::data_item::{address_to_uid, uid_to_address, wrap_raw, DataItem, ITEM_HEADER_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::free_space::FreeSpaceIndex;
use crate::storage::page::{data_page, marker_page, DataPage, Page, PageId};
use crate::storage::page_store::PageStore;
use crate::storage::wal::{LogRecord, WalManager};
use crate::storage::PAGE_SIZE;
use crate::transaction::{TransactionId, TransactionStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fewest pages the page cache may be configured with.
pub const MIN_CACHED_PAGES: u64 = 10;

/// Free-space lookups tried by `insert` before giving up.
const INSERT_ATTEMPTS: usize = 5;

const DB_SUFFIX: &str = ".db";
const LOG_SUFFIX: &str = ".log";

/// Tunables for a [`DataManager`].
#[derive(Debug, Clone)]
pub struct DataManagerConfig {
    /// Bytes of page cache; divided by `PAGE_SIZE` to get the page capacity.
    pub memory_budget: u64,
    /// Hard ceiling on cached data items; 0 means unbounded.
    pub item_cache_capacity: usize,
    /// Fsync page writes and log appends.
    pub sync_writes: bool,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            memory_budget: 64 * PAGE_SIZE as u64,
            item_cache_capacity: 0,
            sync_writes: true,
        }
    }
}

impl DataManagerConfig {
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_item_cache_capacity(mut self, capacity: usize) -> Self {
        self.item_cache_capacity = capacity;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    fn page_capacity(&self) -> StorageResult<usize> {
        let pages = self.memory_budget / PAGE_SIZE as u64;
        if pages < MIN_CACHED_PAGES {
            return Err(StorageError::MemoryTooSmall {
                pages,
                min: MIN_CACHED_PAGES,
            });
        }
        Ok(pages as usize)
    }
}

/// Loads data items by uid. Each cached item pins its page until the item
/// leaves the cache.
struct ItemLoader {
    pages: Arc<PageStore>,
    wal: Arc<WalManager>,
}

impl CacheBackend for ItemLoader {
    type Resource = DataItem;

    fn load(&self, uid: u64) -> StorageResult<DataItem> {
        let (page_id, offset) = uid_to_address(uid);
        // Bits between the offset and the page number must be zero, or the
        // uid would alias another item's slot.
        if page_id <= PageId::MARKER || address_to_uid(page_id, offset) != uid {
            return Err(StorageError::ItemNotFound(uid));
        }

        let page = self.pages.get_page(page_id)?;
        match DataItem::parse(page.clone(), offset, self.wal.clone()) {
            Ok(item) => Ok(item),
            Err(e) => {
                self.pages.release(&page)?;
                Err(e)
            }
        }
    }

    fn finalize(&self, item: &DataItem) -> StorageResult<()> {
        self.pages.release(item.page())
    }
}

/// The storage core as seen by the layers above: durable, crash-consistent
/// variable-length records addressed by uid.
///
/// Two files back a manager, `<path>.db` and `<path>.log`.
pub struct DataManager {
    pages: Arc<PageStore>,
    wal: Arc<WalManager>,
    items: ResourceCache<ItemLoader>,
    free_space: FreeSpaceIndex,
    /// Pinned for the manager's lifetime.
    page_one: Arc<Page>,
}

impl DataManager {
    /// Create a new, empty database.
    ///
    /// Unlike [`open`](Self::open) this takes no transaction status provider:
    /// a fresh log has nothing to replay.
    pub fn create(path: &Path, config: DataManagerConfig) -> StorageResult<Self> {
        let capacity = config.page_capacity()?;
        let pages = PageStore::create(&with_suffix(path, DB_SUFFIX), capacity, config.sync_writes)?;
        let wal = WalManager::create(&with_suffix(path, LOG_SUFFIX), config.sync_writes)?;

        let marker = pages.new_page(marker_page::initial_raw())?;
        debug_assert_eq!(marker, PageId::MARKER);
        let page_one = pages.get_page(PageId::MARKER)?;

        log::info!("Created database at {}", path.display());
        Ok(Self::assemble(pages, wal, page_one, &config))
    }

    /// Open an existing database, replaying the log first if the previous
    /// run did not close cleanly.
    pub fn open(
        path: &Path,
        config: DataManagerConfig,
        status: &dyn TransactionStatus,
    ) -> StorageResult<Self> {
        let capacity = config.page_capacity()?;
        let pages = PageStore::open(&with_suffix(path, DB_SUFFIX), capacity, config.sync_writes)?;
        let wal = WalManager::open(&with_suffix(path, LOG_SUFFIX), config.sync_writes)?;

        let page_one = pages.get_page(PageId::MARKER)?;
        if marker_page::is_clean(&page_one.read()) {
            log::debug!("Database at {} was closed cleanly", path.display());
        } else {
            log::warn!(
                "Database at {} was not closed cleanly, running recovery",
                path.display()
            );
            recovery::recover(status, &wal, &pages)?;
        }

        marker_page::stamp_open(&mut page_one.write());
        pages.flush(&page_one)?;

        let manager = Self::assemble(pages, wal, page_one, &config);
        manager.fill_free_space()?;
        log::info!(
            "Opened database at {} ({} pages)",
            path.display(),
            manager.pages.page_count()
        );
        Ok(manager)
    }

    fn assemble(
        pages: PageStore,
        wal: WalManager,
        page_one: Arc<Page>,
        config: &DataManagerConfig,
    ) -> Self {
        let pages = Arc::new(pages);
        let wal = Arc::new(wal);
        let loader = ItemLoader {
            pages: pages.clone(),
            wal: wal.clone(),
        };
        Self {
            pages,
            wal,
            items: ResourceCache::new(loader, config.item_cache_capacity),
            free_space: FreeSpaceIndex::new(),
            page_one,
        }
    }

    /// Register every data page with the free-space index.
    fn fill_free_space(&self) -> StorageResult<()> {
        for number in 2..=self.pages.page_count() {
            let page = self.pages.get_page(PageId(number))?;
            let free = {
                let data = page.read();
                data_page::validate(page.id(), &data)?;
                data_page::free_space(&data)
            };
            self.free_space.add(page.id(), free);
            self.pages.release(&page)?;
        }
        Ok(())
    }

    /// Look up a live item. Unknown and tombstoned uids yield `None`.
    ///
    /// A returned item stays cached until handed back with [`release`](Self::release).
    pub fn read(&self, uid: u64) -> StorageResult<Option<Arc<DataItem>>> {
        let item = match self.items.acquire(uid) {
            Ok(item) => item,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !item.is_valid() {
            self.items.release(uid)?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    /// Store `data` as a new item on behalf of `xid` and return its uid.
    pub fn insert(&self, xid: TransactionId, data: &[u8]) -> StorageResult<u64> {
        let size = ITEM_HEADER_SIZE + data.len();
        if size > data_page::MAX_FREE_SPACE {
            return Err(StorageError::DataTooLarge {
                size,
                max: data_page::MAX_FREE_SPACE,
            });
        }
        let raw = wrap_raw(data);

        let mut selected = None;
        for _ in 0..INSERT_ATTEMPTS {
            if let Some(info) = self.free_space.select(raw.len()) {
                selected = Some(info);
                break;
            }
            let page_id = self.pages.new_page(data_page::initial_raw())?;
            self.free_space.add(page_id, data_page::MAX_FREE_SPACE);
        }
        let info = selected.ok_or(StorageError::DatabaseBusy { required: raw.len() })?;

        let page = match self.pages.get_page(info.page_id) {
            Ok(page) => page,
            Err(e) => {
                self.free_space.add(info.page_id, info.free_space);
                return Err(e);
            }
        };
        let result = self.append_item(&page, xid, &raw);
        let free = data_page::free_space(&page.read());
        self.free_space.add(page.id(), free);
        self.pages.release(&page)?;
        result
    }

    /// Log the insert, then write it. The page lock pins the offset the log
    /// record names.
    fn append_item(&self, page: &Page, xid: TransactionId, raw: &[u8]) -> StorageResult<u64> {
        let mut data = page.write();
        let offset = data_page::free_space_offset(&data) as u16;
        let uid = address_to_uid(page.id(), offset);

        self.wal.log(&LogRecord::insert(xid, uid, raw.to_vec()))?;
        DataPage::from_data(&mut data).insert(raw)?;
        page.set_dirty(true);
        Ok(uid)
    }

    /// Hand back an item obtained from [`read`](Self::read).
    pub fn release(&self, item: &DataItem) -> StorageResult<()> {
        self.items.release(item.uid())
    }

    /// Write every resident dirty page. The database still counts as open.
    pub fn flush(&self) -> StorageResult<()> {
        self.pages.flush_all()
    }

    pub fn page_count(&self) -> u32 {
        self.pages.page_count()
    }

    /// Flush everything and mark the shutdown clean.
    pub fn close(self) -> StorageResult<()> {
        self.items.shutdown()?;
        self.pages.flush_all()?;
        self.wal.close()?;

        marker_page::stamp_close(&mut self.page_one.write());
        self.pages.flush(&self.page_one)?;
        self.page_one.set_dirty(false);
        self.pages.close()?;

        log::info!("Database closed");
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::MemoryStatusTable;
    use anyhow::Result;
    use tempfile::tempdir;

    fn config() -> DataManagerConfig {
        DataManagerConfig::default().with_sync_writes(false)
    }

    fn read_bytes(dm: &DataManager, uid: u64) -> Result<Option<Vec<u8>>> {
        Ok(match dm.read(uid)? {
            Some(item) => {
                let bytes = item.data().to_vec();
                dm.release(&item)?;
                Some(bytes)
            }
            None => None,
        })
    }

    /// Run one before/after bracket overwriting the item's payload.
    fn overwrite(dm: &DataManager, uid: u64, xid: TransactionId, payload: &[u8]) -> Result<()> {
        let item = dm.read(uid)?.expect("item should exist");
        {
            let mut guard = item.before()?;
            guard.data_mut().copy_from_slice(payload);
            guard.after(xid)?;
        }
        dm.release(&item)?;
        Ok(())
    }

    #[test]
    fn test_create_insert_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");

        let dm = DataManager::create(&path, config())?;
        assert!(with_suffix(&path, ".db").exists());
        assert!(with_suffix(&path, ".log").exists());

        let uid = dm.insert(TransactionId::SYSTEM, b"HelloRainDB")?;
        assert_eq!(uid_to_address(uid).0, PageId(2));
        assert_eq!(read_bytes(&dm, uid)?, Some(b"HelloRainDB".to_vec()));

        dm.close()?;
        Ok(())
    }

    #[test]
    fn test_create_existing_and_open_missing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");

        let status = MemoryStatusTable::new();
        let missing = DataManager::open(&path, config(), &status);
        assert!(matches!(missing, Err(StorageError::FileNotExists(_))));

        DataManager::create(&path, config())?.close()?;
        let again = DataManager::create(&path, config());
        assert!(matches!(again, Err(StorageError::FileExists(_))));

        Ok(())
    }

    #[test]
    fn test_memory_too_small() -> Result<()> {
        let dir = tempdir()?;
        let budget = (MIN_CACHED_PAGES - 1) * PAGE_SIZE as u64;

        let result = DataManager::create(
            &dir.path().join("test"),
            config().with_memory_budget(budget),
        );
        assert!(matches!(
            result,
            Err(StorageError::MemoryTooSmall { pages: 9, min: 10 })
        ));

        Ok(())
    }

    #[test]
    fn test_unknown_uids_read_as_none() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), config())?;
        let uid = dm.insert(TransactionId::SYSTEM, b"present")?;

        // Beyond the last page, on the marker page, past the used region.
        assert!(dm.read(address_to_uid(PageId(99), 2))?.is_none());
        assert!(dm.read(address_to_uid(PageId::MARKER, 2))?.is_none());
        assert!(dm.read(uid + 100)?.is_none());
        assert!(dm.read(0)?.is_none());

        // Stray bits above the 16-bit offset do not alias the real slot.
        assert!(dm.read(uid | 1 << 16)?.is_none());
        assert!(dm.read(uid | 1 << 31)?.is_none());
        assert_eq!(dm.items.len(), 0);

        let item = dm.read(uid)?.expect("inserted item");
        assert_eq!(item.uid(), uid);
        dm.release(&item)?;
        assert_eq!(dm.items.len(), 0);
        Ok(())
    }

    #[test]
    fn test_tombstoned_item_reads_as_none() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), config())?;
        let uid = dm.insert(TransactionId::SYSTEM, b"short-lived")?;

        let item = dm.read(uid)?.expect("just inserted");
        let mut guard = item.before()?;
        guard.set_valid(false);
        guard.after(TransactionId::SYSTEM)?;
        dm.release(&item)?;

        assert!(dm.read(uid)?.is_none());
        Ok(())
    }

    #[test]
    fn test_insert_size_limits() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), config())?;

        let max_payload = data_page::MAX_FREE_SPACE - ITEM_HEADER_SIZE;
        let too_big = dm.insert(TransactionId::SYSTEM, &vec![0u8; max_payload + 1]);
        assert!(matches!(too_big, Err(StorageError::DataTooLarge { .. })));

        let uid = dm.insert(TransactionId::SYSTEM, &vec![7u8; max_payload])?;
        assert_eq!(read_bytes(&dm, uid)?.map(|b| b.len()), Some(max_payload));

        Ok(())
    }

    #[test]
    fn test_inserts_spill_to_new_pages() -> Result<()> {
        let dir = tempdir()?;
        let dm = DataManager::create(&dir.path().join("test"), config())?;

        let payloads: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 3000]).collect();
        let uids = payloads
            .iter()
            .map(|p| dm.insert(TransactionId::SYSTEM, p))
            .collect::<StorageResult<Vec<_>>>()?;

        assert!(dm.page_count() >= 4);
        for (uid, payload) in uids.iter().zip(&payloads) {
            assert_eq!(read_bytes(&dm, *uid)?.as_ref(), Some(payload));
        }

        Ok(())
    }

    #[test]
    fn test_reopen_reuses_free_space() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");

        let dm = DataManager::create(&path, config())?;
        dm.insert(TransactionId::SYSTEM, b"one")?;
        let pages = dm.page_count();
        dm.close()?;

        let dm = DataManager::open(&path, config(), &MemoryStatusTable::new())?;
        let uid = dm.insert(TransactionId::SYSTEM, b"two")?;
        assert_eq!(dm.page_count(), pages);
        assert_eq!(uid_to_address(uid), (PageId(2), 2 + 6));
        dm.close()?;

        Ok(())
    }

    #[test]
    fn test_unclean_shutdown_undoes_active_transaction() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");
        let status = MemoryStatusTable::new();

        let dm = DataManager::create(&path, config())?;
        let a = dm.insert(TransactionId::SYSTEM, b"slot-a")?;
        let b = dm.insert(TransactionId::SYSTEM, b"slot-b")?;

        let t1 = TransactionId::new(1);
        status.begin(t1);
        overwrite(&dm, a, t1, b"AAAAAA")?;
        overwrite(&dm, b, t1, b"BBBBBB")?;
        dm.flush()?;
        drop(dm);

        let dm = DataManager::open(&path, config(), &status)?;
        assert_eq!(read_bytes(&dm, a)?, Some(b"slot-a".to_vec()));
        assert_eq!(read_bytes(&dm, b)?, Some(b"slot-b".to_vec()));
        dm.close()?;

        Ok(())
    }

    #[test]
    fn test_unclean_shutdown_redoes_committed_transaction() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");
        let status = MemoryStatusTable::new();

        let dm = DataManager::create(&path, config())?;
        let uid = dm.insert(TransactionId::SYSTEM, b"before")?;
        dm.flush()?;

        let t2 = TransactionId::new(2);
        status.begin(t2);
        overwrite(&dm, uid, t2, b"after!")?;
        status.commit(t2);
        drop(dm);

        let dm = DataManager::open(&path, config(), &status)?;
        assert_eq!(read_bytes(&dm, uid)?, Some(b"after!".to_vec()));
        dm.close()?;

        Ok(())
    }

    #[test]
    fn test_clean_close_skips_recovery() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test");
        let status = MemoryStatusTable::new();

        let dm = DataManager::create(&path, config())?;
        let uid = dm.insert(TransactionId::SYSTEM, b"first")?;
        let t1 = TransactionId::new(1);
        status.begin(t1);
        overwrite(&dm, uid, t1, b"later")?;
        dm.close()?;

        // Still active, but the shutdown was clean so nothing is undone.
        let dm = DataManager::open(&path, config(), &status)?;
        assert_eq!(read_bytes(&dm, uid)?, Some(b"later".to_vec()));
        dm.close()?;

        Ok(())
    }
}
