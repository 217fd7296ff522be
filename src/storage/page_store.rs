//! Page store: one file of fixed-size pages behind a [`ResourceCache`].
//!
//! Pages are numbered from 1. A miss reads exactly one page from the file
//! under the file lock; the last release of a dirty page writes it back.

use crate::storage::cache::{CacheBackend, ResourceCache};
use crate::storage::disk::{PageFile, PAGE_SIZE};
use crate::storage::error::StorageResult;
use crate::storage::page::{Page, PageId};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Page file shared by the cache loader and the store; the mutex is the
/// file lock, separate from every per-page lock.
struct PageIo {
    file: Mutex<PageFile>,
}

impl PageIo {
    fn flush(&self, page: &Page) -> StorageResult<()> {
        let data = page.read();
        self.file.lock().write_page(page.id(), &data)
    }

    /// Write the page only if dirty. The flag is cleared under the page's
    /// read lock, so a writer that marks the page dirty afterwards is never
    /// lost.
    fn write_back(&self, page: &Page) -> StorageResult<()> {
        let data = page.read();
        if !page.take_dirty() {
            return Ok(());
        }
        let result = self.file.lock().write_page(page.id(), &data);
        if result.is_err() {
            page.set_dirty(true);
        }
        result
    }
}

struct PageLoader {
    io: Arc<PageIo>,
}

impl CacheBackend for PageLoader {
    type Resource = Page;

    fn load(&self, key: u64) -> StorageResult<Page> {
        let page_id = PageId(key as u32);
        let mut data = Box::new([0u8; PAGE_SIZE]);
        self.io.file.lock().read_page(page_id, &mut data)?;
        Ok(Page::new(page_id, data))
    }

    fn finalize(&self, page: &Page) -> StorageResult<()> {
        self.io.write_back(page)
    }
}

pub struct PageStore {
    cache: ResourceCache<PageLoader>,
    io: Arc<PageIo>,
    page_count: AtomicU32,
}

impl PageStore {
    pub fn create(path: &Path, capacity: usize, sync: bool) -> StorageResult<Self> {
        let file = PageFile::create(path, sync)?;
        Ok(Self::with_file(file, capacity, 0))
    }

    pub fn open(path: &Path, capacity: usize, sync: bool) -> StorageResult<Self> {
        let file = PageFile::open(path, sync)?;
        let page_count = file.num_pages()?;
        Ok(Self::with_file(file, capacity, page_count))
    }

    fn with_file(file: PageFile, capacity: usize, page_count: u32) -> Self {
        let io = Arc::new(PageIo {
            file: Mutex::new(file),
        });
        Self {
            cache: ResourceCache::new(PageLoader { io: io.clone() }, capacity),
            io,
            page_count: AtomicU32::new(page_count),
        }
    }

    /// Allocate the next page number and write `init` there immediately.
    /// Numbers are never handed out twice, even if the page is never cached.
    pub fn new_page(&self, init: Box<[u8; PAGE_SIZE]>) -> StorageResult<PageId> {
        let page_id = PageId(self.page_count.fetch_add(1, Ordering::SeqCst) + 1);
        let page = Page::new(page_id, init);
        self.flush(&page)?;
        log::debug!("Allocated {}", page_id);
        Ok(page_id)
    }

    pub fn get_page(&self, page_id: PageId) -> StorageResult<Arc<Page>> {
        self.cache.acquire(page_id.key())
    }

    /// Drop one reference; the last one writes the page back if dirty.
    pub fn release(&self, page: &Page) -> StorageResult<()> {
        self.cache.release(page.id().key())
    }

    /// Unconditional synchronous write of the page's current bytes.
    pub fn flush(&self, page: &Page) -> StorageResult<()> {
        self.io.flush(page)
    }

    /// Write back every resident dirty page, keeping them cached.
    pub fn flush_all(&self) -> StorageResult<()> {
        for page in self.cache.resident() {
            self.io.write_back(&page)?;
        }
        Ok(())
    }

    /// Resize the file to exactly `max_page` pages and continue numbering
    /// after it.
    pub fn truncate(&self, max_page: u32) -> StorageResult<()> {
        self.io.file.lock().truncate(max_page)?;
        self.page_count.store(max_page, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    pub fn resident_pages(&self) -> usize {
        self.cache.len()
    }

    /// Write back all resident pages and sync the file. The store must not
    /// be used afterwards.
    pub fn close(&self) -> StorageResult<()> {
        self.cache.shutdown()?;
        self.io.file.lock().sync()
    }
}
