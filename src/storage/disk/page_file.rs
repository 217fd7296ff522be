use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Positioned page I/O over one file. Page `n` lives at `(n - 1) * PAGE_SIZE`.
pub struct PageFile {
    file: File,
    sync: bool,
}

impl PageFile {
    pub fn create(path: &Path, sync: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StorageError::FileExists(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;

        Ok(Self { file, sync })
    }

    pub fn open(path: &Path, sync: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StorageError::FileNotExists(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;

        Ok(Self { file, sync })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        if page_id.0 == 0 {
            return Err(StorageError::PageNotFound(page_id));
        }

        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset + PAGE_SIZE as u64 > file_size {
            return Err(StorageError::PageNotFound(page_id));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        Ok(())
    }

    /// Write one page, extending the file if needed.
    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        if page_id.0 == 0 {
            return Err(StorageError::PageNotFound(page_id));
        }

        let offset = Self::page_offset(page_id);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        if self.sync {
            self.file.sync_data()?;
        }

        Ok(())
    }

    pub fn num_pages(&self) -> StorageResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    /// Cut or extend the file to hold exactly `max_page` pages.
    pub fn truncate(&mut self, max_page: u32) -> StorageResult<()> {
        self.file.set_len(max_page as u64 * PAGE_SIZE as u64)?;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        (page_id.0 as u64 - 1) * PAGE_SIZE as u64
    }
}
