use crate::storage::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use byteorder::{ByteOrder, LittleEndian};

// Header: free space offset (2 bytes), items are appended right after it.
const FREE_SPACE_OFFSET: usize = 0;
pub const HEADER_SIZE: usize = 2;

/// Largest item a single data page can hold.
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - HEADER_SIZE;

/// Bytes for a freshly allocated, empty data page.
pub fn initial_raw() -> Box<[u8; PAGE_SIZE]> {
    let mut data = Box::new([0u8; PAGE_SIZE]);
    DataPage::new(&mut data);
    data
}

/// Offset of the first unused byte.
pub fn free_space_offset(data: &[u8; PAGE_SIZE]) -> usize {
    LittleEndian::read_u16(&data[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 2]) as usize
}

pub fn free_space(data: &[u8; PAGE_SIZE]) -> usize {
    PAGE_SIZE.saturating_sub(free_space_offset(data))
}

/// Checks the header of a page read back from disk.
pub fn validate(page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
    let fso = free_space_offset(data);
    if !(HEADER_SIZE..=PAGE_SIZE).contains(&fso) {
        return Err(StorageError::CorruptPage {
            page: page_id,
            reason: format!("free space offset {fso} out of range"),
        });
    }
    Ok(())
}

/// Append-only layout: `[FreeSpaceOffset:2][item][item]...`.
pub struct DataPage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> DataPage<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        let mut page = Self { data };
        page.set_free_space_offset(HEADER_SIZE);
        page
    }

    pub fn from_data(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn free_space_offset(&self) -> usize {
        free_space_offset(self.data)
    }

    pub fn free_space(&self) -> usize {
        free_space(self.data)
    }

    /// Append `raw` and return the offset it was written at.
    pub fn insert(&mut self, raw: &[u8]) -> StorageResult<u16> {
        let offset = self.free_space_offset();
        let available = PAGE_SIZE.saturating_sub(offset);
        if raw.len() > available {
            return Err(StorageError::DataTooLarge {
                size: raw.len(),
                max: available,
            });
        }

        self.data[offset..offset + raw.len()].copy_from_slice(raw);
        self.set_free_space_offset(offset + raw.len());

        Ok(offset as u16)
    }

    /// Replay an insert at a known offset, growing the used region if the
    /// item lies beyond it.
    pub fn recover_insert(&mut self, offset: u16, raw: &[u8]) -> StorageResult<()> {
        let end = self.write_at(offset, raw)?;
        if end > self.free_space_offset() {
            self.set_free_space_offset(end);
        }
        Ok(())
    }

    /// Replay an in-place overwrite; the used region is unchanged.
    pub fn recover_update(&mut self, offset: u16, raw: &[u8]) -> StorageResult<()> {
        self.write_at(offset, raw)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u16, raw: &[u8]) -> StorageResult<usize> {
        let start = offset as usize;
        let end = start + raw.len();
        if start < HEADER_SIZE || end > PAGE_SIZE {
            return Err(StorageError::DataTooLarge {
                size: raw.len(),
                max: PAGE_SIZE.saturating_sub(start),
            });
        }
        self.data[start..end].copy_from_slice(raw);
        Ok(end)
    }

    fn set_free_space_offset(&mut self, offset: usize) {
        LittleEndian::write_u16(
            &mut self.data[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 2],
            offset as u16,
        );
    }
}
