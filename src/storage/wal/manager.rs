//! WAL file handling.
//!
//! The running checksum at offset 0 folds over the full bytes of every
//! accepted record and is rewritten after each append. On open the records
//! are re-scanned and must fold to the persisted value. Trailing bytes that
//! never made it into the running checksum (an incomplete frame, or one
//! complete record whose checksum update was lost) are cut off. Any other
//! disagreement is reported as a bad log file.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use super::record::LogRecord;
use crate::storage::error::{StorageError, StorageResult};

const SEED: u32 = 13331;

/// Size of the running checksum at the start of the file.
const CHECKSUM_LEN: u64 = 4;

// Record header: size (4 bytes) then payload checksum (4 bytes).
const OF_SIZE: usize = 0;
const OF_CHECKSUM: usize = OF_SIZE + 4;
const OF_DATA: usize = OF_CHECKSUM + 4;

/// Seeded multiply-add fold used for both payload and running checksums.
pub fn checksum(seed: u32, bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(seed, |acc, &b| acc.wrapping_mul(SEED).wrapping_add(b as u32))
}

/// Why a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Last record ends exactly at end of file.
    Clean,
    /// A trailing record is incomplete or fails its checksum.
    Torn,
    /// A record fails its checksum with more bytes after it.
    Corrupt,
}

enum Frame {
    /// Full record bytes, header included.
    Record(Vec<u8>),
    Tail(Tail),
}

struct WalInner {
    file: File,
    /// Running checksum over all accepted records.
    running: u32,
    /// Offset one past the last accepted record.
    end: u64,
    /// Replay cursor.
    position: u64,
}

impl WalInner {
    fn read_frame(&mut self, position: u64) -> StorageResult<Frame> {
        if position >= self.end {
            return Ok(Frame::Tail(Tail::Clean));
        }
        if position + OF_DATA as u64 > self.end {
            return Ok(Frame::Tail(Tail::Torn));
        }

        let mut header = [0u8; OF_DATA];
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut header)?;
        let size = LittleEndian::read_u32(&header[OF_SIZE..OF_CHECKSUM]) as usize;
        let expected = LittleEndian::read_u32(&header[OF_CHECKSUM..OF_DATA]);

        let record_end = position + (OF_DATA + size) as u64;
        if record_end > self.end {
            return Ok(Frame::Tail(Tail::Torn));
        }

        let mut frame = vec![0u8; OF_DATA + size];
        frame[..OF_DATA].copy_from_slice(&header);
        self.file.read_exact(&mut frame[OF_DATA..])?;

        if checksum(0, &frame[OF_DATA..]) != expected {
            let tail = if record_end == self.end {
                Tail::Torn
            } else {
                Tail::Corrupt
            };
            return Ok(Frame::Tail(tail));
        }

        Ok(Frame::Record(frame))
    }

    /// Re-scan the file against the persisted running checksum and cut off
    /// a bad tail.
    fn check_and_remove_tail(&mut self) -> StorageResult<()> {
        let persisted = self.running;

        let mut position = CHECKSUM_LEN;
        let mut fold = 0u32;
        let mut last: Option<(u64, u32)> = None;
        let mut records = 0usize;
        let tail = loop {
            match self.read_frame(position)? {
                Frame::Record(frame) => {
                    last = Some((position, fold));
                    fold = checksum(fold, &frame);
                    position += frame.len() as u64;
                    records += 1;
                }
                Frame::Tail(tail) => break tail,
            }
        };

        if tail == Tail::Corrupt {
            log::error!("Log record at offset {} fails its checksum", position);
            return Err(StorageError::BadLogFile(format!(
                "record at offset {position} fails its checksum"
            )));
        }

        // An append writes its frame before folding it into the running
        // checksum, so a torn frame is never covered by the persisted value.
        let (valid_end, valid_fold) = if fold == persisted {
            (position, fold)
        } else {
            match last {
                // Last record was written but its checksum update never landed.
                Some((start, fold_before)) if tail == Tail::Clean && fold_before == persisted => {
                    records -= 1;
                    (start, fold_before)
                }
                _ => {
                    log::error!(
                        "Log checksum mismatch: persisted {:#010x}, computed {:#010x}",
                        persisted,
                        fold
                    );
                    return Err(StorageError::BadLogFile(format!(
                        "running checksum {persisted:#010x} does not match records ({fold:#010x})"
                    )));
                }
            }
        };

        if valid_end < self.end {
            log::warn!(
                "Removing bad log tail: {} bytes at offset {}",
                self.end - valid_end,
                valid_end
            );
            self.file.set_len(valid_end)?;
            self.end = valid_end;
        }
        if valid_fold != persisted {
            self.write_running(valid_fold)?;
        }
        self.file.sync_all()?;
        self.running = valid_fold;
        self.position = CHECKSUM_LEN;

        log::debug!("Log opened with {} records, {} bytes", records, self.end);
        Ok(())
    }

    fn write_running(&mut self, running: u32) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_u32::<LittleEndian>(running)?;
        Ok(())
    }
}

pub struct WalManager {
    inner: Mutex<WalInner>,
    sync: bool,
}

impl WalManager {
    pub fn create(path: &Path, sync: bool) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StorageError::FileExists(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;

        file.write_u32::<LittleEndian>(0)?;
        file.sync_all()?;

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                running: 0,
                end: CHECKSUM_LEN,
                position: CHECKSUM_LEN,
            }),
            sync,
        })
    }

    /// Open an existing log, validating it and removing a bad tail.
    pub fn open(path: &Path, sync: bool) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StorageError::FileNotExists(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;

        let size = file.metadata()?.len();
        if size < CHECKSUM_LEN {
            return Err(StorageError::BadLogFile(format!(
                "file is {size} bytes, shorter than its header"
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let running = file.read_u32::<LittleEndian>()?;

        let mut inner = WalInner {
            file,
            running,
            end: size,
            position: CHECKSUM_LEN,
        };
        inner.check_and_remove_tail()?;

        Ok(Self {
            inner: Mutex::new(inner),
            sync,
        })
    }

    /// Append one record and fold it into the running checksum.
    pub fn append(&self, payload: &[u8]) -> StorageResult<()> {
        let frame = Self::wrap(payload);

        let mut inner = self.inner.lock();
        let offset = inner.end;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&frame)?;
        if self.sync {
            inner.file.sync_data()?;
        }
        inner.end += frame.len() as u64;

        let running = checksum(inner.running, &frame);
        inner.write_running(running)?;
        if self.sync {
            inner.file.sync_data()?;
        }
        inner.running = running;

        Ok(())
    }

    pub fn log(&self, record: &LogRecord) -> StorageResult<()> {
        let payload = record.serialize()?;
        self.append(&payload)
    }

    fn wrap(payload: &[u8]) -> BytesMut {
        let mut frame = BytesMut::with_capacity(OF_DATA + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(checksum(0, payload));
        frame.put_slice(payload);
        frame
    }

    /// Reset the replay cursor to the first record.
    pub fn rewind(&self) {
        self.inner.lock().position = CHECKSUM_LEN;
    }

    /// Payload of the next record, or `None` at the end of the log.
    pub fn next(&self) -> StorageResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let position = inner.position;
        match inner.read_frame(position)? {
            Frame::Record(frame) => {
                inner.position += frame.len() as u64;
                Ok(Some(frame[OF_DATA..].to_vec()))
            }
            Frame::Tail(_) => Ok(None),
        }
    }

    pub fn next_record(&self) -> StorageResult<Option<LogRecord>> {
        match self.next()? {
            Some(payload) => Ok(Some(LogRecord::deserialize(&payload)?)),
            None => Ok(None),
        }
    }

    /// Hard cut of the file length.
    pub fn truncate(&self, offset: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(offset)?;
        inner.end = offset;
        if inner.position > offset {
            inner.position = offset;
        }
        Ok(())
    }

    /// Current length of the log in bytes.
    pub fn len(&self) -> u64 {
        self.inner.lock().end
    }

    pub fn is_empty(&self) -> bool {
        self.len() == CHECKSUM_LEN
    }

    pub fn running_checksum(&self) -> u32 {
        self.inner.lock().running
    }

    pub fn close(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data_item::address_to_uid;
    use crate::storage::page::PageId;
    use crate::transaction::TransactionId;
    use anyhow::Result;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    fn log_path() -> Result<(TempDir, PathBuf)> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        Ok((dir, path))
    }

    fn payload(i: usize) -> Vec<u8> {
        format!("record-{i}-").repeat(i + 1).into_bytes()
    }

    /// Appends `count` records and returns the start offset of each.
    fn write_records(path: &Path, count: usize) -> Result<Vec<u64>> {
        Ok(write_records_tracked(path, count)?.0)
    }

    /// Like `write_records`, also returning the running checksum as it was
    /// before each record was appended.
    fn write_records_tracked(path: &Path, count: usize) -> Result<(Vec<u64>, Vec<u32>)> {
        let wal = WalManager::create(path, false)?;
        let mut offsets = Vec::new();
        let mut running = Vec::new();
        for i in 0..count {
            offsets.push(wal.len());
            running.push(wal.running_checksum());
            wal.append(&payload(i))?;
        }
        wal.close()?;
        Ok((offsets, running))
    }

    /// Leave the file as a crash in the middle of appending the record at
    /// `start` would: a partial frame and the previous running checksum.
    fn crash_mid_append(path: &Path, start: u64, cut: u64, running: u32) -> Result<()> {
        assert!(cut >= start);
        OpenOptions::new().write(true).open(path)?.set_len(cut)?;
        patch(path, 0, &running.to_le_bytes())
    }

    fn read_all(wal: &WalManager) -> Result<Vec<Vec<u8>>> {
        wal.rewind();
        let mut out = Vec::new();
        while let Some(p) = wal.next()? {
            out.push(p);
        }
        Ok(out)
    }

    fn patch(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn flip(path: &Path, offset: u64) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut byte)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[!byte[0]])?;
        Ok(())
    }

    #[test]
    fn test_checksum_fold() {
        assert_eq!(checksum(0, &[]), 0);
        assert_eq!(checksum(0, &[1]), 1);
        assert_eq!(checksum(0, &[1, 2]), SEED + 2);
        // Folding in pieces equals folding at once.
        let data = b"write-ahead";
        assert_eq!(checksum(checksum(0, &data[..5]), &data[5..]), checksum(0, data));
    }

    #[test]
    fn test_append_and_replay() -> Result<()> {
        let (_dir, path) = log_path()?;
        write_records(&path, 5)?;

        let wal = WalManager::open(&path, false)?;
        let records = read_all(&wal)?;
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, &payload(i));
        }

        // Rewind restarts the cursor.
        wal.rewind();
        assert_eq!(wal.next()?, Some(payload(0)));

        Ok(())
    }

    #[test]
    fn test_create_existing_fails() -> Result<()> {
        let (_dir, path) = log_path()?;
        let _wal = WalManager::create(&path, false)?;
        assert!(matches!(
            WalManager::create(&path, false),
            Err(StorageError::FileExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_empty_log() -> Result<()> {
        let (_dir, path) = log_path()?;
        WalManager::create(&path, false)?;

        let wal = WalManager::open(&path, false)?;
        assert!(wal.is_empty());
        assert_eq!(wal.next()?, None);

        Ok(())
    }

    #[test]
    fn test_torn_tail_is_removed() -> Result<()> {
        let (_dir, path) = log_path()?;
        let (offsets, running) = write_records_tracked(&path, 6)?;
        let file_len = std::fs::metadata(&path)?.len();

        // Cut inside every possible spot of the last record.
        let last = offsets[5];
        for cut in [last, last + 1, last + 4, last + 9, file_len - 1] {
            let copy = path.with_extension(format!("cut{cut}"));
            std::fs::copy(&path, &copy)?;
            crash_mid_append(&copy, last, cut, running[5])?;

            let wal = WalManager::open(&copy, false)?;
            let records = read_all(&wal)?;
            assert_eq!(records.len(), 5, "cut at {cut}");
            for (i, record) in records.iter().enumerate() {
                assert_eq!(record, &payload(i));
            }
            assert_eq!(std::fs::metadata(&copy)?.len(), last);
        }

        Ok(())
    }

    #[test]
    fn test_log_usable_after_tail_repair() -> Result<()> {
        let (_dir, path) = log_path()?;
        let (offsets, running) = write_records_tracked(&path, 3)?;
        crash_mid_append(&path, offsets[2], offsets[2] + 3, running[2])?;

        {
            let wal = WalManager::open(&path, false)?;
            wal.append(b"after-repair")?;
        }

        let wal = WalManager::open(&path, false)?;
        let records = read_all(&wal)?;
        assert_eq!(records, vec![payload(0), payload(1), b"after-repair".to_vec()]);

        Ok(())
    }

    #[test]
    fn test_unacknowledged_append_is_dropped() -> Result<()> {
        let (_dir, path) = log_path()?;
        write_records(&path, 2)?;

        // A complete record whose running-checksum update never happened.
        let frame = WalManager::wrap(b"lost");
        let end = std::fs::metadata(&path)?.len();
        patch(&path, end, &frame)?;

        let wal = WalManager::open(&path, false)?;
        assert_eq!(read_all(&wal)?, vec![payload(0), payload(1)]);
        assert_eq!(std::fs::metadata(&path)?.len(), end);

        Ok(())
    }

    #[test]
    fn test_corrupt_middle_record_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        let offsets = write_records(&path, 4)?;

        // Flip a byte of the second record's checksum field.
        flip(&path, offsets[1] + OF_CHECKSUM as u64)?;

        let result = WalManager::open(&path, false);
        assert!(matches!(result, Err(StorageError::BadLogFile(_))));

        Ok(())
    }

    #[test]
    fn test_corrupt_middle_payload_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        let offsets = write_records(&path, 4)?;
        flip(&path, offsets[2] + OF_DATA as u64 + 1)?;

        let result = WalManager::open(&path, false);
        assert!(result.is_err());
        assert!(result.err().unwrap().is_integrity());

        Ok(())
    }

    #[test]
    fn test_corrupt_middle_size_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        let offsets = write_records(&path, 4)?;
        let len = std::fs::metadata(&path)?.len();

        // A size that runs past the end of the file must not pass as a torn tail.
        patch(&path, offsets[1] + OF_SIZE as u64, &0xFFFF_0000u32.to_le_bytes())?;

        assert!(matches!(
            WalManager::open(&path, false),
            Err(StorageError::BadLogFile(_))
        ));
        // Nothing was cut off.
        assert_eq!(std::fs::metadata(&path)?.len(), len);

        Ok(())
    }

    #[test]
    fn test_bad_running_checksum_with_trailing_bytes_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        write_records(&path, 3)?;
        patch(&path, 0, &[0xDE, 0xAD, 0xBE, 0xEF])?;
        let end = std::fs::metadata(&path)?.len();
        patch(&path, end, &[1, 2, 3])?;

        assert!(matches!(
            WalManager::open(&path, false),
            Err(StorageError::BadLogFile(_))
        ));

        Ok(())
    }

    #[test]
    fn test_cut_inside_acknowledged_record_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        let offsets = write_records(&path, 3)?;

        // The running checksum already covers the record that lost its tail.
        OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_len(offsets[2] + 5)?;

        assert!(matches!(
            WalManager::open(&path, false),
            Err(StorageError::BadLogFile(_))
        ));

        Ok(())
    }

    #[test]
    fn test_bad_running_checksum_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        write_records(&path, 3)?;
        patch(&path, 0, &[0xDE, 0xAD, 0xBE, 0xEF])?;

        assert!(matches!(
            WalManager::open(&path, false),
            Err(StorageError::BadLogFile(_))
        ));

        Ok(())
    }

    #[test]
    fn test_short_file_is_fatal() -> Result<()> {
        let (_dir, path) = log_path()?;
        std::fs::write(&path, [0u8; 2])?;
        assert!(matches!(
            WalManager::open(&path, false),
            Err(StorageError::BadLogFile(_))
        ));
        Ok(())
    }

    #[test]
    fn test_typed_records() -> Result<()> {
        let (_dir, path) = log_path()?;
        let uid = address_to_uid(PageId(2), 2);
        let records = vec![
            LogRecord::insert(TransactionId::SYSTEM, uid, vec![0, 3, 0, b'a', b'b', b'c']),
            LogRecord::before(uid, vec![0, 3, 0, b'a', b'b', b'c']),
            LogRecord::update(
                TransactionId::new(4),
                uid,
                vec![0, 3, 0, b'a', b'b', b'c'],
                vec![0, 3, 0, b'x', b'y', b'z'],
            ),
        ];

        {
            let wal = WalManager::create(&path, false)?;
            for record in &records {
                wal.log(record)?;
            }
        }

        let wal = WalManager::open(&path, false)?;
        let mut replayed = Vec::new();
        while let Some(record) = wal.next_record()? {
            replayed.push(record);
        }
        assert_eq!(replayed, records);

        Ok(())
    }

    #[test]
    fn test_truncate_is_hard_cut() -> Result<()> {
        let (_dir, path) = log_path()?;
        let wal = WalManager::create(&path, false)?;
        wal.append(b"one")?;
        let cut = wal.len();
        wal.append(b"two")?;

        wal.truncate(cut)?;
        assert_eq!(wal.len(), cut);
        assert_eq!(read_all(&wal)?, vec![b"one".to_vec()]);

        Ok(())
    }
}
