//! Memory-mapped files of fixed-length records.

use crate::error::StorageError;
use anyhow::{Context, Result};
use fs2::FileExt;
use log::{info, warn};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Memory-mapped file divided into fixed-length records.
///
/// Record `i` occupies bytes `i * record_len .. (i + 1) * record_len`; the
/// record number is the only physical address. The file carries no header.
///
/// Views returned by [`FixedRecordFile::record`] and
/// [`FixedRecordFile::record_mut`] borrow the file, so the borrow checker
/// rejects a [`FixedRecordFile::grow`] (which remaps) while a view is alive.
#[derive(Debug)]
pub struct FixedRecordFile {
    /// File handle (owns the file lock)
    file: File,

    /// Memory-mapped view; `None` while the file is empty
    mmap: Option<MmapMut>,

    /// Bytes per record
    record_len: usize,

    /// Records currently backed by the file
    count: u32,

    /// Path, kept for log and error messages
    path: PathBuf,
}

impl FixedRecordFile {
    /// Opens or creates a record file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the record file
    /// * `record_len` - Bytes per record (fixed for the lifetime of the file)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - The file is already locked by another process
    /// - The file cannot be mapped
    pub fn open<P: AsRef<Path>>(path: P, record_len: usize) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(record_len > 0, "Record length must be positive");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open record file: {}", path.display()))?;

        file.try_lock_exclusive()
            .with_context(|| {
                format!("Record file is already open by another process: {}", path.display())
            })?;

        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat record file: {}", path.display()))?
            .len();

        if len % record_len as u64 != 0 {
            warn!(
                "{}: length {} is not a multiple of record length {}, ignoring the tail",
                path.display(),
                len,
                record_len
            );
        }

        let count = u32::try_from(len / record_len as u64)
            .with_context(|| format!("Record file too large: {}", path.display()))?;

        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: the file is exclusively locked by this process and only
            // accessed through this mapping while the lock is held.
            let mmap = unsafe { MmapMut::map_mut(&file) }
                .with_context(|| format!("Failed to map {}", path.display()))?;
            Some(mmap)
        };

        info!("opened {} with {} records of {} bytes", path.display(), count, record_len);

        Ok(Self { file, mmap, record_len, count, path: path.to_path_buf() })
    }

    /// Returns the number of records currently allocated in the file
    pub fn record_count(&self) -> u32 {
        self.count
    }

    /// Returns the path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a read-only view of record `index`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RecordOutOfRange`] if `index` is beyond the
    /// end of the file.
    pub fn record(&self, index: u32) -> Result<&[u8]> {
        let range = self.byte_range(index)?;
        let mmap = self.mmap.as_ref().context("Record file is not mapped")?;
        mmap.get(range).context("Record extends beyond mmap bounds")
    }

    /// Returns a writable view of record `index`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RecordOutOfRange`] if `index` is beyond the
    /// end of the file.
    pub fn record_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let range = self.byte_range(index)?;
        let mmap = self.mmap.as_mut().context("Record file is not mapped")?;
        mmap.get_mut(range).context("Record extends beyond mmap bounds")
    }

    /// Copies record `index` into an owned buffer
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is beyond the end of the file.
    pub fn read_record(&self, index: u32) -> Result<Vec<u8>> {
        Ok(self.record(index)?.to_vec())
    }

    /// Writes a full record's bytes back to record `index`
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is beyond the end of the file or the
    /// buffer length differs from the record length.
    pub fn write_record(&mut self, buffer: &[u8], index: u32) -> Result<()> {
        anyhow::ensure!(
            buffer.len() == self.record_len,
            "Record buffer length mismatch: expected {}, got {}",
            self.record_len,
            buffer.len()
        );
        self.record_mut(index)?.copy_from_slice(buffer);
        Ok(())
    }

    /// Extends the file by `by_records` records
    ///
    /// The new records are **not** initialized by this layer; callers must
    /// write their free sentinel before treating them as available.
    ///
    /// # Returns
    ///
    /// Returns the number of newly available records
    ///
    /// # Warning
    ///
    /// This method remaps the file. Views obtained earlier cannot be held
    /// across this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized or remapped.
    pub fn grow(&mut self, by_records: u32) -> Result<u32> {
        if by_records == 0 {
            return Ok(0);
        }

        let new_count = self
            .count
            .checked_add(by_records)
            .context("Record count overflow while growing file")?;
        let new_len = u64::from(new_count) * self.record_len as u64;

        // Drop the old mapping before resizing the file underneath it
        self.mmap = None;
        self.file
            .set_len(new_len)
            .with_context(|| {
                format!("Failed to grow {} to {} bytes", self.path.display(), new_len)
            })?;

        // SAFETY: see `open`; the file is still exclusively locked.
        self.mmap = Some(
            unsafe { MmapMut::map_mut(&self.file) }
                .with_context(|| format!("Failed to remap {}", self.path.display()))?,
        );
        self.count = new_count;

        Ok(by_records)
    }

    /// Shrinks the file to `count` records
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized or remapped.
    pub fn truncate(&mut self, count: u32) -> Result<()> {
        if count >= self.count {
            return Ok(());
        }

        self.mmap = None;
        self.file
            .set_len(u64::from(count) * self.record_len as u64)
            .with_context(|| format!("Failed to truncate {}", self.path.display()))?;
        if count > 0 {
            // SAFETY: see `open`.
            self.mmap = Some(
                unsafe { MmapMut::map_mut(&self.file) }
                    .with_context(|| format!("Failed to remap {}", self.path.display()))?,
            );
        }
        self.count = count;

        Ok(())
    }

    /// Commits all pending changes to disk
    ///
    /// Flushes the mapping to the kernel page cache and forces the data and
    /// the file length to the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or fsync fails.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush().with_context(|| format!("Failed to flush {}", self.path.display()))?;
        }
        self.file
            .sync_all()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;
        Ok(())
    }

    fn byte_range(&self, index: u32) -> Result<std::ops::Range<usize>> {
        if index >= self.count {
            return Err(StorageError::RecordOutOfRange { record: index, count: self.count }.into());
        }
        let start = (index as usize)
            .checked_mul(self.record_len)
            .context("Record offset calculation overflow")?;
        Ok(start..start + self.record_len)
    }
}

impl Drop for FixedRecordFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_has_no_records() {
        let dir = TempDir::new().unwrap();
        let file = FixedRecordFile::open(dir.path().join("empty.obm"), 16).unwrap();
        assert_eq!(file.record_count(), 0);
        assert!(file.record(0).is_err());
    }

    #[test]
    fn test_out_of_range_is_typed() {
        let dir = TempDir::new().unwrap();
        let mut file = FixedRecordFile::open(dir.path().join("range.obm"), 8).unwrap();
        file.grow(2).unwrap();

        let err = file.record(2).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::RecordOutOfRange { record: 2, count: 2 })
        );
    }

    #[test]
    fn test_truncate_shrinks_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trunc.obm");
        let mut file = FixedRecordFile::open(&path, 8).unwrap();
        file.grow(10).unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.record_count(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
    }
}
