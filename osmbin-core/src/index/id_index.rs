//! Id to first-record map backing every entity file.

use crate::storage::FixedRecordFile;
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

/// Bytes per index entry: `id:i32, record:i32`
const ENTRY_LEN: usize = 8;

/// Free-slot marker in the id column
const FREE_SLOT: i32 = i32::MIN;

/// Slots added whenever the index file runs out of free entries
const GROWTH_SLOTS: u32 = 1024;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    record: u32,
    slot: u32,
}

/// Persistent map from an entity id to the first record of its run.
///
/// The whole map is held in memory; the file is a flat array of 8-byte
/// entries that is updated in place, so every `put`/`remove` is durable once
/// the file is flushed.
#[derive(Debug)]
pub struct IdIndexFile {
    file: FixedRecordFile,
    entries: HashMap<i32, IndexEntry>,
    /// Free entry slots, lowest last so `pop` reuses from the front
    free_slots: Vec<u32>,
}

impl IdIndexFile {
    /// Opens or creates an id index and loads it into memory
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = FixedRecordFile::open(path, ENTRY_LEN)?;
        let mut entries = HashMap::new();
        let mut free_slots = Vec::new();

        for slot in 0..file.record_count() {
            let raw = file.record(slot)?;
            let id = BigEndian::read_i32(raw);
            if id == FREE_SLOT {
                free_slots.push(slot);
                continue;
            }
            let record = BigEndian::read_u32(&raw[4..]);
            if let Some(previous) = entries.insert(id, IndexEntry { record, slot }) {
                warn!(
                    "{}: duplicate entry for id {} in slots {} and {}, keeping the later one",
                    file.path().display(),
                    id,
                    previous.slot,
                    slot
                );
                free_slots.push(previous.slot);
            }
        }
        free_slots.sort_unstable_by(|a, b| b.cmp(a));

        let mut index = Self { file, entries, free_slots };
        // Duplicates were dropped from memory; clear their slots on disk too
        let stale: Vec<u32> = index
            .free_slots
            .iter()
            .copied()
            .filter(|&slot| {
                index
                    .file
                    .record(slot)
                    .map(|raw| BigEndian::read_i32(raw) != FREE_SLOT)
                    .unwrap_or(false)
            })
            .collect();
        for slot in stale {
            index.write_slot(slot, FREE_SLOT, 0)?;
        }

        Ok(index)
    }

    /// Returns the first record of `id`'s run, if indexed
    pub fn get(&self, id: i32) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.record)
    }

    /// Inserts or updates the entry for `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the index file cannot be grown or written.
    pub fn put(&mut self, id: i32, record: u32) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.record == record {
                return Ok(());
            }
            entry.record = record;
            let slot = entry.slot;
            return self.write_slot(slot, id, record);
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => self.grow()?,
        };
        self.write_slot(slot, id, record)?;
        self.entries.insert(id, IndexEntry { record, slot });
        Ok(())
    }

    /// Removes the entry for `id`
    ///
    /// # Returns
    ///
    /// Returns `true` if an entry existed
    ///
    /// # Errors
    ///
    /// Returns an error if the index file cannot be written.
    pub fn remove(&mut self, id: i32) -> Result<bool> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(false);
        };
        self.write_slot(entry.slot, FREE_SLOT, 0)?;
        self.free_slots.push(entry.slot);
        Ok(true)
    }

    /// Drops every entry and truncates the file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated.
    pub fn clear(&mut self) -> Result<()> {
        self.file.truncate(0)?;
        self.entries.clear();
        self.free_slots.clear();
        info!("{}: cleared", self.file.path().display());
        Ok(())
    }

    /// Number of indexed ids
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flushes the index file to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn grow(&mut self) -> Result<u32> {
        let first = self.file.record_count();
        self.file.grow(GROWTH_SLOTS)?;
        for slot in first..first + GROWTH_SLOTS {
            self.write_slot(slot, FREE_SLOT, 0)?;
        }
        // Lowest slot is handed out now, the rest go to the free list
        self.free_slots.extend((first + 1..first + GROWTH_SLOTS).rev());
        Ok(first)
    }

    fn write_slot(&mut self, slot: u32, id: i32, record: u32) -> Result<()> {
        let raw = self.file.record_mut(slot)?;
        BigEndian::write_i32(&mut raw[..4], id);
        BigEndian::write_u32(&mut raw[4..], record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut index = IdIndexFile::open(dir.path().join("t.idx")).unwrap();

        index.put(7, 100).unwrap();
        index.put(-3, 5).unwrap();
        assert_eq!(index.get(7), Some(100));
        assert_eq!(index.get(-3), Some(5));

        index.put(7, 101).unwrap();
        assert_eq!(index.get(7), Some(101));
        assert_eq!(index.len(), 2);

        assert!(index.remove(7).unwrap());
        assert!(!index.remove(7).unwrap());
        assert_eq!(index.get(7), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.idx");
        {
            let mut index = IdIndexFile::open(&path).unwrap();
            for id in 0..3000 {
                index.put(id, (id * 2) as u32).unwrap();
            }
            index.remove(42).unwrap();
            index.flush().unwrap();
        }

        let index = IdIndexFile::open(&path).unwrap();
        assert_eq!(index.len(), 2999);
        assert_eq!(index.get(2999), Some(5998));
        assert_eq!(index.get(42), None);
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.idx");
        let mut index = IdIndexFile::open(&path).unwrap();
        index.put(1, 1).unwrap();
        index.put(2, 2).unwrap();
        index.remove(1).unwrap();
        index.put(3, 3).unwrap();

        assert_eq!(index.entries[&3].slot, 0);
        let expected = u64::from(GROWTH_SLOTS) * ENTRY_LEN as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }
}
