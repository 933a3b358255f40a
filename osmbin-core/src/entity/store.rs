//! Run allocation, lookup and reclamation shared by every entity file.
//!
//! # Ownership protocol
//!
//! A record's first four bytes hold the owning entity id, or [`FREE_ID`].
//! Writers claim a run only after checking that every record of it is free
//! or already theirs, and release a run by writing [`FREE_ID`] into each
//! record after checking that it still belongs to them. Callers serialize
//! writers per file (the datasets hold a write lock), so the checks are an
//! assertion against corruption rather than the locking mechanism.

use crate::entity::layout::{FREE_ID, read_header};
use crate::entity::used::UsedRecords;
use crate::error::StorageError;
use crate::index::IdIndexFile;
use crate::storage::FixedRecordFile;
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;

/// Relocation attempts after a record-in-use collision before giving up
const MAX_RELOCATIONS: usize = 16;

/// Where a write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// First record of the new run
    pub start: u32,
    /// First record of the released run, if the entity moved
    pub previous: Option<u32>,
}

/// A live entity run: its first record and a copy of every record in it
#[derive(Debug, Clone)]
pub struct Run {
    /// First record number
    pub start: u32,
    /// Record copies (safe-copy read buffers)
    pub records: Vec<Vec<u8>>,
}

/// Fixed-record file plus id index plus free-space bookkeeping
#[derive(Debug)]
pub struct RecordStore {
    /// Short name for log messages (`nodes`, `ways`, `relations`)
    name: &'static str,
    records: FixedRecordFile,
    /// Behind a mutex so read paths can repair entries
    index: Mutex<IdIndexFile>,
    used: UsedRecords,
    /// No free record exists below this index
    first_free_hint: u32,
    /// Extra records added on every growth
    spare_records: u32,
}

impl RecordStore {
    /// Opens the record file and its id index
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be opened.
    pub fn open(
        name: &'static str,
        data_path: &Path,
        index_path: &Path,
        record_len: usize,
        spare_records: u32,
    ) -> Result<Self> {
        let records = FixedRecordFile::open(data_path, record_len)?;
        let index = IdIndexFile::open(index_path)?;
        debug!("{name}: {} records, {} indexed ids", records.record_count(), index.len());

        Ok(Self {
            name,
            records,
            index: Mutex::new(index),
            used: UsedRecords::new(),
            first_free_hint: 0,
            spare_records,
        })
    }

    /// Physical records in the file, live or free
    pub fn record_count(&self) -> u32 {
        self.records.record_count()
    }

    /// Number of ids in the index
    pub fn indexed_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Index entry for `id`, without validation
    pub fn indexed_record(&self, id: i32) -> Option<u32> {
        self.index.lock().get(id)
    }

    /// Overwrites the index entry for `id` without touching the records
    ///
    /// # Errors
    ///
    /// Returns an error if the index file cannot be written.
    pub fn set_index_entry(&self, id: i32, record: u32) -> Result<()> {
        self.index.lock().put(id, record)
    }

    /// Reads the owner id of `record`
    ///
    /// # Errors
    ///
    /// Returns an error if `record` is beyond the end of the file.
    pub fn read_id(&self, record: u32) -> Result<i32> {
        Ok(BigEndian::read_i32(self.records.record(record)?))
    }

    /// Copies record `record`
    ///
    /// # Errors
    ///
    /// Returns an error if `record` is beyond the end of the file.
    pub fn read_record(&self, record: u32) -> Result<Vec<u8>> {
        self.records.read_record(record)
    }

    /// Counts the consecutive records from `first` that carry `id` and the
    /// version of `first`
    ///
    /// # Errors
    ///
    /// Returns an error if `first` is beyond the end of the file.
    pub fn used_record_count(&self, first: u32, id: i32) -> Result<u32> {
        let (owner, version) = read_header(self.records.record(first)?);
        if owner != id {
            return Ok(0);
        }

        let mut count = 1;
        while first + count < self.records.record_count() {
            let (next_owner, next_version) = read_header(self.records.record(first + count)?);
            if next_owner != id || next_version != version {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Looks up the first record of `id`'s run
    ///
    /// An index entry that does not point at the start of a run owned by
    /// `id` is logged and repaired through
    /// [`RecordStore::find_record_for_element_fallback`]. Ids missing from
    /// the index are reported as absent without a scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read.
    pub fn find_record_for_element(&self, id: i32) -> Result<Option<u32>> {
        let Some(record) = self.indexed_record(id) else {
            return Ok(None);
        };
        if self.is_run_start(record, id)? {
            return Ok(Some(record));
        }

        error!(
            "{}: index entry for id {} points at record {}, not a run start, scanning the file",
            self.name, id, record
        );
        self.find_record_for_element_fallback(id)
    }

    /// Finds `id` by scanning every record, then repairs the index
    ///
    /// O(file size); only used when the index is known to be wrong. When the
    /// scan meets more than one run of `id` (a relocation cut short by a
    /// crash), the run with the highest version wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or the index cannot be
    /// written.
    pub fn find_record_for_element_fallback(&self, id: i32) -> Result<Option<u32>> {
        let count = self.records.record_count();
        let mut newest: Option<(i32, u32)> = None;
        let mut record = 0;
        while record < count {
            let (owner, version) = self.header(record)?;
            if owner != id {
                record += 1;
                continue;
            }
            if let Some((kept_version, kept)) = newest {
                warn!(
                    "{}: id {} stored twice (version {} at {}, version {} at {})",
                    self.name, id, kept_version, kept, version, record
                );
            }
            if newest.is_none_or(|(kept_version, _)| version > kept_version) {
                newest = Some((version, record));
            }
            record += self.used_record_count(record, id)?.max(1);
        }

        let Some((_, start)) = newest else {
            warn!("{}: id {} is indexed but not stored, dropping the index entry", self.name, id);
            self.index.lock().remove(id)?;
            return Ok(None);
        };
        info!("{}: found id {} at record {} by scan, repairing the index", self.name, id, start);
        self.index.lock().put(id, start)?;
        Ok(Some(start))
    }

    /// Copies the run of `id`, if stored
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read.
    pub fn read_element(&self, id: i32) -> Result<Option<Run>> {
        let Some(start) = self.find_record_for_element(id)? else {
            return Ok(None);
        };
        self.read_run(start).map(Some)
    }

    /// Copies the run starting at `start`
    ///
    /// # Errors
    ///
    /// Returns an error if `start` is beyond the end of the file.
    pub fn read_run(&self, start: u32) -> Result<Run> {
        let id = self.read_id(start)?;
        let len = self.used_record_count(start, id)?;
        let records = (start..start + len)
            .map(|r| self.records.read_record(r))
            .collect::<Result<_>>()?;
        Ok(Run { start, records })
    }

    /// Iterates every live run in record order
    ///
    /// The iterator borrows the store, so the file cannot be modified while
    /// it is alive.
    pub fn runs(&self) -> Runs<'_> {
        Runs { store: self, next: 0, failed: false }
    }

    /// Returns the start of the first free run of at least `required` records
    ///
    /// Scans forward from the first possibly-free record, skipping records
    /// the bitmap knows to be occupied. If no run fits, the file grows by
    /// `required` plus the spare margin; a free tail shorter than `required`
    /// is extended rather than abandoned. Grown records are invalidated
    /// before the start is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or grown.
    pub fn find_free_records(&mut self, required: u32) -> Result<u32> {
        let required = required.max(1);
        let count = self.records.record_count();
        let mut candidate = self.first_free_hint;
        let mut first_free_seen = None;
        let mut tail_start = None;

        while candidate < count {
            if !self.is_free(candidate)? {
                candidate += 1;
                continue;
            }
            first_free_seen.get_or_insert(candidate);

            let mut len = 1;
            while len < required && candidate + len < count && self.is_free(candidate + len)? {
                len += 1;
            }
            if len >= required {
                self.first_free_hint = first_free_seen.unwrap_or(candidate);
                trace!("{}: reusing free run {}..{}", self.name, candidate, candidate + required);
                return Ok(candidate);
            }
            if candidate + len >= count {
                tail_start = Some(candidate);
                break;
            }
            // candidate + len is occupied
            candidate += len + 1;
        }

        let start = tail_start.unwrap_or(count);
        let grow_by = start + required - count + self.spare_records;
        self.records.grow(grow_by)?;
        for record in count..count + grow_by {
            self.write_free_sentinel(record)?;
        }
        self.first_free_hint = first_free_seen.unwrap_or(start);
        info!("{}: grew file by {} records to {}", self.name, grow_by, self.records.record_count());

        Ok(start)
    }

    /// Marks `record` free
    ///
    /// # Errors
    ///
    /// Returns an error if `record` is beyond the end of the file.
    pub fn invalidate_record(&mut self, record: u32) -> Result<()> {
        self.write_free_sentinel(record)?;
        self.used.remove(record);
        self.first_free_hint = self.first_free_hint.min(record);
        Ok(())
    }

    /// Marks `record` free after checking that it belongs to `expected`
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Inconsistent`] if the record is owned by a
    /// different live id; nothing is written in that case.
    pub fn invalidate_record_expecting(&mut self, record: u32, expected: i32) -> Result<()> {
        let found = self.read_id(record)?;
        if found != FREE_ID && found != expected {
            error!("{}: record {} belongs to id {}, not {}", self.name, record, found, expected);
            return Err(StorageError::Inconsistent { record, found, expected }.into());
        }
        self.invalidate_record(record)
    }

    /// Releases every record of `id`'s run and drops its index entry
    ///
    /// # Returns
    ///
    /// Returns the first record of the released run, or `None` if `id` was
    /// not stored
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written.
    pub fn remove_element(&mut self, id: i32) -> Result<Option<u32>> {
        let Some(start) = self.find_record_for_element(id)? else {
            return Ok(None);
        };
        let len = self.used_record_count(start, id)?;
        for record in start..start + len {
            self.invalidate_record_expecting(record, id)?;
        }
        self.index.get_mut().remove(id)?;
        trace!("{}: released id {} at {}..{}", self.name, id, start, start + len);
        Ok(Some(start))
    }

    /// Stores `records` as the run of `id`
    ///
    /// The run is rewritten in place when its length is unchanged and
    /// relocated otherwise; a relocated entity's old run is released after
    /// the new run is written and indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written, or if the
    /// record-in-use collision persists after repeated relocation.
    pub fn write_element(&mut self, id: i32, records: &[Vec<u8>]) -> Result<WriteOutcome> {
        let required = u32::try_from(records.len())?;
        let existing = match self.find_record_for_element(id)? {
            Some(start) => Some((start, self.used_record_count(start, id)?)),
            None => None,
        };

        let preferred = match existing {
            Some((start, len)) if len == required => start,
            _ => self.find_free_records(required)?,
        };
        let start = self.claim_run(preferred, id, records)?;
        self.index.get_mut().put(id, start)?;

        let mut previous = None;
        if let Some((old_start, old_len)) = existing.filter(|&(old_start, _)| old_start != start) {
            for record in old_start..old_start + old_len {
                self.invalidate_record_expecting(record, id)?;
            }
            previous = Some(old_start);
        }

        Ok(WriteOutcome { start, previous })
    }

    /// Clears the id index and rebuilds it from a full scan
    ///
    /// An id found in more than one run keeps the run with the highest
    /// version (the later run on a tie); the other runs are released.
    /// `visit` then sees every surviving run (id, start, first record) in
    /// record order so callers can rebuild secondary indices in the same
    /// pass.
    ///
    /// # Returns
    ///
    /// Returns the number of indexed runs
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written.
    pub fn rebuild_index<F>(&mut self, mut visit: F) -> Result<u32>
    where
        F: FnMut(i32, u32, &[u8]) -> Result<()>,
    {
        self.used.clear();
        self.first_free_hint = 0;

        // id -> (start, len, version) of the run that survives
        let mut newest: HashMap<i32, (u32, u32, i32)> = HashMap::new();
        let mut stale = Vec::new();
        let count = self.records.record_count();
        let mut record = 0;
        while record < count {
            let (id, version) = self.header(record)?;
            if id == FREE_ID {
                record += 1;
                continue;
            }
            let len = self.used_record_count(record, id)?.max(1);
            match newest.entry(id) {
                Entry::Vacant(entry) => {
                    entry.insert((record, len, version));
                }
                Entry::Occupied(mut entry) => {
                    let kept = *entry.get();
                    if version >= kept.2 {
                        stale.push((id, kept));
                        entry.insert((record, len, version));
                    } else {
                        stale.push((id, (record, len, version)));
                    }
                }
            }
            record += len;
        }

        for (id, (start, len, version)) in stale {
            warn!(
                "{}: id {} stored twice, releasing version {} at records {}..{}",
                self.name,
                id,
                version,
                start,
                start + len
            );
            for record in start..start + len {
                self.invalidate_record_expecting(record, id)?;
            }
        }

        let mut starts: Vec<(u32, i32)> =
            newest.iter().map(|(&id, &(start, _, _))| (start, id)).collect();
        starts.sort_unstable();

        let index = self.index.get_mut();
        index.clear()?;
        for &(start, id) in &starts {
            index.put(id, start)?;
        }
        index.flush()?;

        for &(start, id) in &starts {
            visit(id, start, self.records.record(start)?)?;
        }

        let runs = u32::try_from(starts.len())?;
        info!("{}: rebuilt index with {} entries from {} records", self.name, runs, count);
        Ok(runs)
    }

    /// Flushes records and index to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.records.flush()?;
        self.index.get_mut().flush()
    }

    /// Writes `records` at `preferred`, relocating on a record-in-use collision
    fn claim_run(&mut self, preferred: u32, id: i32, records: &[Vec<u8>]) -> Result<u32> {
        let required = u32::try_from(records.len())?;
        let mut start = preferred;
        let mut attempt = 0;

        loop {
            let err = match self.write_run(start, id, records) {
                Ok(()) => return Ok(start),
                Err(err) => err,
            };
            let collision = match err.downcast_ref::<StorageError>() {
                Some(&StorageError::RecordInUse { record, owner, writer }) => {
                    Some((record, owner, writer))
                }
                _ => None,
            };
            let Some((record, owner, writer)) = collision else {
                return Err(err);
            };

            error!(
                "{}: record {} still belongs to id {} while writing id {} (attempt {}), relocating",
                self.name, record, owner, writer, attempt
            );
            self.used.insert(record);
            if attempt == MAX_RELOCATIONS {
                return Err(err);
            }
            attempt += 1;
            start = self.find_free_records(required)?;
        }
    }

    /// Checks every target record, then writes the run
    fn write_run(&mut self, start: u32, id: i32, records: &[Vec<u8>]) -> Result<()> {
        let end = start + u32::try_from(records.len())?;
        for record in start..end {
            let owner = self.read_id(record)?;
            if owner != FREE_ID && owner != id {
                return Err(StorageError::RecordInUse { record, owner, writer: id }.into());
            }
        }
        for (record, buf) in (start..end).zip(records) {
            self.records.write_record(buf, record)?;
            self.used.insert(record);
        }
        Ok(())
    }

    fn is_free(&mut self, record: u32) -> Result<bool> {
        if self.used.contains(record) {
            return Ok(false);
        }
        if self.read_id(record)? == FREE_ID {
            return Ok(true);
        }
        self.used.insert(record);
        Ok(false)
    }

    /// True if `record` opens a run of `id`
    ///
    /// A run of the same id right before it only continues this run if it
    /// carries the same version.
    fn is_run_start(&self, record: u32, id: i32) -> Result<bool> {
        if record >= self.records.record_count() {
            return Ok(false);
        }
        let (owner, version) = self.header(record)?;
        if owner != id {
            return Ok(false);
        }
        Ok(record == 0 || self.header(record - 1)? != (id, version))
    }

    fn header(&self, record: u32) -> Result<(i32, i32)> {
        Ok(read_header(self.records.record(record)?))
    }

    fn write_free_sentinel(&mut self, record: u32) -> Result<()> {
        BigEndian::write_i32(self.records.record_mut(record)?, FREE_ID);
        Ok(())
    }
}

/// Forward-only iterator over live runs, see [`RecordStore::runs`]
#[derive(Debug)]
pub struct Runs<'a> {
    store: &'a RecordStore,
    next: u32,
    failed: bool,
}

impl Iterator for Runs<'_> {
    type Item = Result<Run>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.next < self.store.record_count() {
            let record = self.next;
            let id = match self.store.read_id(record) {
                Ok(FREE_ID) => {
                    self.next += 1;
                    continue;
                }
                Ok(id) => id,
                Err(err) => return Some(self.fail(err)),
            };
            let run = match self.store.read_run(record) {
                Ok(run) => run,
                Err(err) => return Some(self.fail(err)),
            };
            self.next = record + u32::try_from(run.records.len()).unwrap_or(1).max(1);

            // a second copy of an id is left over from an interrupted
            // relocation; only the indexed run is live
            match self.store.find_record_for_element(id) {
                Ok(Some(start)) if start == record => return Some(Ok(run)),
                Ok(_) => debug!(
                    "{}: skipping unindexed run of id {} at {}",
                    self.store.name, id, record
                ),
                Err(err) => return Some(self.fail(err)),
            }
        }
        None
    }
}

impl Runs<'_> {
    fn fail(&mut self, err: anyhow::Error) -> Result<Run> {
        self.failed = true;
        Err(err)
    }
}
