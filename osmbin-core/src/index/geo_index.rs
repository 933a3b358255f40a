//! R-tree of node positions keyed by record number, persisted as a flat
//! slot file.

use crate::storage::FixedRecordFile;
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use log::info;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use std::collections::HashMap;
use std::path::Path;

/// Bytes per entry: `record:i32, lat:i32, lon:i32`
const ENTRY_LEN: usize = 12;

/// Free-slot marker in the record column
const FREE_SLOT: i32 = i32::MIN;

/// Slots added whenever the file runs out of free entries
const GROWTH_SLOTS: u32 = 1024;

/// Fixed-point `[lat, lon]` point tagged with a node record number
type GeoPoint = GeomWithData<[i32; 2], u32>;

/// Persistent spatial multi-map from fixed-point coordinates to node records.
///
/// Several records may share a coordinate. Queries are answered from an
/// in-memory R-tree; the file keeps one 12-byte entry per indexed record.
#[derive(Debug)]
pub struct GeoIndexFile {
    file: FixedRecordFile,
    tree: RTree<GeoPoint>,
    /// record -> (slot, point)
    slots: HashMap<u32, (u32, [i32; 2])>,
    free_slots: Vec<u32>,
}

impl GeoIndexFile {
    /// Opens or creates a geo index and loads it into memory
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = FixedRecordFile::open(path, ENTRY_LEN)?;
        let mut slots = HashMap::new();
        let mut free_slots = Vec::new();
        let mut points = Vec::new();

        for slot in 0..file.record_count() {
            let raw = file.record(slot)?;
            let record = BigEndian::read_i32(raw);
            if record == FREE_SLOT {
                free_slots.push(slot);
                continue;
            }
            let point = [BigEndian::read_i32(&raw[4..]), BigEndian::read_i32(&raw[8..])];
            #[allow(clippy::cast_sign_loss)]
            let record = record as u32;
            if slots.insert(record, (slot, point)).is_none() {
                points.push(GeoPoint::new(point, record));
            }
        }
        free_slots.sort_unstable_by(|a, b| b.cmp(a));

        // Later duplicates win in `slots`; rebuild the tree from it
        let tree = if points.len() == slots.len() {
            RTree::bulk_load(points)
        } else {
            let points =
                slots.iter().map(|(&record, &(_, point))| GeoPoint::new(point, record)).collect();
            RTree::bulk_load(points)
        };

        Ok(Self { file, tree, slots, free_slots })
    }

    /// Indexes (or moves) `record` at the given fixed-point position
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be grown or written.
    pub fn put(&mut self, record: u32, lat: i32, lon: i32) -> Result<()> {
        let point = [lat, lon];
        let slot = match self.slots.get(&record).copied() {
            Some((_, old)) if old == point => return Ok(()),
            Some((slot, old)) => {
                self.tree.remove(&GeoPoint::new(old, record));
                slot
            }
            None => match self.free_slots.pop() {
                Some(slot) => slot,
                None => self.grow()?,
            },
        };

        self.write_slot(slot, record_column(record), point)?;
        self.slots.insert(record, (slot, point));
        self.tree.insert(GeoPoint::new(point, record));
        Ok(())
    }

    /// Removes `record` from the index
    ///
    /// # Returns
    ///
    /// Returns `true` if the record was indexed
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn remove(&mut self, record: u32) -> Result<bool> {
        let Some((slot, point)) = self.slots.remove(&record) else {
            return Ok(false);
        };
        self.tree.remove(&GeoPoint::new(point, record));
        self.write_slot(slot, FREE_SLOT, [0, 0])?;
        self.free_slots.push(slot);
        Ok(true)
    }

    /// Returns the records whose point lies inside the rectangle, edges included
    pub fn query(&self, min_lat: i32, max_lat: i32, min_lon: i32, max_lon: i32) -> Vec<u32> {
        let envelope = AABB::from_corners([min_lat, min_lon], [max_lat, max_lon]);
        self.tree.locate_in_envelope(&envelope).map(|point| point.data).collect()
    }

    /// Number of indexed records
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every entry and truncates the file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be truncated.
    pub fn clear(&mut self) -> Result<()> {
        self.file.truncate(0)?;
        self.tree = RTree::new();
        self.slots.clear();
        self.free_slots.clear();
        info!("{}: cleared", self.file.path().display());
        Ok(())
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
            self.write_slot(slot, FREE_SLOT, [0, 0])?;
        }
        self.free_slots.extend((first + 1..first + GROWTH_SLOTS).rev());
        Ok(first)
    }

    fn write_slot(&mut self, slot: u32, record: i32, point: [i32; 2]) -> Result<()> {
        let raw = self.file.record_mut(slot)?;
        BigEndian::write_i32(&mut raw[..4], record);
        BigEndian::write_i32(&mut raw[4..8], point[0]);
        BigEndian::write_i32(&mut raw[8..], point[1]);
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn record_column(record: u32) -> i32 {
    record as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_query_inclusive_edges() {
        let dir = TempDir::new().unwrap();
        let mut geo = GeoIndexFile::open(dir.path().join("n.id2")).unwrap();
        geo.put(1, 100, 100).unwrap();
        geo.put(2, 200, 200).unwrap();
        geo.put(3, 201, 150).unwrap();

        let mut hits = geo.query(100, 200, 100, 200);
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn test_shared_coordinate_and_move() {
        let dir = TempDir::new().unwrap();
        let mut geo = GeoIndexFile::open(dir.path().join("n.id2")).unwrap();
        geo.put(1, 0, 0).unwrap();
        geo.put(2, 0, 0).unwrap();
        assert_eq!(geo.query(0, 0, 0, 0).len(), 2);

        geo.put(2, 50, 50).unwrap();
        assert_eq!(geo.query(0, 0, 0, 0), vec![1]);
        assert_eq!(geo.query(50, 50, 50, 50), vec![2]);
        assert_eq!(geo.len(), 2);
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n.id2");
        {
            let mut geo = GeoIndexFile::open(&path).unwrap();
            geo.put(10, -5, 7).unwrap();
            geo.put(11, 9, 9).unwrap();
            geo.remove(11).unwrap();
            geo.flush().unwrap();
        }
        let geo = GeoIndexFile::open(&path).unwrap();
        assert_eq!(geo.len(), 1);
        assert_eq!(geo.query(-10, 10, -10, 10), vec![10]);
    }
}
