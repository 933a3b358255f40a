//! Way records with their node list, cached bounding box and relation
//! back-references.

use crate::attr_names::AttrNames;
use crate::entity::layout::{RecordLayout, RefGroup};
use crate::entity::narrow_ids;
use crate::entity::store::{RecordStore, Run};
use crate::entity::tags::{join_tag_slots, prepare_tag_list};
use crate::error::narrow_id;
use crate::model::{Bounds, Way, from_fixed, to_fixed};
use anyhow::{Context, Result};
use log::trace;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Reference groups of a way record: node ids, then relation ids
const WAY_REF_GROUPS: &[RefGroup] =
    &[RefGroup { per_record: 12, words: 1 }, RefGroup { per_record: 2, words: 1 }];

/// Way record: `id, version, minLat, maxLat, minLon, maxLon`, 4 tag slots
/// of 16 chars, 12 node references, 2 relation back-references (216 bytes)
pub const WAY_LAYOUT: RecordLayout =
    RecordLayout {
        header_words: 4,
        tags_per_record: 4,
        chars_per_tag: 16,
        ref_groups: WAY_REF_GROUPS,
    };

/// Bounding box words of a way none of whose nodes is stored
const NO_BBOX: [i32; 4] = [i32::MIN; 4];

/// A way with its cached bounding box and the relations that reference it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWay {
    /// The way itself
    pub way: Way,
    /// Box around the way's stored nodes, `None` if none is stored
    pub bbox: Option<Bounds>,
    /// Relations with this way as a member
    pub relation_ids: BTreeSet<i64>,
}

impl StoredWay {
    /// A way without bounding box or back-references
    #[must_use]
    pub fn new(way: Way) -> Self {
        Self { way, bbox: None, relation_ids: BTreeSet::new() }
    }
}

/// `ways.obm` with its id index (`ways.idx`)
#[derive(Debug)]
pub struct WaysFile {
    store: RecordStore,
    attrs: Arc<AttrNames>,
}

impl WaysFile {
    /// Opens or creates the way files in `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if any of the files cannot be opened.
    pub fn open(dir: &Path, attrs: Arc<AttrNames>, spare_records: u32) -> Result<Self> {
        let store = RecordStore::open(
            "ways",
            &dir.join("ways.obm"),
            &dir.join("ways.idx"),
            WAY_LAYOUT.record_len(),
            spare_records,
        )?;
        Ok(Self { store, attrs })
    }

    /// Writes (or rewrites) a way
    ///
    /// # Errors
    ///
    /// Returns an error if an id does not fit 32 bits or the files cannot be
    /// written.
    pub fn write_way(&mut self, stored: &StoredWay) -> Result<u32> {
        let way = &stored.way;
        let id = narrow_id(way.id)?;
        let nodes = narrow_ids(way.node_ids.iter().copied())?;
        let relations = narrow_ids(stored.relation_ids.iter().copied())?;
        let tags = prepare_tag_list(&way.tags, &self.attrs, WAY_LAYOUT.chars_per_tag)?;
        let bbox = stored.bbox.map_or(NO_BBOX, |b| {
            [to_fixed(b.min_lat), to_fixed(b.max_lat), to_fixed(b.min_lon), to_fixed(b.max_lon)]
        });

        let records = WAY_LAYOUT.encode(id, way.version, &bbox, &tags, &[nodes, relations]);
        let outcome = self.store.write_element(id, &records)?;
        trace!("ways: wrote id {} at {} ({} records)", id, outcome.start, records.len());
        Ok(outcome.start)
    }

    /// Applies `update` to the relation back-references of way `id` and
    /// rewrites the way if they changed
    ///
    /// # Returns
    ///
    /// Returns `false` if the way is not stored
    ///
    /// # Errors
    ///
    /// Returns an error if the way cannot be read or rewritten.
    pub fn update_back_refs<F>(&mut self, id: i64, update: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeSet<i64>),
    {
        let Some(mut stored) = self.read_way(id)? else {
            return Ok(false);
        };
        let before = stored.relation_ids.clone();
        update(&mut stored.relation_ids);
        if stored.relation_ids != before {
            self.write_way(&stored)?;
        }
        Ok(true)
    }

    /// Reads a way by id
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn read_way(&self, id: i64) -> Result<Option<StoredWay>> {
        let Some(run) = self.store.read_element(narrow_id(id)?)? else {
            return Ok(None);
        };
        self.decode(&run).map(Some)
    }

    /// Removes a way
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be written.
    pub fn remove_way(&mut self, id: i64) -> Result<Option<StoredWay>> {
        let Some(stored) = self.read_way(id)? else {
            return Ok(None);
        };
        self.store.remove_element(narrow_id(id)?)?;
        Ok(Some(stored))
    }

    /// Returns the first record of way `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn find_record_for_way(&self, id: i64) -> Result<Option<u32>> {
        self.store.find_record_for_element(narrow_id(id)?)
    }

    /// True if way `id` is stored
    ///
    /// # Errors
    ///
    /// See [`WaysFile::find_record_for_way`].
    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.find_record_for_way(id)?.is_some())
    }

    /// Iterates every stored way in record order
    pub fn ways(&self) -> impl Iterator<Item = Result<StoredWay>> + '_ {
        self.store.runs().map(|run| run.and_then(|run| self.decode(&run)))
    }

    /// Rebuilds `ways.idx` from a full scan of `ways.obm`
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written.
    pub fn rebuild_index(&mut self) -> Result<u32> {
        self.store.rebuild_index(|_, _, _| Ok(()))
    }

    /// The underlying run store
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Flushes records and index to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    fn decode(&self, run: &Run) -> Result<StoredWay> {
        let decoded = WAY_LAYOUT.decode(&run.records).context("Empty way run")?;
        let id = i64::from(decoded.id);
        let bbox = match decoded.header.as_slice() {
            &[min_lat, max_lat, min_lon, max_lon]
                if [min_lat, max_lat, min_lon, max_lon] != NO_BBOX =>
            {
                Some(Bounds {
                    min_lat: from_fixed(min_lat),
                    max_lat: from_fixed(max_lat),
                    min_lon: from_fixed(min_lon),
                    max_lon: from_fixed(max_lon),
                })
            }
            _ => None,
        };
        let mut refs = decoded.refs.into_iter();
        let node_ids = refs.next().unwrap_or_default().into_iter().map(i64::from).collect();
        let relation_ids = refs.next().unwrap_or_default().into_iter().map(i64::from).collect();

        Ok(StoredWay {
            way: Way {
                id,
                version: decoded.version,
                tags: join_tag_slots(id, decoded.tags, &self.attrs),
                node_ids,
            },
            bbox,
            relation_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> WaysFile {
        let attrs = Arc::new(AttrNames::open(dir.path().join("attrnames.txt")).unwrap());
        WaysFile::open(dir.path(), attrs, 4).unwrap()
    }

    #[test]
    fn test_record_len() {
        assert_eq!(WAY_LAYOUT.record_len(), 216);
    }

    #[test]
    fn test_node_order_survives_multi_record_runs() {
        let dir = TempDir::new().unwrap();
        let mut ways = open(&dir);

        // 30 nodes need three records; the order must come back unchanged
        let node_ids: Vec<i64> = (0..30).rev().map(|n| 1000 + n).collect();
        let way = Way::new(55, 1, node_ids).with_tag("highway", "residential");
        let mut stored = StoredWay::new(way);
        stored.bbox = Some(Bounds::new(52.5, 13.4, 52.51, 13.41));
        stored.relation_ids.insert(7);

        let start = ways.write_way(&stored).unwrap();
        assert_eq!(ways.store().used_record_count(start, 55).unwrap(), 3);
        assert_eq!(ways.read_way(55).unwrap(), Some(stored));
    }

    #[test]
    fn test_missing_bbox_round_trips_as_none() {
        let dir = TempDir::new().unwrap();
        let mut ways = open(&dir);
        let stored = StoredWay::new(Way::new(1, 1, vec![5, 6]));
        ways.write_way(&stored).unwrap();
        assert_eq!(ways.read_way(1).unwrap().unwrap().bbox, None);
    }

    #[test]
    fn test_remove_then_reuse() {
        let dir = TempDir::new().unwrap();
        let mut ways = open(&dir);
        let first = ways.write_way(&StoredWay::new(Way::new(1, 1, vec![1]))).unwrap();
        assert!(ways.remove_way(1).unwrap().is_some());
        assert!(!ways.contains(1).unwrap());

        let second = ways.write_way(&StoredWay::new(Way::new(2, 1, vec![2]))).unwrap();
        assert_eq!(first, second);
    }
}
