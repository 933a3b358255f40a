//! Node records: fixed-point position, tags, and way and relation
//! back-references.

use crate::attr_names::AttrNames;
use crate::entity::layout::{FREE_ID, RecordLayout, RefGroup, header_word};
use crate::entity::narrow_ids;
use crate::entity::store::{RecordStore, Run};
use crate::entity::tags::{join_tag_slots, prepare_tag_list};
use crate::error::narrow_id;
use crate::index::GeoIndexFile;
use crate::model::{Bounds, Node, from_fixed, to_fixed};
use anyhow::{Context, Result};
use log::trace;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Reference groups of a node record: way ids, then relation ids
const NODE_REF_GROUPS: &[RefGroup] =
    &[RefGroup { per_record: 2, words: 1 }, RefGroup { per_record: 2, words: 1 }];

/// Node record: `id, version, lat, lon`, 4 tag slots of 16 chars,
/// 2 way back-references, 2 relation back-references (168 bytes)
pub const NODE_LAYOUT: RecordLayout =
    RecordLayout {
        header_words: 2,
        tags_per_record: 4,
        chars_per_tag: 16,
        ref_groups: NODE_REF_GROUPS,
    };

/// A node together with the ways and relations that reference it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    /// The node itself
    pub node: Node,
    /// Ways listing this node
    pub way_ids: BTreeSet<i64>,
    /// Relations with this node as a member
    pub relation_ids: BTreeSet<i64>,
}

impl StoredNode {
    /// A node without back-references
    #[must_use]
    pub fn new(node: Node) -> Self {
        Self { node, way_ids: BTreeSet::new(), relation_ids: BTreeSet::new() }
    }
}

/// `nodes.obm` with its id index (`nodes.idx`) and geo index (`nodes.id2`)
#[derive(Debug)]
pub struct NodesFile {
    store: RecordStore,
    geo: GeoIndexFile,
    attrs: Arc<AttrNames>,
}

impl NodesFile {
    /// Opens or creates the node files in `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if any of the files cannot be opened.
    pub fn open(dir: &Path, attrs: Arc<AttrNames>, spare_records: u32) -> Result<Self> {
        let store = RecordStore::open(
            "nodes",
            &dir.join("nodes.obm"),
            &dir.join("nodes.idx"),
            NODE_LAYOUT.record_len(),
            spare_records,
        )?;
        let geo = GeoIndexFile::open(dir.join("nodes.id2"))?;
        Ok(Self { store, geo, attrs })
    }

    /// Writes (or rewrites) a node and its back-references
    ///
    /// # Returns
    ///
    /// Returns the first record of the node's run
    ///
    /// # Errors
    ///
    /// Returns an error if an id does not fit 32 bits or the files cannot be
    /// written.
    pub fn write_node(&mut self, stored: &StoredNode) -> Result<u32> {
        let node = &stored.node;
        let id = narrow_id(node.id)?;
        let ways = narrow_ids(stored.way_ids.iter().copied())?;
        let relations = narrow_ids(stored.relation_ids.iter().copied())?;
        let tags = prepare_tag_list(&node.tags, &self.attrs, NODE_LAYOUT.chars_per_tag)?;
        let (lat, lon) = (to_fixed(node.lat), to_fixed(node.lon));

        let records = NODE_LAYOUT.encode(id, node.version, &[lat, lon], &tags, &[ways, relations]);
        let outcome = self.store.write_element(id, &records)?;
        if let Some(previous) = outcome.previous {
            self.geo.remove(previous)?;
        }
        self.geo.put(outcome.start, lat, lon)?;

        trace!("nodes: wrote id {} at {} ({} records)", id, outcome.start, records.len());
        Ok(outcome.start)
    }

    /// Applies `update` to the way and relation back-references of node `id`
    /// and rewrites the node if they changed
    ///
    /// # Returns
    ///
    /// Returns `false` if the node is not stored
    ///
    /// # Errors
    ///
    /// Returns an error if the node cannot be read or rewritten.
    pub fn update_back_refs<F>(&mut self, id: i64, update: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeSet<i64>, &mut BTreeSet<i64>),
    {
        let Some(mut stored) = self.read_node(id)? else {
            return Ok(false);
        };
        let (ways, relations) = (stored.way_ids.clone(), stored.relation_ids.clone());
        update(&mut stored.way_ids, &mut stored.relation_ids);
        if stored.way_ids != ways || stored.relation_ids != relations {
            self.write_node(&stored)?;
        }
        Ok(true)
    }

    /// Reads a node by id
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn read_node(&self, id: i64) -> Result<Option<StoredNode>> {
        let Some(run) = self.store.read_element(narrow_id(id)?)? else {
            return Ok(None);
        };
        self.decode(&run).map(Some)
    }

    /// Reads the node whose run starts at `record`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_node_at(&self, record: u32) -> Result<Option<StoredNode>> {
        if record >= self.store.record_count() || self.store.read_id(record)? == FREE_ID {
            return Ok(None);
        }
        let run = self.store.read_run(record)?;
        self.decode(&run).map(Some)
    }

    /// Removes a node and its geo index entry
    ///
    /// # Returns
    ///
    /// Returns the removed node with its back-references
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be written.
    pub fn remove_node(&mut self, id: i64) -> Result<Option<StoredNode>> {
        let Some(stored) = self.read_node(id)? else {
            return Ok(None);
        };
        if let Some(start) = self.store.remove_element(narrow_id(id)?)? {
            self.geo.remove(start)?;
        }
        Ok(Some(stored))
    }

    /// Returns the first record of node `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn find_record_for_node(&self, id: i64) -> Result<Option<u32>> {
        self.store.find_record_for_element(narrow_id(id)?)
    }

    /// True if node `id` is stored
    ///
    /// # Errors
    ///
    /// See [`NodesFile::find_record_for_node`].
    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.find_record_for_node(id)?.is_some())
    }

    /// Iterates every stored node in record order
    pub fn nodes(&self) -> impl Iterator<Item = Result<StoredNode>> + '_ {
        self.store.runs().map(|run| run.and_then(|run| self.decode(&run)))
    }

    /// Returns the nodes inside `bounds` (edges included), ordered by id
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn nodes_in(&self, bounds: &Bounds) -> Result<Vec<StoredNode>> {
        let records = self.geo.query(
            to_fixed(bounds.min_lat),
            to_fixed(bounds.max_lat),
            to_fixed(bounds.min_lon),
            to_fixed(bounds.max_lon),
        );

        let mut found = Vec::with_capacity(records.len());
        for record in records {
            if let Some(stored) = self.read_node_at(record)? {
                if bounds.contains(stored.node.lat, stored.node.lon) {
                    found.push(stored);
                }
            }
        }
        found.sort_by_key(|stored| stored.node.id);
        Ok(found)
    }

    /// Rebuilds `nodes.idx` and `nodes.id2` from a full scan of `nodes.obm`
    ///
    /// # Returns
    ///
    /// Returns the number of nodes found
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written.
    pub fn rebuild_indices(&mut self) -> Result<u32> {
        self.geo.clear()?;
        let geo = &mut self.geo;
        let count = self
            .store
            .rebuild_index(|_, start, first| {
                geo.put(start, header_word(first, 0), header_word(first, 1))
            })?;
        self.geo.flush()?;
        Ok(count)
    }

    /// Number of records in the geo index
    pub fn geo_len(&self) -> usize {
        self.geo.len()
    }

    /// The underlying run store
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Flushes records and indices to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()?;
        self.geo.flush()
    }

    fn decode(&self, run: &Run) -> Result<StoredNode> {
        let decoded = NODE_LAYOUT.decode(&run.records).context("Empty node run")?;
        let id = i64::from(decoded.id);
        let coord = |w: usize| decoded.header.get(w).copied().map_or(0.0, from_fixed);
        let (lat, lon) = (coord(0), coord(1));
        let mut refs = decoded
            .refs
            .into_iter()
            .map(|ids| ids.into_iter().map(i64::from).collect::<BTreeSet<_>>());
        let way_ids = refs.next().unwrap_or_default();
        let relation_ids = refs.next().unwrap_or_default();

        Ok(StoredNode {
            node: Node {
                id,
                version: decoded.version,
                lat,
                lon,
                tags: join_tag_slots(id, decoded.tags, &self.attrs),
            },
            way_ids,
            relation_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LatLon;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> NodesFile {
        let attrs = Arc::new(AttrNames::open(dir.path().join("attrnames.txt")).unwrap());
        NodesFile::open(dir.path(), attrs, 8).unwrap()
    }

    #[test]
    fn test_record_len() {
        assert_eq!(NODE_LAYOUT.record_len(), 168);
    }

    #[test]
    fn test_round_trip_with_back_refs_across_records() {
        let dir = TempDir::new().unwrap();
        let mut nodes = open(&dir);

        let node = Node::new(1001, 3, 52.5, 13.4).with_tag("name", "Alexanderplatz");
        let mut stored = StoredNode::new(node);
        stored.way_ids.extend([55, 56, 57, 58, 59]);
        stored.relation_ids.insert(9);

        let start = nodes.write_node(&stored).unwrap();
        assert_eq!(nodes.store().used_record_count(start, 1001).unwrap(), 3);
        assert_eq!(nodes.read_node(1001).unwrap(), Some(stored));
    }

    #[test]
    fn test_geo_index_follows_relocation() {
        let dir = TempDir::new().unwrap();
        let mut nodes = open(&dir);
        nodes.write_node(&StoredNode::new(Node::new(1, 1, 1.0, 1.0))).unwrap();
        nodes.write_node(&StoredNode::new(Node::new(2, 1, 1.0, 1.0))).unwrap();

        let mut bigger = StoredNode::new(Node::new(1, 2, 1.0, 1.0));
        bigger.way_ids.extend([1, 2, 3]);
        nodes.write_node(&bigger).unwrap();

        assert_eq!(nodes.geo_len(), 2);
        let window = Bounds::around(LatLon::new(1.0, 1.0), 0.1);
        let ids: Vec<i64> =
            nodes.nodes_in(&window).unwrap().into_iter().map(|s| s.node.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_update_back_refs_rewrites_only_on_change() {
        let dir = TempDir::new().unwrap();
        let mut nodes = open(&dir);
        let start = nodes.write_node(&StoredNode::new(Node::new(7, 1, 0.0, 0.0))).unwrap();

        assert!(nodes.update_back_refs(7, |ways, _| {
            ways.insert(1);
        })
        .unwrap());
        assert!(!nodes.update_back_refs(8, |ways, _| {
            ways.insert(1);
        })
        .unwrap());

        let stored = nodes.read_node(7).unwrap().unwrap();
        assert_eq!(stored.way_ids, BTreeSet::from([1]));
        assert_eq!(nodes.find_record_for_node(7).unwrap(), Some(start));
    }

    #[test]
    fn test_remove_drops_geo_entry() {
        let dir = TempDir::new().unwrap();
        let mut nodes = open(&dir);
        nodes.write_node(&StoredNode::new(Node::new(1, 1, 10.0, 10.0))).unwrap();
        assert!(nodes.remove_node(1).unwrap().is_some());
        assert!(nodes.remove_node(1).unwrap().is_none());
        assert_eq!(nodes.geo_len(), 0);
        assert!(!nodes.contains(1).unwrap());
    }
}
