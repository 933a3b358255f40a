use crate::attr_names::AttrNames;
use crate::dataset::{DataSet, closest, window_for_distance};
use crate::entity::{NodesFile, RelationsFile, StoredNode, StoredWay, WaysFile};
use crate::error::narrow_id;
use crate::format::{self, FormatVersion};
use crate::model::{Bounds, EntityType, LatLon, Node, Relation, Way, to_fixed};
use crate::{ATTR_NAMES_FILE, DataSetOptions};
use anyhow::{Context, Result};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Smallest window the nearest-node search starts from (one fixed-point step)
const MIN_SEARCH_RADIUS: f64 = 1e-7;

/// Dataset stored as format 1.0 record files in one directory
///
/// Files: `nodes.obm`/`.idx`/`.id2`, `ways.obm`/`.idx`,
/// `relations.obm`/`.idx`, `attrnames.txt` and `osmbin.properties`.
///
/// # Locking
///
/// Each entity file sits behind its own `RwLock`. Operations that touch
/// several files always lock them in the order nodes, ways, relations.
#[derive(Debug)]
pub struct OsmBinDataSetV10 {
    dir: PathBuf,
    options: DataSetOptions,
    attrs: Arc<AttrNames>,
    nodes: RwLock<NodesFile>,
    ways: RwLock<WaysFile>,
    relations: RwLock<RelationsFile>,
}

impl OsmBinDataSetV10 {
    /// Opens or creates a dataset directory
    ///
    /// # Arguments
    ///
    /// * `dir` - Dataset directory, created if missing
    /// * `options` - Growth margins and search parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory or a file cannot be created or opened
    /// - Another process holds one of the files
    /// - `osmbin.properties` names a different format version
    pub fn open<P: AsRef<Path>>(dir: P, options: DataSetOptions) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create dataset directory: {}", dir.display()))?;
        format::ensure_version(dir, FormatVersion::V10)?;

        let attrs = Arc::new(AttrNames::open(dir.join(ATTR_NAMES_FILE))?);
        let nodes = NodesFile::open(dir, Arc::clone(&attrs), options.node_spare_records)?;
        let ways = WaysFile::open(dir, Arc::clone(&attrs), options.way_spare_records)?;
        let relations =
            RelationsFile::open(dir, Arc::clone(&attrs), options.relation_spare_records)?;

        info!(
            "Opened osmbin dataset {} ({} nodes, {} ways, {} relations indexed)",
            dir.display(),
            nodes.store().indexed_count(),
            ways.store().indexed_count(),
            relations.store().indexed_count()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            attrs,
            nodes: RwLock::new(nodes),
            ways: RwLock::new(ways),
            relations: RwLock::new(relations),
        })
    }

    /// The dataset directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Node by id, together with its way and relation back-references
    ///
    /// # Errors
    ///
    /// Returns an error if the node file cannot be read.
    pub fn get_stored_node(&self, id: i64) -> Result<Option<StoredNode>> {
        self.nodes.read().read_node(id)
    }

    /// Way by id, together with its bounding box and relation back-references
    ///
    /// # Errors
    ///
    /// Returns an error if the way file cannot be read.
    pub fn get_stored_way(&self, id: i64) -> Result<Option<StoredWay>> {
        self.ways.read().read_way(id)
    }

    /// Direct access to the node file
    #[cfg(feature = "internals")]
    pub fn nodes_file(&self) -> &RwLock<NodesFile> {
        &self.nodes
    }

    /// Direct access to the way file
    #[cfg(feature = "internals")]
    pub fn ways_file(&self) -> &RwLock<WaysFile> {
        &self.ways
    }

    fn read_ways(ways: &WaysFile, ids: impl IntoIterator<Item = i64>) -> Result<Vec<Way>> {
        let mut found = Vec::new();
        for id in ids {
            match ways.read_way(id)? {
                Some(stored) => found.push(stored.way),
                None => debug!("way {id} is referenced but not stored"),
            }
        }
        Ok(found)
    }

    fn read_relations(
        relations: &RelationsFile,
        ids: impl IntoIterator<Item = i64>,
    ) -> Result<Vec<Relation>> {
        let mut found = Vec::new();
        for id in ids {
            match relations.read_relation(id)? {
                Some(relation) => found.push(relation),
                None => debug!("relation {id} is referenced but not stored"),
            }
        }
        Ok(found)
    }
}

/// Box around the stored nodes among `node_ids`
fn way_bbox(nodes: &NodesFile, way_id: i64, node_ids: &[i64]) -> Result<Option<Bounds>> {
    let mut bbox: Option<Bounds> = None;
    for &node_id in node_ids {
        match nodes.read_node(node_id)? {
            Some(stored) => extend_bbox(&mut bbox, &stored.node),
            None => debug!("way {way_id}: node {node_id} is not stored, leaving it out of the box"),
        }
    }
    Ok(bbox)
}

fn extend_bbox(bbox: &mut Option<Bounds>, node: &Node) {
    match bbox {
        Some(bounds) => bounds.extend(node.lat, node.lon),
        None => *bbox = Some(Bounds::point(node.position())),
    }
}

/// Recomputes and re-persists the bounding box of way `way_id`
fn refresh_way(nodes: &NodesFile, ways: &mut WaysFile, way_id: i64) -> Result<()> {
    let Some(mut stored) = ways.read_way(way_id)? else {
        debug!("way {way_id} is referenced by a node but not stored");
        return Ok(());
    };
    let bbox = way_bbox(nodes, way_id, &stored.way.node_ids)?;
    if bbox != stored.bbox {
        stored.bbox = bbox;
        ways.write_way(&stored)?;
    }
    Ok(())
}

fn member_ids(relation: &Relation, kind: EntityType) -> BTreeSet<i64> {
    relation.members.iter().filter(|m| m.kind == kind).map(|m| m.id).collect()
}

fn moved(old: &Node, new: &Node) -> bool {
    to_fixed(old.lat) != to_fixed(new.lat) || to_fixed(old.lon) != to_fixed(new.lon)
}

impl DataSet for OsmBinDataSetV10 {
    fn add_node(&self, node: Node) -> Result<()> {
        narrow_id(node.id)?;
        let mut nodes = self.nodes.write();

        let mut stale_ways = BTreeSet::new();
        let stored = match nodes.read_node(node.id)? {
            Some(old) if old.node.version >= node.version => {
                debug!(
                    "node {}: version {} is not newer than stored {}, ignoring",
                    node.id, node.version, old.node.version
                );
                return Ok(());
            }
            Some(old) => {
                if moved(&old.node, &node) {
                    stale_ways.clone_from(&old.way_ids);
                }
                StoredNode { node, way_ids: old.way_ids, relation_ids: old.relation_ids }
            }
            None => StoredNode::new(node),
        };
        nodes.write_node(&stored)?;

        if !stale_ways.is_empty() {
            let mut ways = self.ways.write();
            for way_id in stale_ways {
                refresh_way(&nodes, &mut ways, way_id)?;
            }
        }
        Ok(())
    }

    fn add_way(&self, way: Way) -> Result<()> {
        narrow_id(way.id)?;
        for &node_id in &way.node_ids {
            narrow_id(node_id)?;
        }

        let mut nodes = self.nodes.write();
        let mut ways = self.ways.write();

        let existing = ways.read_way(way.id)?;
        if let Some(old) = &existing {
            if old.way.version >= way.version {
                debug!(
                    "way {}: version {} is not newer than stored {}, ignoring",
                    way.id, way.version, old.way.version
                );
                return Ok(());
            }
        }

        let referenced: BTreeSet<i64> = way.node_ids.iter().copied().collect();
        let mut relation_ids = BTreeSet::new();
        if let Some(old) = existing {
            let dropped: BTreeSet<i64> =
                old.way.node_ids.iter().copied().filter(|id| !referenced.contains(id)).collect();
            for node_id in dropped {
                nodes.update_back_refs(node_id, |way_refs, _| {
                    way_refs.remove(&way.id);
                })?;
            }
            relation_ids = old.relation_ids;
        }

        let mut bbox = None;
        for &node_id in &referenced {
            let Some(mut stored) = nodes.read_node(node_id)? else {
                debug!("way {}: node {} is not stored, skipping it", way.id, node_id);
                continue;
            };
            extend_bbox(&mut bbox, &stored.node);
            if stored.way_ids.insert(way.id) {
                nodes.write_node(&stored)?;
            }
        }

        ways.write_way(&StoredWay { way, bbox, relation_ids })?;
        Ok(())
    }

    fn add_relation(&self, relation: Relation) -> Result<()> {
        narrow_id(relation.id)?;
        for member in &relation.members {
            narrow_id(member.id)?;
        }

        let mut nodes = self.nodes.write();
        let mut ways = self.ways.write();
        let mut relations = self.relations.write();

        let existing = relations.read_relation(relation.id)?;
        if let Some(old) = &existing {
            if old.version >= relation.version {
                debug!(
                    "relation {}: version {} is not newer than stored {}, ignoring",
                    relation.id, relation.version, old.version
                );
                return Ok(());
            }
        }

        let id = relation.id;
        let node_members = member_ids(&relation, EntityType::Node);
        let way_members = member_ids(&relation, EntityType::Way);

        if let Some(old) = &existing {
            for node_id in member_ids(old, EntityType::Node).difference(&node_members) {
                nodes.update_back_refs(*node_id, |_, relation_refs| {
                    relation_refs.remove(&id);
                })?;
            }
            for way_id in member_ids(old, EntityType::Way).difference(&way_members) {
                ways.update_back_refs(*way_id, |relation_refs| {
                    relation_refs.remove(&id);
                })?;
            }
        }

        for &node_id in &node_members {
            let stored = nodes.update_back_refs(node_id, |_, relation_refs| {
                relation_refs.insert(id);
            })?;
            if !stored {
                debug!("relation {id}: member node {node_id} is not stored");
            }
        }
        for &way_id in &way_members {
            let stored = ways.update_back_refs(way_id, |relation_refs| {
                relation_refs.insert(id);
            })?;
            if !stored {
                debug!("relation {id}: member way {way_id} is not stored");
            }
        }

        relations.write_relation(&relation)?;
        Ok(())
    }

    fn contains_node(&self, id: i64) -> Result<bool> {
        self.nodes.read().contains(id)
    }

    fn contains_way(&self, id: i64) -> Result<bool> {
        self.ways.read().contains(id)
    }

    fn contains_relation(&self, id: i64) -> Result<bool> {
        self.relations.read().contains(id)
    }

    fn get_node_by_id(&self, id: i64) -> Result<Option<Node>> {
        Ok(self.get_stored_node(id)?.map(|stored| stored.node))
    }

    fn get_way_by_id(&self, id: i64) -> Result<Option<Way>> {
        Ok(self.get_stored_way(id)?.map(|stored| stored.way))
    }

    fn get_relation_by_id(&self, id: i64) -> Result<Option<Relation>> {
        self.relations.read().read_relation(id)
    }

    fn remove_node(&self, id: i64) -> Result<bool> {
        let mut nodes = self.nodes.write();
        let Some(stored) = nodes.remove_node(id)? else {
            return Ok(false);
        };

        if !stored.way_ids.is_empty() {
            let mut ways = self.ways.write();
            for way_id in stored.way_ids {
                refresh_way(&nodes, &mut ways, way_id)?;
            }
        }
        Ok(true)
    }

    fn remove_way(&self, id: i64) -> Result<bool> {
        let mut nodes = self.nodes.write();
        let mut ways = self.ways.write();
        let Some(stored) = ways.remove_way(id)? else {
            return Ok(false);
        };

        let referenced: BTreeSet<i64> = stored.way.node_ids.into_iter().collect();
        for node_id in referenced {
            nodes.update_back_refs(node_id, |way_refs, _| {
                way_refs.remove(&id);
            })?;
        }
        Ok(true)
    }

    fn remove_relation(&self, id: i64) -> Result<bool> {
        let mut nodes = self.nodes.write();
        let mut ways = self.ways.write();
        let mut relations = self.relations.write();
        let Some(relation) = relations.remove_relation(id)? else {
            return Ok(false);
        };

        for node_id in member_ids(&relation, EntityType::Node) {
            nodes.update_back_refs(node_id, |_, relation_refs| {
                relation_refs.remove(&id);
            })?;
        }
        for way_id in member_ids(&relation, EntityType::Way) {
            ways.update_back_refs(way_id, |relation_refs| {
                relation_refs.remove(&id);
            })?;
        }
        Ok(true)
    }

    fn get_nodes(&self, bounds: &Bounds) -> Result<Vec<Node>> {
        let nodes = self.nodes.read();
        if bounds.is_world() {
            return nodes.nodes().map(|stored| stored.map(|s| s.node)).collect();
        }
        Ok(nodes.nodes_in(bounds)?.into_iter().map(|stored| stored.node).collect())
    }

    fn get_ways(&self, bounds: &Bounds) -> Result<Vec<Way>> {
        let nodes = self.nodes.read();
        let ways = self.ways.read();
        if bounds.is_world() {
            return ways.ways().map(|stored| stored.map(|s| s.way)).collect();
        }

        let way_ids: BTreeSet<i64> =
            nodes.nodes_in(bounds)?.into_iter().flat_map(|stored| stored.way_ids).collect();
        Self::read_ways(&ways, way_ids)
    }

    fn get_relations(&self, bounds: &Bounds) -> Result<Vec<Relation>> {
        let nodes = self.nodes.read();
        let ways = self.ways.read();
        let relations = self.relations.read();
        if bounds.is_world() {
            return relations.relations().collect();
        }

        let mut relation_ids = BTreeSet::new();
        let mut way_ids = BTreeSet::new();
        for stored in nodes.nodes_in(bounds)? {
            relation_ids.extend(stored.relation_ids);
            way_ids.extend(stored.way_ids);
        }
        for way_id in way_ids {
            if let Some(stored) = ways.read_way(way_id)? {
                relation_ids.extend(stored.relation_ids);
            }
        }
        Self::read_relations(&relations, relation_ids)
    }

    fn get_ways_for_node(&self, node_id: i64) -> Result<Vec<Way>> {
        let nodes = self.nodes.read();
        let ways = self.ways.read();
        let Some(stored) = nodes.read_node(node_id)? else {
            return Ok(Vec::new());
        };
        Self::read_ways(&ways, stored.way_ids)
    }

    fn get_relations_for_node(&self, node_id: i64) -> Result<Vec<Relation>> {
        let nodes = self.nodes.read();
        let relations = self.relations.read();
        let Some(stored) = nodes.read_node(node_id)? else {
            return Ok(Vec::new());
        };
        Self::read_relations(&relations, stored.relation_ids)
    }

    fn get_relations_for_way(&self, way_id: i64) -> Result<Vec<Relation>> {
        let ways = self.ways.read();
        let relations = self.relations.read();
        let Some(stored) = ways.read_way(way_id)? else {
            return Ok(Vec::new());
        };
        Self::read_relations(&relations, stored.relation_ids)
    }

    fn get_nearest_node(
        &self,
        pos: LatLon,
        filter: &dyn Fn(&Node) -> bool,
    ) -> Result<Option<Node>> {
        let nodes = self.nodes.read();
        if nodes.geo_len() == 0 {
            return Ok(None);
        }

        let mut radius = self.options.nearest_node_start_radius.max(MIN_SEARCH_RADIUS);
        loop {
            let window = Bounds::around(pos, radius);
            let candidates: Vec<Node> =
                nodes.nodes_in(&window)?.into_iter().map(|stored| stored.node).collect();

            if let Some((distance, _)) = closest(pos, &candidates, filter) {
                // a closer node may sit just outside the square window
                let circle = window_for_distance(pos, distance);
                let candidates: Vec<Node> =
                    nodes.nodes_in(&circle)?.into_iter().map(|stored| stored.node).collect();
                return Ok(closest(pos, &candidates, filter).map(|(_, node)| node));
            }
            if window.is_world() {
                return Ok(None);
            }
            radius *= 2.0;
        }
    }

    fn flush(&self) -> Result<()> {
        self.nodes.write().flush()?;
        self.ways.write().flush()?;
        self.relations.write().flush()?;
        self.attrs.flush()
    }

    fn shutdown(self) -> Result<()> {
        self.flush()?;
        info!("Closed osmbin dataset {}", self.dir.display());
        Ok(())
    }
}
