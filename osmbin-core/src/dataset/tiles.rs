//! Tiled dataset: entities grouped into square tiles, one bincode file per
//! tile, with an id/tag/back-reference index saved next to them.

use crate::dataset::tile_store::{self, Saver, Tile};
pub use crate::dataset::tile_store::TileKey;
use crate::dataset::{DataSet, closest, keep_closest, window_for_distance};
use crate::model::{Bounds, EntityType, LatLon, Node, Relation, Tags, Way};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Subdirectory of the dataset directory holding the tile files
const TILES_DIR: &str = "tiles";

/// Id/tag index file inside [`TILES_DIR`]
const INDEX_FILE: &str = "index.bin";

/// An entity kind and id
type EntityRef = (EntityType, i64);

/// Configuration options for [`FileTileDataSet`]
#[derive(Debug, Clone)]
pub struct TileOptions {
    /// Edge length of a tile in degrees
    pub tile_size: f64,

    /// Snapshots the save queue holds before producers block
    pub save_queue_capacity: usize,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self { tile_size: 0.1, save_queue_capacity: 64 }
    }
}

/// Where every entity lives, what it is tagged with and who references it
#[derive(Debug, Default, Serialize, Deserialize)]
struct TileIndex {
    tile_size: f64,
    locations: HashMap<EntityRef, TileKey>,
    /// Entity count per non-empty tile
    populated: BTreeMap<TileKey, u32>,
    /// key -> value -> entities
    tags: BTreeMap<String, BTreeMap<String, BTreeSet<EntityRef>>>,
    /// node -> ways listing it
    way_refs: HashMap<i64, BTreeSet<i64>>,
    /// node or way -> relations with it as a member
    member_refs: HashMap<EntityRef, BTreeSet<i64>>,
}

impl TileIndex {
    fn new(tile_size: f64) -> Self {
        Self { tile_size, ..Self::default() }
    }

    /// Records that `entity` now lives in `key`
    ///
    /// Returns the tile it left, if it moved.
    fn place(&mut self, entity: EntityRef, key: TileKey) -> Option<TileKey> {
        match self.locations.insert(entity, key) {
            Some(old) if old == key => None,
            Some(old) => {
                self.vacate(old);
                *self.populated.entry(key).or_default() += 1;
                Some(old)
            }
            None => {
                *self.populated.entry(key).or_default() += 1;
                None
            }
        }
    }

    fn forget(&mut self, entity: EntityRef) -> Option<TileKey> {
        let key = self.locations.remove(&entity)?;
        self.vacate(key);
        Some(key)
    }

    fn vacate(&mut self, key: TileKey) {
        if let Some(count) = self.populated.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.populated.remove(&key);
            }
        }
    }

    fn index_tags(&mut self, entity: EntityRef, tags: &Tags) {
        for (key, value) in tags {
            let values = self.tags.entry(key.clone()).or_default();
            values.entry(value.clone()).or_default().insert(entity);
        }
    }

    fn unindex_tags(&mut self, entity: EntityRef, tags: &Tags) {
        for (key, value) in tags {
            let Some(values) = self.tags.get_mut(key) else { continue };
            if let Some(entities) = values.get_mut(value) {
                entities.remove(&entity);
                if entities.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.tags.remove(key);
            }
        }
    }

    /// Ids of `kind` tagged `key` (with exactly `value`, if given), ascending
    fn tagged(&self, kind: EntityType, key: &str, value: Option<&str>) -> BTreeSet<i64> {
        let Some(values) = self.tags.get(key) else {
            return BTreeSet::new();
        };
        let sets: Vec<&BTreeSet<EntityRef>> = match value {
            Some(value) => values.get(value).into_iter().collect(),
            None => values.values().collect(),
        };
        sets.into_iter().flatten().filter(|(k, _)| *k == kind).map(|&(_, id)| id).collect()
    }

    fn add_way_ref(&mut self, node_id: i64, way_id: i64) {
        self.way_refs.entry(node_id).or_default().insert(way_id);
    }

    fn remove_way_ref(&mut self, node_id: i64, way_id: i64) {
        if let Entry::Occupied(mut entry) = self.way_refs.entry(node_id) {
            entry.get_mut().remove(&way_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    fn add_member_ref(&mut self, member: EntityRef, relation_id: i64) {
        self.member_refs.entry(member).or_default().insert(relation_id);
    }

    fn remove_member_ref(&mut self, member: EntityRef, relation_id: i64) {
        if let Entry::Occupied(mut entry) = self.member_refs.entry(member) {
            entry.get_mut().remove(&relation_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    fn contains(&self, entity: EntityRef) -> bool {
        self.locations.contains_key(&entity)
    }
}

/// Node and way members of a relation, the kinds that carry back-references
fn tracked_members(relation: &Relation) -> BTreeSet<EntityRef> {
    relation
        .members
        .iter()
        .filter(|m| m.kind != EntityType::Relation)
        .map(|m| (m.kind, m.id))
        .collect()
}

#[derive(Debug)]
struct TileState {
    dir: PathBuf,
    /// Every tile touched since open; tiles are never evicted
    tiles: HashMap<TileKey, Tile>,
    index: TileIndex,
    /// `index.bin` is stale (and deleted) until the next flush
    index_dirty: bool,
}

impl TileState {
    fn tile(&mut self, key: TileKey) -> Result<&mut Tile> {
        match self.tiles.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let tile = tile_store::load_tile(&self.dir, key)?.unwrap_or_default();
                Ok(entry.insert(tile))
            }
        }
    }

    fn node(&mut self, id: i64) -> Result<Option<Node>> {
        let Some(&key) = self.index.locations.get(&(EntityType::Node, id)) else {
            return Ok(None);
        };
        Ok(self.tile(key)?.nodes.get(&id).cloned())
    }

    fn way(&mut self, id: i64) -> Result<Option<Way>> {
        let Some(&key) = self.index.locations.get(&(EntityType::Way, id)) else {
            return Ok(None);
        };
        Ok(self.tile(key)?.ways.get(&id).cloned())
    }

    fn relation(&mut self, id: i64) -> Result<Option<Relation>> {
        let Some(&key) = self.index.locations.get(&(EntityType::Relation, id)) else {
            return Ok(None);
        };
        Ok(self.tile(key)?.relations.get(&id).cloned())
    }

    fn ways(&mut self, ids: impl IntoIterator<Item = i64>) -> Result<Vec<Way>> {
        let mut ways = Vec::new();
        for id in ids {
            ways.extend(self.way(id)?);
        }
        Ok(ways)
    }

    fn relations(&mut self, ids: impl IntoIterator<Item = i64>) -> Result<Vec<Relation>> {
        let mut relations = Vec::new();
        for id in ids {
            relations.extend(self.relation(id)?);
        }
        Ok(relations)
    }

    /// Deletes `index.bin` the first time the index changes after a flush
    fn mark_dirty(&mut self) -> Result<()> {
        if self.index_dirty {
            return Ok(());
        }
        let path = self.dir.join(INDEX_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
        self.index_dirty = true;
        Ok(())
    }

    /// Rebuilds the index by reading every tile file
    fn rebuild_index(&mut self, tile_size: f64) -> Result<()> {
        let mut index = TileIndex::new(tile_size);
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", self.dir.display()))?;
            let Some(key) = entry.file_name().to_str().and_then(TileKey::from_file_name) else {
                continue;
            };
            let tile = tile_store::load_tile(&self.dir, key)?.unwrap_or_default();
            for (&id, node) in &tile.nodes {
                index.place((EntityType::Node, id), key);
                index.index_tags((EntityType::Node, id), &node.tags);
            }
            for (&id, way) in &tile.ways {
                index.place((EntityType::Way, id), key);
                index.index_tags((EntityType::Way, id), &way.tags);
            }
            for (&id, relation) in &tile.relations {
                index.place((EntityType::Relation, id), key);
                index.index_tags((EntityType::Relation, id), &relation.tags);
            }
            self.tiles.insert(key, tile);
        }

        // back-references only point at stored entities
        for tile in self.tiles.values() {
            for way in tile.ways.values() {
                for &node_id in &way.node_ids {
                    if index.contains((EntityType::Node, node_id)) {
                        index.add_way_ref(node_id, way.id);
                    }
                }
            }
            for relation in tile.relations.values() {
                for member in tracked_members(relation) {
                    if index.contains(member) {
                        index.add_member_ref(member, relation.id);
                    }
                }
            }
        }

        info!(
            "{}: rebuilt tile index from {} tiles ({} entities)",
            self.dir.display(),
            self.tiles.len(),
            index.locations.len()
        );
        self.index = index;
        self.index_dirty = true;
        Ok(())
    }

    fn write_index(&mut self) -> Result<()> {
        if self.index_dirty {
            tile_store::save_bincode(&self.dir.join(INDEX_FILE), &self.index)?;
            self.index_dirty = false;
        }
        Ok(())
    }
}

/// Dataset partitioned into square tiles of `tile_size` degrees
///
/// Every tile touched is kept in memory. Each change queues a snapshot of
/// the changed tile for the background saver; [`DataSet::flush`] waits for
/// the queue to drain and then writes the id/tag index.
///
/// Nodes live in the tile of their position, ways in the tile of their
/// first stored node and relations in the tile of their first stored
/// member; entities with nothing to anchor them go to the tile at 0/0.
#[derive(Debug)]
pub struct FileTileDataSet {
    options: TileOptions,
    state: Mutex<TileState>,
    saver: Saver,
}

impl FileTileDataSet {
    /// Opens or creates a tiled dataset under `dir/tiles`
    ///
    /// A missing or stale index is rebuilt from the tile files.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `tile_size` is not in `(0, 180]`
    /// - The directory was written with a different tile size
    /// - A tile file or the index cannot be read
    pub fn open<P: AsRef<Path>>(dir: P, options: TileOptions) -> Result<Self> {
        anyhow::ensure!(
            options.tile_size > 0.0 && options.tile_size <= 180.0,
            "Tile size must be in (0, 180] degrees, got {}",
            options.tile_size
        );
        let dir = dir.as_ref().join(TILES_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut state =
            TileState {
                dir: dir.clone(),
                tiles: HashMap::new(),
                index: TileIndex::new(options.tile_size),
                index_dirty: false,
            };
        match tile_store::load_bincode::<TileIndex>(&dir.join(INDEX_FILE)) {
            Ok(Some(index)) => {
                anyhow::ensure!(
                    (index.tile_size - options.tile_size).abs() < f64::EPSILON,
                    "{} was written with tile size {}, not {}",
                    dir.display(),
                    index.tile_size,
                    options.tile_size
                );
                state.index = index;
            }
            Ok(None) => state.rebuild_index(options.tile_size)?,
            Err(err) => {
                warn!("{err:#}, rebuilding the tile index");
                state.rebuild_index(options.tile_size)?;
            }
        }

        let saver = Saver::spawn(dir.clone(), options.save_queue_capacity)?;
        info!(
            "Opened tile dataset {} ({} entities indexed)",
            dir.display(),
            state.index.locations.len()
        );

        Ok(Self { options, state: Mutex::new(state), saver })
    }

    /// Tile holding position `lat`/`lon`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn key_for(&self, lat: f64, lon: f64) -> TileKey {
        let size = self.options.tile_size;
        TileKey {
            x: ((lon + 180.0) / size).floor() as i32,
            y: ((lat + 90.0) / size).floor() as i32,
        }
    }

    /// Area covered by tile `key`
    #[must_use]
    pub fn tile_bounds(&self, key: TileKey) -> Bounds {
        let size = self.options.tile_size;
        let min_lon = f64::from(key.x) * size - 180.0;
        let min_lat = f64::from(key.y) * size - 90.0;
        Bounds { min_lat, max_lat: min_lat + size, min_lon, max_lon: min_lon + size }
    }

    /// Tiles currently holding at least one entity
    pub fn populated_tiles(&self) -> Vec<TileKey> {
        self.state.lock().index.populated.keys().copied().collect()
    }

    /// Tile holding `id` of `kind`
    pub fn tile_of(&self, kind: EntityType, id: i64) -> Option<TileKey> {
        self.state.lock().index.locations.get(&(kind, id)).copied()
    }

    fn anchor(
        &self,
        state: &TileState,
        candidates: impl IntoIterator<Item = EntityRef>,
    ) -> TileKey {
        candidates
            .into_iter()
            .find_map(|entity| state.index.locations.get(&entity).copied())
            .unwrap_or_else(|| self.key_for(0.0, 0.0))
    }

    /// Queues a snapshot of tile `key`
    fn save(&self, state: &mut TileState, key: TileKey) -> Result<()> {
        state.mark_dirty()?;
        let snapshot = state.tile(key)?.clone();
        self.saver.save(key, snapshot)
    }

    fn nodes_in(&self, state: &mut TileState, bounds: &Bounds) -> Result<Vec<Node>> {
        let keys: Vec<TileKey> = state
            .index
            .populated
            .keys()
            .copied()
            .filter(|&key| self.tile_bounds(key).intersects(bounds))
            .collect();

        let mut nodes = Vec::new();
        for key in keys {
            let tile = state.tile(key)?;
            nodes.extend(tile.nodes.values().filter(|n| bounds.contains(n.lat, n.lon)).cloned());
        }
        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    fn way_touches(state: &mut TileState, way: &Way, bounds: &Bounds) -> Result<bool> {
        for &node_id in &way.node_ids {
            if let Some(node) = state.node(node_id)? {
                if bounds.contains(node.lat, node.lon) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn relation_touches(
        state: &mut TileState,
        relation: &Relation,
        bounds: &Bounds,
    ) -> Result<bool> {
        for member in &relation.members {
            let touches = match member.kind {
                EntityType::Node => {
                    state.node(member.id)?.is_some_and(|n| bounds.contains(n.lat, n.lon))
                }
                EntityType::Way => match state.way(member.id)? {
                    Some(way) => Self::way_touches(state, &way, bounds)?,
                    None => false,
                },
                EntityType::Relation => false,
            };
            if touches {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Closes the save queue without flushing the index
    ///
    /// # Errors
    ///
    /// Returns an error if the saver thread panicked.
    fn close(&mut self) -> Result<()> {
        self.saver.close()
    }
}

impl DataSet for FileTileDataSet {
    fn add_node(&self, node: Node) -> Result<()> {
        let mut state = self.state.lock();
        let entity = (EntityType::Node, node.id);

        if let Some(old) = state.node(node.id)? {
            if old.version >= node.version {
                debug!(
                    "node {}: version {} is not newer than stored {}, ignoring",
                    node.id, node.version, old.version
                );
                return Ok(());
            }
            state.index.unindex_tags(entity, &old.tags);
        }
        state.index.index_tags(entity, &node.tags);

        let key = self.key_for(node.lat, node.lon);
        if let Some(left) = state.index.place(entity, key) {
            state.tile(left)?.nodes.remove(&node.id);
            self.save(&mut state, left)?;
        }
        state.tile(key)?.nodes.insert(node.id, node);
        self.save(&mut state, key)
    }

    fn add_way(&self, way: Way) -> Result<()> {
        let mut state = self.state.lock();
        let entity = (EntityType::Way, way.id);

        if let Some(old) = state.way(way.id)? {
            if old.version >= way.version {
                debug!(
                    "way {}: version {} is not newer than stored {}, ignoring",
                    way.id, way.version, old.version
                );
                return Ok(());
            }
            state.index.unindex_tags(entity, &old.tags);
            for &node_id in &old.node_ids {
                state.index.remove_way_ref(node_id, way.id);
            }
        }
        state.index.index_tags(entity, &way.tags);
        for &node_id in &way.node_ids {
            if state.index.contains((EntityType::Node, node_id)) {
                state.index.add_way_ref(node_id, way.id);
            } else {
                debug!("way {}: node {} is not stored, skipping it", way.id, node_id);
            }
        }

        let key = self.anchor(&state, way.node_ids.iter().map(|&id| (EntityType::Node, id)));
        if let Some(left) = state.index.place(entity, key) {
            state.tile(left)?.ways.remove(&way.id);
            self.save(&mut state, left)?;
        }
        state.tile(key)?.ways.insert(way.id, way);
        self.save(&mut state, key)
    }

    fn add_relation(&self, relation: Relation) -> Result<()> {
        let mut state = self.state.lock();
        let entity = (EntityType::Relation, relation.id);

        if let Some(old) = state.relation(relation.id)? {
            if old.version >= relation.version {
                debug!(
                    "relation {}: version {} is not newer than stored {}, ignoring",
                    relation.id, relation.version, old.version
                );
                return Ok(());
            }
            state.index.unindex_tags(entity, &old.tags);
            for member in tracked_members(&old) {
                state.index.remove_member_ref(member, relation.id);
            }
        }
        state.index.index_tags(entity, &relation.tags);
        for member in tracked_members(&relation) {
            if state.index.contains(member) {
                state.index.add_member_ref(member, relation.id);
            } else {
                debug!(
                    "relation {}: member {:?} {} is not stored",
                    relation.id, member.0, member.1
                );
            }
        }

        let key = self.anchor(&state, relation.members.iter().map(|m| (m.kind, m.id)));
        if let Some(left) = state.index.place(entity, key) {
            state.tile(left)?.relations.remove(&relation.id);
            self.save(&mut state, left)?;
        }
        state.tile(key)?.relations.insert(relation.id, relation);
        self.save(&mut state, key)
    }

    fn contains_node(&self, id: i64) -> Result<bool> {
        Ok(self.state.lock().index.contains((EntityType::Node, id)))
    }

    fn contains_way(&self, id: i64) -> Result<bool> {
        Ok(self.state.lock().index.contains((EntityType::Way, id)))
    }

    fn contains_relation(&self, id: i64) -> Result<bool> {
        Ok(self.state.lock().index.contains((EntityType::Relation, id)))
    }

    fn get_node_by_id(&self, id: i64) -> Result<Option<Node>> {
        self.state.lock().node(id)
    }

    fn get_way_by_id(&self, id: i64) -> Result<Option<Way>> {
        self.state.lock().way(id)
    }

    fn get_relation_by_id(&self, id: i64) -> Result<Option<Relation>> {
        self.state.lock().relation(id)
    }

    fn remove_node(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let entity = (EntityType::Node, id);
        let Some(key) = state.index.forget(entity) else {
            return Ok(false);
        };

        if let Some(node) = state.tile(key)?.nodes.remove(&id) {
            state.index.unindex_tags(entity, &node.tags);
        }
        state.index.way_refs.remove(&id);
        state.index.member_refs.remove(&entity);
        self.save(&mut state, key)?;
        Ok(true)
    }

    fn remove_way(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let entity = (EntityType::Way, id);
        let Some(key) = state.index.forget(entity) else {
            return Ok(false);
        };

        if let Some(way) = state.tile(key)?.ways.remove(&id) {
            state.index.unindex_tags(entity, &way.tags);
            for node_id in way.node_ids {
                state.index.remove_way_ref(node_id, id);
            }
        }
        state.index.member_refs.remove(&entity);
        self.save(&mut state, key)?;
        Ok(true)
    }

    fn remove_relation(&self, id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let entity = (EntityType::Relation, id);
        let Some(key) = state.index.forget(entity) else {
            return Ok(false);
        };

        if let Some(relation) = state.tile(key)?.relations.remove(&id) {
            state.index.unindex_tags(entity, &relation.tags);
            for member in tracked_members(&relation) {
                state.index.remove_member_ref(member, id);
            }
        }
        self.save(&mut state, key)?;
        Ok(true)
    }

    fn get_nodes(&self, bounds: &Bounds) -> Result<Vec<Node>> {
        let mut state = self.state.lock();
        self.nodes_in(&mut state, bounds)
    }

    fn get_ways(&self, bounds: &Bounds) -> Result<Vec<Way>> {
        let mut state = self.state.lock();
        let nodes = self.nodes_in(&mut state, bounds)?;
        let way_ids: BTreeSet<i64> = nodes
            .iter()
            .filter_map(|node| state.index.way_refs.get(&node.id))
            .flatten()
            .copied()
            .collect();
        state.ways(way_ids)
    }

    fn get_relations(&self, bounds: &Bounds) -> Result<Vec<Relation>> {
        let mut state = self.state.lock();
        let nodes = self.nodes_in(&mut state, bounds)?;

        let index = &state.index;
        let mut relation_ids: BTreeSet<i64> = BTreeSet::new();
        for node in &nodes {
            let refs = index.member_refs.get(&(EntityType::Node, node.id));
            relation_ids.extend(refs.into_iter().flatten());
            for way_id in index.way_refs.get(&node.id).into_iter().flatten() {
                let refs = index.member_refs.get(&(EntityType::Way, *way_id));
                relation_ids.extend(refs.into_iter().flatten());
            }
        }
        state.relations(relation_ids)
    }

    fn get_ways_for_node(&self, node_id: i64) -> Result<Vec<Way>> {
        let mut state = self.state.lock();
        let way_ids = state.index.way_refs.get(&node_id).cloned().unwrap_or_default();
        state.ways(way_ids)
    }

    fn get_relations_for_node(&self, node_id: i64) -> Result<Vec<Relation>> {
        let mut state = self.state.lock();
        let ids =
            state.index.member_refs.get(&(EntityType::Node, node_id)).cloned().unwrap_or_default();
        state.relations(ids)
    }

    fn get_relations_for_way(&self, way_id: i64) -> Result<Vec<Relation>> {
        let mut state = self.state.lock();
        let ids =
            state.index.member_refs.get(&(EntityType::Way, way_id)).cloned().unwrap_or_default();
        state.relations(ids)
    }

    fn get_nodes_by_tag(
        &self,
        bounds: &Bounds,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<Node>> {
        let mut state = self.state.lock();
        let mut nodes = Vec::new();
        for id in state.index.tagged(EntityType::Node, key, value) {
            nodes.extend(state.node(id)?.filter(|n| bounds.contains(n.lat, n.lon)));
        }
        Ok(nodes)
    }

    fn get_ways_by_tag(&self, bounds: &Bounds, key: &str, value: Option<&str>) -> Result<Vec<Way>> {
        let mut state = self.state.lock();
        let mut ways = Vec::new();
        for id in state.index.tagged(EntityType::Way, key, value) {
            let Some(way) = state.way(id)? else { continue };
            if bounds.is_world() || Self::way_touches(&mut state, &way, bounds)? {
                ways.push(way);
            }
        }
        Ok(ways)
    }

    fn get_relations_by_tag(
        &self,
        bounds: &Bounds,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<Relation>> {
        let mut state = self.state.lock();
        let mut relations = Vec::new();
        for id in state.index.tagged(EntityType::Relation, key, value) {
            let Some(relation) = state.relation(id)? else { continue };
            if bounds.is_world() || Self::relation_touches(&mut state, &relation, bounds)? {
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    fn get_nearest_node(
        &self,
        pos: LatLon,
        filter: &dyn Fn(&Node) -> bool,
    ) -> Result<Option<Node>> {
        let mut state = self.state.lock();
        let center = self.key_for(pos.lat, pos.lon);
        let mut rings: Vec<(u32, TileKey)> =
            state.index.populated.keys().map(|&key| (key.ring_distance(center), key)).collect();
        rings.sort_unstable();

        let mut best: Option<(f64, Node)> = None;
        let mut at = 0;
        while at < rings.len() {
            let ring = rings.get(at).map_or(0, |&(ring, _)| ring);
            while let Some(&(r, key)) = rings.get(at) {
                if r != ring {
                    break;
                }
                let tile = state.tile(key)?;
                keep_closest(&mut best, closest(pos, tile.nodes.values(), filter));
                at += 1;
            }

            let Some((distance, _)) = &best else { continue };
            // tiles further out can still hold something closer than the
            // best match when they reach into its circle
            let circle = window_for_distance(pos, *distance);
            for &(_, key) in rings.get(at..).unwrap_or_default() {
                if !self.tile_bounds(key).intersects(&circle) {
                    continue;
                }
                let tile = state.tile(key)?;
                keep_closest(&mut best, closest(pos, tile.nodes.values(), filter));
            }
            break;
        }
        Ok(best.map(|(_, node)| node))
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let failed = self.saver.barrier()?;
        if !failed.is_empty() {
            // resave so a later flush can succeed
            for &key in &failed {
                self.save(&mut state, key)?;
            }
            anyhow::bail!("Failed to save {} tiles: {:?}", failed.len(), failed);
        }
        state.write_index()
    }

    fn shutdown(mut self) -> Result<()> {
        self.flush()?;
        self.close()?;
        info!("Closed tile dataset");
        Ok(())
    }
}
