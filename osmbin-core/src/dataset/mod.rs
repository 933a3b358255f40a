//! The dataset contract and its two implementations.
//!
//! [`OsmBinDataSetV10`] keeps every entity in fixed-record files with id and
//! geo indices. [`FileTileDataSet`] partitions the planet into square tiles
//! kept in memory and saved one file per tile by a background worker.
//!
//! Both take `&self` on every operation and lock internally, so one dataset
//! can be shared between threads behind an `Arc`.

mod osmbin;
mod tile_store;
mod tiles;

pub use osmbin::OsmBinDataSetV10;
pub use tiles::{FileTileDataSet, TileKey, TileOptions};

use crate::model::{Bounds, LatLon, Node, Relation, Tags, Way};
use anyhow::Result;

/// Read/write access to a set of nodes, ways and relations
///
/// Writes are versioned: adding an entity whose version is not higher than
/// the stored one leaves the dataset unchanged. Lookups of absent entities
/// return `Ok(None)` or an empty list; errors always mean storage failure.
pub trait DataSet: Send + Sync {
    /// Stores a node, keeping the ways and relations that already reference it
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit the storage or a write fails.
    fn add_node(&self, node: Node) -> Result<()>;

    /// Stores a way and records it on every stored node it references
    ///
    /// Referenced nodes that are not stored are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if an id does not fit the storage or a write fails.
    fn add_way(&self, way: Way) -> Result<()>;

    /// Stores a relation and records it on its stored node and way members
    ///
    /// # Errors
    ///
    /// Returns an error if an id does not fit the storage or a write fails.
    fn add_relation(&self, relation: Relation) -> Result<()>;

    /// True if node `id` is stored
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn contains_node(&self, id: i64) -> Result<bool>;

    /// True if way `id` is stored
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn contains_way(&self, id: i64) -> Result<bool>;

    /// True if relation `id` is stored
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn contains_relation(&self, id: i64) -> Result<bool>;

    /// Node by id
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_node_by_id(&self, id: i64) -> Result<Option<Node>>;

    /// Way by id
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_way_by_id(&self, id: i64) -> Result<Option<Way>>;

    /// Relation by id
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_relation_by_id(&self, id: i64) -> Result<Option<Relation>>;

    /// Removes a node; ways that listed it keep the id but get a fresh
    /// bounding box
    ///
    /// # Returns
    ///
    /// Returns `true` if the node was stored
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    fn remove_node(&self, id: i64) -> Result<bool>;

    /// Removes a way and its back-references on nodes
    ///
    /// # Returns
    ///
    /// Returns `true` if the way was stored
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    fn remove_way(&self, id: i64) -> Result<bool>;

    /// Removes a relation and its back-references on nodes and ways
    ///
    /// # Returns
    ///
    /// Returns `true` if the relation was stored
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    fn remove_relation(&self, id: i64) -> Result<bool>;

    /// Nodes inside `bounds` (edges included); [`Bounds::WORLD`] lists all
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_nodes(&self, bounds: &Bounds) -> Result<Vec<Node>>;

    /// Ways with at least one stored node inside `bounds`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_ways(&self, bounds: &Bounds) -> Result<Vec<Way>>;

    /// Relations with a node member, or a way member, inside `bounds`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_relations(&self, bounds: &Bounds) -> Result<Vec<Relation>>;

    /// Ways listing node `node_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_ways_for_node(&self, node_id: i64) -> Result<Vec<Way>>;

    /// Relations with node `node_id` as a member
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_relations_for_node(&self, node_id: i64) -> Result<Vec<Relation>>;

    /// Relations with way `way_id` as a member
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_relations_for_way(&self, way_id: i64) -> Result<Vec<Relation>>;

    /// Nodes inside `bounds` carrying tag `key` (with exactly `value`, if given)
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_nodes_by_tag(
        &self,
        bounds: &Bounds,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<Node>> {
        let mut nodes = self.get_nodes(bounds)?;
        nodes.retain(|node| tag_matches(&node.tags, key, value));
        Ok(nodes)
    }

    /// Ways inside `bounds` carrying tag `key` (with exactly `value`, if given)
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_ways_by_tag(&self, bounds: &Bounds, key: &str, value: Option<&str>) -> Result<Vec<Way>> {
        let mut ways = self.get_ways(bounds)?;
        ways.retain(|way| tag_matches(&way.tags, key, value));
        Ok(ways)
    }

    /// Relations inside `bounds` carrying tag `key` (with exactly `value`, if given)
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_relations_by_tag(
        &self,
        bounds: &Bounds,
        key: &str,
        value: Option<&str>,
    ) -> Result<Vec<Relation>> {
        let mut relations = self.get_relations(bounds)?;
        relations.retain(|relation| tag_matches(&relation.tags, key, value));
        Ok(relations)
    }

    /// The node closest to `pos` that `filter` accepts
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn get_nearest_node(&self, pos: LatLon, filter: &dyn Fn(&Node) -> bool) -> Result<Option<Node>>;

    /// Forces every pending change to disk
    ///
    /// # Errors
    ///
    /// Returns an error if a flush fails.
    fn flush(&self) -> Result<()>;

    /// Flushes and releases every file handle
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    fn shutdown(self) -> Result<()>
    where
        Self: Sized;
}

/// True if `tags` holds `key`, and `value` too when one is given
pub fn tag_matches(tags: &Tags, key: &str, value: Option<&str>) -> bool {
    match (tags.get(key), value) {
        (Some(found), Some(value)) => found == value,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Picks the accepted node closest to `pos` out of `candidates`
pub(crate) fn closest<'a, I>(
    pos: LatLon,
    candidates: I,
    filter: &dyn Fn(&Node) -> bool,
) -> Option<(f64, Node)>
where
    I: IntoIterator<Item = &'a Node>,
{
    candidates
        .into_iter()
        .filter(|node| filter(node))
        .map(|node| (pos.distance_to(&node.position()), node))
        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id.cmp(&b.1.id)))
        .map(|(distance, node)| (distance, node.clone()))
}

/// Replaces `best` with `found` if it is closer, or as close with a lower id
pub(crate) fn keep_closest(best: &mut Option<(f64, Node)>, found: Option<(f64, Node)>) {
    let Some(found) = found else { return };
    let closer = best.as_ref().is_none_or(|(distance, node)| {
        found.0.total_cmp(distance).then(found.1.id.cmp(&node.id)).is_lt()
    });
    if closer {
        *best = Some(found);
    }
}

/// Window around `pos` holding every point within `meters` of it
pub(crate) fn window_for_distance(pos: LatLon, meters: f64) -> Bounds {
    let dlat = (meters / crate::model::METERS_PER_DEGREE).min(180.0);
    let max_lat = (pos.lat.abs() + dlat).min(90.0);
    let cos = max_lat.to_radians().cos();
    let dlon = if cos <= f64::EPSILON { 360.0 } else { (dlat / cos).min(360.0) };
    Bounds::around_with(pos, dlat, dlon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches() {
        let tags = Tags::from([("highway".to_owned(), "primary".to_owned())]);
        assert!(tag_matches(&tags, "highway", None));
        assert!(tag_matches(&tags, "highway", Some("primary")));
        assert!(!tag_matches(&tags, "highway", Some("secondary")));
        assert!(!tag_matches(&tags, "name", None));
    }

    #[test]
    fn test_distance_window_covers_the_circle() {
        let pos = LatLon::new(60.0, 10.0);
        let window = window_for_distance(pos, 10_000.0);
        // 10 km north and 10 km east must both be inside
        assert!(window.contains(60.0 + 10_000.0 / crate::model::METERS_PER_DEGREE, 10.0));
        assert!(window.contains(60.0, 10.0 + 0.17));
        assert!(!window.contains(60.0, 10.5));
    }
}
