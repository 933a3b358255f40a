//! osmbin - On-disk storage engine for OpenStreetMap nodes, ways and relations
//!
//! osmbin keeps map data in fixed-size binary records behind id and geo
//! indices, and answers id lookups, bounding-box queries and nearest-node
//! searches without loading the dataset into memory.
//!
//! # Features
//!
//! - Memory-mapped fixed-record files, one per entity type
//! - Entities spanning consecutive record runs, with first-fit record reuse
//! - Persistent id index and R-tree geo index, rebuildable from the data files
//! - Way and relation back-references maintained on the referenced entities
//! - A tiled dataset that saves dirty tiles from a background worker
//!
//! # Example
//!
//! ```no_run
//! use osmbin_core::{DataSet, DataSetOptions, OsmBinDataSetV10};
//! use osmbin_core::model::{Node, Way};
//!
//! # fn main() -> anyhow::Result<()> {
//! let dataset = OsmBinDataSetV10::open("berlin.osmbin", DataSetOptions::default())?;
//!
//! dataset.add_node(Node::new(1001, 1, 52.5, 13.4).with_tag("name", "Alexanderplatz"))?;
//! dataset.add_node(Node::new(1002, 1, 52.51, 13.41))?;
//! dataset.add_way(Way::new(55, 1, vec![1001, 1002]))?;
//!
//! let ways = dataset.get_ways_for_node(1001)?;
//! assert_eq!(ways[0].id, 55);
//!
//! dataset.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Limits
//!
//! Ids are stored in 32 bits; larger ids are rejected with
//! [`StorageError::IdOverflow`]. Relations that are members of other
//! relations carry no back-reference to their parents.
//!
//! Nearest-node searches use plain latitude/longitude windows that stop at
//! the antimeridian: a node just across ±180° longitude is not found from
//! the other side.

pub mod attr_names;
pub mod dataset;
pub mod error;
pub mod format;
pub mod model;
pub mod reindex;

#[cfg(feature = "internals")]
pub mod entity;
#[cfg(not(feature = "internals"))]
pub(crate) mod entity;

#[cfg(feature = "internals")]
pub mod index;
#[cfg(not(feature = "internals"))]
pub(crate) mod index;

#[cfg(feature = "internals")]
pub mod storage;
#[cfg(not(feature = "internals"))]
pub(crate) mod storage;

pub use attr_names::AttrNames;
pub use dataset::{DataSet, FileTileDataSet, OsmBinDataSetV10, TileKey, TileOptions};
pub use entity::{StoredNode, StoredWay};
pub use error::StorageError;
pub use format::{FormatVersion, OsmBin, open};
pub use reindex::{DataSetStats, ReindexReport, rebuild_indices, stats};

/// Name of the attribute (tag key and role) table in a dataset directory
pub const ATTR_NAMES_FILE: &str = "attrnames.txt";

/// Configuration options for [`OsmBinDataSetV10`]
#[derive(Debug, Clone)]
pub struct DataSetOptions {
    /// Extra records added whenever `nodes.obm` grows
    pub node_spare_records: u32,

    /// Extra records added whenever `ways.obm` grows
    pub way_spare_records: u32,

    /// Extra records added whenever `relations.obm` grows
    pub relation_spare_records: u32,

    /// First window half-width (degrees) of the nearest-node search
    pub nearest_node_start_radius: f64,
}

impl Default for DataSetOptions {
    fn default() -> Self {
        Self {
            node_spare_records: 1024,
            way_spare_records: 256,
            relation_spare_records: 64,
            nearest_node_start_radius: 0.001,
        }
    }
}
