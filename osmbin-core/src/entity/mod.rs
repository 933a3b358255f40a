//! Entity storage: the shared run engine and the node, way and relation
//! record files built on it.

pub mod layout;
mod nodes;
mod relations;
mod store;
pub mod tags;
mod used;
mod ways;

pub use nodes::{NODE_LAYOUT, NodesFile, StoredNode};
pub use relations::{RELATION_LAYOUT, RelationsFile};
pub use store::{RecordStore, Run, Runs, WriteOutcome};
pub use used::UsedRecords;
pub use ways::{StoredWay, WAY_LAYOUT, WaysFile};

use crate::error::narrow_id;
use anyhow::Result;

/// Narrows every id to the on-disk 32-bit field
fn narrow_ids<I>(ids: I) -> Result<Vec<i32>>
where
    I: IntoIterator<Item = i64>,
{
    ids.into_iter().map(narrow_id).collect()
}
