//! Persistent lookup structures over record numbers.

mod geo_index;
mod id_index;

pub use geo_index::GeoIndexFile;
pub use id_index::IdIndexFile;
