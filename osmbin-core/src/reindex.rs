//! Offline recovery: rebuilding the index files of a dataset directory from
//! its record files, and counting what the record files hold.
//!
//! Both operations take the same exclusive file locks as an open dataset,
//! so they fail rather than race with a running writer.

use crate::attr_names::AttrNames;
use crate::entity::{NodesFile, RelationsFile, WaysFile};
use crate::format::{self, FormatVersion};
use crate::{ATTR_NAMES_FILE, DataSetOptions};
use anyhow::{Context, Result};
use log::{info, warn};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Index files rebuilt from scratch
const INDEX_FILES: [&str; 4] = ["nodes.idx", "nodes.id2", "ways.idx", "relations.idx"];

/// Runs found while rebuilding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexReport {
    /// Nodes indexed
    pub nodes: u32,
    /// Ways indexed
    pub ways: u32,
    /// Relations indexed
    pub relations: u32,
}

/// Live entities and physical records per file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSetStats {
    /// Live nodes
    pub nodes: u64,
    /// Live ways
    pub ways: u64,
    /// Live relations
    pub relations: u64,
    /// Records in `nodes.obm`, live or free
    pub node_records: u32,
    /// Records in `ways.obm`, live or free
    pub way_records: u32,
    /// Records in `relations.obm`, live or free
    pub relation_records: u32,
    /// Entries in `attrnames.txt`
    pub attribute_names: usize,
}

impl fmt::Display for DataSetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nodes:      {} ({} records)", self.nodes, self.node_records)?;
        writeln!(f, "ways:       {} ({} records)", self.ways, self.way_records)?;
        writeln!(f, "relations:  {} ({} records)", self.relations, self.relation_records)?;
        write!(f, "attributes: {}", self.attribute_names)
    }
}

struct Files {
    attrs: Arc<AttrNames>,
    nodes: NodesFile,
    ways: WaysFile,
    relations: RelationsFile,
}

/// Opens the attribute table first, so an open dataset is detected before
/// anything is touched
fn open_attrs(dir: &Path) -> Result<Arc<AttrNames>> {
    anyhow::ensure!(dir.is_dir(), "Not a dataset directory: {}", dir.display());
    match format::read_version(dir)? {
        Some(FormatVersion::V10) => {}
        None => {
            warn!(
                "{}: no {}, assuming format {}",
                dir.display(),
                format::PROPERTIES_FILE,
                FormatVersion::V10
            );
        }
    }
    Ok(Arc::new(AttrNames::open(dir.join(ATTR_NAMES_FILE))?))
}

fn open_files(dir: &Path, attrs: Arc<AttrNames>) -> Result<Files> {
    let options = DataSetOptions::default();
    Ok(Files {
        nodes: NodesFile::open(dir, Arc::clone(&attrs), options.node_spare_records)?,
        ways: WaysFile::open(dir, Arc::clone(&attrs), options.way_spare_records)?,
        relations: RelationsFile::open(dir, Arc::clone(&attrs), options.relation_spare_records)?,
        attrs,
    })
}

/// Deletes and rebuilds `nodes.idx`, `nodes.id2`, `ways.idx` and
/// `relations.idx` from a full scan of the record files
///
/// # Errors
///
/// Returns an error if `dir` is not a dataset directory, its format is
/// unsupported, or a file cannot be read, written or locked.
pub fn rebuild_indices<P: AsRef<Path>>(dir: P) -> Result<ReindexReport> {
    let dir = dir.as_ref();
    let attrs = open_attrs(dir)?;

    for name in INDEX_FILES {
        let path = dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to remove {}", path.display()));
            }
        }
    }

    let mut files = open_files(dir, attrs)?;
    let report = ReindexReport {
        nodes: files.nodes.rebuild_indices()?,
        ways: files.ways.rebuild_index()?,
        relations: files.relations.rebuild_index()?,
    };
    files.nodes.flush()?;
    files.ways.flush()?;
    files.relations.flush()?;

    info!(
        "{}: reindexed {} nodes, {} ways, {} relations",
        dir.display(),
        report.nodes,
        report.ways,
        report.relations
    );
    Ok(report)
}

/// Counts live entities by scanning the record files
///
/// # Errors
///
/// Returns an error if `dir` is not a dataset directory, its format is
/// unsupported, or a file cannot be read or locked.
pub fn stats<P: AsRef<Path>>(dir: P) -> Result<DataSetStats> {
    let dir = dir.as_ref();
    let files = open_files(dir, open_attrs(dir)?)?;

    let mut stats = DataSetStats {
        node_records: files.nodes.store().record_count(),
        way_records: files.ways.store().record_count(),
        relation_records: files.relations.store().record_count(),
        attribute_names: files.attrs.len(),
        ..DataSetStats::default()
    };
    for run in files.nodes.store().runs() {
        run?;
        stats.nodes += 1;
    }
    for run in files.ways.store().runs() {
        run?;
        stats.ways += 1;
    }
    for run in files.relations.store().runs() {
        run?;
        stats.relations += 1;
    }
    Ok(stats)
}
