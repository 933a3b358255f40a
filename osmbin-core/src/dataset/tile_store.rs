//! Tile files and the background worker that writes them.
//!
//! A tile is saved as one bincode file, `<x>_<y>.tile`. Producers hand the
//! worker full snapshots over a bounded channel and block while it is full.
//! The worker drains whatever is queued, keeps only the newest snapshot per
//! tile, and replaces each file atomically (temp file, fsync, rename).

use crate::error::StorageError;
use crate::model::{Node, Relation, Way};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{error, trace};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// File name suffix of a saved tile
pub(super) const TILE_SUFFIX: &str = ".tile";

/// Column (`x`, from longitude) and row (`y`, from latitude) of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    /// Column, counted from longitude -180
    pub x: i32,
    /// Row, counted from latitude -90
    pub y: i32,
}

impl TileKey {
    /// Chebyshev distance in tiles
    #[must_use]
    pub fn ring_distance(self, other: TileKey) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    fn file_name(self) -> String {
        format!("{}_{}{TILE_SUFFIX}", self.x, self.y)
    }

    /// Parses a tile file name back into its key
    pub(super) fn from_file_name(name: &str) -> Option<Self> {
        let (x, y) = name.strip_suffix(TILE_SUFFIX)?.split_once('_')?;
        Some(Self { x: x.parse().ok()?, y: y.parse().ok()? })
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.x, self.y)
    }
}

/// The entities placed in one tile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(super) struct Tile {
    pub nodes: BTreeMap<i64, Node>,
    pub ways: BTreeMap<i64, Way>,
    pub relations: BTreeMap<i64, Relation>,
}

impl Tile {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }
}

/// Reads the tile `key` from `dir`; `None` if it was never saved
pub(super) fn load_tile(dir: &Path, key: TileKey) -> Result<Option<Tile>> {
    load_bincode(&dir.join(key.file_name()))
}

/// Writes (or, for an empty tile, deletes) the file of tile `key`
pub(super) fn save_tile(dir: &Path, key: TileKey, tile: &Tile) -> Result<()> {
    let path = dir.join(key.file_name());
    if tile.is_empty() {
        return match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
        };
    }
    save_bincode(&path, tile)
}

/// Reads a bincode file; `None` if it does not exist
pub(super) fn load_bincode<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = bincode::deserialize(&bytes)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok(Some(value))
}

/// Replaces `path` with the bincode encoding of `value`
pub(super) fn save_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)
        .with_context(|| format!("Failed to encode {}", path.display()))?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file =
        File::create(&temp).with_context(|| format!("Failed to create {}", temp.display()))?;
    file.write_all(&bytes)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    fs::rename(&temp, path).with_context(|| format!("Failed to replace {}", path.display()))
}

/// Work items for the saver
pub(super) enum SaveRequest {
    /// Newest contents of a tile
    Tile(TileKey, Box<Tile>),
    /// Answered with the tiles that failed to save since the last barrier,
    /// once everything queued before it is on disk
    Barrier(Sender<Vec<TileKey>>),
}

/// Handle to the saver thread
#[derive(Debug)]
pub(super) struct Saver {
    sender: Option<Sender<SaveRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl Saver {
    /// Starts the worker with a queue of `capacity` requests
    pub fn spawn(dir: PathBuf, capacity: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let worker = thread::Builder::new()
            .name("osmbin-tile-saver".to_owned())
            .spawn(move || run(&dir, &receiver))
            .context("Failed to start the tile saver")?;
        Ok(Self { sender: Some(sender), worker: Some(worker) })
    }

    /// Queues a snapshot, blocking while the queue is full
    pub fn save(&self, key: TileKey, tile: Tile) -> Result<()> {
        self.send(SaveRequest::Tile(key, Box::new(tile)))
    }

    /// Waits until everything queued so far is written
    ///
    /// Returns the tiles that failed to save since the previous barrier.
    pub fn barrier(&self) -> Result<Vec<TileKey>> {
        let (reply, done) = crossbeam_channel::bounded(1);
        self.send(SaveRequest::Barrier(reply))?;
        done.recv().map_err(|_| StorageError::QueueClosed.into())
    }

    /// Closes the queue and waits for the worker to drain it
    pub fn close(&mut self) -> Result<()> {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| anyhow::anyhow!("Tile saver thread panicked"))?;
        }
        Ok(())
    }

    fn send(&self, request: SaveRequest) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(StorageError::QueueClosed)?;
        sender.send(request).map_err(|_| StorageError::QueueClosed.into())
    }
}

impl Drop for Saver {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("{err:#}");
        }
    }
}

fn run(dir: &Path, receiver: &Receiver<SaveRequest>) {
    let mut pending: BTreeMap<TileKey, Box<Tile>> = BTreeMap::new();
    let mut barriers = Vec::new();
    let mut failed = Vec::new();

    while let Ok(first) = receiver.recv() {
        for request in std::iter::once(first).chain(receiver.try_iter()) {
            match request {
                SaveRequest::Tile(key, tile) => {
                    pending.insert(key, tile);
                }
                SaveRequest::Barrier(reply) => barriers.push(reply),
            }
        }

        for (key, tile) in std::mem::take(&mut pending) {
            match save_tile(dir, key, &tile) {
                Ok(()) => trace!("saved tile {} ({} entities)", key, tile.len()),
                Err(err) => {
                    error!("Failed to save tile {key}: {err:#}");
                    failed.push(key);
                }
            }
        }

        for reply in barriers.drain(..) {
            // the flusher may have given up waiting
            let _ = reply.send(std::mem::take(&mut failed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_names_round_trip_negative_keys() {
        let key = TileKey { x: -3, y: 1799 };
        assert_eq!(key.file_name(), "-3_1799.tile");
        assert_eq!(TileKey::from_file_name("-3_1799.tile"), Some(key));
        assert_eq!(TileKey::from_file_name("index.bin"), None);
        assert_eq!(TileKey::from_file_name("1_2.tile.tmp"), None);
    }

    #[test]
    fn test_saver_writes_newest_snapshot_and_removes_empty_tiles() {
        let dir = TempDir::new().unwrap();
        let mut saver = Saver::spawn(dir.path().to_path_buf(), 2).unwrap();
        let key = TileKey { x: 1, y: 2 };

        let mut tile = Tile::default();
        tile.nodes.insert(1, Node::new(1, 1, 0.0, 0.0));
        saver.save(key, tile.clone()).unwrap();
        tile.nodes.insert(2, Node::new(2, 1, 0.0, 0.0));
        saver.save(key, tile.clone()).unwrap();
        assert!(saver.barrier().unwrap().is_empty());
        assert_eq!(load_tile(dir.path(), key).unwrap(), Some(tile));

        saver.save(key, Tile::default()).unwrap();
        saver.close().unwrap();
        assert_eq!(load_tile(dir.path(), key).unwrap(), None);
    }

    #[test]
    fn test_closed_saver_rejects_work() {
        let dir = TempDir::new().unwrap();
        let mut saver = Saver::spawn(dir.path().to_path_buf(), 1).unwrap();
        saver.close().unwrap();
        let err = saver.save(TileKey { x: 0, y: 0 }, Tile::default()).unwrap_err();
        assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::QueueClosed));
    }
}
