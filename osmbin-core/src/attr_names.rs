//! Persistent string-interning table for tag keys and member roles.
//!
//! `attrnames.txt` holds one name per line; the zero-based line number is
//! the name's id. Ids are handed out in append order and never change.

use crate::error::StorageError;
use anyhow::{Context, Result};
use fs2::FileExt;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Number of distinct names a 16-bit id can address (0..=i16::MAX)
const MAX_NAMES: usize = i16::MAX as usize + 1;

#[derive(Debug)]
struct Inner {
    names: Vec<String>,
    ids: HashMap<String, i16>,
    writer: BufWriter<File>,
}

/// Interned attribute names shared by the node, way and relation files
#[derive(Debug)]
pub struct AttrNames {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl AttrNames {
    /// Opens or creates the name table at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, locked or read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Failed to open attribute names: {}", path.display()))?;

        file.try_lock_exclusive()
            .with_context(|| {
                format!("Attribute names are already open by another process: {}", path.display())
            })?;

        let mut names = Vec::new();
        let mut ids = HashMap::new();
        for line in BufReader::new(&file).lines() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let name = unescape(&line);
            let id = i16::try_from(names.len())
                .map_err(|_| StorageError::AttrNamesFull(names.len()))?;
            ids.entry(name.clone()).or_insert(id);
            names.push(name);
        }

        debug!("{}: loaded {} attribute names", path.display(), names.len());

        Ok(Self {
            inner: RwLock::new(Inner { names, ids, writer: BufWriter::new(file) }),
            path: path.to_path_buf(),
        })
    }

    /// Returns the id of `name` if it is already interned
    pub fn id_of(&self, name: &str) -> Option<i16> {
        self.inner.read().ids.get(name).copied()
    }

    /// Returns the id of `name`, appending it to the table if necessary
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AttrNamesFull`] if every id is taken, or an
    /// I/O error if the new name cannot be appended.
    pub fn intern(&self, name: &str) -> Result<i16> {
        if let Some(id) = self.id_of(name) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids.get(name) {
            return Ok(id);
        }
        if inner.names.len() >= MAX_NAMES {
            return Err(StorageError::AttrNamesFull(inner.names.len()).into());
        }

        let id = i16::try_from(inner.names.len())
            .map_err(|_| StorageError::AttrNamesFull(MAX_NAMES))?;
        writeln!(inner.writer, "{}", escape(name))
            .and_then(|()| inner.writer.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        inner.names.push(name.to_owned());
        inner.ids.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Returns the name for `id`
    pub fn name(&self, id: i16) -> Option<String> {
        let index = usize::try_from(id).ok()?;
        self.inner.read().names.get(index).cloned()
    }

    /// Number of interned names
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// True if no name is interned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces appended names to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or fsync fails.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.writer.flush()?;
        inner
            .writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("Failed to sync {}", self.path.display()))
    }
}

fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_intern_is_stable_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attrnames.txt");
        {
            let names = AttrNames::open(&path).unwrap();
            assert_eq!(names.intern("name").unwrap(), 0);
            assert_eq!(names.intern("highway").unwrap(), 1);
            assert_eq!(names.intern("name").unwrap(), 0);
            assert_eq!(names.intern("multi\nline\\key").unwrap(), 2);
        }

        let names = AttrNames::open(&path).unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.id_of("highway"), Some(1));
        assert_eq!(names.name(2).as_deref(), Some("multi\nline\\key"));
        assert_eq!(names.intern("surface").unwrap(), 3);
    }

    #[test]
    fn test_unknown_and_negative_ids() {
        let dir = TempDir::new().unwrap();
        let names = AttrNames::open(dir.path().join("attrnames.txt")).unwrap();
        assert_eq!(names.name(0), None);
        assert_eq!(names.name(-1), None);
    }

    #[test]
    fn test_escape_round_trip() {
        for s in ["plain", "a\\nb", "tab\there", "\r\n", "trailing\\"] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }
}
