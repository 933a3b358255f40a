//! Format-version selection for dataset directories.
//!
//! `osmbin.properties` holds `key=value` lines; `version` names the record
//! layout revision the directory was written with. The version is read once
//! at open time and picks the dataset implementation.

use crate::dataset::{DataSet, OsmBinDataSetV10};
use crate::error::StorageError;
use crate::DataSetOptions;
use anyhow::{Context, Result};
use log::info;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

/// Name of the properties file in a dataset directory
pub const PROPERTIES_FILE: &str = "osmbin.properties";

/// Key of the format version in the properties file
const VERSION_KEY: &str = "version";

/// On-disk layout revisions this build reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Layout 1.0: 32-bit ids, 16-char tag slots, big-endian records
    V10,
}

impl FormatVersion {
    /// Version written into fresh directories
    pub const CURRENT: Self = Self::V10;

    /// Value stored under `version=`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V10 => "1.0",
        }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatVersion {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(Self::V10),
            other => Err(StorageError::UnsupportedFormat(other.to_owned())),
        }
    }
}

/// Reads the format version of `dir`
///
/// # Returns
///
/// Returns `None` if the directory has no properties file (or the file has
/// no `version` key)
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedFormat`] for an unknown version, or an
/// I/O error if the file cannot be read.
pub fn read_version(dir: &Path) -> Result<Option<FormatVersion>> {
    let path = dir.join(PROPERTIES_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
    };

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == VERSION_KEY {
                return Ok(Some(value.parse()?));
            }
        }
    }
    Ok(None)
}

/// Checks that `dir` holds `expected`, recording it if no version is set
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedFormat`] if `dir` holds another
/// version, or an I/O error if the properties file cannot be read or written.
pub fn ensure_version(dir: &Path, expected: FormatVersion) -> Result<()> {
    match read_version(dir)? {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(StorageError::UnsupportedFormat(found.to_string()).into()),
        None => {
            let path = dir.join(PROPERTIES_FILE);
            fs::write(&path, format!("{VERSION_KEY}={expected}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("{}: created with format version {}", dir.display(), expected);
            Ok(())
        }
    }
}

/// A dataset opened at whatever version its directory holds
#[derive(Debug)]
pub enum OsmBin {
    /// Format 1.0
    V10(OsmBinDataSetV10),
}

impl OsmBin {
    /// The directory's format version
    #[must_use]
    pub const fn version(&self) -> FormatVersion {
        match self {
            Self::V10(_) => FormatVersion::V10,
        }
    }

    /// The dataset behind the version
    #[must_use]
    pub fn dataset(&self) -> &dyn DataSet {
        match self {
            Self::V10(dataset) => dataset,
        }
    }

    /// Flushes and closes the dataset
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn shutdown(self) -> Result<()> {
        match self {
            Self::V10(dataset) => dataset.shutdown(),
        }
    }
}

/// Opens a dataset directory at the version it was written with
///
/// Fresh directories get [`FormatVersion::CURRENT`].
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedFormat`] for an unknown version, or
/// any error of the selected dataset's `open`.
pub fn open<P: AsRef<Path>>(dir: P, options: DataSetOptions) -> Result<OsmBin> {
    let dir = dir.as_ref();
    let version = if dir.exists() { read_version(dir)? } else { None };

    match version.unwrap_or(FormatVersion::CURRENT) {
        FormatVersion::V10 => Ok(OsmBin::V10(OsmBinDataSetV10::open(dir, options)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_directory_gets_current_version() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_version(dir.path()).unwrap(), None);

        ensure_version(dir.path(), FormatVersion::V10).unwrap();
        assert_eq!(read_version(dir.path()).unwrap(), Some(FormatVersion::V10));
        let text = fs::read_to_string(dir.path().join(PROPERTIES_FILE)).unwrap();
        assert_eq!(text, "version=1.0\n");
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let properties = "# written by a newer build\nversion = 2.0\n";
        fs::write(dir.path().join(PROPERTIES_FILE), properties).unwrap();

        let err = open(dir.path(), DataSetOptions::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::UnsupportedFormat("2.0".to_owned()))
        );
    }

    #[test]
    fn test_open_selects_v10() {
        let dir = TempDir::new().unwrap();
        let osmbin = open(dir.path().join("data"), DataSetOptions::default()).unwrap();
        assert_eq!(osmbin.version(), FormatVersion::V10);
        assert!(osmbin.dataset().get_node_by_id(1).unwrap().is_none());
        osmbin.shutdown().unwrap();
    }
}
