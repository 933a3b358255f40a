//! Typed storage conditions that callers need to match on.
//!
//! Operations return `anyhow::Result`; the variants below travel inside the
//! `anyhow::Error` and are recovered with [`anyhow::Error::downcast_ref`].

use thiserror::Error;

/// Storage-layer conditions with a defined recovery (or a defined lack of one).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A write found a record still owned by another live entity.
    ///
    /// The writer relocates to a fresh run instead of overwriting.
    #[error("record {record} is owned by id {owner}, refusing to overwrite it with id {writer}")]
    RecordInUse {
        /// Physical record number
        record: u32,
        /// Id currently stored in the record header
        owner: i32,
        /// Id that attempted the write
        writer: i32,
    },

    /// Invalidating a record expected to belong to `expected` found `found`.
    #[error("record {record} holds id {found} but was expected to hold id {expected}")]
    Inconsistent {
        /// Physical record number
        record: u32,
        /// Id found in the record header
        found: i32,
        /// Id the caller expected
        expected: i32,
    },

    /// The on-disk layout stores 32-bit ids.
    #[error("entity id {0} does not fit the 32-bit on-disk id field")]
    IdOverflow(i64),

    /// Record number at or beyond the end of the file.
    #[error("record {record} is beyond the end of the file ({count} records)")]
    RecordOutOfRange {
        /// Requested record number
        record: u32,
        /// Records currently in the file
        count: u32,
    },

    /// Every 16-bit attribute id is taken.
    #[error("attribute name table is full ({0} names)")]
    AttrNamesFull(usize),

    /// `osmbin.properties` names a format this build cannot read.
    #[error("unsupported osmbin format version '{0}'")]
    UnsupportedFormat(String),

    /// The tile saver has already been shut down.
    #[error("tile save queue is closed")]
    QueueClosed,
}

/// Narrow an entity id to the on-disk 32-bit field.
///
/// # Errors
///
/// Returns [`StorageError::IdOverflow`] if `id` is outside `i32` or equals
/// the free-record sentinel `i32::MIN`.
pub fn narrow_id(id: i64) -> anyhow::Result<i32> {
    match i32::try_from(id) {
        Ok(narrow) if narrow != i32::MIN => Ok(narrow),
        _ => Err(StorageError::IdOverflow(id).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_id_accepts_32_bit_range() {
        assert_eq!(narrow_id(1001).unwrap(), 1001);
        assert_eq!(narrow_id(-5).unwrap(), -5);
        assert_eq!(narrow_id(i64::from(i32::MAX)).unwrap(), i32::MAX);
    }

    #[test]
    fn test_narrow_id_rejects_overflow_and_sentinel() {
        for id in [i64::from(i32::MAX) + 1, i64::from(i32::MIN), i64::MAX] {
            let err = narrow_id(id).unwrap_err();
            assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::IdOverflow(id)));
        }
    }
}
