//! Advisory occupancy bitmap over record numbers.
//!
//! Not persisted and never authoritative: a clear bit means "unknown", the
//! record header decides. A set bit lets the free-run scan skip a record
//! without reading it.

const WORD_BITS: u32 = u64::BITS;

/// Bitmap of records known to be occupied
#[derive(Debug, Default, Clone)]
pub struct UsedRecords {
    words: Vec<u64>,
}

impl UsedRecords {
    /// Create an empty bitmap
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `record` is known to be occupied
    #[inline]
    pub fn contains(&self, record: u32) -> bool {
        let (word, bit) = Self::locate(record);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Mark `record` as occupied
    pub fn insert(&mut self, record: u32) {
        let (word, bit) = Self::locate(record);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        if let Some(w) = self.words.get_mut(word) {
            *w |= bit;
        }
    }

    /// Forget that `record` is occupied
    pub fn remove(&mut self, record: u32) {
        let (word, bit) = Self::locate(record);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.words.clear();
    }

    #[inline]
    fn locate(record: u32) -> (usize, u64) {
        ((record / WORD_BITS) as usize, 1u64 << (record % WORD_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut used = UsedRecords::new();
        assert!(!used.contains(130));
        used.insert(130);
        used.insert(0);
        assert!(used.contains(130));
        assert!(used.contains(0));
        assert!(!used.contains(129));
        used.remove(130);
        assert!(!used.contains(130));
        used.remove(10_000);
    }
}
