//! Fixed-width record layouts shared by the node, way and relation files.
//!
//! # Layout
//!
//! ```text
//! [id:i32][version:i32][header words:i32 * H]
//! [tag slot 0: key:i16 + value:u16 * C] ... [tag slot T-1]
//! [ref group 0: (i32 * W0) * R0] [ref group 1: (i32 * W1) * R1] ...
//! ```
//!
//! All integers are big-endian. An entity that needs more tag or reference
//! slots than one record holds spans a consecutive run of records; every
//! record of the run repeats the id, version and header words.
//!
//! Changing any constant here changes the file format.

use crate::entity::tags::TagSlot;
use byteorder::{BigEndian, ByteOrder};

/// Id of a free record
pub const FREE_ID: i32 = i32::MIN;

/// Empty reference slot (first word of the slot)
pub const EMPTY_REF: i32 = i32::MIN;

/// Empty tag slot key
pub const EMPTY_KEY: i16 = i16::MIN;

/// Key of a slot continuing the previous slot's value
pub const CONTINUATION_KEY: i16 = i16::MIN + 1;

/// Padding code unit for unused tag value space
pub const PAD: u16 = 0;

/// Byte offset of the version field
const VERSION_OFFSET: usize = 4;

/// Byte offset of the first header word
const HEADER_WORDS_OFFSET: usize = 8;

/// A repeated group of reference slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefGroup {
    /// Slots of this group in every record
    pub per_record: usize,
    /// `i32` words per slot
    pub words: usize,
}

/// Per-entity-type record geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// `i32` header words after id and version
    pub header_words: usize,
    /// Tag slots in every record
    pub tags_per_record: usize,
    /// UTF-16 code units per tag slot value
    pub chars_per_tag: usize,
    /// Reference slot groups in record order
    pub ref_groups: &'static [RefGroup],
}

/// The decoded contents of one entity run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRun {
    /// Entity id (32-bit on disk)
    pub id: i32,
    /// Version counter
    pub version: i32,
    /// Header words from the first record
    pub header: Vec<i32>,
    /// Non-empty tag slots in order
    pub tags: Vec<TagSlot>,
    /// Non-empty references per group, flattened to `words` per slot
    pub refs: Vec<Vec<i32>>,
}

impl RecordLayout {
    /// Bytes per tag slot
    #[must_use]
    pub const fn tag_slot_len(&self) -> usize {
        2 + 2 * self.chars_per_tag
    }

    /// Bytes of the fixed header (id, version, header words)
    #[must_use]
    pub const fn header_len(&self) -> usize {
        HEADER_WORDS_OFFSET + 4 * self.header_words
    }

    /// Bytes per record
    #[must_use]
    pub const fn record_len(&self) -> usize {
        let mut len = self.header_len() + self.tags_per_record * self.tag_slot_len();
        let mut g = 0;
        while g < self.ref_groups.len() {
            len += self.ref_groups[g].per_record * self.ref_groups[g].words * 4;
            g += 1;
        }
        len
    }

    /// Byte offset of tag slot `slot` within a record
    #[must_use]
    pub const fn tag_offset(&self, slot: usize) -> usize {
        self.header_len() + slot * self.tag_slot_len()
    }

    /// Byte offset of slot `slot` of reference group `group` within a record
    #[must_use]
    pub fn ref_offset(&self, group: usize, slot: usize) -> usize {
        let mut offset = self.tag_offset(self.tags_per_record);
        for previous in self.ref_groups.iter().take(group) {
            offset += previous.per_record * previous.words * 4;
        }
        offset + slot * self.ref_groups.get(group).map_or(0, |g| g.words * 4)
    }

    /// Records needed for `tag_slots` tag slots and `ref_counts[g]` references per group
    #[must_use]
    pub fn records_needed(&self, tag_slots: usize, ref_counts: &[usize]) -> u32 {
        let mut needed = tag_slots.div_ceil(self.tags_per_record.max(1));
        for (group, &count) in self.ref_groups.iter().zip(ref_counts) {
            needed = needed.max(count.div_ceil(group.per_record.max(1)));
        }
        u32::try_from(needed.max(1)).unwrap_or(u32::MAX)
    }

    /// Encodes an entity into its run of records
    ///
    /// `refs[g]` holds the flattened words of group `g` (`words` per slot).
    #[must_use]
    pub fn encode(
        &self,
        id: i32,
        version: i32,
        header: &[i32],
        tags: &[TagSlot],
        refs: &[Vec<i32>],
    ) -> Vec<Vec<u8>> {
        let ref_counts: Vec<usize> =
            self.ref_groups
                .iter()
                .zip(refs)
                .map(|(group, words)| words.len() / group.words.max(1))
                .collect();
        let count = self.records_needed(tags.len(), &ref_counts) as usize;

        (0..count)
            .map(|r| {
                let mut buf = vec![0u8; self.record_len()];
                write_header(&mut buf, id, version, header);

                for slot in 0..self.tags_per_record {
                    let tag = tags.get(r * self.tags_per_record + slot);
                    write_attribute(&mut buf[self.tag_offset(slot)..], tag, self.chars_per_tag);
                }

                for (g, group) in self.ref_groups.iter().enumerate() {
                    let words = refs.get(g).map_or(&[][..], Vec::as_slice);
                    for slot in 0..group.per_record {
                        let at = self.ref_offset(g, slot);
                        let first = (r * group.per_record + slot) * group.words;
                        for w in 0..group.words {
                            let value = words.get(first + w).copied().unwrap_or(EMPTY_REF);
                            BigEndian::write_i32(&mut buf[at + 4 * w..], value);
                        }
                    }
                }
                buf
            })
            .collect()
    }

    /// Decodes a run of records previously produced by [`RecordLayout::encode`]
    #[must_use]
    pub fn decode(&self, records: &[Vec<u8>]) -> Option<DecodedRun> {
        let first = records.first()?;
        let (id, version) = read_header(first);
        let header = (0..self.header_words)
            .map(|w| header_word(first, w))
            .collect();

        let mut tags = Vec::new();
        let mut refs = vec![Vec::new(); self.ref_groups.len()];
        for buf in records {
            for slot in 0..self.tags_per_record {
                let tag = read_attribute(&buf[self.tag_offset(slot)..], self.chars_per_tag);
                if let Some(tag) = tag {
                    tags.push(tag);
                }
            }
            for (g, group) in self.ref_groups.iter().enumerate() {
                for slot in 0..group.per_record {
                    let at = self.ref_offset(g, slot);
                    if BigEndian::read_i32(&buf[at..]) == EMPTY_REF {
                        continue;
                    }
                    if let Some(words) = refs.get_mut(g) {
                        words.extend(
                            (0..group.words).map(|w| BigEndian::read_i32(&buf[at + 4 * w..])),
                        );
                    }
                }
            }
        }

        Some(DecodedRun { id, version, header, tags, refs })
    }
}

/// Reads `(id, version)` from the start of a record
#[must_use]
pub fn read_header(record: &[u8]) -> (i32, i32) {
    (BigEndian::read_i32(record), BigEndian::read_i32(&record[VERSION_OFFSET..]))
}

/// Reads header word `word` (after id and version) from a record
#[must_use]
pub fn header_word(record: &[u8], word: usize) -> i32 {
    BigEndian::read_i32(&record[HEADER_WORDS_OFFSET + 4 * word..])
}

/// Writes id, version and header words
pub fn write_header(record: &mut [u8], id: i32, version: i32, header: &[i32]) {
    BigEndian::write_i32(record, id);
    BigEndian::write_i32(&mut record[VERSION_OFFSET..], version);
    for (w, &word) in header.iter().enumerate() {
        BigEndian::write_i32(&mut record[HEADER_WORDS_OFFSET + 4 * w..], word);
    }
}

/// Writes one tag slot: key id (or [`EMPTY_KEY`]) then the value padded with [`PAD`]
pub fn write_attribute(slot: &mut [u8], tag: Option<&TagSlot>, chars_per_tag: usize) {
    let key = tag.map_or(EMPTY_KEY, |t| t.key);
    BigEndian::write_i16(slot, key);
    let value = tag.map_or(&[][..], |t| t.value.as_slice());
    for c in 0..chars_per_tag {
        BigEndian::write_u16(&mut slot[2 + 2 * c..], value.get(c).copied().unwrap_or(PAD));
    }
}

/// Reads one tag slot, stripping trailing padding; `None` for an empty slot
#[must_use]
pub fn read_attribute(slot: &[u8], chars_per_tag: usize) -> Option<TagSlot> {
    let key = BigEndian::read_i16(slot);
    if key == EMPTY_KEY {
        return None;
    }
    let mut value: Vec<u16> =
        (0..chars_per_tag).map(|c| BigEndian::read_u16(&slot[2 + 2 * c..])).collect();
    while value.last() == Some(&PAD) {
        value.pop();
    }
    Some(TagSlot { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUPS: &[RefGroup] =
        &[RefGroup { per_record: 2, words: 1 }, RefGroup { per_record: 1, words: 3 }];
    const LAYOUT: RecordLayout =
        RecordLayout { header_words: 1, tags_per_record: 2, chars_per_tag: 4, ref_groups: GROUPS };

    #[test]
    fn test_record_len() {
        // 12 header + 2 * (2 + 8) tags + 2 * 4 + 1 * 12 refs
        assert_eq!(LAYOUT.record_len(), 12 + 20 + 8 + 12);
        assert_eq!(LAYOUT.ref_offset(1, 0), 12 + 20 + 8);
    }

    #[test]
    fn test_records_needed_takes_the_largest_demand() {
        assert_eq!(LAYOUT.records_needed(0, &[0, 0]), 1);
        assert_eq!(LAYOUT.records_needed(3, &[0, 0]), 2);
        assert_eq!(LAYOUT.records_needed(1, &[5, 0]), 3);
        assert_eq!(LAYOUT.records_needed(1, &[1, 4]), 4);
    }

    #[test]
    fn test_encode_decode_multi_record() {
        let tags: Vec<TagSlot> = (0..3)
            .map(|k| TagSlot { key: k, value: "ab".encode_utf16().collect() })
            .collect();
        let refs = vec![vec![10, 11, 12], vec![1, 2, 3]];
        let records = LAYOUT.encode(77, 3, &[-9], &tags, &refs);
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(read_header(record), (77, 3));
        }

        let run = LAYOUT.decode(&records).unwrap();
        assert_eq!(run.header, vec![-9]);
        assert_eq!(run.tags, tags);
        assert_eq!(run.refs, refs);
    }

    #[test]
    fn test_attribute_padding_is_stripped() {
        let mut slot = vec![0u8; LAYOUT.tag_slot_len()];
        let tag = TagSlot { key: 5, value: vec![0x41, 0x42] };
        write_attribute(&mut slot, Some(&tag), 4);
        assert_eq!(read_attribute(&slot, 4), Some(tag));

        write_attribute(&mut slot, None, 4);
        assert_eq!(read_attribute(&slot, 4), None);
    }
}
