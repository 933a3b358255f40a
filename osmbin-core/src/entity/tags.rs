//! Tag lists split into fixed-width slots and joined back together.

use crate::attr_names::AttrNames;
use crate::entity::layout::CONTINUATION_KEY;
use crate::model::Tags;
use anyhow::Result;
use log::error;

/// One fixed-width tag slot: an interned key (or [`CONTINUATION_KEY`]) and
/// at most `chars_per_tag` UTF-16 code units of value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSlot {
    /// Interned key id or a sentinel
    pub key: i16,
    /// Value code units, unpadded
    pub value: Vec<u16>,
}

/// Splits a tag list into slots no wider than `max_chars_per_slot`
///
/// A value longer than a slot becomes a leading slot carrying the key and
/// as many continuation slots as the remainder needs. A continuation slot
/// never comes first.
///
/// # Errors
///
/// Returns an error if a key cannot be interned.
pub fn prepare_tag_list(
    tags: &Tags,
    attrs: &AttrNames,
    max_chars_per_slot: usize,
) -> Result<Vec<TagSlot>> {
    let width = max_chars_per_slot.max(1);
    let mut slots = Vec::with_capacity(tags.len());

    for (key, value) in tags {
        let key_id = attrs.intern(key)?;
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.is_empty() {
            slots.push(TagSlot { key: key_id, value: Vec::new() });
            continue;
        }
        for (n, chunk) in units.chunks(width).enumerate() {
            let key = if n == 0 { key_id } else { CONTINUATION_KEY };
            slots.push(TagSlot { key, value: chunk.to_vec() });
        }
    }

    Ok(slots)
}

/// Reassembles slots produced by [`prepare_tag_list`]
///
/// Continuations are joined at code-unit level, so a surrogate pair split
/// across two slots survives. Unknown key ids and orphan continuations are
/// logged and skipped.
pub fn join_tag_slots(entity: i64, slots: Vec<TagSlot>, attrs: &AttrNames) -> Tags {
    let mut joined: Vec<(String, Vec<u16>)> = Vec::with_capacity(slots.len());
    let mut skipping = false;

    for slot in slots {
        if slot.key == CONTINUATION_KEY {
            match joined.last_mut() {
                Some((_, value)) if !skipping => value.extend(slot.value),
                Some(_) => {}
                None => error!("entity {entity}: orphan continuation slot, ignoring it"),
            }
            continue;
        }

        match attrs.name(slot.key) {
            Some(key) => {
                joined.push((key, slot.value));
                skipping = false;
            }
            None => {
                error!("entity {entity}: unknown attribute id {}, dropping the tag", slot.key);
                skipping = true;
            }
        }
    }

    joined.into_iter().map(|(key, units)| (key, String::from_utf16_lossy(&units))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn attrs(dir: &TempDir) -> AttrNames {
        AttrNames::open(dir.path().join("attrnames.txt")).unwrap()
    }

    #[test]
    fn test_exact_width_fits_one_slot() {
        let dir = TempDir::new().unwrap();
        let attrs = attrs(&dir);
        let tags = Tags::from([("name".to_owned(), "abcd".to_owned())]);

        let slots = prepare_tag_list(&tags, &attrs, 4).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(join_tag_slots(1, slots, &attrs), tags);
    }

    #[test]
    fn test_one_over_width_uses_continuation() {
        let dir = TempDir::new().unwrap();
        let attrs = attrs(&dir);
        let tags = Tags::from([("name".to_owned(), "abcde".to_owned())]);

        let slots = prepare_tag_list(&tags, &attrs, 4).unwrap();
        assert_eq!(slots.len(), 2);
        assert_ne!(slots[0].key, CONTINUATION_KEY);
        assert_eq!(slots[1].key, CONTINUATION_KEY);
        assert_eq!(join_tag_slots(1, slots, &attrs), tags);
    }

    #[test]
    fn test_surrogate_pair_split_across_slots() {
        let dir = TempDir::new().unwrap();
        let attrs = attrs(&dir);
        // "a" + U+1F5FA (two code units) + "b": the pair straddles a 2-unit slot boundary
        let tags = Tags::from([("note".to_owned(), "a\u{1F5FA}b".to_owned())]);

        let slots = prepare_tag_list(&tags, &attrs, 2).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(join_tag_slots(1, slots, &attrs), tags);
    }

    #[test]
    fn test_empty_value_and_orphan_continuation() {
        let dir = TempDir::new().unwrap();
        let attrs = attrs(&dir);
        let tags = Tags::from([("area".to_owned(), String::new())]);
        let mut slots = prepare_tag_list(&tags, &attrs, 4).unwrap();
        assert_eq!(slots.len(), 1);

        slots.insert(0, TagSlot { key: CONTINUATION_KEY, value: vec![0x78] });
        assert_eq!(join_tag_slots(1, slots, &attrs), tags);
    }
}
