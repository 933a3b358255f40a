//! Relation records with typed members and interned roles.

use crate::attr_names::AttrNames;
use crate::entity::layout::{RecordLayout, RefGroup};
use crate::entity::store::{RecordStore, Run};
use crate::entity::tags::{join_tag_slots, prepare_tag_list};
use crate::error::narrow_id;
use crate::model::{EntityType, Member, Relation};
use anyhow::{Context, Result};
use log::{error, trace};
use std::path::Path;
use std::sync::Arc;

/// A relation record has one reference group: members as
/// `(id, type ordinal, role id)` triples
const RELATION_REF_GROUPS: &[RefGroup] = &[RefGroup { per_record: 4, words: 3 }];

/// Relation record: `id, version`, 4 tag slots of 16 chars, 4 members
/// (192 bytes)
pub const RELATION_LAYOUT: RecordLayout =
    RecordLayout {
        header_words: 0,
        tags_per_record: 4,
        chars_per_tag: 16,
        ref_groups: RELATION_REF_GROUPS,
    };

/// `relations.obm` with its id index (`relations.idx`)
#[derive(Debug)]
pub struct RelationsFile {
    store: RecordStore,
    attrs: Arc<AttrNames>,
}

impl RelationsFile {
    /// Opens or creates the relation files in `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if any of the files cannot be opened.
    pub fn open(dir: &Path, attrs: Arc<AttrNames>, spare_records: u32) -> Result<Self> {
        let store = RecordStore::open(
            "relations",
            &dir.join("relations.obm"),
            &dir.join("relations.idx"),
            RELATION_LAYOUT.record_len(),
            spare_records,
        )?;
        Ok(Self { store, attrs })
    }

    /// Writes (or rewrites) a relation; roles are interned like tag keys
    ///
    /// # Errors
    ///
    /// Returns an error if an id does not fit 32 bits, a role cannot be
    /// interned or the files cannot be written.
    pub fn write_relation(&mut self, relation: &Relation) -> Result<u32> {
        let id = narrow_id(relation.id)?;
        let tags = prepare_tag_list(&relation.tags, &self.attrs, RELATION_LAYOUT.chars_per_tag)?;

        let mut members = Vec::with_capacity(relation.members.len() * 3);
        for member in &relation.members {
            members.push(narrow_id(member.id)?);
            members.push(member.kind.ordinal());
            members.push(i32::from(self.attrs.intern(&member.role)?));
        }

        let records = RELATION_LAYOUT.encode(id, relation.version, &[], &tags, &[members]);
        let outcome = self.store.write_element(id, &records)?;
        trace!("relations: wrote id {} at {} ({} records)", id, outcome.start, records.len());
        Ok(outcome.start)
    }

    /// Reads a relation by id
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn read_relation(&self, id: i64) -> Result<Option<Relation>> {
        let Some(run) = self.store.read_element(narrow_id(id)?)? else {
            return Ok(None);
        };
        self.decode(&run).map(Some)
    }

    /// Removes a relation
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be written.
    pub fn remove_relation(&mut self, id: i64) -> Result<Option<Relation>> {
        let Some(relation) = self.read_relation(id)? else {
            return Ok(None);
        };
        self.store.remove_element(narrow_id(id)?)?;
        Ok(Some(relation))
    }

    /// Returns the first record of relation `id`
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not fit 32 bits or the files cannot
    /// be read.
    pub fn find_record_for_relation(&self, id: i64) -> Result<Option<u32>> {
        self.store.find_record_for_element(narrow_id(id)?)
    }

    /// True if relation `id` is stored
    ///
    /// # Errors
    ///
    /// See [`RelationsFile::find_record_for_relation`].
    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.find_record_for_relation(id)?.is_some())
    }

    /// Iterates every stored relation in record order
    pub fn relations(&self) -> impl Iterator<Item = Result<Relation>> + '_ {
        self.store.runs().map(|run| run.and_then(|run| self.decode(&run)))
    }

    /// Rebuilds `relations.idx` from a full scan of `relations.obm`
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or written.
    pub fn rebuild_index(&mut self) -> Result<u32> {
        self.store.rebuild_index(|_, _, _| Ok(()))
    }

    /// The underlying run store
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Flushes records and index to disk
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    fn decode(&self, run: &Run) -> Result<Relation> {
        let decoded = RELATION_LAYOUT.decode(&run.records).context("Empty relation run")?;
        let id = i64::from(decoded.id);
        let words = decoded.refs.into_iter().next().unwrap_or_default();

        let mut members = Vec::with_capacity(words.len() / 3);
        for triple in words.chunks_exact(3) {
            let &[member_id, ordinal, role] = triple else { continue };
            let Some(kind) = EntityType::from_ordinal(ordinal) else {
                error!("relation {id}: member {member_id} has unknown type {ordinal}, skipping it");
                continue;
            };
            let name = i16::try_from(role).ok().and_then(|role| self.attrs.name(role));
            let role = name.unwrap_or_else(|| {
                error!("relation {id}: member {member_id} has unknown role id {role}");
                String::new()
            });
            members.push(Member { kind, id: i64::from(member_id), role });
        }

        let tags = join_tag_slots(id, decoded.tags, &self.attrs);
        Ok(Relation { id, version: decoded.version, tags, members })
    }
}
