//! Per-document metadata: actor sets, merge clocks, file classification.
//!
//! Actor sets and merge clocks only ever grow (union / pointwise max), so
//! exchanging metadata blocks in any order converges to the same state on
//! every peer. Writability is tracked separately and is only ever learned
//! from the local feed layer — gossiped writable bits are stripped before
//! blocks reach [`Metadata::add_blocks`].
//!
//! Merge-clock entries double as read caps: an actor adopted through
//! [`Metadata::add_actor`] is followed with no cap ([`UNBOUNDED`]), while
//! an actor learned through an explicit merge is read only up to the merged
//! sequence until a peer that follows it fully lifts the cap via gossip.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, UNBOUNDED};
use crate::keys::{ActorId, DocId};

/// Header block of a file feed. Stored as block 0, classified by the
/// presence of the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "File", rename_all = "camelCase")]
pub struct FileHeader {
    pub mime_type: String,
    pub bytes: u64,
}

/// One document's metadata as gossiped between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataBlock {
    pub id: DocId,
    #[serde(default)]
    pub actors: BTreeSet<ActorId>,
    #[serde(default)]
    pub writable: BTreeMap<ActorId, bool>,
    #[serde(default)]
    pub merge: Clock,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_header: Option<FileHeader>,
}

/// Snapshot of one document's metadata for the frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PublicMetadata {
    #[serde(rename_all = "camelCase")]
    Document {
        actors: Vec<ActorId>,
        clock: Clock,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_actor: Option<ActorId>,
    },
    #[serde(rename_all = "camelCase")]
    File { mime_type: String, bytes: u64 },
}

#[derive(Debug, Default)]
struct DocMeta {
    actors: BTreeSet<ActorId>,
    merge: Clock,
    is_file: bool,
    file_header: Option<FileHeader>,
}

/// Authoritative per-document actor sets and head clocks, plus reverse
/// indices from actors to the documents containing them.
#[derive(Debug, Default)]
pub struct Metadata {
    docs: HashMap<DocId, DocMeta>,
    writable: HashMap<ActorId, bool>,
    index: HashMap<ActorId, BTreeSet<DocId>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `actor` into `doc`'s actor set, following its feed with no
    /// cap. Idempotent. Returns the actors newly seen by this process (the
    /// coordinator joins those on the swarm).
    pub fn add_actor(&mut self, doc: DocId, actor: ActorId) -> Vec<ActorId> {
        let newly_seen = !self.index.contains_key(&actor);
        let meta = self.docs.entry(doc).or_default();
        meta.actors.insert(actor);
        meta.merge.set(actor, UNBOUNDED);
        self.index.entry(actor).or_default().insert(doc);
        if newly_seen { vec![actor] } else { vec![] }
    }

    /// Apply remote metadata blocks: union actor sets, pointwise-max merge
    /// clocks, adopt file classification. Returns newly seen actors.
    pub fn add_blocks(&mut self, blocks: Vec<MetadataBlock>) -> Vec<ActorId> {
        let mut newly_seen = Vec::new();
        for block in blocks {
            let meta = self.docs.entry(block.id).or_default();
            meta.merge.union(&block.merge);
            if block.is_file {
                meta.is_file = true;
                if meta.file_header.is_none() {
                    meta.file_header = block.file_header.clone();
                }
            }
            let mut members: BTreeSet<ActorId> = block.actors;
            members.extend(block.merge.actors().copied());
            for actor in members {
                meta.actors.insert(actor);
                let index = self.index.entry(actor).or_default();
                if index.is_empty() {
                    newly_seen.push(actor);
                }
                index.insert(block.id);
            }
        }
        newly_seen
    }

    /// Client-initiated merge: union the clock's actors into the doc's
    /// actor set and the clock into the merge clock. Actors brought in this
    /// way are read only up to the merged sequence. Returns newly seen
    /// actors.
    pub fn merge(&mut self, doc: DocId, clock: &Clock) -> Vec<ActorId> {
        let mut newly_seen = Vec::new();
        let meta = self.docs.entry(doc).or_default();
        meta.merge.union(clock);
        for actor in clock.actors() {
            meta.actors.insert(*actor);
            let index = self.index.entry(*actor).or_default();
            if index.is_empty() {
                newly_seen.push(*actor);
            }
            index.insert(doc);
        }
        newly_seen
    }

    /// Record writability as learned from the feed layer.
    pub fn set_writable(&mut self, actor: ActorId, writable: bool) {
        self.writable.insert(actor, writable);
    }

    /// The single writable actor of `doc`, if any. More than one is a
    /// contract violation.
    pub fn local_actor(&self, doc: &DocId) -> Option<ActorId> {
        let meta = self.docs.get(doc)?;
        let writable: Vec<ActorId> = meta
            .actors
            .iter()
            .copied()
            .filter(|a| self.writable.get(a).copied().unwrap_or(false))
            .collect();
        assert!(
            writable.len() <= 1,
            "document {doc} has {} writable actors",
            writable.len()
        );
        writable.first().copied()
    }

    /// How far into `actor`'s feed this document has requested to read.
    pub fn clock_at(&self, doc: &DocId, actor: &ActorId) -> u64 {
        self.docs.get(doc).map(|m| m.merge.get(actor)).unwrap_or(0)
    }

    pub fn actors(&self, doc: &DocId) -> Vec<ActorId> {
        self.docs
            .get(doc)
            .map(|m| m.actors.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn docs_with(&self, actor: &ActorId) -> Vec<DocId> {
        self.index
            .get(actor)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, doc: &DocId) -> bool {
        self.docs.contains_key(doc)
    }

    pub fn is_file(&self, doc: &DocId) -> bool {
        self.docs.get(doc).map(|m| m.is_file).unwrap_or(false)
    }

    pub fn set_file(&mut self, doc: DocId, header: FileHeader) {
        let meta = self.docs.entry(doc).or_default();
        meta.is_file = true;
        meta.file_header = Some(header);
    }

    pub fn file_header(&self, doc: &DocId) -> Option<&FileHeader> {
        self.docs.get(doc).and_then(|m| m.file_header.as_ref())
    }

    pub fn merge_clock(&self, doc: &DocId) -> Clock {
        self.docs
            .get(doc)
            .map(|m| m.merge.clone())
            .unwrap_or_default()
    }

    /// Drop a document. Actors remain in the writable map; orphan purging
    /// is the coordinator's job.
    pub fn delete(&mut self, doc: &DocId) {
        if let Some(meta) = self.docs.remove(doc) {
            for actor in meta.actors {
                if let Some(set) = self.index.get_mut(&actor) {
                    set.remove(doc);
                    if set.is_empty() {
                        self.index.remove(&actor);
                    }
                }
            }
        }
    }

    /// Union of actor sets across all surviving documents.
    pub fn all_actors(&self) -> BTreeSet<ActorId> {
        self.docs.values().flat_map(|m| m.actors.iter().copied()).collect()
    }

    /// The gossip block for one document.
    pub fn block_for_doc(&self, doc: &DocId) -> Option<MetadataBlock> {
        let meta = self.docs.get(doc)?;
        Some(MetadataBlock {
            id: *doc,
            actors: meta.actors.clone(),
            writable: meta
                .actors
                .iter()
                .map(|a| (*a, self.writable.get(a).copied().unwrap_or(false)))
                .collect(),
            merge: meta.merge.clone(),
            is_file: meta.is_file,
            file_header: meta.file_header.clone(),
        })
    }

    /// Gossip blocks for every document containing `actor`.
    pub fn blocks_for_actor(&self, actor: &ActorId) -> Vec<MetadataBlock> {
        self.docs_with(actor)
            .iter()
            .filter_map(|doc| self.block_for_doc(doc))
            .collect()
    }
}

/// Strip writable bits from gossiped blocks (a peer is only authoritative
/// about its own writability, which is learned from the feed layer) and
/// make sure each block's root actor is a member of its own actor set.
pub fn sanitize_remote_metadata(blocks: Vec<MetadataBlock>) -> Vec<MetadataBlock> {
    blocks
        .into_iter()
        .map(|mut block| {
            block.writable.clear();
            block.actors.insert(block.id.root_actor());
            block
        })
        .collect()
}
