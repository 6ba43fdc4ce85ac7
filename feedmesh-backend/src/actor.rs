//! Per-feed actor lifecycle.
//!
//! An actor wraps one feed and classifies it lazily on its first block:
//! a block 0 with a `type` field is a file header, anything else is the
//! first CRDT change. Document feeds keep an in-order parsed change
//! sequence (block `i` holds change seq `i + 1`); file feeds keep the raw
//! chunk blocks plus the header.
//!
//! Readiness and sync are latches flipped by the coordinator when it
//! processes the corresponding events; work that needs a latch (file
//! reads, document loads) is deferred until it flips.

use std::collections::HashSet;

use tokio::sync::oneshot;

use crate::crdt::Change;
use crate::error::RepoError;
use crate::feed::Feed;
use crate::keys::{ActorId, PeerId};
use crate::meta::FileHeader;

/// File feeds are chunked into fixed-size blocks after the header.
pub const FILE_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unknown,
    Document,
    File,
}

/// Notifications an actor hands the coordinator, delivered through the
/// single event queue.
#[derive(Debug)]
pub enum ActorEvent {
    /// The feed is open and its existing blocks are ingested.
    FeedReady,
    /// A brand-new writable feed was created (nothing to gossip yet).
    Initialized,
    /// The feed caught up; propagate new changes into documents.
    Sync,
    /// A block arrived from the network (drives download progress UI).
    Download { index: u64, size: u64, time: i64 },
}

type FileReply = oneshot::Sender<Result<(FileHeader, Vec<u8>), RepoError>>;

pub struct Actor {
    pub id: ActorId,
    pub feed: Feed,
    pub classification: Classification,
    /// Parsed changes, for document feeds. Dense: index `i` holds seq `i+1`.
    pub changes: Vec<Change>,
    /// Raw chunk blocks, for file feeds (header excluded).
    pub data: Vec<Vec<u8>>,
    pub file_header: Option<FileHeader>,
    /// Peers currently attached for replication of this feed.
    pub peers: HashSet<PeerId>,
    pub ready: bool,
    pub synced: bool,
    pending_reads: Vec<FileReply>,
}

impl Actor {
    /// Wrap a feed, ingesting any blocks it already holds. Returns the
    /// lifecycle events the coordinator should process: `Initialized` for
    /// a fresh writable feed, `FeedReady` otherwise, plus `Sync` when the
    /// feed already holds blocks.
    pub fn new(feed: Feed) -> Result<(Self, Vec<ActorEvent>), RepoError> {
        let fresh = feed.is_empty() && feed.writable();
        let mut actor = Self {
            id: feed.id(),
            feed,
            classification: Classification::Unknown,
            changes: Vec::new(),
            data: Vec::new(),
            file_header: None,
            peers: HashSet::new(),
            ready: false,
            synced: false,
            pending_reads: Vec::new(),
        };
        for index in 0..actor.feed.len() {
            let data = actor
                .feed
                .get(index)
                .map(|b| b.to_vec())
                .ok_or_else(|| RepoError::BadBlock(format!("missing block {index}")))?;
            actor.ingest_block(index, &data)?;
        }
        let mut events = vec![if fresh {
            ActorEvent::Initialized
        } else {
            ActorEvent::FeedReady
        }];
        // An empty feed has nothing to be caught up with; its first sync
        // comes from replication (or a local write).
        if !actor.feed.is_empty() {
            events.push(ActorEvent::Sync);
        }
        Ok((actor, events))
    }

    /// Parse one block into the actor's state. Block 0 decides the
    /// classification.
    pub fn ingest_block(&mut self, index: u64, data: &[u8]) -> Result<(), RepoError> {
        if index == 0 && self.classification == Classification::Unknown {
            let value: serde_json::Value = serde_json::from_slice(data)
                .map_err(|e| RepoError::BadBlock(format!("unparseable block 0: {e}")))?;
            if value.get("type").is_some() {
                let header: FileHeader = serde_json::from_value(value)
                    .map_err(|e| RepoError::BadBlock(format!("bad file header: {e}")))?;
                self.file_header = Some(header);
                self.classification = Classification::File;
                return Ok(());
            }
            self.classification = Classification::Document;
        }
        match self.classification {
            Classification::Document => {
                let change: Change = serde_json::from_slice(data)
                    .map_err(|e| RepoError::BadBlock(format!("bad change block: {e}")))?;
                let expected = self.changes.len() as u64 + 1;
                if change.seq != expected {
                    return Err(RepoError::BadBlock(format!(
                        "feed {} block {index} carries seq {} (expected {expected})",
                        self.id, change.seq
                    )));
                }
                self.changes.push(change);
                Ok(())
            }
            Classification::File => {
                self.data.push(data.to_vec());
                Ok(())
            }
            Classification::Unknown => Err(RepoError::BadBlock(format!(
                "block {index} on an unclassified feed"
            ))),
        }
    }

    /// Append a locally generated change. The seq must extend the log
    /// contiguously — anything else is a correctness bug upstream.
    pub fn write_change(&mut self, change: Change) -> Result<u64, RepoError> {
        if self.classification == Classification::File {
            return Err(RepoError::FeedAppend(
                "cannot write changes to a file feed".into(),
            ));
        }
        let expected = self.changes.len() as u64 + 1;
        if change.seq != expected {
            return Err(RepoError::SequenceSkip {
                seq: change.seq,
                len: self.changes.len() as u64,
            });
        }
        let data = serde_json::to_vec(&change)?;
        let index = self.feed.append(data)?;
        self.classification = Classification::Document;
        self.changes.push(change);
        Ok(index)
    }

    /// Write a file into an empty feed: header block, then fixed-size
    /// chunks.
    pub fn write_file(&mut self, bytes: &[u8], mime_type: &str) -> Result<FileHeader, RepoError> {
        if !self.feed.is_empty() {
            return Err(RepoError::FileRewrite);
        }
        let header = FileHeader {
            mime_type: mime_type.to_string(),
            bytes: bytes.len() as u64,
        };
        self.feed.append(serde_json::to_vec(&header)?)?;
        self.classification = Classification::File;
        self.file_header = Some(header.clone());
        for chunk in bytes.chunks(FILE_CHUNK_SIZE) {
            self.feed.append(chunk.to_vec())?;
            self.data.push(chunk.to_vec());
        }
        Ok(header)
    }

    /// Read the file back, deferring until every chunk the header promises
    /// has replicated.
    pub fn read_file(&mut self, reply: FileReply) {
        if self.classification == Classification::Document {
            let _ = reply.send(Err(RepoError::BadBlock(format!(
                "feed {} is not a file",
                self.id
            ))));
            return;
        }
        if self.synced && self.file_complete() {
            let _ = reply.send(self.assemble_file());
        } else {
            self.pending_reads.push(reply);
        }
    }

    /// All chunk blocks the header calls for are present. The byte count
    /// itself is validated on assembly.
    fn file_complete(&self) -> bool {
        self.file_header
            .as_ref()
            .map(|h| self.data.len() as u64 >= h.bytes.div_ceil(FILE_CHUNK_SIZE as u64))
            .unwrap_or(false)
    }

    fn assemble_file(&self) -> Result<(FileHeader, Vec<u8>), RepoError> {
        let header = self
            .file_header
            .clone()
            .ok_or_else(|| RepoError::BadBlock(format!("feed {} is not a file", self.id)))?;
        let mut bytes = Vec::with_capacity(header.bytes as usize);
        for chunk in &self.data {
            bytes.extend_from_slice(chunk);
        }
        if bytes.len() as u64 != header.bytes {
            return Err(RepoError::FileSizeMismatch {
                got: bytes.len() as u64,
                want: header.bytes,
            });
        }
        Ok((header, bytes))
    }

    /// Flip the sync latch and run deferred file reads once the file is
    /// whole.
    pub fn on_synced(&mut self) {
        self.synced = true;
        if self.pending_reads.is_empty() || !self.file_complete() {
            return;
        }
        for reply in std::mem::take(&mut self.pending_reads) {
            let _ = reply.send(self.assemble_file());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ChangeRequest, CrdtState};
    use crate::feed::FeedStore;
    use crate::keys::KeyPair;
    use serde_json::json;

    fn writable_actor() -> Actor {
        let feed = FeedStore::new(None).create(KeyPair::generate()).unwrap();
        Actor::new(feed).unwrap().0
    }

    #[test]
    fn fresh_writable_feed_reports_initialized() {
        let feed = FeedStore::new(None).create(KeyPair::generate()).unwrap();
        let (actor, events) = Actor::new(feed).unwrap();
        assert_eq!(actor.classification, Classification::Unknown);
        assert!(matches!(events[0], ActorEvent::Initialized));
        // An empty feed has no sync to report yet.
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn first_change_classifies_as_document() {
        let mut actor = writable_actor();
        let mut state = CrdtState::new();
        let (change, _) = state.apply_local(actor.id, ChangeRequest::set("x", json!(1)));
        actor.write_change(change).unwrap();
        assert_eq!(actor.classification, Classification::Document);
        assert_eq!(actor.changes.len(), 1);
        assert_eq!(actor.feed.len(), 1);
    }

    #[test]
    fn sequence_skip_is_rejected() {
        let mut actor = writable_actor();
        let mut state = CrdtState::new();
        let (mut change, _) = state.apply_local(actor.id, ChangeRequest::set("x", json!(1)));
        change.seq = 5;
        match actor.write_change(change) {
            Err(RepoError::SequenceSkip { seq: 5, len: 0 }) => {}
            other => panic!("expected SequenceSkip, got {other:?}"),
        }
    }

    #[test]
    fn file_header_classifies_as_file() {
        let mut actor = writable_actor();
        actor.write_file(b"hello world", "text/plain").unwrap();
        assert_eq!(actor.classification, Classification::File);
        // Header plus one chunk.
        assert_eq!(actor.feed.len(), 2);
    }

    #[test]
    fn file_rewrite_is_rejected() {
        let mut actor = writable_actor();
        actor.write_file(b"once", "text/plain").unwrap();
        assert!(matches!(
            actor.write_file(b"twice", "text/plain"),
            Err(RepoError::FileRewrite)
        ));
    }

    #[test]
    fn changes_cannot_be_written_to_a_file_feed() {
        let mut actor = writable_actor();
        actor.write_file(b"bytes", "application/octet-stream").unwrap();
        let mut state = CrdtState::new();
        let (change, _) = state.apply_local(actor.id, ChangeRequest::set("x", json!(1)));
        assert!(actor.write_change(change).is_err());
    }

    #[tokio::test]
    async fn read_file_defers_until_sync() {
        let mut actor = writable_actor();
        actor.write_file(b"deferred bytes", "text/plain").unwrap();

        let (tx, rx) = oneshot::channel();
        actor.read_file(tx);
        // Not synced yet: nothing sent.
        actor.on_synced();
        let (header, bytes) = rx.await.unwrap().unwrap();
        assert_eq!(header.bytes, 14);
        assert_eq!(bytes, b"deferred bytes");
    }

    #[tokio::test]
    async fn read_file_validates_total_length() {
        // Hand-build a feed whose header lies about the byte count.
        let mut feed = FeedStore::new(None).create(KeyPair::generate()).unwrap();
        let header = FileHeader {
            mime_type: "text/plain".into(),
            bytes: 10,
        };
        feed.append(serde_json::to_vec(&header).unwrap()).unwrap();
        feed.append(b"abc".to_vec()).unwrap();

        let (mut actor, _) = Actor::new(feed).unwrap();
        actor.on_synced();
        let (tx, rx) = oneshot::channel();
        actor.read_file(tx);
        assert!(matches!(
            rx.await.unwrap(),
            Err(RepoError::FileSizeMismatch { got: 3, want: 10 })
        ));
    }

    #[test]
    fn reopened_document_feed_reingests_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeedStore::new(Some(dir.path().to_path_buf()));
        let keypair = KeyPair::generate();
        let id = keypair.id();
        {
            let feed = store.create(keypair).unwrap();
            let (mut actor, _) = Actor::new(feed).unwrap();
            let mut state = CrdtState::new();
            let (c1, _) = state.apply_local(id, ChangeRequest::set("a", json!(1)));
            let (c2, _) = state.apply_local(id, ChangeRequest::set("b", json!(2)));
            actor.write_change(c1).unwrap();
            actor.write_change(c2).unwrap();
        }
        let (actor, events) = Actor::new(store.open(id).unwrap()).unwrap();
        assert!(matches!(events[0], ActorEvent::FeedReady));
        assert_eq!(actor.classification, Classification::Document);
        assert_eq!(actor.changes.len(), 2);
        assert_eq!(actor.changes[0].seq, 1);
        assert_eq!(actor.changes[1].seq, 2);
    }
}
