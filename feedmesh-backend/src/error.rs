//! Backend error kinds.
//!
//! Recoverable gossip-layer errors (malformed messages, unknown peers) are
//! logged and dropped at the call site so one bad peer cannot stall the
//! node. Local invariant violations (sequence skips, file rewrites) surface
//! as errors so bugs are caught in test.

use crate::keys::{ActorId, DocId};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// `open` was called on a document id the metadata knows to be a file.
    #[error("document {0} is backed by a file feed")]
    OpenAsFile(DocId),

    /// A change's seq does not extend the feed contiguously.
    #[error("change seq {seq} does not extend a log of {len} changes")]
    SequenceSkip { seq: u64, len: u64 },

    /// Lower-level feed append failed; the actor's log is compromised.
    #[error("feed append failed: {0}")]
    FeedAppend(String),

    /// `write_file` on a feed that already has blocks.
    #[error("file feeds cannot be rewritten")]
    FileRewrite,

    /// Concatenated file length disagrees with the header.
    #[error("file length {got} does not match header length {want}")]
    FileSizeMismatch { got: u64, want: u64 },

    /// The frontend referenced a document the backend has no record of.
    #[error("no record of document {0}")]
    MissingDoc(DocId),

    #[error("actor {0} is not loaded")]
    MissingActor(ActorId),

    #[error("invalid identifier: {0}")]
    BadId(String),

    /// A feed block that fails signature verification or does not parse.
    #[error("invalid block: {0}")]
    BadBlock(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("backend is closed")]
    Closed,
}
