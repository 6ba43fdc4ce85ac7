//! The frontend ↔ backend message contract.
//!
//! Frontends drive the backend with [`ToBackend`] commands and consume
//! [`ToFrontend`] notifications. Queries carry an id echoed back on the
//! reply so a frontend can multiplex them over the one channel.

use serde_json::Value;

use crate::clock::Clock;
use crate::crdt::{ChangeRequest, Patch};
use crate::keys::{ActorId, DocId};

/// Commands from the frontend.
#[derive(Debug, Clone)]
pub enum ToBackend {
    /// Mint a new document with an explicit keypair. The frontend derives
    /// the new DocId from the public key itself.
    Create {
        public_key: Vec<u8>,
        secret_key: Vec<u8>,
    },
    /// Ensure a document backend exists for `id`. Rejected if the id is
    /// known to be a file.
    Open { id: DocId },
    /// Drop the document and purge orphan actors.
    Destroy { id: DocId },
    /// Dump internal state for diagnostics.
    Debug { id: DocId },
    /// Assign a writable actor to the document (lazily, on first edit).
    NeedsActorId { id: DocId },
    /// Apply a local CRDT change.
    Request { id: DocId, request: ChangeRequest },
    /// Merge an external clock into the document.
    Merge { id: DocId, actors: Clock },
    /// Gossip an application payload to all peers interested in `id`.
    DocumentMessage { id: DocId, contents: Value },
    /// Read-only query; the reply is tagged with `id`.
    Query { id: u64, query: QueryMsg },
    /// Shut down the backend.
    Close,
}

#[derive(Debug, Clone)]
pub enum QueryMsg {
    Metadata { id: DocId },
    Materialize { id: DocId, history: u64 },
}

/// Notifications to the frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum ToFrontend {
    /// Initial materialization of a document completed.
    Ready {
        id: DocId,
        actor_id: Option<ActorId>,
        minimum_clock_satisfied: bool,
        history: u64,
        patch: Patch,
    },
    /// A writable local actor was assigned.
    ActorId { id: DocId, actor_id: ActorId },
    /// Local or remote changes were applied.
    Patch {
        id: DocId,
        minimum_clock_satisfied: bool,
        history: u64,
        patch: Patch,
    },
    /// Response to a query, tagged with its id.
    Reply { id: u64, payload: Value },
    /// An application payload gossiped by a peer.
    DocumentMessage { id: DocId, contents: Value },
    /// A feed block arrived from the network (download progress).
    ActorBlockDownloaded {
        id: DocId,
        actor_id: ActorId,
        index: u64,
        size: u64,
        time: i64,
    },
    /// The blob file server is listening.
    FileServerReady { path: String },
}
