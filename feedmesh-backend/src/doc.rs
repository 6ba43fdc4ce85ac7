//! Per-document CRDT state and patch emission.
//!
//! A `DocBackend` holds one document's engine state, the per-actor count of
//! changes already applied, and the current clock. It emits typed messages
//! the coordinator turns into frontend notifications; nothing here talks to
//! feeds or peers directly.
//!
//! Until `init` has run, incoming actor syncs are parked on the `ready`
//! queue — changes are never applied before the initial load.

use std::collections::HashMap;

use serde_json::Value;

use crate::clock::Clock;
use crate::crdt::{Change, ChangeRequest, CrdtState, Patch};
use crate::error::RepoError;
use crate::keys::{ActorId, DocId};

/// Notifications from a document to the coordinator.
#[derive(Debug)]
pub enum DocMsg {
    /// Initial materialization completed.
    Ready { history: u64, patch: Patch },
    /// A writable local actor was assigned.
    ActorId { actor_id: ActorId },
    /// Remote changes were applied.
    RemotePatch { patch: Patch, history: u64 },
    /// A local change was generated; it must be written to the feed.
    LocalPatch {
        change: Change,
        patch: Patch,
        history: u64,
    },
}

pub struct DocBackend {
    pub id: DocId,
    state: CrdtState,
    /// The document's locally writable actor, assigned on load or lazily.
    pub actor_id: Option<ActorId>,
    /// How many changes from each actor have been applied.
    pub changes: HashMap<ActorId, u64>,
    pub clock: Clock,
    pub ready: bool,
    /// Actor syncs deferred until `init` has run.
    pending: Vec<ActorId>,
}

impl DocBackend {
    pub fn new(id: DocId) -> Self {
        Self {
            id,
            state: CrdtState::new(),
            actor_id: None,
            changes: HashMap::new(),
            clock: Clock::new(),
            ready: false,
            pending: Vec::new(),
        }
    }

    /// Load the document from per-actor change slices. Counters record how
    /// many changes of each listed actor were applied, even when a slice is
    /// empty. Returns the messages to emit plus the deferred actor syncs
    /// that were parked while loading.
    pub fn init(
        &mut self,
        slices: Vec<(ActorId, Vec<Change>)>,
        actor_id: Option<ActorId>,
    ) -> (Vec<DocMsg>, Vec<ActorId>) {
        for (actor, changes) in slices {
            let count = changes.len() as u64;
            self.state.apply_changes(changes);
            self.changes.insert(actor, count);
            self.clock.set(actor, count);
        }
        self.actor_id = actor_id;
        self.ready = true;
        let msgs = vec![DocMsg::Ready {
            history: self.state.history_len(),
            patch: self.state.full_patch(),
        }];
        (msgs, std::mem::take(&mut self.pending))
    }

    /// Assign a writable actor after the fact.
    pub fn init_actor(&mut self, actor_id: ActorId) -> DocMsg {
        self.actor_id = Some(actor_id);
        DocMsg::ActorId { actor_id }
    }

    /// Apply a local edit. The resulting change must be appended to the
    /// local actor's feed before the dispatcher moves on.
    pub fn apply_local_change(&mut self, request: ChangeRequest) -> Result<DocMsg, RepoError> {
        let actor_id = self
            .actor_id
            .ok_or_else(|| RepoError::MissingDoc(self.id))?;
        let (change, patch) = self.state.apply_local(actor_id, request);
        self.changes.insert(actor_id, change.seq);
        self.clock.set(actor_id, change.seq);
        Ok(DocMsg::LocalPatch {
            change,
            patch,
            history: self.state.history_len(),
        })
    }

    /// Merge remote changes. The caller guarantees per-actor contiguity and
    /// keeps the counters; the clock is advanced here.
    pub fn apply_remote_changes(&mut self, changes: Vec<Change>) -> DocMsg {
        for change in &changes {
            self.clock.set(change.actor, change.seq);
        }
        let patch = self.state.apply_changes(changes);
        DocMsg::RemotePatch {
            patch,
            history: self.state.history_len(),
        }
    }

    /// Park an actor sync until the initial load completes.
    pub fn defer_sync(&mut self, actor: ActorId) {
        if !self.pending.contains(&actor) {
            self.pending.push(actor);
        }
    }

    pub fn applied(&self, actor: &ActorId) -> u64 {
        self.changes.get(actor).copied().unwrap_or(0)
    }

    pub fn set_applied(&mut self, actor: ActorId, count: u64) {
        self.changes.insert(actor, count);
    }

    pub fn materialize(&self, history: u64) -> Value {
        self.state.materialize_at(history)
    }

    /// The whole current state rendered as a patch (re-emitted on a second
    /// `open` of an already-loaded document).
    pub fn full_patch(&self) -> Patch {
        self.state.full_patch()
    }

    pub fn history_len(&self) -> u64 {
        self.state.history_len()
    }
}
