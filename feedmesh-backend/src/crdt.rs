//! CRDT engine: a last-writer-wins map over string keys.
//!
//! The engine is deliberately opaque to the coordinator: ordered change
//! sequences go in, patches come out. Each change carries a per-actor
//! monotone `seq` (the feed position) and a Lamport timestamp used for
//! conflict resolution. Concurrent writes to the same key resolve by
//! `(time, actor id)` — the higher pair wins deterministically on every
//! replica, so replicas that apply the same changes in any actor
//! interleaving converge. Deletes leave tombstones so a removal is never
//! resurrected by a concurrent earlier write.
//!
//! Materialization at a history prefix is an explicit operation
//! (`materialize_at`) rather than a reach into internal state.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::ActorId;

/// A single mutation requested by the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Op {
    Set { key: String, value: Value },
    Del { key: String },
}

/// A local edit request, before it is stamped into a [`Change`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub ops: Vec<Op>,
}

impl ChangeRequest {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            ops: vec![Op::Set {
                key: key.into(),
                value,
            }],
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            ops: vec![Op::Del { key: key.into() }],
        }
    }
}

/// One immutable CRDT operation. `seq` is the position in the author's
/// feed, starting at 1 with no gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    pub time: u64,
    pub ops: Vec<Op>,
}

/// One visible key update. `value: None` means the key was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub key: String,
    pub value: Option<Value>,
}

/// Incremental description of a state change, emitted to the frontend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub diffs: Vec<Diff>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// `None` is a tombstone.
    value: Option<Value>,
    time: u64,
    actor: ActorId,
}

impl Entry {
    fn wins_over(&self, other: &Entry) -> bool {
        (self.time, self.actor) > (other.time, other.actor)
    }
}

/// The materialized CRDT state plus its full change history.
#[derive(Debug, Clone, Default)]
pub struct CrdtState {
    entries: BTreeMap<String, Entry>,
    history: Vec<Change>,
    seqs: HashMap<ActorId, u64>,
    max_time: u64,
}

impl CrdtState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next seq this replica would stamp for `actor`.
    pub fn next_seq(&self, actor: &ActorId) -> u64 {
        self.seqs.get(actor).copied().unwrap_or(0) + 1
    }

    /// Stamp a local edit request into a change and apply it.
    pub fn apply_local(&mut self, actor: ActorId, request: ChangeRequest) -> (Change, Patch) {
        let change = Change {
            actor,
            seq: self.next_seq(&actor),
            time: self.max_time + 1,
            ops: request.ops,
        };
        let patch = self.apply(&change);
        (change, patch)
    }

    /// Apply remote changes in the order given, returning the combined
    /// visible diff. Per-actor ordering is the caller's contract; cross-
    /// actor interleaving is free.
    pub fn apply_changes(&mut self, changes: Vec<Change>) -> Patch {
        let mut patch = Patch::default();
        for change in changes {
            let p = self.apply(&change);
            patch.diffs.extend(p.diffs);
        }
        patch
    }

    fn apply(&mut self, change: &Change) -> Patch {
        let mut diffs = Vec::new();
        for op in &change.ops {
            let (key, value) = match op {
                Op::Set { key, value } => (key, Some(value.clone())),
                Op::Del { key } => (key, None),
            };
            let incoming = Entry {
                value,
                time: change.time,
                actor: change.actor,
            };
            let visible = match self.entries.get(key) {
                Some(current) => incoming.wins_over(current),
                None => true,
            };
            if visible {
                diffs.push(Diff {
                    key: key.clone(),
                    value: incoming.value.clone(),
                });
                self.entries.insert(key.clone(), incoming);
            }
        }
        let seq = self.seqs.entry(change.actor).or_insert(0);
        *seq = (*seq).max(change.seq);
        self.max_time = self.max_time.max(change.time);
        self.history.push(change.clone());
        Patch { diffs }
    }

    /// The current visible state as a JSON object.
    pub fn materialize(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
            .collect();
        Value::Object(map)
    }

    /// The state as seen after the first `n` history entries. `n` is
    /// clamped to the history length.
    pub fn materialize_at(&self, n: u64) -> Value {
        let n = (n as usize).min(self.history.len());
        let mut replay = CrdtState::new();
        replay.apply_changes(self.history[..n].to_vec());
        replay.materialize()
    }

    /// The whole state rendered as a patch (used for initial loads).
    pub fn full_patch(&self) -> Patch {
        Patch {
            diffs: self
                .entries
                .iter()
                .filter_map(|(k, e)| {
                    e.value.clone().map(|v| Diff {
                        key: k.clone(),
                        value: Some(v),
                    })
                })
                .collect(),
        }
    }

    pub fn history_len(&self) -> u64 {
        self.history.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    fn actor() -> ActorId {
        KeyPair::generate().id()
    }

    #[test]
    fn local_changes_get_contiguous_seqs() {
        let a = actor();
        let mut state = CrdtState::new();
        let (c1, _) = state.apply_local(a, ChangeRequest::set("x", json!(1)));
        let (c2, _) = state.apply_local(a, ChangeRequest::set("y", json!(2)));
        assert_eq!(c1.seq, 1);
        assert_eq!(c2.seq, 2);
        assert!(c2.time > c1.time);
    }

    #[test]
    fn patch_reflects_visible_writes() {
        let mut state = CrdtState::new();
        let (_, patch) = state.apply_local(actor(), ChangeRequest::set("x", json!("hi")));
        assert_eq!(patch.diffs.len(), 1);
        assert_eq!(patch.diffs[0].key, "x");
        assert_eq!(patch.diffs[0].value, Some(json!("hi")));
    }

    #[test]
    fn concurrent_writes_converge_in_any_order() {
        let (a, b) = (actor(), actor());
        let mut origin_a = CrdtState::new();
        let (ca, _) = origin_a.apply_local(a, ChangeRequest::set("k", json!("from-a")));
        let mut origin_b = CrdtState::new();
        let (cb, _) = origin_b.apply_local(b, ChangeRequest::set("k", json!("from-b")));

        let mut one = CrdtState::new();
        one.apply_changes(vec![ca.clone(), cb.clone()]);
        let mut two = CrdtState::new();
        two.apply_changes(vec![cb, ca]);

        assert_eq!(one.materialize(), two.materialize());
    }

    #[test]
    fn delete_tombstone_beats_concurrent_earlier_write() {
        let (a, b) = (actor(), actor());
        let set = Change {
            actor: a,
            seq: 1,
            time: 1,
            ops: vec![Op::Set {
                key: "k".into(),
                value: json!(1),
            }],
        };
        let del = Change {
            actor: b,
            seq: 1,
            time: 2,
            ops: vec![Op::Del { key: "k".into() }],
        };
        let mut state = CrdtState::new();
        state.apply_changes(vec![del, set]);
        assert_eq!(state.materialize(), json!({}));
    }

    #[test]
    fn materialize_at_prefix() {
        let a = actor();
        let mut state = CrdtState::new();
        state.apply_local(a, ChangeRequest::set("x", json!(1)));
        state.apply_local(a, ChangeRequest::set("x", json!(2)));
        assert_eq!(state.materialize_at(1), json!({ "x": 1 }));
        assert_eq!(state.materialize_at(2), json!({ "x": 2 }));
        // Clamped to the history length.
        assert_eq!(state.materialize_at(99), json!({ "x": 2 }));
        assert_eq!(state.materialize_at(0), json!({}));
    }

    #[test]
    fn change_json_has_no_type_field() {
        // Block 0 of a feed is classified by the presence of a "type"
        // field: file headers have one, changes must not.
        let a = actor();
        let mut state = CrdtState::new();
        let (change, _) = state.apply_local(a, ChangeRequest::set("x", json!(1)));
        let value = serde_json::to_value(&change).unwrap();
        assert!(value.get("type").is_none());
    }
}
