//! Vector clocks over actor ids.
//!
//! A clock maps each actor to the highest sequence number observed from it
//! (seq ≥ 1 means "I have seen that many changes"). Merge is pointwise max,
//! which is commutative, associative, and idempotent. The partial order is
//! pointwise ≤ with missing entries reading as zero.
//!
//! Entries of `u64::MAX` mean "follow this actor's feed with no cap" and
//! only appear in metadata merge clocks; clocks describing observed state
//! always carry finite entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keys::ActorId;

/// Merge-clock entry for an actor whose feed is followed in full.
pub const UNBOUNDED: u64 = u64::MAX;

/// A vector clock. Keys are kept sorted (BTreeMap) so serialization is
/// canonical; zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(BTreeMap<ActorId, u64>);

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for one actor, zero if absent.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Raise the entry for `actor` to `seq`. Zero and non-increasing values
    /// are ignored, so stored clocks stay canonical and monotone.
    pub fn set(&mut self, actor: ActorId, seq: u64) {
        if seq == 0 {
            return;
        }
        let entry = self.0.entry(actor).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Pointwise-max merge of `other` into `self`.
    pub fn union(&mut self, other: &Clock) {
        for (actor, &seq) in &other.0 {
            self.set(*actor, seq);
        }
    }

    /// `self ≤ other` in the pointwise partial order.
    pub fn lte(&self, other: &Clock) -> bool {
        self.0.iter().all(|(actor, &seq)| seq <= other.get(actor))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(ActorId, u64)> for Clock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        let mut clock = Clock::new();
        for (actor, seq) in iter {
            clock.set(actor, seq);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn actor() -> ActorId {
        KeyPair::generate().id()
    }

    #[test]
    fn zero_entries_are_stripped() {
        let mut clock = Clock::new();
        clock.set(actor(), 0);
        assert!(clock.is_empty());
    }

    #[test]
    fn set_is_monotone() {
        let a = actor();
        let mut clock = Clock::new();
        clock.set(a, 5);
        clock.set(a, 3);
        assert_eq!(clock.get(&a), 5);
    }

    #[test]
    fn union_is_pointwise_max() {
        let (a, b) = (actor(), actor());
        let mut left: Clock = [(a, 2), (b, 1)].into_iter().collect();
        let right: Clock = [(a, 1), (b, 4)].into_iter().collect();
        left.union(&right);
        assert_eq!(left.get(&a), 2);
        assert_eq!(left.get(&b), 4);
    }

    #[test]
    fn union_commutes() {
        let (a, b) = (actor(), actor());
        let x: Clock = [(a, 2)].into_iter().collect();
        let y: Clock = [(a, 1), (b, 3)].into_iter().collect();
        let mut xy = x.clone();
        xy.union(&y);
        let mut yx = y.clone();
        yx.union(&x);
        assert_eq!(xy, yx);
    }

    #[test]
    fn partial_order() {
        let (a, b) = (actor(), actor());
        let small: Clock = [(a, 1)].into_iter().collect();
        let big: Clock = [(a, 2), (b, 1)].into_iter().collect();
        assert!(small.lte(&big));
        assert!(!big.lte(&small));
        // Missing entries read as zero.
        assert!(Clock::new().lte(&small));
        // Concurrent clocks are unordered in both directions.
        let other: Clock = [(b, 9)].into_iter().collect();
        assert!(!small.lte(&other));
        assert!(!other.lte(&small));
    }

    #[test]
    fn canonical_json_is_sorted() {
        let (a, b) = (actor(), actor());
        let c1: Clock = [(a, 1), (b, 2)].into_iter().collect();
        let c2: Clock = [(b, 2), (a, 1)].into_iter().collect();
        assert_eq!(
            serde_json::to_string(&c1).unwrap(),
            serde_json::to_string(&c2).unwrap()
        );
    }
}
