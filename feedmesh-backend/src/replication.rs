//! Peer ↔ feed interest bookkeeping.
//!
//! Tracks which feeds this process replicates and which discovery topics
//! each connected peer has advertised. Whenever both sides list a feed, a
//! discovery event fires exactly once per (peer, feed) pair — that event
//! drives the coordinator's "a peer can replicate this actor — gossip
//! metadata and request blocks" path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::keys::{ActorId, DiscoveryId, PeerId};

/// A peer has become able to replicate a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub actor: ActorId,
    pub peer: PeerId,
}

#[derive(Debug, Default)]
pub struct ReplicationManager {
    /// Feeds the local process wants to replicate, by discovery topic.
    feeds: BTreeMap<DiscoveryId, ActorId>,
    /// Discovery topics each connected peer has advertised.
    peers: HashMap<PeerId, BTreeSet<DiscoveryId>>,
    /// (peer, feed) pairs already announced to the coordinator.
    fired: HashSet<(PeerId, DiscoveryId)>,
}

impl ReplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register additional local feeds. Returns discovery events for peers
    /// that already advertise them.
    pub fn add_feed_ids(&mut self, ids: impl IntoIterator<Item = ActorId>) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        for actor in ids {
            let topic = actor.discovery_id();
            self.feeds.insert(topic, actor);
            for (peer, topics) in &self.peers {
                if topics.contains(&topic) && self.fired.insert((*peer, topic)) {
                    events.push(DiscoveryEvent { actor, peer: *peer });
                }
            }
        }
        events
    }

    pub fn remove_feed_id(&mut self, actor: &ActorId) {
        let topic = actor.discovery_id();
        self.feeds.remove(&topic);
        self.fired.retain(|(_, t)| *t != topic);
    }

    /// A new peer connected; nothing is known about it yet.
    pub fn on_peer(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_default();
    }

    /// The peer advertised its current interest set (full set, resent on
    /// additions). Returns newly matched feeds.
    pub fn on_interest(
        &mut self,
        peer: PeerId,
        topics: impl IntoIterator<Item = DiscoveryId>,
    ) -> Vec<DiscoveryEvent> {
        let entry = self.peers.entry(peer).or_default();
        let mut events = Vec::new();
        for topic in topics {
            entry.insert(topic);
            if let Some(actor) = self.feeds.get(&topic) {
                if self.fired.insert((peer, topic)) {
                    events.push(DiscoveryEvent {
                        actor: *actor,
                        peer,
                    });
                }
            }
        }
        events
    }

    /// Peers currently advertising at least one of the given topics.
    pub fn peers_with(&self, topics: impl IntoIterator<Item = DiscoveryId>) -> Vec<PeerId> {
        let wanted: BTreeSet<DiscoveryId> = topics.into_iter().collect();
        self.peers
            .iter()
            .filter(|(_, advertised)| !advertised.is_disjoint(&wanted))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.fired.retain(|(p, _)| p != peer);
    }

    pub fn actor_for(&self, topic: &DiscoveryId) -> Option<ActorId> {
        self.feeds.get(topic).copied()
    }

    /// The local interest set, advertised to peers on connect and on
    /// changes.
    pub fn interests(&self) -> Vec<DiscoveryId> {
        self.feeds.keys().copied().collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }
}
