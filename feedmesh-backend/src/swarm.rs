//! Discovery/transport abstraction.
//!
//! A swarm produces connected peer byte streams for the topics a repo has
//! joined. The coordinator only ever sees [`SwarmEvent`]s; what carries
//! the bytes (an in-memory duplex for tests, an iroh QUIC bridge for real
//! deployments) is the swarm's business.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::keys::{DiscoveryId, RepoId};

/// Events a swarm delivers to its repo.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A peer link was established; speak the wire protocol on it.
    PeerStream(DuplexStream),
}

/// Topic membership interface. Connections arrive on the event channel
/// handed out at registration.
pub trait Swarm: Send + Sync {
    fn join(&self, topic: DiscoveryId);
    fn leave(&self, topic: DiscoveryId);
}

/// Swarm for repos that never network.
pub struct NullSwarm;

impl Swarm for NullSwarm {
    fn join(&self, _topic: DiscoveryId) {}
    fn leave(&self, _topic: DiscoveryId) {}
}

struct Member {
    events: mpsc::UnboundedSender<SwarmEvent>,
    topics: BTreeSet<DiscoveryId>,
}

#[derive(Default)]
struct HubInner {
    members: HashMap<RepoId, Member>,
    /// Normalized (low, high) pairs already wired together.
    linked: HashSet<(RepoId, RepoId)>,
}

/// In-memory discovery hub: repos that share at least one topic get a
/// duplex stream pair. This is the swarm the integration scenarios run on.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repo with the hub. The receiver delivers peer streams as
    /// topic overlaps appear.
    pub fn register(&self, id: RepoId) -> (MemorySwarm, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().members.insert(
            id,
            Member {
                events: tx,
                topics: BTreeSet::new(),
            },
        );
        (
            MemorySwarm {
                id,
                inner: Arc::clone(&self.inner),
            },
            rx,
        )
    }

    /// Drop a repo from the hub (simulates the peer going away).
    pub fn deregister(&self, id: &RepoId) {
        let mut inner = self.inner.lock();
        inner.members.remove(id);
        inner.linked.retain(|(a, b)| a != id && b != id);
    }
}

pub struct MemorySwarm {
    id: RepoId,
    inner: Arc<Mutex<HubInner>>,
}

impl Swarm for MemorySwarm {
    fn join(&self, topic: DiscoveryId) {
        let mut inner = self.inner.lock();
        if let Some(member) = inner.members.get_mut(&self.id) {
            member.topics.insert(topic);
        }

        // Wire up any member sharing a topic with us that we are not
        // already linked to.
        let my_topics = match inner.members.get(&self.id) {
            Some(m) => m.topics.clone(),
            None => return,
        };
        let others: Vec<RepoId> = inner
            .members
            .iter()
            .filter(|(other, member)| {
                **other != self.id && !member.topics.is_disjoint(&my_topics)
            })
            .map(|(other, _)| *other)
            .collect();

        for other in others {
            let pair = normalize(self.id, other);
            if !inner.linked.insert(pair) {
                continue;
            }
            let (mine, theirs) = tokio::io::duplex(65536);
            let us_ok = inner.members[&self.id]
                .events
                .send(SwarmEvent::PeerStream(mine))
                .is_ok();
            let them_ok = inner.members[&other]
                .events
                .send(SwarmEvent::PeerStream(theirs))
                .is_ok();
            if us_ok && them_ok {
                tracing::debug!(a = %self.id, b = %other, "memory swarm linked peers");
            }
        }
    }

    fn leave(&self, topic: DiscoveryId) {
        let mut inner = self.inner.lock();
        if let Some(member) = inner.members.get_mut(&self.id) {
            member.topics.remove(&topic);
        }
        // Existing links stay up; only future discovery is affected.
    }
}

fn normalize(a: RepoId, b: RepoId) -> (RepoId, RepoId) {
    if a <= b { (a, b) } else { (b, a) }
}
