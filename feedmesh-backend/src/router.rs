//! Typed peer messages, multiplexed over each peer's transport stream.
//!
//! Every peer link carries newline-delimited JSON messages. The first
//! message on a link must be `hello`, binding the link to a peer id and an
//! extension tag; links with a foreign tag are dropped. Gossip
//! (`remote_metadata`, `doc_message`) and feed replication
//! (`interest`, `feed_request`, `feed_blocks`) share the stream as
//! disjoint message families. Binary block payloads travel base64-encoded.
//!
//! Unknown or malformed input is logged and discarded — one bad peer must
//! not stall the node.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::keys::{DiscoveryId, DocId, PeerId};
use crate::meta::MetadataBlock;

/// Extension tag spoken by this protocol revision.
pub const EXT_TAG: &str = "feedmesh.1";

/// Messages exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMsg {
    /// Link handshake — sent immediately on both sides of a connection.
    Hello { peer_id: PeerId, ext: String },

    /// The sender's full replication interest set, resent on additions.
    Interest { discovery_ids: Vec<DiscoveryId> },

    /// Gossip of what the sender knows: metadata blocks plus its stored
    /// clocks for the documents involved.
    RemoteMetadata {
        blocks: Vec<MetadataBlock>,
        clocks: BTreeMap<DocId, Clock>,
    },

    /// Application-level passthrough to peers interested in a document.
    DocMessage {
        id: DocId,
        contents: serde_json::Value,
    },

    /// Ask for blocks of a feed starting at `from`.
    FeedRequest { discovery_id: DiscoveryId, from: u64 },

    /// A contiguous run of feed blocks. `total` is the sender's feed
    /// length, letting the receiver re-request when it is still behind.
    FeedBlocks {
        discovery_id: DiscoveryId,
        start: u64,
        blocks: Vec<String>,
        sigs: Vec<String>,
        total: u64,
    },
}

/// Events surfaced by a peer link's reader task.
#[derive(Debug)]
pub enum PeerIoEvent {
    /// The handshake completed; `tx` writes to the peer.
    Joined {
        peer: PeerId,
        tx: mpsc::Sender<WireMsg>,
    },
    Msg {
        peer: PeerId,
        msg: WireMsg,
    },
    Left {
        peer: PeerId,
    },
}

/// Per-peer write handles for the coordinator.
#[derive(Default)]
pub struct MessageRouter {
    peers: HashMap<PeerId, mpsc::Sender<WireMsg>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: PeerId, tx: mpsc::Sender<WireMsg>) {
        self.peers.insert(peer, tx);
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn send_to_peer(&self, peer: &PeerId, msg: WireMsg) {
        if let Some(tx) = self.peers.get(peer) {
            if tx.try_send(msg).is_err() {
                tracing::warn!(peer = %peer, "peer write queue full or closed");
            }
        }
    }

    pub fn send_to_peers(&self, peers: &[PeerId], msg: WireMsg) {
        for peer in peers {
            self.send_to_peer(peer, msg.clone());
        }
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }
}

/// Drive one peer link: write our `hello` first, require the peer's
/// `hello` before anything else, then stream decoded messages into the
/// coordinator's queue until the link closes.
pub fn spawn_peer_io<S>(stream: S, me: PeerId, events: mpsc::UnboundedSender<PeerIoEvent>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<WireMsg>(256);

    // Writer: hello first, then whatever the coordinator queues.
    tokio::spawn(async move {
        let hello = WireMsg::Hello {
            peer_id: me,
            ext: EXT_TAG.to_string(),
        };
        if write_line(&mut write_half, &hello).await.is_err() {
            return;
        }
        while let Some(msg) = rx.recv().await {
            if write_line(&mut write_half, &msg).await.is_err() {
                break;
            }
        }
    });

    // Reader: handshake, then decode until EOF.
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        let peer = loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<WireMsg>(&line) {
                    Ok(WireMsg::Hello { peer_id, ext }) => {
                        if ext != EXT_TAG {
                            tracing::warn!(peer = %peer_id, %ext, "peer speaks a foreign extension tag, dropping link");
                            return;
                        }
                        break peer_id;
                    }
                    Ok(_) => {
                        tracing::warn!("peer sent a message before hello, dropping link");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("unparseable handshake line: {e}");
                        return;
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!("peer link read error before handshake: {e}");
                    return;
                }
            }
        };

        if events.send(PeerIoEvent::Joined { peer, tx }).is_err() {
            return;
        }
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<WireMsg>(&line) {
                    Ok(msg) => {
                        if events.send(PeerIoEvent::Msg { peer, msg }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, "discarding unparseable peer message: {e}");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer, "peer link closed: {e}");
                    break;
                }
            }
        }
        let _ = events.send(PeerIoEvent::Left { peer });
    });
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMsg) -> std::io::Result<()> {
    let mut line = serde_json::to_string(msg).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}
