//! The repository coordinator.
//!
//! `RepoBackend` is the single owner of every actor, document, and
//! collaborator. All mutation flows through one FIFO event queue drained
//! by one task: frontend commands, swarm connections, decoded peer
//! messages, actor lifecycle notifications, and file requests are all
//! `Event` variants, and each handler runs to completion before the next
//! event is dequeued. Collaborators never call back into the coordinator —
//! they enqueue events.
//!
//! # Satisfied clocks
//!
//! Before a `Ready` or `Patch` notification goes out, the coordinator
//! checks whether the document's clock is at least as advanced as some
//! persisted baseline: our own stored clock if we have one, otherwise the
//! union of peer clocks the current state dominates. A local patch makes
//! the current clock durable in our own feed, so it is persisted as the
//! baseline before the predicate runs; a remote patch persists a baseline
//! only when one is found. This is what keeps a restarted node from
//! presenting a rewound view as fresh.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actor::{Actor, ActorEvent, Classification};
use crate::clock::Clock;
use crate::db::{ClockStore, Db, KeyStore};
use crate::doc::{DocBackend, DocMsg};
use crate::error::RepoError;
use crate::feed::FeedStore;
use crate::fileserver::{self, FileRequest};
use crate::keys::{ActorId, DiscoveryId, DocId, KeyPair, PeerId, RepoId};
use crate::meta::{FileHeader, Metadata, PublicMetadata, sanitize_remote_metadata};
use crate::msg::{QueryMsg, ToBackend, ToFrontend};
use crate::replication::{DiscoveryEvent, ReplicationManager};
use crate::router::{MessageRouter, PeerIoEvent, WireMsg, spawn_peer_io};
use crate::swarm::{NullSwarm, Swarm, SwarmEvent};

/// Backend construction options.
#[derive(Debug, Clone)]
pub struct RepoOptions {
    /// Root directory for feeds and the database.
    pub path: PathBuf,
    /// Keep everything in memory; no directory is created.
    pub memory: bool,
    /// Bind the blob file server here (`FileServerReadyMsg` announces the
    /// bound address).
    pub file_server_addr: Option<SocketAddr>,
}

impl RepoOptions {
    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            memory: false,
            file_server_addr: None,
        }
    }

    pub fn memory() -> Self {
        Self {
            path: PathBuf::from("default"),
            memory: true,
            file_server_addr: None,
        }
    }
}

impl Default for RepoOptions {
    fn default() -> Self {
        Self::disk("default")
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    Frontend(ToBackend),
    Swarm(SwarmEvent),
    PeerIo(PeerIoEvent),
    Actor { id: ActorId, event: ActorEvent },
    File(FileRequest),
}

/// The frontend's grip on a spawned backend: one command channel in, one
/// notification channel out.
pub struct RepoHandle {
    id: RepoId,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<ToFrontend>,
    task: JoinHandle<()>,
}

impl RepoHandle {
    pub fn id(&self) -> RepoId {
        self.id
    }

    pub fn send(&self, msg: ToBackend) {
        let _ = self.tx.send(Event::Frontend(msg));
    }

    pub async fn recv(&mut self) -> Option<ToFrontend> {
        self.rx.recv().await
    }

    /// Store bytes as a new file feed; resolves to the new actor id.
    pub async fn write_file(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<ActorId, RepoError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Event::File(FileRequest::Write {
            bytes,
            mime_type: mime_type.to_string(),
            reply,
        }));
        rx.await.map_err(|_| RepoError::Closed)?
    }

    /// Read a file feed back, waiting until it has synced.
    pub async fn read_file(&self, actor: ActorId) -> Result<(FileHeader, Vec<u8>), RepoError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Event::File(FileRequest::Read { actor, reply }));
        rx.await.map_err(|_| RepoError::Closed)?
    }

    pub fn close(&self) {
        let _ = self.tx.send(Event::Frontend(ToBackend::Close));
    }

    /// Wait for the backend task to finish (after [`RepoHandle::close`]).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub struct RepoBackend {
    id: RepoId,
    options: RepoOptions,
    clocks: ClockStore,
    keys: KeyStore,
    meta: Metadata,
    feeds: FeedStore,
    actors: HashMap<ActorId, Actor>,
    docs: HashMap<DocId, DocBackend>,
    repl: ReplicationManager,
    router: MessageRouter,
    swarm: Box<dyn Swarm>,
    /// Documents waiting for their known actors to become ready.
    pending_loads: HashSet<DocId>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Option<mpsc::UnboundedReceiver<Event>>,
    peer_io_tx: mpsc::UnboundedSender<PeerIoEvent>,
    peer_io_rx: Option<mpsc::UnboundedReceiver<PeerIoEvent>>,
    swarm_rx: Option<mpsc::UnboundedReceiver<SwarmEvent>>,
    to_frontend: mpsc::UnboundedSender<ToFrontend>,
    frontend_rx: Option<mpsc::UnboundedReceiver<ToFrontend>>,
}

impl RepoBackend {
    pub fn new(options: RepoOptions) -> Result<Self, RepoError> {
        let db = if options.memory {
            Db::open_memory()?
        } else {
            std::fs::create_dir_all(&options.path)?;
            Db::open(options.path.join("feedmesh.db"))?
        };
        let db = Arc::new(Mutex::new(db));
        let clocks = ClockStore::new(Arc::clone(&db));
        let keys = KeyStore::new(Arc::clone(&db));

        let identity = match keys.get(KeyStore::SELF_REPO)? {
            Some(keypair) => keypair,
            None => {
                let keypair = KeyPair::generate();
                keys.set(KeyStore::SELF_REPO, &keypair)?;
                keypair
            }
        };
        let id = RepoId::from_bytes(*identity.id().as_bytes());

        let feeds = FeedStore::new(if options.memory {
            None
        } else {
            Some(options.path.clone())
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (peer_io_tx, peer_io_rx) = mpsc::unbounded_channel();
        let (to_frontend, frontend_rx) = mpsc::unbounded_channel();

        tracing::info!(repo = %id, path = %options.path.display(), memory = options.memory, "repo backend created");

        Ok(Self {
            id,
            options,
            clocks,
            keys,
            meta: Metadata::new(),
            feeds,
            actors: HashMap::new(),
            docs: HashMap::new(),
            repl: ReplicationManager::new(),
            router: MessageRouter::new(),
            swarm: Box::new(NullSwarm),
            pending_loads: HashSet::new(),
            event_tx,
            event_rx: Some(event_rx),
            peer_io_tx,
            peer_io_rx: Some(peer_io_rx),
            swarm_rx: None,
            to_frontend,
            frontend_rx: Some(frontend_rx),
        })
    }

    pub fn id(&self) -> RepoId {
        self.id
    }

    /// The persistent key store (`"self.repo"` holds the repo identity).
    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    /// Attach a swarm. Peer streams arriving on `events` get the wire
    /// protocol spoken on them.
    pub fn set_swarm(
        &mut self,
        swarm: Box<dyn Swarm>,
        events: mpsc::UnboundedReceiver<SwarmEvent>,
    ) {
        self.swarm = swarm;
        self.swarm_rx = Some(events);
    }

    /// Start the dispatcher task and hand the frontend its channels.
    pub fn spawn(mut self) -> RepoHandle {
        let id = self.id;
        let tx = self.event_tx.clone();
        let rx = self.frontend_rx.take().expect("spawn called twice");
        let task = tokio::spawn(self.run());
        RepoHandle { id, tx, rx, task }
    }

    async fn run(mut self) {
        // Forward swarm connections and peer IO into the single queue.
        if let Some(mut swarm_rx) = self.swarm_rx.take() {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = swarm_rx.recv().await {
                    if tx.send(Event::Swarm(event)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(mut peer_io_rx) = self.peer_io_rx.take() {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = peer_io_rx.recv().await {
                    if tx.send(Event::PeerIo(event)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(addr) = self.options.file_server_addr {
            let (file_tx, mut file_rx) = mpsc::unbounded_channel();
            match fileserver::start(addr, file_tx).await {
                Ok(bound) => {
                    let _ = self.to_frontend.send(ToFrontend::FileServerReady {
                        path: bound.to_string(),
                    });
                    let tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        while let Some(request) = file_rx.recv().await {
                            if tx.send(Event::File(request)).is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => tracing::warn!("file server failed to start: {e}"),
            }
        }

        let mut rx = self.event_rx.take().expect("run called twice");
        while let Some(event) = rx.recv().await {
            if self.handle_event(event) {
                break;
            }
        }
        tracing::info!(repo = %self.id, "repo backend stopped");
    }

    /// Returns true when the backend should shut down.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Frontend(msg) => return self.handle_frontend(msg),
            Event::Swarm(SwarmEvent::PeerStream(stream)) => {
                spawn_peer_io(stream, self.id.as_peer(), self.peer_io_tx.clone());
            }
            Event::PeerIo(event) => self.handle_peer_io(event),
            Event::Actor { id, event } => self.handle_actor_event(id, event),
            Event::File(request) => self.handle_file_request(request),
        }
        false
    }

    // ── Frontend commands ───────────────────────────────────────────

    fn handle_frontend(&mut self, msg: ToBackend) -> bool {
        match msg {
            ToBackend::Create {
                public_key,
                secret_key,
            } => {
                if let Err(e) = self.handle_create(&public_key, &secret_key) {
                    tracing::error!("create failed: {e}");
                }
            }
            ToBackend::Open { id } => self.handle_open(id),
            ToBackend::Destroy { id } => self.handle_destroy(id),
            ToBackend::Debug { id } => self.handle_debug(id),
            ToBackend::NeedsActorId { id } => self.handle_needs_actor_id(id),
            ToBackend::Request { id, request } => {
                let result = match self.docs.get_mut(&id) {
                    None => {
                        tracing::warn!("{}", RepoError::MissingDoc(id));
                        return false;
                    }
                    Some(doc) if !doc.ready => {
                        tracing::warn!(doc = %id, "edit before initial load, dropping");
                        return false;
                    }
                    Some(doc) => doc.apply_local_change(request),
                };
                match result {
                    Ok(doc_msg) => self.dispatch_doc_msg(id, doc_msg),
                    Err(e) => tracing::error!(doc = %id, "local change failed: {e}"),
                }
            }
            ToBackend::Merge { id, actors } => self.handle_merge(id, &actors),
            ToBackend::DocumentMessage { id, contents } => {
                let topics: BTreeSet<DiscoveryId> = self
                    .meta
                    .actors(&id)
                    .iter()
                    .map(|a| a.discovery_id())
                    .collect();
                let peers = self.repl.peers_with(topics);
                self.router
                    .send_to_peers(&peers, WireMsg::DocMessage { id, contents });
            }
            ToBackend::Query { id, query } => self.handle_query(id, query),
            ToBackend::Close => return true,
        }
        false
    }

    fn handle_create(&mut self, public_key: &[u8], secret_key: &[u8]) -> Result<(), RepoError> {
        let keypair = KeyPair::from_parts(public_key, Some(secret_key))?;
        let actor_id = keypair.id();
        let doc_id = actor_id.as_doc();
        tracing::info!(doc = %doc_id, "creating document");

        self.meta.set_writable(actor_id, true);
        self.ensure_actor_with_keypair(keypair)?;
        self.adopt_actor(doc_id, actor_id);

        let mut doc = DocBackend::new(doc_id);
        let (msgs, _) = doc.init(vec![], Some(actor_id));
        self.docs.insert(doc_id, doc);
        for msg in msgs {
            self.dispatch_doc_msg(doc_id, msg);
        }
        Ok(())
    }

    fn handle_open(&mut self, id: DocId) {
        if self.meta.is_file(&id) {
            tracing::error!("{}", RepoError::OpenAsFile(id));
            return;
        }
        if let Some(doc) = self.docs.get(&id) {
            if doc.ready {
                let msg = ToFrontend::Ready {
                    id,
                    actor_id: doc.actor_id,
                    minimum_clock_satisfied: self.good_clock(&id).is_some(),
                    history: doc.history_len(),
                    patch: doc.full_patch(),
                };
                let _ = self.to_frontend.send(msg);
            }
            return;
        }
        tracing::info!(doc = %id, "opening document");
        self.docs.insert(id, DocBackend::new(id));
        if let Err(e) = self.ensure_actor(id.root_actor()) {
            tracing::error!(doc = %id, "root actor failed to open: {e}");
            self.docs.remove(&id);
            return;
        }
        self.adopt_actor(id, id.root_actor());
        self.pending_loads.insert(id);
        self.try_load(id);
    }

    fn handle_needs_actor_id(&mut self, id: DocId) {
        let Some(doc) = self.docs.get(&id) else {
            tracing::warn!("{}", RepoError::MissingDoc(id));
            return;
        };
        if let Some(actor_id) = doc.actor_id {
            let _ = self.to_frontend.send(ToFrontend::ActorId { id, actor_id });
            return;
        }
        let actor_id = match self.meta.local_actor(&id) {
            Some(actor_id) => actor_id,
            None => match self.mint_local_actor(id) {
                Ok(actor_id) => actor_id,
                Err(e) => {
                    tracing::error!(doc = %id, "could not mint a writable actor: {e}");
                    return;
                }
            },
        };
        let msg = match self.docs.get_mut(&id) {
            Some(doc) => doc.init_actor(actor_id),
            None => return,
        };
        self.dispatch_doc_msg(id, msg);
    }

    fn handle_merge(&mut self, id: DocId, clock: &Clock) {
        let newly_seen = self.meta.merge(id, clock);
        for actor_id in newly_seen {
            if let Err(e) = self.ensure_actor(actor_id) {
                tracing::warn!(actor = %actor_id, "merge could not open actor: {e}");
            }
        }
        self.gossip_doc(id);
        self.sync_ready_actors(clock.actors().copied().collect());
    }

    fn handle_query(&mut self, query_id: u64, query: QueryMsg) {
        let payload = match query {
            QueryMsg::Metadata { id } => {
                if self.meta.is_file(&id) {
                    let header = self.meta.file_header(&id);
                    serde_json::to_value(PublicMetadata::File {
                        mime_type: header.map(|h| h.mime_type.clone()).unwrap_or_default(),
                        bytes: header.map(|h| h.bytes).unwrap_or(0),
                    })
                    .unwrap_or(serde_json::Value::Null)
                } else if self.meta.contains(&id) {
                    // Head clock: what we actually hold, capped by what the
                    // document has requested.
                    let mut clock = Clock::new();
                    for actor_id in self.meta.actors(&id) {
                        let cap = self.meta.clock_at(&id, &actor_id);
                        let len = self
                            .actors
                            .get(&actor_id)
                            .map(|a| a.changes.len() as u64)
                            .unwrap_or(0);
                        clock.set(actor_id, cap.min(len));
                    }
                    serde_json::to_value(PublicMetadata::Document {
                        actors: self.meta.actors(&id),
                        clock,
                        local_actor: self.meta.local_actor(&id),
                    })
                    .unwrap_or(serde_json::Value::Null)
                } else {
                    serde_json::Value::Null
                }
            }
            QueryMsg::Materialize { id, history } => self
                .docs
                .get(&id)
                .map(|doc| doc.materialize(history))
                .unwrap_or(serde_json::Value::Null),
        };
        let _ = self.to_frontend.send(ToFrontend::Reply {
            id: query_id,
            payload,
        });
    }

    fn handle_destroy(&mut self, id: DocId) {
        tracing::info!(doc = %id, "destroying document");
        self.docs.remove(&id);
        self.pending_loads.remove(&id);
        self.meta.delete(&id);

        let alive = self.meta.all_actors();
        let orphans: Vec<ActorId> = self
            .actors
            .keys()
            .copied()
            .filter(|a| !alive.contains(a))
            .collect();
        for actor_id in orphans {
            self.swarm.leave(actor_id.discovery_id());
            self.repl.remove_feed_id(&actor_id);
            self.actors.remove(&actor_id);
            if let Err(e) = self.feeds.delete(actor_id) {
                tracing::warn!(actor = %actor_id, "feed cleanup failed: {e}");
            }
            tracing::info!(actor = %actor_id, "purged orphan actor");
        }
    }

    fn handle_debug(&mut self, id: DocId) {
        let doc = self.docs.get(&id);
        tracing::info!(
            doc = %id,
            ready = doc.map(|d| d.ready).unwrap_or(false),
            history = doc.map(|d| d.history_len()).unwrap_or(0),
            clock = ?doc.map(|d| d.clock.clone()),
            local_actor = ?doc.and_then(|d| d.actor_id),
            actors = ?self.meta.actors(&id),
            merge = ?self.meta.merge_clock(&id),
            peers = ?self.router.peer_ids(),
            "debug dump"
        );
    }

    // ── Peer IO ─────────────────────────────────────────────────────

    fn handle_peer_io(&mut self, event: PeerIoEvent) {
        match event {
            PeerIoEvent::Joined { peer, tx } => {
                tracing::info!(peer = %peer, "peer joined");
                self.router.add_peer(peer, tx);
                self.repl.on_peer(peer);
                self.router.send_to_peer(
                    &peer,
                    WireMsg::Interest {
                        discovery_ids: self.repl.interests(),
                    },
                );
            }
            PeerIoEvent::Msg { peer, msg } => self.handle_peer_msg(peer, msg),
            PeerIoEvent::Left { peer } => {
                tracing::info!(peer = %peer, "peer left");
                self.router.remove_peer(&peer);
                self.repl.remove_peer(&peer);
                for actor in self.actors.values_mut() {
                    actor.peers.remove(&peer);
                }
            }
        }
    }

    fn handle_peer_msg(&mut self, peer: PeerId, msg: WireMsg) {
        match msg {
            WireMsg::Hello { .. } => {
                tracing::debug!(peer = %peer, "stray hello after handshake, ignoring");
            }
            WireMsg::Interest { discovery_ids } => {
                let events = self.repl.on_interest(peer, discovery_ids);
                for event in events {
                    self.handle_discovery(event);
                }
            }
            WireMsg::RemoteMetadata { blocks, clocks } => {
                self.handle_remote_metadata(peer, blocks, clocks);
            }
            WireMsg::DocMessage { id, contents } => {
                let _ = self
                    .to_frontend
                    .send(ToFrontend::DocumentMessage { id, contents });
            }
            WireMsg::FeedRequest {
                discovery_id,
                from,
            } => self.handle_feed_request(peer, discovery_id, from),
            WireMsg::FeedBlocks {
                discovery_id,
                start,
                blocks,
                sigs,
                total,
            } => self.handle_feed_blocks(peer, discovery_id, start, blocks, sigs, total),
        }
    }

    fn handle_remote_metadata(
        &mut self,
        peer: PeerId,
        blocks: Vec<crate::meta::MetadataBlock>,
        clocks: BTreeMap<DocId, Clock>,
    ) {
        let blocks = sanitize_remote_metadata(blocks);
        for (doc_id, clock) in &clocks {
            if let Err(e) = self.clocks.update(peer, *doc_id, clock) {
                tracing::warn!(peer = %peer, doc = %doc_id, "clock update failed: {e}");
            }
        }

        let mut touched_actors: BTreeSet<ActorId> = BTreeSet::new();
        let mut touched_docs: BTreeSet<DocId> = BTreeSet::new();
        for block in &blocks {
            touched_docs.insert(block.id);
            touched_actors.extend(block.actors.iter().copied());
            touched_actors.extend(block.merge.actors().copied());
        }

        let newly_seen = self.meta.add_blocks(blocks);
        for actor_id in newly_seen {
            if let Err(e) = self.ensure_actor(actor_id) {
                tracing::warn!(actor = %actor_id, "gossiped actor failed to open: {e}");
            }
        }

        self.sync_ready_actors(touched_actors);
        for doc_id in touched_docs {
            self.try_load(doc_id);
        }
    }

    fn handle_feed_request(&mut self, peer: PeerId, discovery_id: DiscoveryId, from: u64) {
        let Some(actor_id) = self.repl.actor_for(&discovery_id) else {
            tracing::debug!(peer = %peer, "feed request for an unknown feed");
            return;
        };
        let Some(actor) = self.actors.get_mut(&actor_id) else {
            return;
        };
        actor.peers.insert(peer);
        let total = actor.feed.len();
        if from >= total {
            return;
        }
        let mut blocks = Vec::new();
        let mut sigs = Vec::new();
        for index in from..total {
            match (actor.feed.get(index), actor.feed.signature(index)) {
                (Some(data), Some(sig)) => {
                    blocks.push(B64.encode(data));
                    sigs.push(B64.encode(sig));
                }
                _ => break,
            }
        }
        self.router.send_to_peer(
            &peer,
            WireMsg::FeedBlocks {
                discovery_id,
                start: from,
                blocks,
                sigs,
                total,
            },
        );
    }

    fn handle_feed_blocks(
        &mut self,
        peer: PeerId,
        discovery_id: DiscoveryId,
        start: u64,
        blocks: Vec<String>,
        sigs: Vec<String>,
        total: u64,
    ) {
        let Some(actor_id) = self.repl.actor_for(&discovery_id) else {
            return;
        };
        if blocks.len() != sigs.len() {
            tracing::warn!(peer = %peer, "feed blocks with mismatched signature count");
            return;
        }

        let mut appended: Vec<(u64, u64)> = Vec::new();
        {
            let Some(actor) = self.actors.get_mut(&actor_id) else {
                return;
            };
            for (offset, (data_b64, sig_b64)) in blocks.iter().zip(&sigs).enumerate() {
                let index = start + offset as u64;
                let data = match B64.decode(data_b64) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(peer = %peer, "undecodable block payload: {e}");
                        continue;
                    }
                };
                let sig = match B64.decode(sig_b64) {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::warn!(peer = %peer, "undecodable block signature: {e}");
                        continue;
                    }
                };
                match actor.feed.append_remote(index, data.clone(), &sig) {
                    Ok(true) => {
                        if let Err(e) = actor.ingest_block(index, &data) {
                            tracing::warn!(actor = %actor_id, "stopped ingesting feed: {e}");
                            break;
                        }
                        appended.push((index, data.len() as u64));
                    }
                    Ok(false) => {} // duplicate or gap
                    Err(e) => {
                        tracing::warn!(peer = %peer, actor = %actor_id, "rejected block: {e}");
                        break;
                    }
                }
            }
        }

        if !appended.is_empty() {
            let now = chrono::Utc::now().timestamp_millis();
            for (index, size) in &appended {
                let _ = self.event_tx.send(Event::Actor {
                    id: actor_id,
                    event: ActorEvent::Download {
                        index: *index,
                        size: *size,
                        time: now,
                    },
                });
            }
            let _ = self.event_tx.send(Event::Actor {
                id: actor_id,
                event: ActorEvent::Sync,
            });
            for (index, _) in &appended {
                self.broadcast_block(actor_id, *index, Some(peer));
            }
            // Classification may have just been learned from block 0.
            let file_header = self.actors.get(&actor_id).and_then(|actor| {
                (actor.classification == Classification::File)
                    .then(|| actor.file_header.clone())
                    .flatten()
            });
            if let Some(header) = file_header {
                self.meta.set_file(actor_id.as_doc(), header);
            }

            // Ask again while the sender still has blocks we lack. Only
            // after progress — a peer that keeps resending blocks we
            // reject must not drive a request loop.
            let len = self
                .actors
                .get(&actor_id)
                .map(|a| a.feed.len())
                .unwrap_or(0);
            if total > len {
                self.router.send_to_peer(
                    &peer,
                    WireMsg::FeedRequest {
                        discovery_id,
                        from: len,
                    },
                );
            }
        } else if start > 0 {
            // A broadcast landed past our length: we missed earlier
            // blocks, so ask for the gap. `start > len` bounds this to
            // genuine holes and cannot re-request rejected blocks.
            let len = self
                .actors
                .get(&actor_id)
                .map(|a| a.feed.len())
                .unwrap_or(0);
            if start > len && total > len {
                self.router.send_to_peer(
                    &peer,
                    WireMsg::FeedRequest {
                        discovery_id,
                        from: len,
                    },
                );
            }
        }
    }

    /// A peer became able to replicate `actor`'s feed: send it our
    /// metadata and clocks, attach it, and start pulling blocks.
    fn handle_discovery(&mut self, event: DiscoveryEvent) {
        let DiscoveryEvent { actor, peer } = event;
        tracing::debug!(actor = %actor, peer = %peer, "feed discovered on peer");

        let blocks = self.meta.blocks_for_actor(&actor);
        let docs = self.meta.docs_with(&actor);
        let clocks = self.clocks_for_docs(&docs);
        if !blocks.is_empty() {
            self.router
                .send_to_peer(&peer, WireMsg::RemoteMetadata { blocks, clocks });
        }

        if let Some(actor_ref) = self.actors.get_mut(&actor) {
            actor_ref.peers.insert(peer);
            let from = actor_ref.feed.len();
            self.router.send_to_peer(
                &peer,
                WireMsg::FeedRequest {
                    discovery_id: actor.discovery_id(),
                    from,
                },
            );
        }
    }

    // ── Actor lifecycle ─────────────────────────────────────────────

    fn handle_actor_event(&mut self, actor_id: ActorId, event: ActorEvent) {
        match event {
            ActorEvent::FeedReady => self.handle_actor_ready(actor_id, false),
            ActorEvent::Initialized => self.handle_actor_ready(actor_id, true),
            ActorEvent::Sync => {
                if let Some(actor) = self.actors.get_mut(&actor_id) {
                    actor.on_synced();
                }
                self.sync_changes(actor_id);
            }
            ActorEvent::Download { index, size, time } => {
                for doc_id in self.meta.docs_with(&actor_id) {
                    let _ = self.to_frontend.send(ToFrontend::ActorBlockDownloaded {
                        id: doc_id,
                        actor_id,
                        index,
                        size,
                        time,
                    });
                }
            }
        }
    }

    fn handle_actor_ready(&mut self, actor_id: ActorId, initialized: bool) {
        let writable = match self.actors.get_mut(&actor_id) {
            Some(actor) => {
                actor.ready = true;
                actor.feed.writable()
            }
            None => return,
        };
        self.meta.set_writable(actor_id, writable);
        self.join_actor(actor_id);

        if !initialized {
            // Re-send metadata and clocks to every peer interested in a
            // document containing this actor.
            let docs = self.meta.docs_with(&actor_id);
            let mut topics: BTreeSet<DiscoveryId> = BTreeSet::new();
            for doc_id in &docs {
                for other in self.meta.actors(doc_id) {
                    topics.insert(other.discovery_id());
                }
            }
            let peers = self.repl.peers_with(topics);
            if !peers.is_empty() {
                let blocks = self.meta.blocks_for_actor(&actor_id);
                let clocks = self.clocks_for_docs(&docs);
                if !blocks.is_empty() {
                    self.router
                        .send_to_peers(&peers, WireMsg::RemoteMetadata { blocks, clocks });
                }
            }
        }

        for doc_id in self.meta.docs_with(&actor_id) {
            self.try_load(doc_id);
        }
    }

    /// Propagate newly arrived changes from an actor into every document
    /// containing it. Delivery is capped by the document's merge clock and
    /// always contiguous per actor.
    fn sync_changes(&mut self, actor_id: ActorId) {
        for doc_id in self.meta.docs_with(&actor_id) {
            let outcome = {
                let Some(doc) = self.docs.get_mut(&doc_id) else {
                    continue;
                };
                if !doc.ready {
                    doc.defer_sync(actor_id);
                    continue;
                }
                let Some(actor) = self.actors.get(&actor_id) else {
                    continue;
                };
                let cap = self.meta.clock_at(&doc_id, &actor_id);
                let applied = doc.applied(&actor_id);
                let upper = (actor.changes.len() as u64).min(cap);
                if upper <= applied {
                    None
                } else {
                    let slice = actor.changes[applied as usize..upper as usize].to_vec();
                    doc.set_applied(actor_id, upper);
                    Some(doc.apply_remote_changes(slice))
                }
            };
            if let Some(msg) = outcome {
                self.dispatch_doc_msg(doc_id, msg);
            }
        }
    }

    fn sync_ready_actors(&mut self, ids: BTreeSet<ActorId>) {
        for actor_id in ids {
            let ready = self
                .actors
                .get(&actor_id)
                .map(|a| a.ready)
                .unwrap_or(false);
            if ready {
                self.sync_changes(actor_id);
            }
        }
    }

    // ── Document loading ────────────────────────────────────────────

    /// Complete a deferred `open` once every known actor of the document
    /// is ready: slice each change log up to the merge clock, assign the
    /// local writable actor (reusing or minting), and initialize.
    fn try_load(&mut self, doc_id: DocId) {
        if !self.pending_loads.contains(&doc_id) {
            return;
        }
        let actor_ids = self.meta.actors(&doc_id);
        let all_ready = actor_ids
            .iter()
            .all(|a| self.actors.get(a).map(|x| x.ready).unwrap_or(false));
        if !all_ready {
            return;
        }
        self.pending_loads.remove(&doc_id);

        let mut slices = Vec::new();
        for actor_id in &actor_ids {
            let cap = self.meta.clock_at(&doc_id, actor_id);
            let Some(actor) = self.actors.get(actor_id) else {
                continue;
            };
            let upper = (actor.changes.len() as u64).min(cap) as usize;
            slices.push((*actor_id, actor.changes[..upper].to_vec()));
        }

        let local = match self.meta.local_actor(&doc_id) {
            Some(actor_id) => actor_id,
            None => match self.mint_local_actor(doc_id) {
                Ok(actor_id) => actor_id,
                Err(e) => {
                    tracing::error!(doc = %doc_id, "could not mint a writable actor: {e}");
                    return;
                }
            },
        };

        let Some(doc) = self.docs.get_mut(&doc_id) else {
            return;
        };
        let (msgs, _deferred) = doc.init(slices, Some(local));
        tracing::info!(doc = %doc_id, local_actor = %local, "document loaded");
        for msg in msgs {
            self.dispatch_doc_msg(doc_id, msg);
        }
        // Catch anything that arrived while the load was pending (covers
        // the deferred queue as well).
        for actor_id in self.meta.actors(&doc_id) {
            if self
                .actors
                .get(&actor_id)
                .map(|a| a.ready)
                .unwrap_or(false)
            {
                self.sync_changes(actor_id);
            }
        }
    }

    // ── Doc message dispatch & satisfied clocks ─────────────────────

    fn dispatch_doc_msg(&mut self, doc_id: DocId, msg: DocMsg) {
        match msg {
            DocMsg::Ready { history, patch } => {
                let actor_id = self.docs.get(&doc_id).and_then(|d| d.actor_id);
                let minimum_clock_satisfied = self.good_clock(&doc_id).is_some();
                let _ = self.to_frontend.send(ToFrontend::Ready {
                    id: doc_id,
                    actor_id,
                    minimum_clock_satisfied,
                    history,
                    patch,
                });
            }
            DocMsg::ActorId { actor_id } => {
                let _ = self
                    .to_frontend
                    .send(ToFrontend::ActorId { id: doc_id, actor_id });
            }
            DocMsg::RemotePatch { patch, history } => {
                let good = self.good_clock(&doc_id);
                if let Some(good_clock) = &good {
                    if let Err(e) = self.clocks.update(self.id.as_peer(), doc_id, good_clock) {
                        tracing::warn!(doc = %doc_id, "baseline persist failed: {e}");
                    }
                }
                let _ = self.to_frontend.send(ToFrontend::Patch {
                    id: doc_id,
                    minimum_clock_satisfied: good.is_some(),
                    history,
                    patch,
                });
            }
            DocMsg::LocalPatch {
                change,
                patch,
                history,
            } => {
                let actor_id = change.actor;
                // The change reaches the feed before the dispatcher moves
                // on — nothing can interleave with it.
                let written = match self.actors.get_mut(&actor_id) {
                    Some(actor) => actor.write_change(change),
                    None => Err(RepoError::MissingActor(actor_id)),
                };
                let index = match written {
                    Ok(index) => index,
                    Err(e) => {
                        tracing::error!(doc = %doc_id, actor = %actor_id, "feed write failed: {e}");
                        return;
                    }
                };
                self.broadcast_block(actor_id, index, None);
                let _ = self.event_tx.send(Event::Actor {
                    id: actor_id,
                    event: ActorEvent::Sync,
                });

                // Our own feed now holds the change durably; persist the
                // clock as a baseline before evaluating the predicate.
                let clock = self
                    .docs
                    .get(&doc_id)
                    .map(|d| d.clock.clone())
                    .unwrap_or_default();
                if let Err(e) = self.clocks.update(self.id.as_peer(), doc_id, &clock) {
                    tracing::warn!(doc = %doc_id, "baseline persist failed: {e}");
                }
                let minimum_clock_satisfied = self.good_clock(&doc_id).is_some();
                let _ = self.to_frontend.send(ToFrontend::Patch {
                    id: doc_id,
                    minimum_clock_satisfied,
                    history,
                    patch,
                });
            }
        }
    }

    /// A clock proving the document is at least as advanced as some
    /// persisted baseline, if one exists.
    fn good_clock(&self, doc_id: &DocId) -> Option<Clock> {
        let doc = self.docs.get(doc_id)?;
        if !doc.ready {
            return None;
        }
        if self.clocks.has(self.id.as_peer(), *doc_id) {
            return Some(doc.clock.clone());
        }
        self.clocks
            .max_satisfied_clock(*doc_id, &doc.clock)
            .ok()
            .flatten()
    }

    // ── Files ───────────────────────────────────────────────────────

    fn handle_file_request(&mut self, request: FileRequest) {
        match request {
            FileRequest::Write {
                bytes,
                mime_type,
                reply,
            } => {
                let _ = reply.send(self.handle_write_file(&bytes, &mime_type));
            }
            FileRequest::Read { actor, reply } => {
                if let Err(e) = self.ensure_actor(actor) {
                    let _ = reply.send(Err(e));
                    return;
                }
                // Make the swarm look for the feed in case it is remote.
                self.join_actor(actor);
                if let Some(actor_ref) = self.actors.get_mut(&actor) {
                    actor_ref.read_file(reply);
                }
            }
        }
    }

    fn handle_write_file(&mut self, bytes: &[u8], mime_type: &str) -> Result<ActorId, RepoError> {
        let keypair = KeyPair::generate();
        let actor_id = keypair.id();
        self.meta.set_writable(actor_id, true);
        self.ensure_actor_with_keypair(keypair)?;
        let header = match self.actors.get_mut(&actor_id) {
            Some(actor) => actor.write_file(bytes, mime_type)?,
            None => return Err(RepoError::MissingActor(actor_id)),
        };
        self.meta.set_file(actor_id.as_doc(), header);
        self.adopt_actor(actor_id.as_doc(), actor_id);
        // A locally written feed is trivially caught up.
        let _ = self.event_tx.send(Event::Actor {
            id: actor_id,
            event: ActorEvent::Sync,
        });
        tracing::info!(actor = %actor_id, bytes = bytes.len(), %mime_type, "file stored");
        Ok(actor_id)
    }

    // ── Actor plumbing ──────────────────────────────────────────────

    fn insert_actor(&mut self, feed: crate::feed::Feed) -> Result<(), RepoError> {
        let (actor, events) = Actor::new(feed)?;
        let actor_id = actor.id;
        self.actors.insert(actor_id, actor);
        for event in events {
            let _ = self.event_tx.send(Event::Actor {
                id: actor_id,
                event,
            });
        }
        Ok(())
    }

    fn ensure_actor(&mut self, actor_id: ActorId) -> Result<(), RepoError> {
        if self.actors.contains_key(&actor_id) {
            return Ok(());
        }
        let feed = self.feeds.open(actor_id)?;
        self.insert_actor(feed)
    }

    fn ensure_actor_with_keypair(&mut self, keypair: KeyPair) -> Result<(), RepoError> {
        if self.actors.contains_key(&keypair.id()) {
            return Ok(());
        }
        let feed = self.feeds.create(keypair)?;
        self.insert_actor(feed)
    }

    /// Track `actor` as part of `doc`, joining the swarm for actors this
    /// process has not seen before, and push the grown actor set to peers
    /// already interested in the document.
    fn adopt_actor(&mut self, doc_id: DocId, actor_id: ActorId) {
        for newly_seen in self.meta.add_actor(doc_id, actor_id) {
            self.join_actor(newly_seen);
        }
        self.gossip_doc(doc_id);
    }

    /// Send one document's current metadata block and clocks to every peer
    /// interested in any of its actors. Gossip is monotone, so resends are
    /// harmless.
    fn gossip_doc(&mut self, doc_id: DocId) {
        let topics: BTreeSet<DiscoveryId> = self
            .meta
            .actors(&doc_id)
            .iter()
            .map(|a| a.discovery_id())
            .collect();
        let peers = self.repl.peers_with(topics);
        if peers.is_empty() {
            return;
        }
        let Some(block) = self.meta.block_for_doc(&doc_id) else {
            return;
        };
        let clocks = self.clocks_for_docs(&[doc_id]);
        self.router.send_to_peers(
            &peers,
            WireMsg::RemoteMetadata {
                blocks: vec![block],
                clocks,
            },
        );
    }

    /// Join the swarm topic, register the feed for replication, and
    /// advertise the updated interest set.
    fn join_actor(&mut self, actor_id: ActorId) {
        self.swarm.join(actor_id.discovery_id());
        let events = self.repl.add_feed_ids([actor_id]);
        let peers = self.router.peer_ids();
        if !peers.is_empty() {
            self.router.send_to_peers(
                &peers,
                WireMsg::Interest {
                    discovery_ids: self.repl.interests(),
                },
            );
        }
        for event in events {
            self.handle_discovery(event);
        }
    }

    fn mint_local_actor(&mut self, doc_id: DocId) -> Result<ActorId, RepoError> {
        let keypair = KeyPair::generate();
        let actor_id = keypair.id();
        self.meta.set_writable(actor_id, true);
        self.ensure_actor_with_keypair(keypair)?;
        self.adopt_actor(doc_id, actor_id);
        tracing::info!(doc = %doc_id, actor = %actor_id, "minted writable actor");
        Ok(actor_id)
    }

    /// Send a freshly appended block to the actor's attached peers,
    /// skipping the peer it came from.
    fn broadcast_block(&mut self, actor_id: ActorId, index: u64, except: Option<PeerId>) {
        let Some(actor) = self.actors.get(&actor_id) else {
            return;
        };
        if actor.peers.is_empty() {
            return;
        }
        let (Some(data), Some(sig)) = (actor.feed.get(index), actor.feed.signature(index)) else {
            return;
        };
        let msg = WireMsg::FeedBlocks {
            discovery_id: actor_id.discovery_id(),
            start: index,
            blocks: vec![B64.encode(data)],
            sigs: vec![B64.encode(sig)],
            total: actor.feed.len(),
        };
        let peers: Vec<PeerId> = actor
            .peers
            .iter()
            .copied()
            .filter(|p| Some(*p) != except)
            .collect();
        self.router.send_to_peers(&peers, msg);
    }

    fn clocks_for_docs(&self, docs: &[DocId]) -> BTreeMap<DocId, Clock> {
        let mut clocks = BTreeMap::new();
        for doc_id in docs {
            if let Ok(Some(clock)) = self.clocks.get(self.id.as_peer(), *doc_id) {
                clocks.insert(*doc_id, clock);
            } else if let Some(doc) = self.docs.get(doc_id) {
                if doc.ready && !doc.clock.is_empty() {
                    clocks.insert(*doc_id, doc.clock.clone());
                }
            }
        }
        clocks
    }
}
