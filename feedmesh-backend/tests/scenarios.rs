//! End-to-end scenarios over spawned backends and the in-memory swarm.
//!
//! Covers the full lifecycle: create/apply/observe, reopen from disk,
//! two-peer sync, late-arriving writable actors, orphan purging on
//! destroy, and explicit clock merges.

use std::time::Duration;

use serde_json::{Value, json};

use feedmesh_backend::backend::{RepoBackend, RepoHandle, RepoOptions};
use feedmesh_backend::clock::Clock;
use feedmesh_backend::crdt::ChangeRequest;
use feedmesh_backend::keys::{DocId, KeyPair};
use feedmesh_backend::msg::{QueryMsg, ToBackend, ToFrontend};
use feedmesh_backend::swarm::MemoryHub;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn recv(handle: &mut RepoHandle) -> ToFrontend {
    tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("timed out waiting for a frontend message")
        .expect("backend closed")
}

/// Next document-level message, skipping download-progress noise.
async fn recv_doc(handle: &mut RepoHandle) -> ToFrontend {
    loop {
        match recv(handle).await {
            ToFrontend::ActorBlockDownloaded { .. } => continue,
            msg => return msg,
        }
    }
}

fn spawn_memory(hub: &MemoryHub) -> RepoHandle {
    init_tracing();
    let mut repo = RepoBackend::new(RepoOptions::memory()).unwrap();
    let (swarm, events) = hub.register(repo.id());
    repo.set_swarm(Box::new(swarm), events);
    repo.spawn()
}

fn create_doc(handle: &RepoHandle) -> DocId {
    let keypair = KeyPair::generate();
    let doc_id = keypair.id().as_doc();
    handle.send(ToBackend::Create {
        public_key: keypair.public.to_bytes().to_vec(),
        secret_key: keypair.secret.as_ref().unwrap().to_bytes().to_vec(),
    });
    doc_id
}

async fn materialize(handle: &mut RepoHandle, query_id: u64, doc: DocId) -> Value {
    handle.send(ToBackend::Query {
        id: query_id,
        query: QueryMsg::Materialize {
            id: doc,
            history: u64::MAX,
        },
    });
    loop {
        if let ToFrontend::Reply { id, payload } = recv(handle).await {
            if id == query_id {
                return payload;
            }
        }
    }
}

async fn metadata(handle: &mut RepoHandle, query_id: u64, doc: DocId) -> Value {
    handle.send(ToBackend::Query {
        id: query_id,
        query: QueryMsg::Metadata { id: doc },
    });
    loop {
        if let ToFrontend::Reply { id, payload } = recv(handle).await {
            if id == query_id {
                return payload;
            }
        }
    }
}

#[tokio::test]
async fn create_apply_observe() {
    init_tracing();
    let mut repo = RepoBackend::new(RepoOptions::memory()).unwrap().spawn();
    let doc_id = create_doc(&repo);
    let root = doc_id.root_actor();

    match recv_doc(&mut repo).await {
        ToFrontend::Ready {
            id,
            actor_id,
            minimum_clock_satisfied,
            history,
            ..
        } => {
            assert_eq!(id, doc_id);
            assert_eq!(actor_id, Some(root));
            assert!(!minimum_clock_satisfied, "no baseline exists before any edit");
            assert_eq!(history, 0);
        }
        other => panic!("expected Ready, got {other:?}"),
    }

    repo.send(ToBackend::NeedsActorId { id: doc_id });
    match recv_doc(&mut repo).await {
        ToFrontend::ActorId { id, actor_id } => {
            assert_eq!(id, doc_id);
            assert_eq!(actor_id, root, "the root actor is the writable actor");
        }
        other => panic!("expected ActorId, got {other:?}"),
    }

    repo.send(ToBackend::Request {
        id: doc_id,
        request: ChangeRequest::set("text", json!("x")),
    });
    match recv_doc(&mut repo).await {
        ToFrontend::Patch {
            id,
            minimum_clock_satisfied,
            history,
            patch,
        } => {
            assert_eq!(id, doc_id);
            assert!(
                minimum_clock_satisfied,
                "the clock is satisfied once the first local change is persisted"
            );
            assert_eq!(history, 1);
            assert_eq!(patch.diffs[0].key, "text");
        }
        other => panic!("expected Patch, got {other:?}"),
    }

    assert_eq!(
        materialize(&mut repo, 1, doc_id).await,
        json!({ "text": "x" })
    );
}

#[tokio::test]
async fn reopen_persists_the_satisfied_clock() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let doc_id;
    {
        let mut repo = RepoBackend::new(RepoOptions::disk(dir.path()))
            .unwrap()
            .spawn();
        doc_id = create_doc(&repo);
        assert!(matches!(recv_doc(&mut repo).await, ToFrontend::Ready { .. }));
        repo.send(ToBackend::NeedsActorId { id: doc_id });
        assert!(matches!(recv_doc(&mut repo).await, ToFrontend::ActorId { .. }));
        repo.send(ToBackend::Request {
            id: doc_id,
            request: ChangeRequest::set("text", json!("persisted")),
        });
        assert!(matches!(recv_doc(&mut repo).await, ToFrontend::Patch { .. }));
        repo.close();
        repo.join().await;
    }

    let mut repo = RepoBackend::new(RepoOptions::disk(dir.path()))
        .unwrap()
        .spawn();
    repo.send(ToBackend::Open { id: doc_id });
    match recv_doc(&mut repo).await {
        ToFrontend::Ready {
            id,
            actor_id,
            minimum_clock_satisfied,
            history,
            ..
        } => {
            assert_eq!(id, doc_id);
            assert_eq!(actor_id, Some(doc_id.root_actor()));
            assert!(
                minimum_clock_satisfied,
                "a stored self clock satisfies the reopened document"
            );
            assert_eq!(history, 1);
        }
        other => panic!("expected Ready, got {other:?}"),
    }
    assert_eq!(
        materialize(&mut repo, 1, doc_id).await,
        json!({ "text": "persisted" })
    );
}

#[tokio::test]
async fn peer_sync_converges_a_consumer() {
    let hub = MemoryHub::new();
    let mut producer = spawn_memory(&hub);
    let mut consumer = spawn_memory(&hub);

    let doc_id = create_doc(&producer);
    assert!(matches!(recv_doc(&mut producer).await, ToFrontend::Ready { .. }));
    producer.send(ToBackend::NeedsActorId { id: doc_id });
    assert!(matches!(recv_doc(&mut producer).await, ToFrontend::ActorId { .. }));
    for (key, value) in [("title", json!("sync")), ("body", json!("two changes"))] {
        producer.send(ToBackend::Request {
            id: doc_id,
            request: ChangeRequest::set(key, value),
        });
        assert!(matches!(recv_doc(&mut producer).await, ToFrontend::Patch { .. }));
    }

    consumer.send(ToBackend::Open { id: doc_id });
    match recv_doc(&mut consumer).await {
        ToFrontend::Ready {
            id,
            minimum_clock_satisfied,
            history,
            ..
        } => {
            assert_eq!(id, doc_id);
            assert!(!minimum_clock_satisfied, "nothing replicated yet");
            assert_eq!(history, 0);
        }
        other => panic!("expected Ready, got {other:?}"),
    }
    match recv_doc(&mut consumer).await {
        ToFrontend::Patch { id, history, .. } => {
            assert_eq!(id, doc_id);
            assert_eq!(history, 2, "both changes arrive in one batch");
        }
        other => panic!("expected Patch, got {other:?}"),
    }

    let ours = materialize(&mut consumer, 1, doc_id).await;
    let theirs = materialize(&mut producer, 1, doc_id).await;
    assert_eq!(ours, theirs);
    assert_eq!(ours, json!({ "title": "sync", "body": "two changes" }));
}

#[tokio::test]
async fn late_arriving_actor_is_learned_on_both_sides() {
    let hub = MemoryHub::new();
    let mut one = spawn_memory(&hub);
    let mut two = spawn_memory(&hub);

    let doc_id = create_doc(&one);
    let actor_a = doc_id.root_actor();
    assert!(matches!(recv_doc(&mut one).await, ToFrontend::Ready { .. }));
    one.send(ToBackend::Request {
        id: doc_id,
        request: ChangeRequest::set("from", json!("one")),
    });
    assert!(matches!(recv_doc(&mut one).await, ToFrontend::Patch { .. }));

    two.send(ToBackend::Open { id: doc_id });
    let actor_b = match recv_doc(&mut two).await {
        ToFrontend::Ready { actor_id, .. } => actor_id.expect("opening mints a writable actor"),
        other => panic!("expected Ready, got {other:?}"),
    };
    assert_ne!(actor_b, actor_a, "the second writer gets its own feed");
    // A's change replicates over.
    assert!(matches!(recv_doc(&mut two).await, ToFrontend::Patch { .. }));

    // Both sides converge on the actor set {A, B} with their own local
    // actor each.
    let mut query_id = 10;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let meta_one = metadata(&mut one, query_id, doc_id).await;
        let meta_two = metadata(&mut two, query_id + 1, doc_id).await;
        query_id += 2;
        let actors_of = |meta: &Value| -> Vec<String> {
            meta["actors"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .map(|v| v.as_str().unwrap_or_default().to_string())
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut want = vec![actor_a.to_string(), actor_b.to_string()];
        want.sort();
        let mut got_one = actors_of(&meta_one);
        got_one.sort();
        let mut got_two = actors_of(&meta_two);
        got_two.sort();
        if got_one == want && got_two == want {
            assert_eq!(meta_one["localActor"], actor_a.to_string());
            assert_eq!(meta_two["localActor"], actor_b.to_string());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "actor sets never converged: {got_one:?} / {got_two:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn destroy_purges_orphan_actors() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut repo = RepoBackend::new(RepoOptions::disk(dir.path()))
        .unwrap()
        .spawn();

    let doc_one = create_doc(&repo);
    assert!(matches!(recv_doc(&mut repo).await, ToFrontend::Ready { .. }));
    let doc_two = create_doc(&repo);
    assert!(matches!(recv_doc(&mut repo).await, ToFrontend::Ready { .. }));

    let feed_one = dir.path().join(doc_one.root_actor().to_string());
    let feed_two = dir.path().join(doc_two.root_actor().to_string());
    assert!(feed_one.exists());
    assert!(feed_two.exists());

    repo.send(ToBackend::Destroy { id: doc_one });
    // Queries round-trip through the dispatcher, so the reply proves the
    // destroy was processed.
    assert_eq!(metadata(&mut repo, 1, doc_one).await, Value::Null);
    assert_ne!(metadata(&mut repo, 2, doc_two).await, Value::Null);

    assert!(!feed_one.exists(), "orphan actor storage is removed");
    assert!(feed_two.exists(), "unrelated actors survive");
}

#[tokio::test]
async fn explicit_merge_delivers_exactly_the_requested_prefix() {
    let hub = MemoryHub::new();
    let mut one = spawn_memory(&hub);
    let mut two = spawn_memory(&hub);

    // Repo one authors a document with two changes.
    let source_doc = create_doc(&one);
    let actor_a = source_doc.root_actor();
    assert!(matches!(recv_doc(&mut one).await, ToFrontend::Ready { .. }));
    for (key, value) in [("first", json!(1)), ("second", json!(2))] {
        one.send(ToBackend::Request {
            id: source_doc,
            request: ChangeRequest::set(key, value),
        });
        assert!(matches!(recv_doc(&mut one).await, ToFrontend::Patch { .. }));
    }

    // Repo two has an unrelated document and has never observed actor A.
    let doc_id = create_doc(&two);
    assert!(matches!(recv_doc(&mut two).await, ToFrontend::Ready { .. }));

    let clock: Clock = [(actor_a, 1u64)].into_iter().collect();
    two.send(ToBackend::Merge {
        id: doc_id,
        actors: clock,
    });

    // The merge joins A's feed; replication delivers change 1 and nothing
    // beyond it.
    match recv_doc(&mut two).await {
        ToFrontend::Patch { id, history, patch, .. } => {
            assert_eq!(id, doc_id);
            assert_eq!(history, 1, "only the merged prefix is applied");
            assert_eq!(patch.diffs.len(), 1);
            assert_eq!(patch.diffs[0].key, "first");
        }
        other => panic!("expected Patch, got {other:?}"),
    }

    assert_eq!(
        materialize(&mut two, 1, doc_id).await,
        json!({ "first": 1 }),
        "change 2 must not be applied"
    );

    let meta = metadata(&mut two, 2, doc_id).await;
    let actors: Vec<String> = meta["actors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(actors.contains(&actor_a.to_string()));
}
