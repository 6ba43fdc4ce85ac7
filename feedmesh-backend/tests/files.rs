//! File feeds: store, replicate, serve over HTTP, and the open-as-file
//! guard.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use feedmesh_backend::backend::{RepoBackend, RepoHandle, RepoOptions};
use feedmesh_backend::msg::{QueryMsg, ToBackend, ToFrontend};
use feedmesh_backend::swarm::MemoryHub;

async fn recv(handle: &mut RepoHandle) -> ToFrontend {
    tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("timed out waiting for a frontend message")
        .expect("backend closed")
}

fn spawn_memory(hub: &MemoryHub) -> RepoHandle {
    let mut repo = RepoBackend::new(RepoOptions::memory()).unwrap();
    let (swarm, events) = hub.register(repo.id());
    repo.set_swarm(Box::new(swarm), events);
    repo.spawn()
}

#[tokio::test]
async fn write_and_read_back_a_file() {
    let repo = RepoBackend::new(RepoOptions::memory()).unwrap().spawn();
    let actor = repo
        .write_file(b"file bytes".to_vec(), "text/plain")
        .await
        .unwrap();
    let (header, bytes) = repo.read_file(actor).await.unwrap();
    assert_eq!(header.mime_type, "text/plain");
    assert_eq!(header.bytes, 10);
    assert_eq!(bytes, b"file bytes");
}

#[tokio::test]
async fn files_replicate_between_peers() {
    let hub = MemoryHub::new();
    let writer = spawn_memory(&hub);
    let reader = spawn_memory(&hub);

    let actor = writer
        .write_file(b"replicated blob".to_vec(), "application/octet-stream")
        .await
        .unwrap();

    // The read joins the feed's topic, waits for replication, and resolves
    // once the feed has synced.
    let (header, bytes) = tokio::time::timeout(
        Duration::from_secs(5),
        reader.read_file(actor),
    )
    .await
    .expect("file never replicated")
    .unwrap();
    assert_eq!(header.mime_type, "application/octet-stream");
    assert_eq!(bytes, b"replicated blob");
}

#[tokio::test]
async fn open_on_a_file_id_is_rejected() {
    let hub = MemoryHub::new();
    let mut repo = spawn_memory(&hub);
    let actor = repo
        .write_file(b"not a document".to_vec(), "text/plain")
        .await
        .unwrap();
    let file_doc = actor.as_doc();

    repo.send(ToBackend::Open { id: file_doc });
    // The open is dropped; the next message is the query reply, and the
    // metadata classifies the id as a file.
    repo.send(ToBackend::Query {
        id: 7,
        query: QueryMsg::Metadata { id: file_doc },
    });
    match recv(&mut repo).await {
        ToFrontend::Reply { id, payload } => {
            assert_eq!(id, 7);
            assert_eq!(payload["type"], "File");
            assert_eq!(payload["mimeType"], "text/plain");
        }
        other => panic!("open must not produce a Ready for a file: {other:?}"),
    }
}

#[tokio::test]
async fn file_server_serves_blobs_over_http() {
    let mut options = RepoOptions::memory();
    options.file_server_addr = Some("127.0.0.1:0".parse().unwrap());
    let mut repo = RepoBackend::new(options).unwrap().spawn();

    let addr = match recv(&mut repo).await {
        ToFrontend::FileServerReady { path } => path,
        other => panic!("expected FileServerReady first, got {other:?}"),
    };
    let actor = repo
        .write_file(b"<svg>blob</svg>".to_vec(), "image/svg+xml")
        .await
        .unwrap();

    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    let request = format!(
        "GET /blobs/{actor} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("image/svg+xml"));
    assert!(response.ends_with("<svg>blob</svg>"));
}
