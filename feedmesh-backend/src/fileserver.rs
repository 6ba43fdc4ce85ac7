//! HTTP blob server over file feeds.
//!
//! Serves `GET /blobs/{actorId}` straight from the coordinator's file
//! actors. Requests travel to the coordinator as [`FileRequest`] events
//! and resolve through the actor's deferred-read path, so a blob that is
//! still replicating answers once its feed has synced.

use std::net::SocketAddr;

use anyhow::Result;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;

use crate::error::RepoError;
use crate::keys::ActorId;
use crate::meta::FileHeader;

/// File operations handled by the coordinator.
#[derive(Debug)]
pub enum FileRequest {
    /// Store bytes as a new file feed; resolves to the new actor id.
    Write {
        bytes: Vec<u8>,
        mime_type: String,
        reply: oneshot::Sender<Result<ActorId, RepoError>>,
    },
    /// Read a file feed back, deferring until it has synced.
    Read {
        actor: ActorId,
        reply: oneshot::Sender<Result<(FileHeader, Vec<u8>), RepoError>>,
    },
}

#[derive(Clone)]
struct ServerState {
    requests: mpsc::UnboundedSender<FileRequest>,
}

/// Bind the blob server and return the bound address.
pub async fn start(
    addr: SocketAddr,
    requests: mpsc::UnboundedSender<FileRequest>,
) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/blobs/{id}", get(get_blob))
        .layer(CorsLayer::permissive())
        .with_state(ServerState { requests });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("file server exited: {e}");
        }
    });
    tracing::info!(%bound, "file server listening");
    Ok(bound)
}

async fn get_blob(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
    let actor: ActorId = match id.parse() {
        Ok(actor) => actor,
        Err(_) => return (StatusCode::BAD_REQUEST, "bad actor id").into_response(),
    };

    let (tx, rx) = oneshot::channel();
    if state
        .requests
        .send(FileRequest::Read { actor, reply: tx })
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "backend closed").into_response();
    }

    match rx.await {
        Ok(Ok((file_header, bytes))) => {
            ([(header::CONTENT_TYPE, file_header.mime_type)], bytes).into_response()
        }
        Ok(Err(e)) => {
            tracing::debug!(%actor, "blob read failed: {e}");
            (StatusCode::NOT_FOUND, "no such blob").into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "backend closed").into_response(),
    }
}
