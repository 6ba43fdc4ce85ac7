//! Peer-to-peer collaborative document backend.
//!
//! Documents are CRDT states layered over per-actor append-only signed
//! feeds. Each peer records its edits as immutable changes in its own
//! writable feed, replicates feeds over an encrypted swarm, and merges
//! everything deterministically into its view of each document.
//!
//! The entry point is [`backend::RepoBackend`]: construct it with
//! [`backend::RepoOptions`], optionally attach a swarm (the in-memory
//! [`swarm::MemoryHub`] for tests, the [`iroh`] adapter for real
//! deployments), then [`backend::RepoBackend::spawn`] it and drive it
//! through the returned [`backend::RepoHandle`] with [`msg::ToBackend`]
//! commands.
//!
//! ```no_run
//! use feedmesh_backend::backend::{RepoBackend, RepoOptions};
//! use feedmesh_backend::keys::KeyPair;
//! use feedmesh_backend::msg::ToBackend;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let repo = RepoBackend::new(RepoOptions::memory())?;
//! let mut handle = repo.spawn();
//!
//! let keypair = KeyPair::generate();
//! handle.send(ToBackend::Create {
//!     public_key: keypair.public.to_bytes().to_vec(),
//!     secret_key: keypair.secret.as_ref().unwrap().to_bytes().to_vec(),
//! });
//! let ready = handle.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod backend;
pub mod clock;
pub mod crdt;
pub mod db;
pub mod doc;
pub mod error;
pub mod feed;
pub mod fileserver;
pub mod iroh;
pub mod keys;
pub mod meta;
pub mod msg;
pub mod replication;
pub mod router;
pub mod swarm;

pub use backend::{RepoBackend, RepoHandle, RepoOptions};
pub use error::RepoError;
pub use keys::{ActorId, DiscoveryId, DocId, KeyPair, PeerId, RepoId};
pub use msg::{QueryMsg, ToBackend, ToFrontend};
