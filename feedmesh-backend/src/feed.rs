//! Append-only signed block logs.
//!
//! Each feed is a contiguous sequence of blocks signed by one ed25519
//! keypair. A feed with the secret key present is writable; remote blocks
//! are verified against the public key before they are accepted. On-disk
//! feeds live under `<base>/<actorId>/` as hex key files plus a JSONL
//! block log; with the `memory` option nothing touches the filesystem.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;
use crate::keys::{ActorId, KeyPair};

#[derive(Serialize, Deserialize)]
struct BlockRow {
    index: u64,
    data: String,
    sig: String,
}

/// One append-only signed log. Blocks are owned exclusively by the actor
/// wrapping this feed.
pub struct Feed {
    keypair: KeyPair,
    blocks: Vec<Vec<u8>>,
    sigs: Vec<[u8; 64]>,
    dir: Option<PathBuf>,
}

impl Feed {
    pub fn id(&self) -> ActorId {
        self.keypair.id()
    }

    pub fn writable(&self) -> bool {
        self.keypair.writable()
    }

    pub fn len(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&[u8]> {
        self.blocks.get(index as usize).map(|b| b.as_slice())
    }

    pub fn signature(&self, index: u64) -> Option<&[u8; 64]> {
        self.sigs.get(index as usize)
    }

    /// Append a locally authored block. Requires the secret key.
    pub fn append(&mut self, data: Vec<u8>) -> Result<u64, RepoError> {
        let index = self.len();
        let sig = self.keypair.sign(&sign_payload(index, &data))?;
        self.push(index, data, sig.to_bytes())?;
        Ok(index)
    }

    /// Accept a replicated block. Returns `Ok(true)` if the block extended
    /// the feed, `Ok(false)` for duplicates (index below the length) and
    /// gaps (index above it — the caller re-requests from the length).
    /// Blocks failing signature verification are an error.
    pub fn append_remote(
        &mut self,
        index: u64,
        data: Vec<u8>,
        sig: &[u8],
    ) -> Result<bool, RepoError> {
        if index != self.len() {
            return Ok(false);
        }
        let sig_arr: [u8; 64] = sig
            .try_into()
            .map_err(|_| RepoError::BadBlock("bad signature length".into()))?;
        let signature = Signature::from_bytes(&sig_arr);
        if !self.keypair.verify(&sign_payload(index, &data), &signature) {
            return Err(RepoError::BadBlock(format!(
                "signature verification failed at index {index}"
            )));
        }
        self.push(index, data, sig_arr)?;
        Ok(true)
    }

    fn push(&mut self, index: u64, data: Vec<u8>, sig: [u8; 64]) -> Result<(), RepoError> {
        if let Some(dir) = &self.dir {
            let row = BlockRow {
                index,
                data: B64.encode(&data),
                sig: B64.encode(sig),
            };
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("log.jsonl"))
                .map_err(|e| RepoError::FeedAppend(e.to_string()))?;
            let mut line = serde_json::to_string(&row)?;
            line.push('\n');
            file.write_all(line.as_bytes())
                .map_err(|e| RepoError::FeedAppend(e.to_string()))?;
        }
        self.blocks.push(data);
        self.sigs.push(sig);
        Ok(())
    }
}

/// Creates and opens feeds under one base directory (or purely in memory).
pub struct FeedStore {
    base: Option<PathBuf>,
}

impl FeedStore {
    pub fn new(base: Option<PathBuf>) -> Self {
        Self { base }
    }

    /// Open a feed for a known keypair, creating its directory on first
    /// use and loading any blocks already on disk.
    pub fn create(&self, keypair: KeyPair) -> Result<Feed, RepoError> {
        let dir = match &self.base {
            Some(base) => {
                let dir = base.join(keypair.id().to_string());
                fs::create_dir_all(&dir)?;
                fs::write(dir.join("public.key"), hex::encode(keypair.public.to_bytes()))?;
                if let Some(secret) = &keypair.secret {
                    fs::write(dir.join("secret.key"), hex::encode(secret.to_bytes()))?;
                }
                Some(dir)
            }
            None => None,
        };
        let mut feed = Feed {
            keypair,
            blocks: Vec::new(),
            sigs: Vec::new(),
            dir,
        };
        load_blocks(&mut feed)?;
        Ok(feed)
    }

    /// Open a feed by id. Picks up the secret key from disk when we
    /// authored the feed in an earlier session; otherwise the feed is
    /// read-only.
    pub fn open(&self, id: ActorId) -> Result<Feed, RepoError> {
        let dir = self.base.as_ref().map(|base| base.join(id.to_string()));
        let secret = match &dir {
            Some(dir) if dir.join("secret.key").exists() => {
                let raw = fs::read_to_string(dir.join("secret.key"))?;
                let bytes = hex::decode(raw.trim())
                    .map_err(|e| RepoError::BadId(format!("bad secret key file: {e}")))?;
                Some(bytes)
            }
            _ => None,
        };
        let keypair = KeyPair::from_parts(id.as_bytes(), secret.as_deref())?;
        self.create(keypair)
    }

    /// Remove a feed's on-disk state (used when purging orphan actors).
    pub fn delete(&self, id: ActorId) -> Result<(), RepoError> {
        if let Some(base) = &self.base {
            let dir = base.join(id.to_string());
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

fn sign_payload(index: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

fn load_blocks(feed: &mut Feed) -> Result<(), RepoError> {
    let Some(dir) = &feed.dir else {
        return Ok(());
    };
    let path = dir.join("log.jsonl");
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(path)?;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let row: BlockRow = serde_json::from_str(line)?;
        if row.index != feed.len() {
            return Err(RepoError::BadBlock(format!(
                "feed log for {} is not contiguous at index {}",
                feed.id(),
                row.index
            )));
        }
        let data = B64
            .decode(&row.data)
            .map_err(|e| RepoError::BadBlock(e.to_string()))?;
        let sig: [u8; 64] = B64
            .decode(&row.sig)
            .map_err(|e| RepoError::BadBlock(e.to_string()))?
            .try_into()
            .map_err(|_| RepoError::BadBlock("bad signature length".into()))?;
        feed.blocks.push(data);
        feed.sigs.push(sig);
    }
    Ok(())
}
