//! SQLite persistence for clocks and keypairs.
//!
//! One database file (`feedmesh.db`) in WAL mode, two tables:
//! `clocks(peer, doc, clock_json)` and `keys(name, public, secret)`.
//! Clocks are stored as canonical JSON (sorted actor ids, no zero entries)
//! and merged monotonically on update, so a stored clock never moves
//! backward.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::clock::Clock;
use crate::error::RepoError;
use crate::keys::{DocId, KeyPair, PeerId};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepoError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for the `memory` option and tests).
    pub fn open_memory() -> Result<Self, RepoError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), RepoError> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS clocks (
                peer       TEXT NOT NULL,
                doc        TEXT NOT NULL,
                clock_json TEXT NOT NULL,
                PRIMARY KEY (peer, doc)
            );

            CREATE TABLE IF NOT EXISTS keys (
                name   TEXT PRIMARY KEY,
                public BLOB NOT NULL,
                secret BLOB
            );
            ",
        )?;
        Ok(())
    }

    fn get_clock(&self, peer: &PeerId, doc: &DocId) -> Result<Option<Clock>, RepoError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT clock_json FROM clocks WHERE peer = ?1 AND doc = ?2",
                params![peer.to_string(), doc.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put_clock(&self, peer: &PeerId, doc: &DocId, clock: &Clock) -> Result<(), RepoError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO clocks (peer, doc, clock_json) VALUES (?1, ?2, ?3)",
            params![
                peer.to_string(),
                doc.to_string(),
                serde_json::to_string(clock)?
            ],
        )?;
        Ok(())
    }

    fn clocks_for_doc(&self, doc: &DocId) -> Result<Vec<Clock>, RepoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT clock_json FROM clocks WHERE doc = ?1")?;
        let rows = stmt.query_map(params![doc.to_string()], |row| row.get::<_, String>(0))?;
        let mut clocks = Vec::new();
        for row in rows {
            clocks.push(serde_json::from_str(&row?)?);
        }
        Ok(clocks)
    }

    fn get_key(&self, name: &str) -> Result<Option<KeyPair>, RepoError> {
        let row: Option<(Vec<u8>, Option<Vec<u8>>)> = self
            .conn
            .query_row(
                "SELECT public, secret FROM keys WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((public, secret)) => Ok(Some(KeyPair::from_parts(&public, secret.as_deref())?)),
            None => Ok(None),
        }
    }

    fn put_key(&self, name: &str, keypair: &KeyPair) -> Result<(), RepoError> {
        let secret = keypair.secret.as_ref().map(|s| s.to_bytes().to_vec());
        self.conn.execute(
            "INSERT OR REPLACE INTO keys (name, public, secret) VALUES (?1, ?2, ?3)",
            params![name, keypair.public.to_bytes().to_vec(), secret],
        )?;
        Ok(())
    }
}

/// Persistent mapping `(peer, doc) → clock` with monotone updates.
#[derive(Clone)]
pub struct ClockStore {
    db: Arc<Mutex<Db>>,
}

impl ClockStore {
    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    /// Merge `incoming` into the stored clock (pointwise max). Returns the
    /// merged clock and whether anything changed.
    pub fn update(
        &self,
        peer: PeerId,
        doc: DocId,
        incoming: &Clock,
    ) -> Result<(Clock, bool), RepoError> {
        let db = self.db.lock();
        let mut merged = db.get_clock(&peer, &doc)?.unwrap_or_default();
        let before = merged.clone();
        merged.union(incoming);
        let changed = merged != before;
        db.put_clock(&peer, &doc, &merged)?;
        Ok((merged, changed))
    }

    pub fn get(&self, peer: PeerId, doc: DocId) -> Result<Option<Clock>, RepoError> {
        self.db.lock().get_clock(&peer, &doc)
    }

    pub fn has(&self, peer: PeerId, doc: DocId) -> bool {
        matches!(self.db.lock().get_clock(&peer, &doc), Ok(Some(_)))
    }

    /// The largest stored clock for `doc` that `target` dominates: the
    /// union of every stored clock `≤ target`, from any peer. `None` when
    /// no stored clock qualifies.
    pub fn max_satisfied_clock(
        &self,
        doc: DocId,
        target: &Clock,
    ) -> Result<Option<Clock>, RepoError> {
        let stored = self.db.lock().clocks_for_doc(&doc)?;
        let mut best: Option<Clock> = None;
        for clock in stored {
            if clock.lte(target) {
                best.get_or_insert_with(Clock::new).union(&clock);
            }
        }
        Ok(best)
    }
}

/// Persistent named keypairs. `"self.repo"` is the reserved name for the
/// repo identity.
#[derive(Clone)]
pub struct KeyStore {
    db: Arc<Mutex<Db>>,
}

impl KeyStore {
    pub const SELF_REPO: &'static str = "self.repo";

    pub fn new(db: Arc<Mutex<Db>>) -> Self {
        Self { db }
    }

    pub fn get(&self, name: &str) -> Result<Option<KeyPair>, RepoError> {
        self.db.lock().get_key(name)
    }

    pub fn set(&self, name: &str, keypair: &KeyPair) -> Result<(), RepoError> {
        self.db.lock().put_key(name, keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ActorId, KeyPair};

    fn store() -> ClockStore {
        ClockStore::new(Arc::new(Mutex::new(Db::open_memory().unwrap())))
    }

    fn actor() -> ActorId {
        KeyPair::generate().id()
    }

    fn peer() -> PeerId {
        let kp = KeyPair::generate();
        PeerId::from_bytes(*kp.id().as_bytes())
    }

    fn doc() -> DocId {
        KeyPair::generate().id().as_doc()
    }

    #[test]
    fn update_merges_monotonically() {
        let clocks = store();
        let (p, d, a) = (peer(), doc(), actor());

        let (merged, changed) = clocks.update(p, d, &[(a, 3)].into_iter().collect()).unwrap();
        assert!(changed);
        assert_eq!(merged.get(&a), 3);

        // A dominated clock is a no-op.
        let (merged, changed) = clocks.update(p, d, &[(a, 1)].into_iter().collect()).unwrap();
        assert!(!changed);
        assert_eq!(merged.get(&a), 3);
    }

    #[test]
    fn has_and_get() {
        let clocks = store();
        let (p, d, a) = (peer(), doc(), actor());
        assert!(!clocks.has(p, d));
        assert!(clocks.get(p, d).unwrap().is_none());

        clocks.update(p, d, &[(a, 1)].into_iter().collect()).unwrap();
        assert!(clocks.has(p, d));
        assert_eq!(clocks.get(p, d).unwrap().unwrap().get(&a), 1);
    }

    #[test]
    fn max_satisfied_unions_dominated_clocks() {
        let clocks = store();
        let d = doc();
        let (a, b) = (actor(), actor());
        clocks.update(peer(), d, &[(a, 2)].into_iter().collect()).unwrap();
        clocks.update(peer(), d, &[(b, 1)].into_iter().collect()).unwrap();
        // A clock above the target must not contribute.
        clocks.update(peer(), d, &[(a, 9)].into_iter().collect()).unwrap();

        let target: Clock = [(a, 5), (b, 5)].into_iter().collect();
        let best = clocks.max_satisfied_clock(d, &target).unwrap().unwrap();
        assert_eq!(best.get(&a), 2);
        assert_eq!(best.get(&b), 1);
    }

    #[test]
    fn max_satisfied_none_when_nothing_qualifies() {
        let clocks = store();
        let d = doc();
        let a = actor();
        assert!(clocks.max_satisfied_clock(d, &Clock::new()).unwrap().is_none());
        clocks.update(peer(), d, &[(a, 9)].into_iter().collect()).unwrap();
        let target: Clock = [(a, 1)].into_iter().collect();
        assert!(clocks.max_satisfied_clock(d, &target).unwrap().is_none());
    }

    #[test]
    fn keys_roundtrip() {
        let db = Arc::new(Mutex::new(Db::open_memory().unwrap()));
        let keys = KeyStore::new(db);
        assert!(keys.get(KeyStore::SELF_REPO).unwrap().is_none());

        let keypair = KeyPair::generate();
        keys.set(KeyStore::SELF_REPO, &keypair).unwrap();
        let loaded = keys.get(KeyStore::SELF_REPO).unwrap().unwrap();
        assert_eq!(loaded.id(), keypair.id());
        assert!(loaded.writable());
    }

    #[test]
    fn clocks_survive_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedmesh.db");
        let (p, d, a) = (peer(), doc(), actor());
        {
            let clocks = ClockStore::new(Arc::new(Mutex::new(Db::open(&path).unwrap())));
            clocks.update(p, d, &[(a, 4)].into_iter().collect()).unwrap();
        }
        let clocks = ClockStore::new(Arc::new(Mutex::new(Db::open(&path).unwrap())));
        assert_eq!(clocks.get(p, d).unwrap().unwrap().get(&a), 4);
    }
}
