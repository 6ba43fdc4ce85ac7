//! Identifiers and keypairs.
//!
//! Every id in the system is a base58-encoded 32-byte ed25519 public key
//! (or, for discovery topics, the SHA-256 of one). A `DocId` is identical
//! in form to an `ActorId`: the root actor of a document is the actor whose
//! id equals the document id.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::RepoError;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bs58::encode(&self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = RepoError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|_| RepoError::BadId(s.to_string()))?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| RepoError::BadId(s.to_string()))?;
                Ok(Self(arr))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let s = String::deserialize(de)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

id_type! {
    /// One append-only signed log of changes.
    ActorId
}
id_type! {
    /// A CRDT document, identified by the public key of its root actor.
    DocId
}
id_type! {
    /// A repository identity ("self.repo" keypair).
    RepoId
}
id_type! {
    /// A connected peer, identified by its repo public key.
    PeerId
}
id_type! {
    /// Swarm rendezvous topic: SHA-256 of an actor public key.
    DiscoveryId
}

impl DocId {
    /// The actor whose feed holds the document's first changes.
    pub fn root_actor(&self) -> ActorId {
        ActorId(self.0)
    }
}

impl ActorId {
    pub fn as_doc(&self) -> DocId {
        DocId(self.0)
    }

    /// The swarm topic for this actor's feed.
    pub fn discovery_id(&self) -> DiscoveryId {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        DiscoveryId(hasher.finalize().into())
    }
}

impl RepoId {
    /// Our own entry in the clock store is keyed by our repo id.
    pub fn as_peer(&self) -> PeerId {
        PeerId(self.0)
    }
}

/// An ed25519 keypair. The secret half may be absent, in which case the
/// corresponding feed is read-only for this process.
#[derive(Clone)]
pub struct KeyPair {
    pub public: VerifyingKey,
    pub secret: Option<SigningKey>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            public: secret.verifying_key(),
            secret: Some(secret),
        }
    }

    pub fn from_parts(public: &[u8], secret: Option<&[u8]>) -> Result<Self, RepoError> {
        let public_arr: [u8; 32] = public
            .try_into()
            .map_err(|_| RepoError::BadId(hex::encode(public)))?;
        let public = VerifyingKey::from_bytes(&public_arr)
            .map_err(|e| RepoError::BadId(format!("bad public key: {e}")))?;
        let secret = match secret {
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| RepoError::BadId("bad secret key length".into()))?;
                let secret = SigningKey::from_bytes(&arr);
                if secret.verifying_key() != public {
                    return Err(RepoError::BadId("secret key does not match public key".into()));
                }
                Some(secret)
            }
            None => None,
        };
        Ok(Self { public, secret })
    }

    pub fn read_only(public: ActorId) -> Result<Self, RepoError> {
        Self::from_parts(public.as_bytes(), None)
    }

    pub fn id(&self) -> ActorId {
        ActorId(self.public.to_bytes())
    }

    pub fn writable(&self) -> bool {
        self.secret.is_some()
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Signature, RepoError> {
        match &self.secret {
            Some(secret) => Ok(secret.sign(msg)),
            None => Err(RepoError::FeedAppend("feed is not writable".into())),
        }
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        self.public.verify(msg, sig).is_ok()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("id", &self.id())
            .field("writable", &self.writable())
            .finish()
    }
}
