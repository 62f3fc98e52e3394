//! Attribute-reconciliation cache.
//!
//! The dispatcher remembers, per resource, a content hash of the extra
//! attributes it last pushed to the backend, so that a fleet of agents does
//! not send the same `update_resource` call over and over. The cache is a
//! pure optimization: a miss or a stale entry only costs an extra backend
//! call, never a wrong result.
//!
//! The hash is a canonical, order-independent serialization (sorted key/value
//! pairs, length-framed) fed into blake3, so it is stable across processes,
//! architectures and agent versions. Cache keys are likewise an opaque blake3
//! digest of the resource id.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The cache operations the dispatcher consumes. Implementations may be
/// process-local or distributed (e.g. memcached); a distributed cache makes
/// the TTL a soft cross-process throttle.
pub trait AttributeCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str, ttl: Duration);
}

/// Opaque cache key derived from a resource id.
pub fn cache_key(resource_id: &str) -> String {
    hex::encode(&blake3::hash(resource_id.as_bytes()).as_bytes()[..16])
}

/// Canonical content hash of an attribute set.
///
/// Keys are visited in sorted order and each key/value pair is framed with
/// its length, so the digest does not depend on insertion order and cannot be
/// confused by concatenation ambiguities.
pub fn attribute_hash(attributes: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in attributes {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// Process-local [`AttributeCache`] with per-entry TTL.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttributeCache for InMemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value.to_owned(), expires_at));
    }
}
