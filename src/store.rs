//! Concurrent multi-database in-memory store with per-key TTL.
//!
//! Each logical database is its own `RwLock`-guarded map so that operations
//! against different databases never contend for the same lock. Lazy
//! expiry takes the write side of the shard's lock because it deletes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FerroError, Result};

/// A stored value plus its optional absolute expiration.
#[derive(Debug, Clone)]
pub struct Item {
    pub value: Vec<u8>,
    /// Seconds since the Unix epoch, or `None` if the key never expires.
    pub expire_at: Option<i64>,
}

impl Item {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expire_at, Some(at) if now > at)
    }
}

/// Current time as seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}

type Shard = RwLock<HashMap<Vec<u8>, Item>>;

/// An ordered sequence of independent databases, indexed `0..db_count`.
pub struct Store {
    databases: Vec<Shard>,
}

impl Store {
    pub fn new(db_count: usize) -> Self {
        let mut databases = Vec::with_capacity(db_count);
        databases.resize_with(db_count, || RwLock::new(HashMap::new()));
        Self { databases }
    }

    pub fn db_count(&self) -> usize {
        self.databases.len()
    }

    fn shard(&self, db: usize) -> Result<&Shard> {
        self.databases
            .get(db)
            .ok_or_else(|| FerroError::Range("ERR invalid DB index".to_string()))
    }

    /// Write `value`, clearing any existing expiration (`SET` resets TTL).
    pub fn set(&self, db: usize, key: &[u8], value: Vec<u8>) -> Result<()> {
        let shard = self.shard(db)?;
        let mut map = shard.write().expect("store lock poisoned");
        map.insert(
            key.to_vec(),
            Item {
                value,
                expire_at: None,
            },
        );
        Ok(())
    }

    /// Lazily expire `key` if its TTL has passed, then return its value.
    pub fn get(&self, db: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shard = self.shard(db)?;
        let now = now_secs();

        // Fast path: try a shared read first to avoid taking the write lock
        // on every GET of a live key.
        {
            let map = shard.read().expect("store lock poisoned");
            match map.get(key) {
                None => return Ok(None),
                Some(item) if !item.is_expired(now) => return Ok(Some(item.value.clone())),
                Some(_) => {}
            }
        }

        // The key is expired: reclaim it under the write lock.
        let mut map = shard.write().expect("store lock poisoned");
        if let Some(item) = map.get(key) {
            if item.is_expired(now) {
                map.remove(key);
                return Ok(None);
            }
            return Ok(Some(item.value.clone()));
        }
        Ok(None)
    }

    /// Remove `key` if present. Returns whether a removal occurred.
    pub fn del(&self, db: usize, key: &[u8]) -> Result<bool> {
        let shard = self.shard(db)?;
        let mut map = shard.write().expect("store lock poisoned");
        Ok(map.remove(key).is_some())
    }

    /// Set an absolute expiration. Fails (returns `false`) if the key is
    /// absent. `ts <= now` is valid and makes the key logically absent
    /// immediately.
    pub fn expire_at(&self, db: usize, key: &[u8], ts: i64) -> Result<bool> {
        let shard = self.shard(db)?;
        let mut map = shard.write().expect("store lock poisoned");
        match map.get_mut(key) {
            Some(item) => {
                item.expire_at = Some(ts);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clear a key's expiration. Returns `false` if the key is absent or
    /// already non-expiring.
    pub fn persist(&self, db: usize, key: &[u8]) -> Result<bool> {
        let shard = self.shard(db)?;
        let mut map = shard.write().expect("store lock poisoned");
        match map.get_mut(key) {
            Some(item) if item.expire_at.is_some() => {
                item.expire_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `-2` for absent keys, `-1` for keys without expiration, otherwise the
    /// non-negative remaining seconds. Also lazily expires the key.
    pub fn ttl(&self, db: usize, key: &[u8]) -> Result<i64> {
        let shard = self.shard(db)?;
        let now = now_secs();
        {
            let map = shard.read().expect("store lock poisoned");
            match map.get(key) {
                None => return Ok(-2),
                Some(item) if item.is_expired(now) => {}
                Some(Item {
                    expire_at: None, ..
                }) => return Ok(-1),
                Some(item) => return Ok(item.expire_at.unwrap() - now),
            }
        }
        let mut map = shard.write().expect("store lock poisoned");
        if let Some(item) = map.get(key) {
            if item.is_expired(now) {
                map.remove(key);
                return Ok(-2);
            }
            return Ok(item.expire_at.map(|at| at - now).unwrap_or(-1));
        }
        Ok(-2)
    }

    /// Live, non-expired keys currently in `db`, in no particular order.
    pub fn keys(&self, db: usize) -> Result<Vec<Vec<u8>>> {
        let shard = self.shard(db)?;
        let now = now_secs();
        let map = shard.read().expect("store lock poisoned");
        Ok(map
            .iter()
            .filter(|(_, item)| !item.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// A consistent, non-expired, point-in-time copy of every database.
    pub fn snapshot(&self) -> Vec<Vec<(Vec<u8>, Item)>> {
        let now = now_secs();
        self.databases
            .iter()
            .map(|shard| {
                let map = shard.read().expect("store lock poisoned");
                map.iter()
                    .filter(|(_, item)| !item.is_expired(now))
                    .map(|(k, item)| (k.clone(), item.clone()))
                    .collect()
            })
            .collect()
    }

    /// Total live entries across all databases. May be conservative if the
    /// sweeper hasn't run recently (an already-expired entry still counts
    /// until reclaimed).
    pub fn size(&self) -> usize {
        self.databases
            .iter()
            .map(|shard| shard.read().expect("store lock poisoned").len())
            .sum()
    }

    /// Delete every entry whose expiration has passed, across all
    /// databases. Called by the background sweeper.
    pub fn sweep_expired(&self) {
        let now = now_secs();
        for shard in &self.databases {
            let mut map = shard.write().expect("store lock poisoned");
            map.retain(|_, item| !item.is_expired(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(4)
    }

    #[test]
    fn set_then_get_round_trips() {
        let s = store();
        s.set(0, b"a", b"1".to_vec()).unwrap();
        assert_eq!(s.get(0, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let s = store();
        assert_eq!(s.get(0, b"missing").unwrap(), None);
    }

    #[test]
    fn invalid_db_index_is_an_error() {
        let s = store();
        assert!(s.get(10, b"a").is_err());
        assert!(matches!(s.get(10, b"a"), Err(FerroError::Range(_))));
    }

    #[test]
    fn set_clears_existing_ttl() {
        let s = store();
        s.set(0, b"k", b"v".to_vec()).unwrap();
        s.expire_at(0, b"k", now_secs() + 100).unwrap();
        assert!(s.ttl(0, b"k").unwrap() > 0);
        s.set(0, b"k", b"v2".to_vec()).unwrap();
        assert_eq!(s.ttl(0, b"k").unwrap(), -1);
    }

    #[test]
    fn expire_at_in_the_past_makes_key_absent() {
        let s = store();
        s.set(0, b"k", b"v".to_vec()).unwrap();
        s.expire_at(0, b"k", now_secs() - 10).unwrap();
        assert_eq!(s.get(0, b"k").unwrap(), None);
        assert_eq!(s.ttl(0, b"k").unwrap(), -2);
    }

    #[test]
    fn expire_at_on_missing_key_fails() {
        let s = store();
        assert!(!s.expire_at(0, b"missing", now_secs() + 10).unwrap());
    }

    #[test]
    fn persist_clears_ttl_and_reports_change() {
        let s = store();
        s.set(0, b"k", b"v".to_vec()).unwrap();
        assert!(!s.persist(0, b"k").unwrap());
        s.expire_at(0, b"k", now_secs() + 100).unwrap();
        assert!(s.persist(0, b"k").unwrap());
        assert_eq!(s.ttl(0, b"k").unwrap(), -1);
    }

    #[test]
    fn ttl_semantics_match_spec() {
        let s = store();
        assert_eq!(s.ttl(0, b"missing").unwrap(), -2);
        s.set(0, b"k", b"v".to_vec()).unwrap();
        assert_eq!(s.ttl(0, b"k").unwrap(), -1);
        s.expire_at(0, b"k", now_secs() + 30).unwrap();
        let ttl = s.ttl(0, b"k").unwrap();
        assert!((29..=30).contains(&ttl), "ttl was {ttl}");
    }

    #[test]
    fn databases_are_isolated() {
        let s = store();
        s.set(0, b"k", b"a".to_vec()).unwrap();
        s.set(1, b"k", b"b".to_vec()).unwrap();
        assert_eq!(s.get(0, b"k").unwrap(), Some(b"a".to_vec()));
        assert_eq!(s.get(1, b"k").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn keys_never_returns_an_expired_key() {
        let s = store();
        s.set(0, b"live", b"v".to_vec()).unwrap();
        s.set(0, b"dead", b"v".to_vec()).unwrap();
        s.expire_at(0, b"dead", now_secs() - 1).unwrap();
        let keys = s.keys(0).unwrap();
        assert_eq!(keys, vec![b"live".to_vec()]);
    }

    #[test]
    fn sweep_expired_reclaims_memory() {
        let s = store();
        s.set(0, b"k", b"v".to_vec()).unwrap();
        s.expire_at(0, b"k", now_secs() - 1).unwrap();
        assert_eq!(s.size(), 1);
        s.sweep_expired();
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn snapshot_excludes_expired_entries() {
        let s = store();
        s.set(0, b"live", b"v".to_vec()).unwrap();
        s.set(1, b"dead", b"v".to_vec()).unwrap();
        s.expire_at(1, b"dead", now_secs() - 1).unwrap();

        let snap = s.snapshot();
        assert_eq!(snap[0].len(), 1);
        assert_eq!(snap[1].len(), 0);
    }

    #[test]
    fn empty_value_is_accepted_and_retrievable() {
        let s = store();
        s.set(0, b"k", Vec::new()).unwrap();
        assert_eq!(s.get(0, b"k").unwrap(), Some(Vec::new()));
    }
}
