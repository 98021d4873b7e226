//! In-memory store for tests and single-host deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::store::StateStore;

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    sets: HashMap<String, HashSet<String>>,
    expiries: HashMap<String, Instant>,
}

impl Inner {
    /// Drop a key everywhere once its TTL passed. Expiry is lazy, applied
    /// on the next access.
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.kv.remove(key);
                self.lists.remove(key);
                self.sets.remove(key);
                self.expiries.remove(key);
            }
        }
    }
}

/// Process-local [`StateStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_dequeue(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        inner.lists.get_mut(key).and_then(|list| list.pop_front())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        Ok(inner.sets.get(key).cloned().unwrap_or_default())
    }

    async fn enqueue_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.purge_expired(key);
            inner
                .lists
                .entry(key.to_string())
                .or_default()
                .push_back(bytes.to_vec());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue_bytes(&self, key: &str, timeout_ms: u64) -> Result<Vec<u8>> {
        if timeout_ms == 0 {
            return self.try_dequeue(key).ok_or(Error::NoResponse);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let notified = self.notify.notified();
            if let Some(bytes) = self.try_dequeue(key) {
                return Ok(bytes);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::NoResponse);
            }
            // Wake on any enqueue and re-check; spurious wakeups only cost
            // another probe.
            let _ = timeout(remaining, notified).await;
            if Instant::now() >= deadline {
                if let Some(bytes) = self.try_dequeue(key) {
                    return Ok(bytes);
                }
                return Err(Error::NoResponse);
            }
        }
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        inner.kv.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(key);
        inner
            .kv
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }
}
