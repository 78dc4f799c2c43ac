//! Optional cache/broker collaborator.
//!
//! The orchestrator uses a broker for two things only: persisting task
//! snapshots as hashes with an expiry, and fanning messages out to other
//! processes over pub/sub. Without one it runs purely in memory.

use crate::types::ContextMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobswitch_core::{JobSwitchError, JobSwitchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Async key/value + pub/sub client (Redis-shaped).
#[async_trait]
pub trait CacheBroker: Send + Sync {
    /// Check connectivity. Called once during orchestrator start.
    async fn ping(&self) -> JobSwitchResult<()>;

    /// Set fields on the hash stored at `key`.
    async fn hset(&self, key: &str, fields: &ContextMap) -> JobSwitchResult<()>;

    /// Expire `key` after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> JobSwitchResult<()>;

    /// Publish `payload` on `channel`, returning the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> JobSwitchResult<usize>;

    /// Release connections. Called on orchestrator stop.
    async fn close(&self) -> JobSwitchResult<()> {
        Ok(())
    }
}

/// Broker settings resolved once when the orchestrator is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Use the injected broker. When false any injected client is ignored.
    pub enabled: bool,
    /// Expiry applied to persisted task hashes, in seconds.
    pub task_ttl_secs: u64,
    /// Prefix of the per-recipient pub/sub topic.
    pub topic_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            task_ttl_secs: 24 * 60 * 60,
            topic_prefix: "agent:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn topic_for(&self, recipient_id: &str) -> String {
        format!("{}{recipient_id}", self.topic_prefix)
    }
}

struct StoredHash {
    fields: ContextMap,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredHash {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process broker: hashes in a map, pub/sub over tokio broadcast channels.
///
/// Useful for single-process deployments and tests; subscribers created with
/// [`InMemoryBroker::subscribe`] see every later publish on their topic.
pub struct InMemoryBroker {
    hashes: RwLock<HashMap<String, StoredHash>>,
    topics: RwLock<HashMap<String, broadcast::Sender<String>>>,
    published: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` bounds each topic's backlog for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hashes: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut topics = self.topics.write().await;
        topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// All fields of an unexpired hash. An expired hash is evicted.
    pub async fn hgetall(&self, key: &str) -> Option<ContextMap> {
        let now = Utc::now();
        {
            let hashes = self.hashes.read().await;
            let stored = hashes.get(key)?;
            if !stored.is_expired(now) {
                return Some(stored.fields.clone());
            }
        }
        let mut hashes = self.hashes.write().await;
        if hashes.get(key).is_some_and(|stored| stored.is_expired(now)) {
            hashes.remove(key);
        }
        None
    }

    /// Hashes currently held, expired ones not yet evicted included.
    pub async fn stored_hashes(&self) -> usize {
        self.hashes.read().await.len()
    }

    /// Drop every expired hash. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut hashes = self.hashes.write().await;
        Self::sweep(&mut hashes, Utc::now())
    }

    fn sweep(hashes: &mut HashMap<String, StoredHash>, now: DateTime<Utc>) -> usize {
        let before = hashes.len();
        hashes.retain(|_, stored| !stored.is_expired(now));
        before - hashes.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> JobSwitchResult<()> {
        if self.is_closed() {
            Err(JobSwitchError::Broker("broker is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBroker for InMemoryBroker {
    async fn ping(&self) -> JobSwitchResult<()> {
        self.ensure_open()
    }

    async fn hset(&self, key: &str, fields: &ContextMap) -> JobSwitchResult<()> {
        self.ensure_open()?;
        let mut hashes = self.hashes.write().await;
        Self::sweep(&mut hashes, Utc::now());
        let stored = hashes.entry(key.to_string()).or_insert_with(|| StoredHash {
            fields: ContextMap::new(),
            expires_at: None,
        });
        for (k, v) in fields {
            stored.fields.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> JobSwitchResult<()> {
        self.ensure_open()?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| JobSwitchError::Broker(format!("invalid ttl: {e}")))?;
        let now = Utc::now();
        let mut hashes = self.hashes.write().await;
        if let Some(stored) = hashes.get_mut(key) {
            // Past the calendar's end means it never expires.
            stored.expires_at = now.checked_add_signed(ttl);
        }
        Self::sweep(&mut hashes, now);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> JobSwitchResult<usize> {
        self.ensure_open()?;
        self.published.fetch_add(1, Ordering::SeqCst);
        let topics = self.topics.read().await;
        let receivers = topics
            .get(channel)
            .and_then(|tx| tx.send(payload.to_string()).ok())
            .unwrap_or(0);
        Ok(receivers)
    }

    async fn close(&self) -> JobSwitchResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hset_merges_fields() {
        let broker = InMemoryBroker::new();
        let first = json!({"status": "pending", "agent_id": "echo"});
        let second = json!({"status": "completed"});
        broker.hset("task:1", first.as_object().unwrap()).await.unwrap();
        broker.hset("task:1", second.as_object().unwrap()).await.unwrap();

        let stored = broker.hgetall("task:1").await.unwrap();
        assert_eq!(stored["status"], "completed");
        assert_eq!(stored["agent_id"], "echo");
    }

    #[tokio::test]
    async fn test_expired_hash_is_hidden() {
        let broker = InMemoryBroker::new();
        broker.hset("k", json!({"a": 1}).as_object().unwrap()).await.unwrap();
        broker.expire("k", Duration::ZERO).await.unwrap();
        assert!(broker.hgetall("k").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_hashes_are_evicted() {
        let broker = InMemoryBroker::new();
        for i in 0..1000 {
            let key = format!("task:{i}");
            broker.hset(&key, json!({"status": "completed"}).as_object().unwrap()).await.unwrap();
            broker.expire(&key, Duration::ZERO).await.unwrap();
        }
        assert_eq!(broker.stored_hashes().await, 0);

        broker.hset("task:live", json!({"status": "pending"}).as_object().unwrap()).await.unwrap();
        broker.expire("task:live", Duration::from_secs(60)).await.unwrap();
        assert_eq!(broker.stored_hashes().await, 1);
        assert_eq!(broker.hgetall("task:live").await.unwrap()["status"], "pending");
    }

    #[tokio::test]
    async fn test_hgetall_evicts_and_rewrite_starts_fresh() {
        let broker = InMemoryBroker::new();
        broker.hset("k", json!({"a": 1}).as_object().unwrap()).await.unwrap();
        broker.expire("k", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker.hgetall("k").await.is_none());
        assert_eq!(broker.stored_hashes().await, 0);

        broker.hset("k", json!({"b": 2}).as_object().unwrap()).await.unwrap();
        let stored = broker.hgetall("k").await.unwrap();
        assert!(!stored.contains_key("a"));
        assert_eq!(stored["b"], 2);
        assert_eq!(broker.evict_expired().await, 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let broker = InMemoryBroker::new();
        broker.hset("k", json!({"a": 1}).as_object().unwrap()).await.unwrap();
        broker.expire("k", Duration::from_secs(300_000 * 365 * 24 * 3600)).await.unwrap();
        assert!(broker.hgetall("k").await.is_some());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("agent:echo").await;
        let receivers = broker.publish("agent:echo", "hello").await.unwrap();
        assert_eq!(receivers, 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        // No subscribers on this topic
        assert_eq!(broker.publish("agent:other", "x").await.unwrap(), 0);
        assert_eq!(broker.published_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_operations() {
        let broker = InMemoryBroker::new();
        broker.close().await.unwrap();
        assert!(broker.ping().await.is_err());
        assert!(broker.publish("t", "x").await.is_err());
    }

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.task_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.topic_for("echo"), "agent:echo");
    }
}
