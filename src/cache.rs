//! Two-tier identification result cache.
//!
//! Primary tier is a Redis-compatible store; fallback is an in-process map
//! with a key cap and per-entry TTL. Keys are a content hash of the query
//! image bytes, so identical images short-circuit the whole pipeline and
//! Redis gives coherence across workers.
//!
//! The cache is never a failure source: every operation swallows backend
//! errors and degrades to a miss. A Redis error flips a one-way failover
//! flag — the rest of the run serves from memory; reconnection does not
//! swap back mid-run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use parking_lot::RwLock;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "face_recog_";

/// Cache key for a query image: `face_recog_<md5hex>`.
pub fn cache_key(image_bytes: &[u8]) -> String {
    let digest = Md5::digest(image_bytes);
    let mut key = String::with_capacity(KEY_PREFIX.len() + 32);
    key.push_str(KEY_PREFIX);
    for b in digest {
        key.push_str(&format!("{:02x}", b));
    }
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Redis,
    Memory,
}

impl CacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackend::Redis => "redis",
            CacheBackend::Memory => "memory",
        }
    }
}

struct MemoryEntry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

/// In-process fallback tier: capped map with TTL expiry, oldest-first
/// eviction once full.
struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    max_entries: usize,
    default_ttl: Duration,
}

impl MemoryCache {
    fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            default_ttl,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.created_at.elapsed() < entry.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let mut entries = self.entries.write();

        entries.retain(|_, e| e.created_at.elapsed() < e.ttl);

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    fn del(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

pub struct ResultCache {
    redis: Option<redis::aio::ConnectionManager>,
    failed_over: AtomicBool,
    memory: MemoryCache,
    default_ttl: Duration,
}

impl ResultCache {
    /// Connect the primary tier, or fall back to memory.
    ///
    /// Connection attempts back off `min(attempt × 200ms, 1s)`, three tries.
    /// The selected mode is stable for the life of the process except for
    /// the one-way failover on a later Redis error.
    pub async fn connect(
        redis_url: Option<&str>,
        default_ttl: Duration,
        max_entries: usize,
    ) -> Self {
        let memory = MemoryCache::new(max_entries, default_ttl);

        let Some(url) = redis_url else {
            info!("result cache: no redis url configured, using in-process tier");
            return Self {
                redis: None,
                failed_over: AtomicBool::new(false),
                memory,
                default_ttl,
            };
        };

        for attempt in 1..=3u32 {
            match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(manager) => {
                        info!("result cache: connected to redis");
                        return Self {
                            redis: Some(manager),
                            failed_over: AtomicBool::new(false),
                            memory,
                            default_ttl,
                        };
                    }
                    Err(e) => {
                        warn!("result cache: redis connect attempt {} failed: {}", attempt, e);
                    }
                },
                Err(e) => {
                    warn!("result cache: invalid redis url: {}", e);
                    break;
                }
            }
            let backoff = Duration::from_millis((attempt as u64 * 200).min(1000));
            tokio::time::sleep(backoff).await;
        }

        warn!("result cache: redis unavailable, using in-process tier");
        Self {
            redis: None,
            failed_over: AtomicBool::new(false),
            memory,
            default_ttl,
        }
    }

    pub fn backend(&self) -> CacheBackend {
        if self.redis.is_some() && !self.failed_over.load(Ordering::Relaxed) {
            CacheBackend::Redis
        } else {
            CacheBackend::Memory
        }
    }

    fn redis_conn(&self) -> Option<redis::aio::ConnectionManager> {
        if self.failed_over.load(Ordering::Relaxed) {
            return None;
        }
        self.redis.clone()
    }

    fn fail_over(&self, err: &redis::RedisError) {
        warn!("result cache: redis error ({}), failing over to memory", err);
        self.failed_over.store(true, Ordering::Relaxed);
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(mut conn) = self.redis_conn() {
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => return value,
                Err(e) => self.fail_over(&e),
            }
        }
        self.memory.get(key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let ttl_secs = ttl.unwrap_or(self.default_ttl).as_secs().max(1);
        if let Some(mut conn) = self.redis_conn() {
            match conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
                Ok(()) => return true,
                Err(e) => self.fail_over(&e),
            }
        }
        self.memory.set(key, value, ttl);
        true
    }

    pub async fn del(&self, key: &str) -> bool {
        if let Some(mut conn) = self.redis_conn() {
            match conn.del::<_, i64>(key).await {
                Ok(n) => return n > 0,
                Err(e) => self.fail_over(&e),
            }
        }
        self.memory.del(key)
    }

    /// Delete keys matching a glob. Only meaningful on the distributed
    /// tier; the memory tier treats it as a no-op.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        if let Some(mut conn) = self.redis_conn() {
            let keys: Vec<String> = match conn.keys(pattern).await {
                Ok(keys) => keys,
                Err(e) => {
                    self.fail_over(&e);
                    return 0;
                }
            };
            if keys.is_empty() {
                return 0;
            }
            match conn.del::<_, i64>(keys).await {
                Ok(n) => return n as u64,
                Err(e) => self.fail_over(&e),
            }
        } else {
            debug!("invalidate_pattern is a no-op on the memory tier");
        }
        0
    }

    pub async fn flush(&self) -> bool {
        if let Some(mut conn) = self.redis_conn() {
            match redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
                Ok(()) => return true,
                Err(e) => self.fail_over(&e),
            }
        }
        self.memory.clear();
        true
    }

    /// Entries in the in-process tier (diagnostics only).
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }
}
