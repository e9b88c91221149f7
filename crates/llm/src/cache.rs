//! Content-addressed response cache.
//!
//! Keyed by `(model, sha256(normalized prompt))` with a TTL. Process-local;
//! cache coherence across processes is not required.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::provider::Message;

const CACHE_CAPACITY: usize = 2_048;

#[derive(Debug, Clone)]
pub struct CachedCompletion {
    pub content: String,
    pub tokens: u64,
}

struct Entry {
    completion: CachedCompletion,
    inserted: Instant,
}

pub struct ResponseCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
            ttl,
        }
    }

    pub fn key(model: &str, messages: &[Message]) -> String {
        let mut hasher = Sha256::new();
        for m in messages {
            // Whitespace-insensitive so prompt reformatting still hits.
            let normalized: String = m.content.split_whitespace().collect::<Vec<_>>().join(" ");
            hasher.update(normalized.as_bytes());
            hasher.update([0u8]);
        }
        format!("{}:{:x}", model, hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<CachedCompletion> {
        let mut inner = self.inner.lock().expect("cache lock");
        match inner.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.completion.clone()),
            Some(_) => {
                inner.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, completion: CachedCompletion) {
        self.inner
            .lock()
            .expect("cache lock")
            .put(key, Entry { completion, inserted: Instant::now() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> Vec<Message> {
        vec![Message::user(content)]
    }

    #[test]
    fn key_is_whitespace_insensitive() {
        let a = ResponseCache::key("m", &msg("analyze   this\n email"));
        let b = ResponseCache::key("m", &msg("analyze this email"));
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_per_model() {
        let a = ResponseCache::key("mid", &msg("same prompt"));
        let b = ResponseCache::key("high", &msg("same prompt"));
        assert_ne!(a, b);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = ResponseCache::new(Duration::from_millis(0));
        let key = ResponseCache::key("m", &msg("p"));
        cache.put(key.clone(), CachedCompletion { content: "x".into(), tokens: 1 });
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn fresh_entries_hit() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let key = ResponseCache::key("m", &msg("p"));
        cache.put(key.clone(), CachedCompletion { content: "x".into(), tokens: 7 });
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.content, "x");
        assert_eq!(hit.tokens, 7);
    }
}
