use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_CACHE_CAPACITY: usize = 500;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// Process-lifetime cache of prior call results, bounded by both LRU
/// capacity and a TTL that applies regardless of LRU pressure.
///
/// Keys are derived from `(server_id, capability, params)` with params
/// serialized in canonical key order, so `{a:1,b:2}` and `{b:2,a:1}`
/// collide.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, server_id: &str, capability: &str, params: &Value) -> Option<Value> {
        let key = cache_key(server_id, capability, params);
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                log::debug!("response cache hit for {server_id}/{capability}");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, server_id: &str, capability: &str, params: &Value, value: Value) {
        let key = cache_key(server_id, capability, params);
        self.lock().put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL)
    }
}

fn cache_key(server_id: &str, capability: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(capability.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(params).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serialize a JSON value with object keys sorted recursively, so the
/// result is independent of the order parameters were supplied in.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 2, "a": 1, "nested": {"z": [1, {"y": 0, "x": 9}], "a": true}});
        let b = json!({"nested": {"a": true, "z": [1, {"x": 9, "y": 0}]}, "a": 1, "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_param_order_independent_key() {
        let cache = ResponseCache::default();
        cache.set("s1", "doc", &json!({"a": 1, "b": 2}), json!("cached"));
        let hit = cache.get("s1", "doc", &json!({"b": 2, "a": 1}));
        assert_eq!(hit, Some(json!("cached")));
    }

    #[test]
    fn test_different_server_different_entry() {
        let cache = ResponseCache::default();
        cache.set("s1", "doc", &json!({}), json!(1));
        assert!(cache.get("s2", "doc", &json!({})).is_none());
        assert!(cache.get("s1", "search", &json!({})).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(10, Duration::from_millis(0));
        cache.set("s1", "doc", &json!({}), json!(1));
        assert!(cache.get("s1", "doc", &json!({})).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.set("s1", "doc", &json!({"n": 1}), json!(1));
        cache.set("s1", "doc", &json!({"n": 2}), json!(2));
        cache.set("s1", "doc", &json!({"n": 3}), json!(3));
        assert!(cache.get("s1", "doc", &json!({"n": 1})).is_none());
        assert_eq!(cache.get("s1", "doc", &json!({"n": 3})), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }
}
