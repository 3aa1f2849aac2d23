use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    text_hash: String,
    model: String,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<[f32]>>,
    order: VecDeque<CacheKey>,
}

/// In-memory vectors keyed by `(text hash, model)`.
///
/// A vector is only ever served for the model that produced it. When full, the oldest entry
/// is evicted first.
pub struct EmbeddingCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl EmbeddingCache {
    /// Cache holding at most `capacity` vectors. A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached vector for `text_hash` under `model`.
    pub fn get(&self, text_hash: &str, model: &str) -> Option<Arc<[f32]>> {
        let key = CacheKey {
            text_hash: text_hash.to_string(),
            model: model.to_string(),
        };
        self.lock().entries.get(&key).cloned()
    }

    /// Store `vector` for `text_hash` under `model`.
    pub fn insert(&self, text_hash: &str, model: &str, vector: Arc<[f32]>) {
        if self.capacity == 0 {
            return;
        }
        let key = CacheKey {
            text_hash: text_hash.to_string(),
            model: model.to_string(),
        };
        let mut state = self.lock();
        if state.entries.insert(key.clone(), vector).is_none() {
            state.order.push_back(key);
        }
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(value: f32) -> Arc<[f32]> {
        Arc::from(vec![value, value])
    }

    #[test]
    fn keys_include_model() {
        let cache = EmbeddingCache::new(8);
        cache.insert("h1", "model-a", vector(1.0));

        assert!(cache.get("h1", "model-a").is_some());
        assert!(cache.get("h1", "model-b").is_none());
    }

    #[test]
    fn evicts_oldest_entry_when_full() {
        let cache = EmbeddingCache::new(2);
        cache.insert("h1", "m", vector(1.0));
        cache.insert("h2", "m", vector(2.0));
        cache.insert("h3", "m", vector(3.0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("h1", "m").is_none());
        assert_eq!(cache.get("h3", "m").as_deref(), Some(&[3.0, 3.0][..]));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = EmbeddingCache::new(0);
        cache.insert("h1", "m", vector(1.0));
        assert!(cache.is_empty());
    }
}
