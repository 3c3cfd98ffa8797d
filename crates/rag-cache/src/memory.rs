//! Bounded in-process cache tier.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    /// Keys of live entries, in first-insertion order.
    order: VecDeque<String>,
}

/// In-process tier shared by all concurrent requests.
///
/// Every operation takes the single mutex for the map mutation only.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryTier {
    /// Create a tier holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a key, dropping it if its TTL has passed.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                state.entries.remove(key);
                state.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite a key. A zero TTL never expires.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        let entry = MemoryEntry { value, expires_at };

        let mut state = self.lock();

        if let Some(existing) = state.entries.get_mut(key) {
            *existing = entry;
            return;
        }

        if state.entries.len() >= self.capacity {
            let evicted = Self::evict_oldest(&mut state, self.eviction_batch());
            debug!("Memory tier full, evicted {} entries", evicted);
        }

        state.order.push_back(key.to_string());
        state.entries.insert(key.to_string(), entry);
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        state.order.retain(|key| !key.starts_with(prefix));
        before - state.entries.len()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    fn eviction_batch(&self) -> usize {
        (self.capacity / 10).max(1)
    }

    fn evict_oldest(state: &mut MemoryState, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(key) = state.order.pop_front() else {
                break;
            };
            if state.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Memory tier mutex poisoned, continuing with inner state");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_set_get_round_trip() {
        let tier = MemoryTier::new(10);
        tier.set("k", vec![0, 159, 146, 150], TTL);
        assert_eq!(tier.get("k"), Some(vec![0, 159, 146, 150]));
        assert_eq!(tier.get("missing"), None);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let tier = MemoryTier::new(10);
        tier.set("k", b"one".to_vec(), TTL);
        tier.set("k", b"two".to_vec(), TTL);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get("k"), Some(b"two".to_vec()));
    }

    #[test]
    fn test_evicts_oldest_tenth_when_full() {
        let tier = MemoryTier::new(20);
        for i in 0..20 {
            tier.set(&format!("k{}", i), vec![i as u8], TTL);
        }
        assert_eq!(tier.len(), 20);

        tier.set("k20", vec![20], TTL);

        // 20 / 10 = 2 oldest evicted, then one inserted.
        assert_eq!(tier.len(), 19);
        assert_eq!(tier.get("k0"), None);
        assert_eq!(tier.get("k1"), None);
        assert_eq!(tier.get("k2"), Some(vec![2]));
        assert_eq!(tier.get("k20"), Some(vec![20]));
    }

    #[test]
    fn test_small_capacity_evicts_at_least_one() {
        let tier = MemoryTier::new(1);
        tier.set("a", vec![1], TTL);
        tier.set("b", vec![2], TTL);
        assert_eq!(tier.get("a"), None);
        assert_eq!(tier.get("b"), Some(vec![2]));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let tier = MemoryTier::new(10);
        tier.set("k", vec![1], Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tier.get("k"), None);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let tier = MemoryTier::new(10);
        tier.set("k", vec![1], Duration::ZERO);
        assert_eq!(tier.get("k"), Some(vec![1]));
    }

    #[test]
    fn test_remove_prefix() {
        let tier = MemoryTier::new(10);
        tier.set("rerank:a", vec![1], TTL);
        tier.set("rerank:b", vec![2], TTL);
        tier.set("full_response:a", vec![3], TTL);

        assert_eq!(tier.remove_prefix("rerank:"), 2);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.get("full_response:a"), Some(vec![3]));
    }

    #[test]
    fn test_expired_then_reset_key_counts_as_newest() {
        let tier = MemoryTier::new(3);
        tier.set("a", vec![1], Duration::from_millis(1));
        tier.set("b", vec![2], TTL);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(tier.get("a"), None);
        tier.set("a", vec![3], TTL);
        tier.set("c", vec![4], TTL);

        // Full: the oldest live key is "b", not the re-set "a".
        tier.set("d", vec![5], TTL);
        assert_eq!(tier.get("b"), None);
        assert_eq!(tier.get("a"), Some(vec![3]));
        assert_eq!(tier.get("c"), Some(vec![4]));
        assert_eq!(tier.get("d"), Some(vec![5]));
    }

    #[test]
    fn test_expiry_cycles_do_not_grow_order_queue() {
        let tier = MemoryTier::new(10);
        for _ in 0..50 {
            tier.set("k", vec![1], Duration::from_millis(1));
            std::thread::sleep(Duration::from_millis(2));
            assert_eq!(tier.get("k"), None);
        }
        let state = tier.lock();
        assert!(state.entries.is_empty());
        assert!(state.order.is_empty());
    }
}
