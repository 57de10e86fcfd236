//! Associative container bounded in both size and age.
//!
//! Entries are evicted in the order they were last set, never in the order
//! they were read. Age is checked on read: an entry older than `max_age` is
//! dropped and reported as missing.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, as an offset from an arbitrary epoch
pub type Clock = Box<dyn Fn() -> Duration + Send + Sync>;

fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

struct Slot<V> {
    value: V,
    set_at: Duration,
    order: u64,
}

pub struct BoundedCache<K, V> {
    max_count: usize,
    max_age: Duration,
    clock: Clock,
    slots: HashMap<K, Slot<V>>,
    /// set order -> key, oldest first
    order: BTreeMap<u64, K>,
    next_order: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_count: usize, max_age: Duration) -> Self {
        Self::with_clock(max_count, max_age, Box::new(wall_clock))
    }

    pub fn with_clock(max_count: usize, max_age: Duration, clock: Clock) -> Self {
        Self {
            max_count,
            max_age,
            clock,
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_order: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    pub fn set(&mut self, key: K, value: V) {
        let now = (self.clock)();
        self.set_at(key, value, now);
    }

    /// Store `value` as of time `now`.
    ///
    /// Ignored when `key` was already set at or after `now`, so a delayed
    /// writer cannot replace newer data.
    pub fn set_at(&mut self, key: K, value: V, now: Duration) {
        if let Some(slot) = self.slots.get(&key) {
            if now <= slot.set_at {
                return;
            }
            self.order.remove(&slot.order);
        }

        let order = self.next_order;
        self.next_order += 1;
        self.order.insert(order, key.clone());
        self.slots.insert(key, Slot { value, set_at: now, order });

        while self.slots.len() > self.max_count {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.slots.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = (self.clock)();
        self.get_at(key, now)
    }

    /// Fetch the value for `key`, dropping it if it has expired by `now`.
    pub fn get_at(&mut self, key: &K, now: Duration) -> Option<V> {
        let expired = {
            let slot = self.slots.get(key)?;
            self.is_expired(slot, now)
        };
        if expired {
            self.remove_slot(key);
            return None;
        }
        self.slots.get(key).map(|slot| slot.value.clone())
    }

    pub fn pop(&mut self, key: &K) -> Option<V> {
        let now = (self.clock)();
        self.pop_at(key, now)
    }

    /// Remove `key` whether or not it has expired; the value is only
    /// returned if it was still fresh at `now`.
    pub fn pop_at(&mut self, key: &K, now: Duration) -> Option<V> {
        let slot = self.remove_slot(key)?;
        if self.is_expired(&slot, now) {
            None
        } else {
            Some(slot.value)
        }
    }

    /// Keys from least to most recently set
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    fn is_expired(&self, slot: &Slot<V>, now: Duration) -> bool {
        now.saturating_sub(slot.set_at) > self.max_age
    }

    fn remove_slot(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.order);
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn t(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn cache() -> BoundedCache<&'static str, i32> {
        BoundedCache::new(3, t(2))
    }

    fn keys(c: &BoundedCache<&'static str, i32>) -> Vec<&'static str> {
        c.keys().copied().collect()
    }

    #[test]
    fn test_expires_after_max_age() {
        let mut c = cache();
        assert!(c.is_empty());
        c.set_at("A", 1, t(0));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get_at(&"A", t(0)), Some(1));
        c.set_at("B", 2, t(2));
        assert_eq!(c.get_at(&"A", t(2)), Some(1));
        assert_eq!(c.get_at(&"A", t(3)), None);
        assert_eq!(keys(&c), vec!["B"]);
    }

    #[test]
    fn test_evicts_least_recently_set() {
        let mut c = cache();
        c.set_at("A", 2, t(0));
        c.set_at("B", 3, t(0));
        c.set_at("C", 4, t(0));
        c.set_at("D", 5, t(0));
        assert_eq!(keys(&c), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_set_moves_key_to_newest() {
        let mut c = cache();
        c.set_at("A", 1, t(0));
        c.set_at("B", 3, t(0));
        c.set_at("C", 4, t(0));
        c.set_at("A", 42, t(3));
        assert_eq!(keys(&c), vec!["B", "C", "A"]);
        c.set_at("D", 5, t(0));
        assert_eq!(keys(&c), vec!["C", "A", "D"]);
    }

    #[test]
    fn test_older_set_does_not_overwrite() {
        let mut c = cache();
        c.set_at("A", 1, t(2));
        c.set_at("A", 42, t(3));
        c.set_at("A", 40, t(2));
        assert_eq!(c.get_at(&"A", t(4)), Some(42));
        c.set_at("A", 40, t(3));
        assert_eq!(c.get_at(&"A", t(4)), Some(42));
        c.set_at("A", 40, t(4));
        assert_eq!(c.get_at(&"A", t(4)), Some(40));
    }

    #[test]
    fn test_reads_do_not_reorder() {
        let mut c = cache();
        c.set_at("A", 1, t(0));
        c.set_at("B", 2, t(0));
        c.set_at("C", 3, t(0));
        assert_eq!(c.get_at(&"A", t(1)), Some(1));
        c.set_at("D", 4, t(1));
        assert_eq!(keys(&c), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_len_never_exceeds_max_count() {
        let mut c = cache();
        for i in 0..50u64 {
            let key: &'static str = ["A", "B", "C", "D", "E"][(i % 5) as usize];
            c.set_at(key, i as i32, t(i));
            assert!(c.len() <= 3);
        }
    }

    #[test]
    fn test_pop_removes_even_when_expired() {
        let mut c = cache();
        c.set_at("A", 1, t(0));
        c.set_at("B", 2, t(0));
        assert_eq!(c.pop_at(&"A", t(1)), Some(1));
        assert_eq!(c.pop_at(&"B", t(5)), None);
        assert!(c.is_empty());
        assert_eq!(c.pop_at(&"C", t(0)), None);
    }

    #[test]
    fn test_clear() {
        let mut c = cache();
        c.set_at("A", 1, t(0));
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.get_at(&"A", t(0)), None);
    }

    #[test]
    fn test_injected_clock() {
        let now = Arc::new(AtomicU64::new(0));
        let clock_now = now.clone();
        let mut c: BoundedCache<u32, &str> = BoundedCache::with_clock(
            10,
            t(30),
            Box::new(move || Duration::from_secs(clock_now.load(Ordering::SeqCst))),
        );
        c.set(1, "one");
        now.store(30, Ordering::SeqCst);
        assert_eq!(c.get(&1), Some("one"));
        now.store(31, Ordering::SeqCst);
        assert_eq!(c.get(&1), None);
    }
}
