//! Utility containers (C10, spec §4.10): small, self-contained data
//! structures the rest of the kernel leans on — a composite-key map, a
//! counter, an identity-deduplicating object set, a stack with
//! remove-by-value, a bounded LRU, and an ordered k-way stream merge.

use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::pin::Pin;

/// A map keyed by a structured `(id, role)` pair, stored internally under
/// a stable string key so it can also answer "every role for this id" in
/// O(1) via a secondary index (spec §4.10 "custom-keyed map").
#[derive(Debug, Default)]
pub struct KeyedMap<V> {
    by_key: HashMap<String, V>,
    by_id: HashMap<u64, Vec<String>>,
}

fn composite_key(id: u64, role: &str) -> String {
    format!("{id}_{role}")
}

impl<V> KeyedMap<V> {
    /// Builds an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Inserts or replaces the value for `(id, role)`.
    pub fn insert(&mut self, id: u64, role: &str, value: V) {
        let key = composite_key(id, role);
        if !self.by_id.entry(id).or_default().iter().any(|k| k == &key) {
            self.by_id.entry(id).or_default().push(key.clone());
        }
        self.by_key.insert(key, value);
    }

    /// Looks up the value for `(id, role)`.
    #[must_use]
    pub fn get(&self, id: u64, role: &str) -> Option<&V> {
        self.by_key.get(&composite_key(id, role))
    }

    /// Removes the value for `(id, role)`, returning it if present.
    pub fn remove(&mut self, id: u64, role: &str) -> Option<V> {
        let key = composite_key(id, role);
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.retain(|k| k != &key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
        self.by_key.remove(&key)
    }

    /// Every value currently stored under `id`, across all roles.
    #[must_use]
    pub fn by_id(&self, id: u64) -> Vec<&V> {
        self.by_id
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|key| self.by_key.get(key))
            .collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// A multiset that removes a key once its count drops to zero (spec
/// §4.10 "counter").
#[derive(Debug, Default)]
pub struct Counter<K: Eq + Hash + Clone> {
    counts: HashMap<K, i64>,
}

impl<K: Eq + Hash + Clone> Counter<K> {
    /// Builds an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self { counts: HashMap::new() }
    }

    /// Adds `delta` to `key`'s count, removing the entry entirely if the
    /// result is zero.
    pub fn add(&mut self, key: K, delta: i64) {
        let entry = self.counts.entry(key.clone()).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            self.counts.remove(&key);
        }
    }

    /// Increments `key` by one.
    pub fn increment(&mut self, key: K) {
        self.add(key, 1);
    }

    /// Decrements `key` by one, removing it if the count reaches zero.
    pub fn decrement(&mut self, key: K) {
        self.add(key, -1);
    }

    /// Current count for `key`, `0` if absent.
    #[must_use]
    pub fn count(&self, key: &K) -> i64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Sum of every key's count.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }

    /// The `n` keys with the highest counts, descending.
    #[must_use]
    pub fn most_common(&self, n: usize) -> Vec<(K, i64)> {
        let mut entries: Vec<(K, i64)> = self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }

    /// The `n` keys with the lowest counts, ascending.
    #[must_use]
    pub fn least_common(&self, n: usize) -> Vec<(K, i64)> {
        let mut entries: Vec<(K, i64)> = self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        entries.truncate(n);
        entries
    }
}

/// An object with an identity key, possibly provisional, and a load
/// timestamp used to resolve conflicts (spec §4.10 "objects set").
pub trait IdentifiedObject {
    /// The stable or provisional identity this object deduplicates on.
    fn identity(&self) -> u64;

    /// Monotonic load timestamp, used by [`ObjectSet::insert_newest_wins`]
    /// to decide which of two objects sharing an identity survives.
    fn loaded_at(&self) -> u64;
}

/// Deduplicates objects by identity (spec §4.10 "objects set").
#[derive(Debug, Default)]
pub struct ObjectSet<T: IdentifiedObject> {
    items: HashMap<u64, T>,
}

impl<T: IdentifiedObject> ObjectSet<T> {
    /// Builds an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self { items: HashMap::new() }
    }

    /// Unconditionally replaces any existing entry with the same identity.
    pub fn insert(&mut self, item: T) {
        self.items.insert(item.identity(), item);
    }

    /// Inserts `item`, keeping whichever of it and any existing entry with
    /// the same identity has the later `loaded_at`.
    pub fn insert_newest_wins(&mut self, item: T) {
        match self.items.get(&item.identity()) {
            Some(existing) if existing.loaded_at() >= item.loaded_at() => {}
            _ => {
                self.items.insert(item.identity(), item);
            }
        }
    }

    /// Looks up by identity.
    #[must_use]
    pub fn get(&self, identity: u64) -> Option<&T> {
        self.items.get(&identity)
    }

    /// Number of distinct identities held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A LIFO stack that additionally supports removing the last occurrence
/// of a specific element (spec §4.10 "stack with pop(elem)").
#[derive(Debug, Default, Clone)]
pub struct Stack<T> {
    items: Vec<T>,
}

impl<T: PartialEq> Stack<T> {
    /// Builds an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Pushes `item` on top.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Pops the top element.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Removes the last (topmost) occurrence of `elem`, preserving the
    /// relative order of everything else.
    pub fn pop_elem(&mut self, elem: &T) -> Option<T> {
        let idx = self.items.iter().rposition(|x| x == elem)?;
        Some(self.items.remove(idx))
    }

    /// Number of elements currently on the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A fixed-capacity LRU cache with insertion-order semantics: `get`
/// promotes the key to most-recently-used, and inserting past capacity
/// evicts the least-recently-used entry (spec §4.10 "bounded LRU").
#[derive(Debug)]
pub struct Lru<K: Eq + Hash + Clone, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    /// Builds an LRU bounded at `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be positive");
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Looks up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
        }
        self.entries.get(key)
    }

    /// Inserts or replaces `key`, evicting the least-recently-used entry
    /// if the cache is at capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).expect("position just found");
            self.order.push_back(k);
        }
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merges several already-ordered async streams into one ordered stream,
/// dropping duplicate keys in favor of whichever input was listed first
/// (spec §4.10 "sorted-stream merge"). `key_of` extracts the comparison
/// key from an item; `streams` must each already be sorted ascending by
/// that key, or the merge panics in debug assertions once it detects an
/// out-of-order item.
///
/// # Panics
///
/// Panics if any input stream yields an item whose key is smaller than
/// the previous item that same stream yielded.
pub async fn sorted_merge<T, K, F>(streams: Vec<Pin<Box<dyn Stream<Item = T> + Send>>>, key_of: F) -> Vec<T>
where
    K: Ord + Clone,
    F: Fn(&T) -> K,
{
    let mut heads: Vec<Option<T>> = Vec::with_capacity(streams.len());
    let mut streams = streams;
    let mut last_key: Vec<Option<K>> = vec![None; streams.len()];

    for stream in &mut streams {
        heads.push(stream.next().await);
    }

    let mut output = Vec::new();
    loop {
        let Some((winner_idx, winner_key)) = heads
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.as_ref().map(|v| (i, key_of(v))))
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        else {
            break;
        };

        // Drop duplicates of the winning key from every other stream's
        // current head; the earliest-listed stream's value is the one
        // that survives.
        for (i, item) in heads.iter_mut().enumerate() {
            if i == winner_idx {
                continue;
            }
            if item.as_ref().map(&key_of) == Some(winner_key.clone()) {
                *item = streams[i].next().await;
            }
        }

        let winner = heads[winner_idx].take().expect("winner index came from a Some head");
        let key = key_of(&winner);
        assert!(
            last_key[winner_idx].as_ref().is_none_or(|prev| *prev <= key),
            "sorted_merge input stream {winner_idx} violated its own ordering"
        );
        last_key[winner_idx] = Some(key);
        output.push(winner);
        heads[winner_idx] = streams[winner_idx].next().await;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn keyed_map_round_trips_composite_key_and_indexes_by_id() {
        let mut map = KeyedMap::new();
        map.insert(1, "$agent", "a");
        map.insert(1, "$leader", "b");
        map.insert(2, "$agent", "c");

        assert_eq!(map.get(1, "$agent"), Some(&"a"));
        let mut by_id = map.by_id(1);
        by_id.sort_unstable();
        assert_eq!(by_id, vec![&"a", &"b"]);

        map.remove(1, "$agent");
        assert_eq!(map.get(1, "$agent"), None);
        assert_eq!(map.by_id(1), vec![&"b"]);
    }

    #[test]
    fn counter_removes_entry_at_zero_and_ranks_common() {
        let mut counter = Counter::new();
        counter.increment("a");
        counter.increment("a");
        counter.increment("b");
        counter.decrement("b");
        assert_eq!(counter.count("b"), 0);
        assert_eq!(counter.total(), 2);
        assert_eq!(counter.most_common(1), vec![("a", 2)]);
    }

    struct Obj {
        id: u64,
        loaded_at: u64,
    }

    impl IdentifiedObject for Obj {
        fn identity(&self) -> u64 {
            self.id
        }

        fn loaded_at(&self) -> u64 {
            self.loaded_at
        }
    }

    #[test]
    fn object_set_newest_wins_keeps_later_load() {
        let mut set = ObjectSet::new();
        set.insert_newest_wins(Obj { id: 1, loaded_at: 10 });
        set.insert_newest_wins(Obj { id: 1, loaded_at: 5 });
        assert_eq!(set.get(1).unwrap().loaded_at, 10);

        set.insert_newest_wins(Obj { id: 1, loaded_at: 20 });
        assert_eq!(set.get(1).unwrap().loaded_at, 20);
    }

    #[test]
    fn stack_pop_elem_removes_last_occurrence_only() {
        let mut stack = Stack::new();
        stack.push(1);
        stack.push(2);
        stack.push(1);
        assert_eq!(stack.pop_elem(&1), Some(1));
        assert_eq!(stack.items, vec![1, 2]);
    }

    #[test]
    fn lru_evicts_least_recently_used_on_overflow() {
        let mut lru = Lru::new(2);
        lru.insert("a", 1);
        lru.insert("b", 2);
        lru.get(&"a");
        lru.insert("c", 3);
        assert_eq!(lru.get(&"b"), None);
        assert_eq!(lru.get(&"a"), Some(&1));
        assert_eq!(lru.get(&"c"), Some(&3));
    }

    #[tokio::test]
    async fn sorted_merge_dedups_favoring_earliest_stream() {
        let a: Pin<Box<dyn Stream<Item = (u32, &'static str)> + Send>> =
            Box::pin(stream::iter(vec![(1, "a1"), (3, "a3")]));
        let b: Pin<Box<dyn Stream<Item = (u32, &'static str)> + Send>> =
            Box::pin(stream::iter(vec![(1, "b1"), (2, "b2")]));

        let merged = sorted_merge(vec![a, b], |item| item.0).await;
        assert_eq!(merged, vec![(1, "a1"), (2, "b2"), (3, "a3")]);
    }
}
