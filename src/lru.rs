// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded LRU mapping from object key to `FileInfo`, weighted by a pluggable
//! sizing function. See spec.md §4.2.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache as OrderedMap;

use crate::error::{Error, Result};

/// Computes the admission weight of a value. Either "raw bytes as reported
/// by the value" or a disk-aware function rounding up to a block size
/// (spec.md §4.2, §4.7); callers supply whichever fits their accounting mode.
pub trait Weigh<V> {
    /// Weight of `value` against the LRU's byte budget.
    fn weigh(&self, value: &V) -> u64;
}

/// A `Weigh` impl that calls back into a plain closure.
pub struct WeighFn<F>(pub F);

impl<V, F: Fn(&V) -> u64> Weigh<V> for WeighFn<F> {
    fn weigh(&self, value: &V) -> u64 {
        (self.0)(value)
    }
}

struct Inner<K: Hash + Eq, V> {
    order: OrderedMap<K, V>,
    total_weight: u64,
}

/// A capacity-bounded `(key -> value)` map maintaining LRU order, enforcing
/// `Σ weight(entry) <= max_size`.
///
/// Ordering is delegated to the `lru` crate's intrusive map (used here with
/// an effectively unbounded entry-count capacity; weight-based eviction is
/// driven manually by popping the LRU end), behind a single `Mutex` exactly
/// as spec.md §4.2 specifies: "order and bookkeeping... are protected by a
/// single lock; callers receive evicted values and must run post-eviction
/// cleanup themselves".
pub struct LruIndex<K: Hash + Eq + Clone, V, W: Weigh<V>> {
    max_size: u64,
    weigh: W,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone, V, W: Weigh<V>> LruIndex<K, V, W> {
    /// Create an index bounded to `max_size` total weight.
    pub fn new(max_size: u64, weigh: W) -> Self {
        LruIndex {
            max_size,
            weigh,
            inner: Mutex::new(Inner {
                // `lru` requires a non-zero entry-count cap; we don't use
                // entry-count as a limit, so make it effectively unbounded
                // and rely solely on `total_weight` for admission.
                order: OrderedMap::unbounded(),
                total_weight: 0,
            }),
        }
    }

    /// Configured byte budget.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    /// True iff the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current total weight of all entries.
    pub fn total_weight(&self) -> u64 {
        self.inner.lock().unwrap().total_weight
    }

    /// Insert `value` under `key`, evicting least-recently-used entries
    /// until it fits within `max_size`. Returns the evicted values (oldest
    /// first) for the caller to clean up *after* this call returns (the
    /// index never calls back into cleanup itself — spec.md §9 "Eviction
    /// callback inversion").
    ///
    /// Fails with `EntryTooLarge` if `value` alone exceeds `max_size`; the
    /// index is left unmodified in that case.
    pub fn insert(&self, key: K, value: V) -> Result<Vec<V>> {
        let weight = self.weigh.weigh(&value);
        if weight > self.max_size {
            return Err(Error::EntryTooLarge {
                weight,
                max_size: self.max_size,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let mut evicted = Vec::new();

        // If the key is already present, account for its removal before
        // computing how much more room is needed.
        if let Some(old) = inner.order.pop(&key) {
            let old_weight = self.weigh.weigh(&old);
            inner.total_weight = inner.total_weight.saturating_sub(old_weight);
        }

        while inner.total_weight + weight > self.max_size {
            match inner.order.pop_lru() {
                Some((_, evicted_value)) => {
                    let evicted_weight = self.weigh.weigh(&evicted_value);
                    inner.total_weight = inner.total_weight.saturating_sub(evicted_weight);
                    evicted.push(evicted_value);
                }
                None => break, // nothing left to evict; weight must now fit
            }
        }

        inner.order.put(key, value);
        inner.total_weight += weight;
        Ok(evicted)
    }

    /// Look up `key`, moving it to most-recently-used position.
    pub fn look_up(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().unwrap().order.get(key).cloned()
    }

    /// Look up `key` without disturbing recency order.
    pub fn look_up_without_changing_order(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().unwrap().order.peek(key).cloned()
    }

    /// Replace the value stored at `key` in place, without changing its
    /// recency position. Fails with `EntryNotExist` if the key is absent.
    pub fn update_without_changing_order(&self, key: &K, value: V) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.order.peek(key).is_none() {
            return Err(Error::EntryNotExist);
        }
        let old_weight = self.weigh.weigh(inner.order.peek(key).unwrap());
        let new_weight = self.weigh.weigh(&value);
        // `peek_mut` preserves order; this is the in-place replacement path.
        *inner.order.peek_mut(key).unwrap() = value;
        inner.total_weight = inner.total_weight - old_weight + new_weight;
        Ok(())
    }

    /// Remove `key`, returning its prior value if present.
    pub fn erase(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.order.pop(key);
        if let Some(ref value) = removed {
            let weight = self.weigh.weigh(value);
            inner.total_weight = inner.total_weight.saturating_sub(weight);
        }
        removed
    }

    /// Remove and return every entry, leaving the index empty. Used by
    /// `CacheHandler::destroy` to enumerate entries needing on-disk cleanup.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut inner = self.inner.lock().unwrap();
        let entries: Vec<(K, V)> = std::iter::from_fn(|| inner.order.pop_lru()).collect();
        inner.total_weight = 0;
        entries
    }
}

trait UnboundedLru<K: Hash + Eq, V> {
    fn unbounded() -> OrderedMap<K, V>;
}

impl<K: Hash + Eq, V> UnboundedLru<K, V> for OrderedMap<K, V> {
    fn unbounded() -> OrderedMap<K, V> {
        // `lru::LruCache` requires a `NonZeroUsize` capacity; usize::MAX
        // gives us an entry-count cap that will never bind in practice,
        // leaving `max_size` (weight) as the only real admission control.
        OrderedMap::new(NonZeroUsize::new(usize::MAX).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Entry {
        size: u64,
    }

    fn index(max_size: u64) -> LruIndex<&'static str, Entry, WeighFn<fn(&Entry) -> u64>> {
        LruIndex::new(max_size, WeighFn(|e: &Entry| e.size))
    }

    #[test]
    fn insert_rejects_entry_larger_than_budget() {
        let idx = index(10);
        let err = idx.insert("a", Entry { size: 11 }).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { .. }));
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn insert_evicts_lru_until_it_fits() {
        let idx = index(10);
        assert_eq!(idx.insert("a", Entry { size: 6 }).unwrap(), vec![]);
        assert_eq!(idx.insert("b", Entry { size: 4 }).unwrap(), vec![]);
        assert_eq!(idx.total_weight(), 10);

        // "a" is LRU (inserted first, never looked up); inserting "c" of
        // weight 3 must evict "a" to make room.
        let evicted = idx.insert("c", Entry { size: 3 }).unwrap();
        assert_eq!(evicted, vec![Entry { size: 6 }]);
        assert!(idx.look_up_without_changing_order(&"a").is_none());
        assert!(idx.look_up_without_changing_order(&"b").is_some());
        assert!(idx.look_up_without_changing_order(&"c").is_some());
    }

    #[test]
    fn look_up_promotes_to_mru_and_protects_from_eviction() {
        let idx = index(10);
        idx.insert("a", Entry { size: 5 }).unwrap();
        idx.insert("b", Entry { size: 5 }).unwrap();
        // Touch "a" so "b" becomes LRU.
        assert!(idx.look_up(&"a").is_some());
        let evicted = idx.insert("c", Entry { size: 5 }).unwrap();
        assert_eq!(evicted, vec![Entry { size: 5 }]); // "b" evicted, not "a"
        assert!(idx.look_up_without_changing_order(&"a").is_some());
    }

    #[test]
    fn look_up_without_changing_order_does_not_promote() {
        let idx = index(10);
        idx.insert("a", Entry { size: 5 }).unwrap();
        idx.insert("b", Entry { size: 5 }).unwrap();
        assert!(idx.look_up_without_changing_order(&"a").is_some());
        // "a" should still be LRU since we didn't touch order.
        let evicted = idx.insert("c", Entry { size: 5 }).unwrap();
        assert_eq!(evicted, vec![Entry { size: 5 }]); // "a" evicted
    }

    #[test]
    fn update_without_changing_order_requires_existing_key() {
        let idx = index(10);
        assert!(matches!(
            idx.update_without_changing_order(&"missing", Entry { size: 1 }),
            Err(Error::EntryNotExist)
        ));
        idx.insert("a", Entry { size: 5 }).unwrap();
        idx.update_without_changing_order(&"a", Entry { size: 7 })
            .unwrap();
        assert_eq!(idx.total_weight(), 7);
        assert_eq!(
            idx.look_up_without_changing_order(&"a"),
            Some(Entry { size: 7 })
        );
    }

    #[test]
    fn erase_removes_and_returns_prior_value() {
        let idx = index(10);
        idx.insert("a", Entry { size: 5 }).unwrap();
        assert_eq!(idx.erase(&"a"), Some(Entry { size: 5 }));
        assert_eq!(idx.erase(&"a"), None);
        assert_eq!(idx.total_weight(), 0);
    }

    #[test]
    fn reinserting_existing_key_accounts_for_old_weight() {
        let idx = index(10);
        idx.insert("a", Entry { size: 5 }).unwrap();
        idx.insert("a", Entry { size: 8 }).unwrap();
        assert_eq!(idx.total_weight(), 8);
        assert_eq!(idx.len(), 1);
    }
}
