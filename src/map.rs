//! Concurrent memoized map.
//!
//! This module provides [`MemoizedMap<K, V>`], a concurrent key/value store
//! where every slot is a [`DeferredCell`]. Write operations publish cells
//! atomically through the underlying container's entry API and never run
//! user code while a store shard lock is held; evaluation happens on first
//! dereference of the winning published cell. That split is what makes
//! `get_or_insert_with` race-proof without any outer lock: many threads may
//! build candidate cells, but only one is ever published, and only the
//! published one is ever evaluated.
//!
//! A slot whose factory fails removes its own entry before the error reaches
//! the caller, so the next access builds a fresh slot and retries instead of
//! replaying a cached failure forever.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cell::{BoxedFactory, DeferredCell, EvictHook};
use crate::error::{ComputeError, EvalError};

/// Map state shared by every cloned handle and weakly referenced by the
/// eviction hooks embedded in pending slots.
struct Shared<K, V, S> {
   slots: DashMap<K, Arc<DeferredCell<V>>, S>,
   /// Source of slot identities; strictly increasing per map.
   next_id: AtomicU64,
}

/// A concurrent map that memoizes expensive, possibly-failing computations.
///
/// Every slot is a [`DeferredCell`]: factories handed to `try_insert_with`
/// and friends are wrapped, published atomically, and evaluated at most once
/// on first access, no matter how many threads race on the same key.
///
/// Cloning the map clones a handle; both handles operate on the same slots.
///
/// Published cells are immutable. An update always publishes a new cell in
/// place of the old one, so a reader still holding the old cell never sees
/// its value change underneath it.
pub struct MemoizedMap<K, V, S = RandomState> {
   shared: Arc<Shared<K, V, S>>,
}

impl<K, V, S> Clone for MemoizedMap<K, V, S> {
   /// Returns a new handle to the same map.
   fn clone(&self) -> Self {
      Self {
         shared: Arc::clone(&self.shared),
      }
   }
}

impl<K: Eq + Hash, V> MemoizedMap<K, V, RandomState> {
   /// Creates an empty map.
   #[must_use]
   pub fn new() -> Self {
      Self::from_slots(DashMap::new())
   }

   /// Creates an empty map with room for `capacity` entries.
   #[must_use]
   pub fn with_capacity(capacity: usize) -> Self {
      Self::from_slots(DashMap::with_capacity(capacity))
   }
}

impl<K: Eq + Hash, V, S: BuildHasher + Clone> MemoizedMap<K, V, S> {
   /// Creates an empty map using `hasher` as its key-equality strategy.
   #[must_use]
   pub fn with_hasher(hasher: S) -> Self {
      Self::from_slots(DashMap::with_hasher(hasher))
   }

   /// Creates an empty map with the given capacity and key-equality strategy.
   #[must_use]
   pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
      Self::from_slots(DashMap::with_capacity_and_hasher(capacity, hasher))
   }

   /// Creates an empty map sized for `capacity` entries and a `concurrency`
   /// hint, the expected number of threads updating the map simultaneously.
   ///
   /// The hint is rounded up to the next power-of-two shard count.
   #[must_use]
   pub fn with_concurrency_and_hasher(capacity: usize, concurrency: usize, hasher: S) -> Self {
      let shards = concurrency.next_power_of_two().max(2);
      Self::from_slots(DashMap::with_capacity_and_hasher_and_shard_amount(
         capacity, hasher, shards,
      ))
   }

   fn from_slots(slots: DashMap<K, Arc<DeferredCell<V>>, S>) -> Self {
      Self {
         shared: Arc::new(Shared {
            slots,
            next_id: AtomicU64::new(1),
         }),
      }
   }
}

impl<K, V, S> MemoizedMap<K, V, S>
where
   K: Eq + Hash + Clone + Send + Sync + 'static,
   V: Clone + Send + 'static,
   S: BuildHasher + Clone + Send + Sync + 'static,
{
   fn next_id(&self) -> u64 {
      self.shared.next_id.fetch_add(1, Ordering::Relaxed)
   }

   /// Builds a settled slot holding `value`.
   fn value_slot(&self, value: V) -> Arc<DeferredCell<V>> {
      Arc::new(DeferredCell::keyed_value(self.next_id(), value))
   }

   /// Builds an unevaluated slot whose factory and eviction hook are both
   /// bound to `key`. The hook removes the entry only while this very slot
   /// is still published, so a newer slot is never evicted by a stale
   /// failure. It holds the map weakly; if the map is gone, eviction is a
   /// no-op.
   fn pending_slot<F>(&self, key: &K, factory: F) -> Arc<DeferredCell<V>>
   where
      F: FnOnce(&K) -> Result<V, ComputeError> + Send + 'static,
   {
      let id = self.next_id();
      let bound = key.clone();
      let run: BoxedFactory<V> = Box::new(move || factory(&bound));
      let evict_key = key.clone();
      let shared = Arc::downgrade(&self.shared);
      let on_failure: EvictHook = Box::new(move || {
         if let Some(shared) = shared.upgrade() {
            tracing::debug!("deferred computation failed, evicting slot");
            let _ = shared.slots.remove_if(&evict_key, |_, slot| slot.id() == id);
         }
      });
      Arc::new(DeferredCell::keyed(id, run, on_failure))
   }

   /// Reads the published slot for `key` without forcing it.
   pub(crate) fn slot<Q>(&self, key: &Q) -> Option<Arc<DeferredCell<V>>>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      match self.shared.slots.get(key) {
         Some(entry) => Some(Arc::clone(entry.value())),
         None => None,
      }
   }

   /// Swaps in `replacement` only if `observed` is still the published slot
   /// for `key`. This is the reference-identity compare-and-swap every
   /// update operation builds on.
   fn replace_if_current(
      &self,
      key: K,
      observed: &Arc<DeferredCell<V>>,
      replacement: Arc<DeferredCell<V>>,
   ) -> bool {
      match self.shared.slots.entry(key) {
         Entry::Occupied(mut entry) => {
            if entry.get().id() == observed.id() {
               entry.insert(replacement);
               true
            } else {
               false
            }
         }
         Entry::Vacant(_) => false,
      }
   }

   /// Publishes a new slot holding `value` in place of `observed`.
   pub(crate) fn replace_slot(&self, key: K, observed: &Arc<DeferredCell<V>>, value: V) -> bool {
      let replacement = self.value_slot(value);
      self.replace_if_current(key, observed, replacement)
   }

   /// Publishes `value` under `key` if the key is absent.
   ///
   /// Returns `true` if the value was inserted, `false` if the key was
   /// already present. Never evaluates anything.
   pub fn try_insert(&self, key: K, value: V) -> bool {
      match self.shared.slots.entry(key) {
         Entry::Occupied(_) => false,
         Entry::Vacant(entry) => {
            let _published = entry.insert(self.value_slot(value));
            true
         }
      }
   }

   /// Publishes an unevaluated `factory` under `key` if the key is absent.
   ///
   /// The factory is wrapped, not invoked; it runs on the first operation
   /// that forces the slot. Returns `false` without touching the map if the
   /// key is already present, in which case the candidate slot is discarded
   /// unevaluated.
   pub fn try_insert_with<F>(&self, key: K, factory: F) -> bool
   where
      F: FnOnce(&K) -> Result<V, ComputeError> + Send + 'static,
   {
      let candidate = self.pending_slot(&key, factory);
      match self.shared.slots.entry(key) {
         Entry::Occupied(_) => false,
         Entry::Vacant(entry) => {
            let _published = entry.insert(candidate);
            true
         }
      }
   }

   /// Returns the materialized value for `key`, forcing the slot's
   /// computation if it has not run yet.
   ///
   /// `Ok(None)` if the key is absent. A factory failure propagates to the
   /// caller after the slot has evicted itself.
   pub fn get<Q>(&self, key: &Q) -> Result<Option<V>, EvalError>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      match self.slot(key) {
         // Forced outside the shard lock; `slot` already dropped its guard.
         Some(slot) => slot.materialize().map(Some),
         None => Ok(None),
      }
   }

   /// Removes the slot for `key`, returning its materialized value.
   ///
   /// Forces the removed slot if it was still pending, so the previous value
   /// can be reported; a factory failure during that forcing propagates.
   pub fn remove<Q>(&self, key: &Q) -> Result<Option<V>, EvalError>
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      match self.shared.slots.remove(key) {
         Some((_key, slot)) => slot.materialize().map(Some),
         None => Ok(None),
      }
   }

   /// Replaces the value for `key` with `new_value` if the current
   /// materialized value equals `expected` and the slot has not been swapped
   /// since it was read.
   ///
   /// The read forces the current slot; if the comparison then fails, that
   /// evaluation was wasted and is accepted as such.
   pub fn try_update(&self, key: K, new_value: V, expected: &V) -> Result<bool, EvalError>
   where
      V: PartialEq,
   {
      let Some(observed) = self.slot(&key) else {
         return Ok(false);
      };
      let current = observed.materialize()?;
      if current != *expected {
         return Ok(false);
      }
      let replacement = self.value_slot(new_value);
      Ok(self.replace_if_current(key, &observed, replacement))
   }

   /// Like [`try_update`](Self::try_update), but publishes an unevaluated
   /// `factory` as the replacement slot. The factory runs on the first
   /// access that forces the new slot, not here.
   pub fn try_update_with<F>(&self, key: K, factory: F, expected: &V) -> Result<bool, EvalError>
   where
      V: PartialEq,
      F: FnOnce(&K) -> Result<V, ComputeError> + Send + 'static,
   {
      let Some(observed) = self.slot(&key) else {
         return Ok(false);
      };
      let current = observed.materialize()?;
      if current != *expected {
         return Ok(false);
      }
      let replacement = self.pending_slot(&key, factory);
      Ok(self.replace_if_current(key, &observed, replacement))
   }

   /// Returns the value for `key`, publishing `value` first if the key is
   /// absent.
   pub fn get_or_insert(&self, key: K, value: V) -> Result<V, EvalError> {
      let slot = match self.shared.slots.entry(key) {
         Entry::Occupied(entry) => Arc::clone(entry.get()),
         Entry::Vacant(entry) => Arc::clone(entry.insert(self.value_slot(value)).value()),
      };
      slot.materialize()
   }

   /// Returns the value for `key`, publishing and evaluating `factory` if
   /// the key is absent.
   ///
   /// Exactly one factory invocation happens per successful materialization
   /// regardless of how many threads call this concurrently: each caller may
   /// build a candidate slot, the entry API picks a single winner, losing
   /// candidates are discarded unevaluated, and the winning slot runs its
   /// factory once for everyone.
   ///
   /// If the factory fails, the error propagates to every caller waiting on
   /// this slot and the entry evicts itself, so a later call builds a fresh
   /// slot and retries.
   pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> Result<V, EvalError>
   where
      F: FnOnce(&K) -> Result<V, ComputeError> + Send + 'static,
   {
      let candidate = self.pending_slot(&key, factory);
      let slot = match self.shared.slots.entry(key) {
         Entry::Occupied(entry) => Arc::clone(entry.get()),
         Entry::Vacant(entry) => Arc::clone(entry.insert(candidate).value()),
      };
      // Forced only after the entry guard above is gone.
      slot.materialize()
   }

   /// Inserts `value` if `key` is absent, otherwise replaces the current
   /// value with `update(key, current)`. Returns whichever value ended up
   /// published by this call.
   ///
   /// The replace step is an optimistic compare-and-swap loop: `update` runs
   /// eagerly, and if another writer swapped the slot in the meantime it runs
   /// again against the fresh value. At-least-once, not exactly-once; that is
   /// the accepted cost of the lock-free retry.
   pub fn upsert<U>(&self, key: K, value: V, mut update: U) -> Result<V, EvalError>
   where
      U: FnMut(&K, &V) -> Result<V, ComputeError>,
   {
      loop {
         let observed = match self.shared.slots.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
               let _published = entry.insert(self.value_slot(value.clone()));
               return Ok(value);
            }
         };
         let current = observed.materialize()?;
         let next = update(&key, &current).map_err(EvalError::Factory)?;
         let replacement = self.value_slot(next.clone());
         if self.replace_if_current(key.clone(), &observed, replacement) {
            return Ok(next);
         }
         // Lost the swap; fold over whatever won.
      }
   }

   /// Like [`upsert`](Self::upsert), but computes the absent-case value with
   /// `insert_with` instead of taking it eagerly.
   ///
   /// Both closures may run more than once under contention: a competing
   /// writer can publish between the absence check and the insert, or swap
   /// the slot between the update computation and its commit.
   pub fn upsert_with<F, U>(&self, key: K, mut insert_with: F, mut update: U) -> Result<V, EvalError>
   where
      F: FnMut(&K) -> Result<V, ComputeError>,
      U: FnMut(&K, &V) -> Result<V, ComputeError>,
   {
      loop {
         let Some(observed) = self.slot(&key) else {
            // Compute outside any store lock, then race to publish.
            let value = insert_with(&key).map_err(EvalError::Factory)?;
            if self.try_insert(key.clone(), value.clone()) {
               return Ok(value);
            }
            continue;
         };
         let current = observed.materialize()?;
         let next = update(&key, &current).map_err(EvalError::Factory)?;
         let replacement = self.value_slot(next.clone());
         if self.replace_if_current(key.clone(), &observed, replacement) {
            return Ok(next);
         }
      }
   }

   /// Whether `key` currently has a published slot. Never forces anything.
   pub fn contains_key<Q>(&self, key: &Q) -> bool
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      self.shared.slots.contains_key(key)
   }

   /// Number of published slots.
   pub fn len(&self) -> usize {
      self.shared.slots.len()
   }

   /// Whether the map has no published slots.
   pub fn is_empty(&self) -> bool {
      self.shared.slots.is_empty()
   }

   /// Removes every slot. Pending computations in removed slots simply never
   /// run unless someone still holds the cell.
   pub fn clear(&self) {
      self.shared.slots.clear();
   }

   /// Keys present at the moment of the walk. Never forces anything.
   pub fn keys(&self) -> Vec<K> {
      self.shared.slots.iter().map(|entry| entry.key().clone()).collect()
   }

   /// Materialized values, forcing each slot as it is visited. The first
   /// factory failure aborts the walk.
   pub fn values(&self) -> Result<Vec<V>, EvalError> {
      self.iter().map(|pair| pair.map(|(_, value)| value)).collect()
   }

   /// Iterates over `(key, value)` pairs, forcing each slot lazily as it is
   /// visited.
   ///
   /// The walk is weakly consistent: each pair reflects that entry at the
   /// moment it was read, not a single instant across the whole map. No
   /// pair ever mixes two different writes, because published cells are
   /// immutable.
   pub fn iter(&self) -> Iter<K, V> {
      let entries: Vec<_> = self
         .shared
         .slots
         .iter()
         .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
         .collect();
      Iter {
         entries: entries.into_iter(),
      }
   }

   /// Snapshot of the map as a vector of materialized pairs. Same weak
   /// consistency as [`iter`](Self::iter).
   pub fn to_vec(&self) -> Result<Vec<(K, V)>, EvalError> {
      self.iter().collect()
   }
}

/// Iterator over the entries of a [`MemoizedMap`], forcing each slot as it
/// is visited.
pub struct Iter<K, V> {
   entries: std::vec::IntoIter<(K, Arc<DeferredCell<V>>)>,
}

impl<K, V: Clone> Iterator for Iter<K, V> {
   type Item = Result<(K, V), EvalError>;

   fn next(&mut self) -> Option<Self::Item> {
      let (key, slot) = self.entries.next()?;
      Some(slot.materialize().map(|value| (key, value)))
   }

   fn size_hint(&self) -> (usize, Option<usize>) {
      self.entries.size_hint()
   }
}

impl<K: Eq + Hash, V, S: BuildHasher + Clone + Default> Default for MemoizedMap<K, V, S> {
   /// Creates an empty map with a default key-equality strategy.
   fn default() -> Self {
      Self::with_hasher(S::default())
   }
}

impl<K, V> FromIterator<(K, V)> for MemoizedMap<K, V, RandomState>
where
   K: Eq + Hash + Clone + Send + Sync + 'static,
   V: Clone + Send + 'static,
{
   /// Builds a map from an initial sequence. A key that appears more than
   /// once keeps its last value.
   fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
      let map = Self::new();
      for (key, value) in iter {
         let slot = map.value_slot(value);
         map.shared.slots.insert(key, slot);
      }
      map
   }
}

impl<K, V, S> fmt::Debug for MemoizedMap<K, V, S>
where
   K: fmt::Debug + Eq + Hash,
   V: fmt::Debug,
   S: BuildHasher + Clone,
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_map();
      for entry in self.shared.slots.iter() {
         d.entry(entry.key(), entry.value().as_ref());
      }
      d.finish()
   }
}
