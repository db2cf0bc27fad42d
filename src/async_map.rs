//! Asynchronous memoized map.
//!
//! [`AsyncMemoizedMap`] composes a [`MemoizedMap`] with a [`KeyedMutex`] so
//! that suspendable factories get the same at-most-once guarantees without
//! blocking worker threads. Every operation follows the same double-checked
//! shape:
//!
//! 1. probe the map without any lock, returning immediately if the
//!    precondition already settles the call;
//! 2. acquire the per-key lock (suspension point);
//! 3. probe again under the lock, guarding the race between the first probe
//!    and acquisition;
//! 4. await the caller's factory or update closure while holding the lock,
//!    which serializes all asynchronous callers of the same key;
//! 5. publish through the synchronous map; the lock is released on scope
//!    exit, including when the factory fails or the future is dropped.
//!
//! Synchronous operations taken through [`as_sync`](AsyncMemoizedMap::as_sync)
//! do not consult the per-key locks. A synchronous and an asynchronous caller
//! may interleave on the same key without mutual exclusion; that boundary is
//! part of the contract, not patched here.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crate::error::{ComputeError, EvalError};
use crate::lock::KeyedMutex;
use crate::map::MemoizedMap;

struct Inner<K, V, S> {
   map: MemoizedMap<K, V, S>,
   locks: KeyedMutex<K, S>,
}

/// A concurrent memoized map for asynchronous factories.
///
/// Cloning the map clones a handle; both handles operate on the same slots
/// and the same per-key locks.
pub struct AsyncMemoizedMap<K, V, S = RandomState> {
   inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for AsyncMemoizedMap<K, V, S> {
   /// Returns a new handle to the same map.
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<K: Eq + Hash + Clone, V> AsyncMemoizedMap<K, V, RandomState> {
   /// Creates an empty map.
   #[must_use]
   pub fn new() -> Self {
      Self::from_parts(MemoizedMap::new(), KeyedMutex::new())
   }

   /// Creates an empty map with room for `capacity` entries.
   #[must_use]
   pub fn with_capacity(capacity: usize) -> Self {
      Self::from_parts(MemoizedMap::with_capacity(capacity), KeyedMutex::new())
   }
}

impl<K: Eq + Hash + Clone, V, S: BuildHasher + Clone> AsyncMemoizedMap<K, V, S> {
   /// Creates an empty map using `hasher` as its key-equality strategy. The
   /// per-key locks share the strategy, so "same key" means the same thing
   /// for slots and locks.
   #[must_use]
   pub fn with_hasher(hasher: S) -> Self {
      Self::from_parts(
         MemoizedMap::with_hasher(hasher.clone()),
         KeyedMutex::with_hasher(hasher),
      )
   }

   fn from_parts(map: MemoizedMap<K, V, S>, locks: KeyedMutex<K, S>) -> Self {
      Self {
         inner: Arc::new(Inner { map, locks }),
      }
   }
}

impl<K: Eq + Hash + Clone, V> Default for AsyncMemoizedMap<K, V, RandomState> {
   fn default() -> Self {
      Self::new()
   }
}

impl<K, V, S> AsyncMemoizedMap<K, V, S>
where
   K: Eq + Hash + Clone + Send + Sync + 'static,
   V: Clone + Send + 'static,
   S: BuildHasher + Clone + Send + Sync + 'static,
{
   /// The synchronous map the asynchronous operations publish through.
   ///
   /// Operations taken through this handle are not serialized against the
   /// per-key locks. Mixing synchronous and asynchronous mutation of the
   /// same key is allowed but uncoordinated.
   pub fn as_sync(&self) -> &MemoizedMap<K, V, S> {
      &self.inner.map
   }

   /// Whether `key` currently has a published slot. Lock-free probe.
   pub fn contains_key<Q>(&self, key: &Q) -> bool
   where
      K: Borrow<Q>,
      Q: Hash + Eq + ?Sized,
   {
      self.inner.map.contains_key(key)
   }

   /// Number of published slots.
   pub fn len(&self) -> usize {
      self.inner.map.len()
   }

   /// Whether the map has no published slots.
   pub fn is_empty(&self) -> bool {
      self.inner.map.is_empty()
   }

   /// Publishes the value produced by `factory` under `key` if the key is
   /// absent. Returns whether the value was inserted.
   ///
   /// The factory is awaited while the per-key lock is held, so concurrent
   /// asynchronous callers of the same key run it at most once between them;
   /// if the key is already present, no lock is taken and no factory runs.
   pub async fn try_insert_async<F, Fut>(&self, key: K, factory: F) -> Result<bool, EvalError>
   where
      F: FnOnce(&K) -> Fut,
      Fut: Future<Output = Result<V, ComputeError>>,
   {
      if self.inner.map.contains_key(&key) {
         return Ok(false);
      }
      let _guard = self.inner.locks.lock(key.clone()).await;
      if self.inner.map.contains_key(&key) {
         return Ok(false);
      }
      let value = factory(&key).await.map_err(EvalError::Factory)?;
      Ok(self.inner.map.try_insert(key, value))
   }

   /// Returns the value for `key`, computing and publishing it with
   /// `factory` if the key is absent.
   ///
   /// Concurrent asynchronous callers of the same key invoke the factory
   /// exactly once between them, serialized by the per-key lock rather than
   /// by slot racing; callers of other keys proceed without waiting. If the
   /// factory fails, nothing is published and the error propagates to this
   /// caller only, so the next caller retries from scratch.
   pub async fn get_or_insert_async<F, Fut>(&self, key: K, factory: F) -> Result<V, EvalError>
   where
      F: FnOnce(&K) -> Fut,
      Fut: Future<Output = Result<V, ComputeError>>,
   {
      if let Some(value) = self.inner.map.get(&key)? {
         return Ok(value);
      }
      let _guard = self.inner.locks.lock(key.clone()).await;
      if let Some(value) = self.inner.map.get(&key)? {
         return Ok(value);
      }
      let value = factory(&key).await.map_err(EvalError::Factory)?;
      // A synchronous writer may still have slipped in; whoever won, return
      // the published value.
      self.inner.map.get_or_insert(key, value)
   }

   /// Replaces the value for `key` with `new_value` if the current
   /// materialized value equals `expected`, re-validated under the per-key
   /// lock.
   pub async fn try_update_async(&self, key: K, new_value: V, expected: &V) -> Result<bool, EvalError>
   where
      V: PartialEq,
   {
      match self.inner.map.get(&key)? {
         Some(current) if current == *expected => {}
         _ => return Ok(false),
      }
      let _guard = self.inner.locks.lock(key.clone()).await;
      self.inner.map.try_update(key, new_value, expected)
   }

   /// Like [`try_update_async`](Self::try_update_async), but computes the
   /// replacement with an asynchronous `factory`, awaited under the per-key
   /// lock only after the comparison holds there.
   pub async fn try_update_with_async<F, Fut>(
      &self,
      key: K,
      factory: F,
      expected: &V,
   ) -> Result<bool, EvalError>
   where
      V: PartialEq,
      F: FnOnce(&K) -> Fut,
      Fut: Future<Output = Result<V, ComputeError>>,
   {
      match self.inner.map.get(&key)? {
         Some(current) if current == *expected => {}
         _ => return Ok(false),
      }
      let _guard = self.inner.locks.lock(key.clone()).await;
      match self.inner.map.get(&key)? {
         Some(current) if current == *expected => {}
         _ => return Ok(false),
      }
      let value = factory(&key).await.map_err(EvalError::Factory)?;
      self.inner.map.try_update(key, value, expected)
   }

   /// Inserts `value` if `key` is absent, otherwise folds `update` over the
   /// current value. Returns whichever value ended up published by this
   /// call.
   ///
   /// The whole retry loop runs inside the per-key lock, so asynchronous
   /// callers of the same key are serialized and `update` normally commits
   /// on its first run. It re-runs only when a synchronous caller swaps the
   /// slot outside the lock's awareness.
   pub async fn upsert_async<U, Fut>(&self, key: K, value: V, mut update: U) -> Result<V, EvalError>
   where
      U: FnMut(&K, &V) -> Fut,
      Fut: Future<Output = Result<V, ComputeError>>,
   {
      let _guard = self.inner.locks.lock(key.clone()).await;
      loop {
         let Some(observed) = self.inner.map.slot(&key) else {
            if self.inner.map.try_insert(key.clone(), value.clone()) {
               return Ok(value);
            }
            continue;
         };
         let current = observed.materialize()?;
         let next = update(&key, &current).await.map_err(EvalError::Factory)?;
         if self.inner.map.replace_slot(key.clone(), &observed, next.clone()) {
            return Ok(next);
         }
      }
   }

   /// Like [`upsert_async`](Self::upsert_async), but computes the
   /// absent-case value with the asynchronous `insert_with`.
   ///
   /// Both closures are awaited under the per-key lock; they can run more
   /// than once only if synchronous callers interleave.
   pub async fn upsert_with_async<F, FFut, U, UFut>(
      &self,
      key: K,
      mut insert_with: F,
      mut update: U,
   ) -> Result<V, EvalError>
   where
      F: FnMut(&K) -> FFut,
      FFut: Future<Output = Result<V, ComputeError>>,
      U: FnMut(&K, &V) -> UFut,
      UFut: Future<Output = Result<V, ComputeError>>,
   {
      let _guard = self.inner.locks.lock(key.clone()).await;
      loop {
         let Some(observed) = self.inner.map.slot(&key) else {
            let value = insert_with(&key).await.map_err(EvalError::Factory)?;
            if self.inner.map.try_insert(key.clone(), value.clone()) {
               return Ok(value);
            }
            continue;
         };
         let current = observed.materialize()?;
         let next = update(&key, &current).await.map_err(EvalError::Factory)?;
         if self.inner.map.replace_slot(key.clone(), &observed, next.clone()) {
            return Ok(next);
         }
      }
   }
}

impl<K, V, S> fmt::Debug for AsyncMemoizedMap<K, V, S>
where
   K: fmt::Debug + Eq + Hash,
   V: fmt::Debug,
   S: BuildHasher + Clone,
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AsyncMemoizedMap").field("map", &self.inner.map).finish()
   }
}
