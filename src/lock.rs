//! Per-key asynchronous mutual exclusion.
//!
//! [`KeyedMutex`] maps keys to exclusive asynchronous locks, created on
//! demand and reclaimed as soon as the last acquirer lets go. Acquiring the
//! lock for a key suspends only the calling task, never a worker thread, and
//! locks for unequal keys never contend with each other.
//!
//! Reclamation is acquirer-counted: every `lock` call registers interest in
//! the slot before awaiting the mutex, and deregisters on guard drop or on
//! cancellation while still waiting. A slot whose count reaches zero is
//! removed under the shard lock, guarded by a recheck of the count, so the
//! table does not grow without bound as keys churn.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One lock slot. Cloning shares the underlying mutex and acquirer count.
#[derive(Clone, Default)]
struct LockSlot {
   mutex: Arc<Mutex<()>>,
   acquirers: Arc<AtomicUsize>,
}

/// A table of asynchronous locks, one per key.
pub struct KeyedMutex<K, S = RandomState> {
   slots: DashMap<K, LockSlot, S>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K, RandomState> {
   /// Creates an empty lock table.
   #[must_use]
   pub fn new() -> Self {
      Self {
         slots: DashMap::new(),
      }
   }
}

impl<K: Eq + Hash + Clone, S: BuildHasher + Clone> KeyedMutex<K, S> {
   /// Creates an empty lock table using `hasher` as its key-equality
   /// strategy. Use the same strategy as the map the locks protect, so that
   /// "same key" means the same thing on both sides.
   #[must_use]
   pub fn with_hasher(hasher: S) -> Self {
      Self {
         slots: DashMap::with_hasher(hasher),
      }
   }

   /// Acquires the lock for `key`, suspending until it is free.
   ///
   /// The returned guard releases the lock when dropped, on every exit path:
   /// normal return, error propagation, or the owning future being dropped.
   pub async fn lock(&self, key: K) -> KeyedGuard<'_, K, S> {
      let lease = self.lease(key);
      let permit = lease.slot.mutex.clone().lock_owned().await;
      KeyedGuard {
         _permit: permit,
         lease,
      }
   }

   /// Registers interest in `key` so the slot cannot be reclaimed while this
   /// caller waits for the mutex. Dropping the lease, even before the mutex
   /// was acquired, takes the registration back.
   fn lease(&self, key: K) -> Lease<'_, K, S> {
      let slot = {
         let entry = self.slots.entry(key.clone()).or_default();
         entry.acquirers.fetch_add(1, Ordering::SeqCst);
         entry.value().clone()
      };
      Lease {
         table: self,
         key,
         slot,
      }
   }

   /// Number of keys currently holding a live lock slot.
   pub fn len(&self) -> usize {
      self.slots.len()
   }

   /// Whether no key currently holds a live lock slot.
   pub fn is_empty(&self) -> bool {
      self.slots.is_empty()
   }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K, RandomState> {
   fn default() -> Self {
      Self::new()
   }
}

impl<K: Eq + Hash, S: BuildHasher + Clone> fmt::Debug for KeyedMutex<K, S> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("KeyedMutex").field("keys", &self.slots.len()).finish()
   }
}

/// Registered interest in one lock slot. Dropping it deregisters and, if
/// this was the last acquirer, reclaims the slot.
struct Lease<'a, K: Eq + Hash + Clone, S: BuildHasher + Clone> {
   table: &'a KeyedMutex<K, S>,
   key: K,
   slot: LockSlot,
}

impl<K: Eq + Hash + Clone, S: BuildHasher + Clone> Drop for Lease<'_, K, S> {
   fn drop(&mut self) {
      if self.slot.acquirers.fetch_sub(1, Ordering::SeqCst) == 1 {
         // Last acquirer out. The recheck runs under the shard lock, so a
         // fresh registration either arrives before it (count nonzero, keep
         // the slot) or after the removal (and recreates the slot).
         let removed = self
            .table
            .slots
            .remove_if(&self.key, |_, slot| slot.acquirers.load(Ordering::SeqCst) == 0);
         if removed.is_some() {
            tracing::trace!("reclaimed idle key lock");
         }
      }
   }
}

/// Scoped token for a held per-key lock, returned by [`KeyedMutex::lock`].
pub struct KeyedGuard<'a, K: Eq + Hash + Clone, S: BuildHasher + Clone = RandomState> {
   // Field order matters: the mutex is released before the lease
   // deregisters, so the slot is never reclaimed while still locked.
   _permit: OwnedMutexGuard<()>,
   lease: Lease<'a, K, S>,
}

impl<K: Eq + Hash + Clone, S: BuildHasher + Clone> KeyedGuard<'_, K, S> {
   /// The key this guard serializes.
   pub fn key(&self) -> &K {
      &self.lease.key
   }
}

impl<K: Eq + Hash + Clone + fmt::Debug, S: BuildHasher + Clone> fmt::Debug
   for KeyedGuard<'_, K, S>
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("KeyedGuard").field("key", &self.lease.key).finish()
   }
}
