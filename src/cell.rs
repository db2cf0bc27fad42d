//! Deferred one-shot computation slot.
//!
//! This module provides [`DeferredCell<V>`], the building block every map slot
//! is made of. A cell wraps either an already-known value or a factory bound
//! to its owning key, and guarantees that the factory runs at most once per
//! cell instance no matter how many threads race to materialize it. The
//! outcome, value or failure, is cached in the instance so that every
//! concurrent accessor observes the same result.
//!
//! The first caller to materialize a pending cell takes the factory out and
//! runs it outside the slot lock; everyone else blocks on a condition
//! variable until the slot settles. A failing or panicking computation still
//! settles the slot (so waiters are released) and fires the eviction hook the
//! owning map supplied at construction, exactly once per failing evaluation.

use std::fmt;
use std::mem;

use parking_lot::{Condvar, Mutex};

use crate::error::{ComputeError, EvalError};

/// Factory stored inside an unevaluated slot. The owning key is already bound
/// by the closure, which keeps the cell itself key-agnostic.
pub(crate) type BoxedFactory<V> = Box<dyn FnOnce() -> Result<V, ComputeError> + Send + 'static>;

/// Hook fired when the wrapped computation fails, used by the owning map to
/// drop the entry that published this cell.
pub(crate) type EvictHook = Box<dyn FnOnce() + Send + 'static>;

enum Slot<V> {
   /// The factory has not run yet.
   Pending {
      factory: BoxedFactory<V>,
      on_failure: Option<EvictHook>,
   },
   /// Some thread is currently running the factory, outside the lock.
   Computing,
   /// The factory produced a value.
   Ready(V),
   /// The factory failed. Every later accessor of this instance observes the
   /// same error; the owning map entry has already been evicted.
   Failed(EvalError),
}

/// A one-shot, thread-safe computation holder.
///
/// The wrapped computation executes at most once per cell instance. Callers
/// that hit a cell mid-computation block until the first caller finishes and
/// then observe the identical outcome, so an expensive factory is never
/// duplicated for the same slot.
///
/// A cell never "un-settles": once ready or failed it stays that way for the
/// rest of its life. Retrying after a failure is the owning map's job, which
/// evicts the failed entry and builds a fresh cell on the next access.
pub struct DeferredCell<V> {
   /// Identity used by the owning map for compare-and-swap and for
   /// identity-guarded eviction. Cells built through the public constructors
   /// use 0; they never enter a map.
   id: u64,
   slot: Mutex<Slot<V>>,
   settled: Condvar,
}

impl<V> DeferredCell<V> {
   /// Creates a cell that already holds `value`. No computation will run.
   #[must_use]
   pub fn with_value(value: V) -> Self {
      Self::from_slot(0, Slot::Ready(value))
   }

   /// Creates a cell wrapping `factory`.
   ///
   /// The factory runs at most once, on the first call to
   /// [`materialize`](Self::materialize).
   pub fn new<F>(factory: F) -> Self
   where
      F: FnOnce() -> Result<V, ComputeError> + Send + 'static,
   {
      Self::from_slot(
         0,
         Slot::Pending {
            factory: Box::new(factory),
            on_failure: None,
         },
      )
   }

   /// Like [`new`](Self::new), but fires `on_failure` if the computation
   /// fails or panics, after the failure is recorded in the slot and before
   /// it reaches the caller that ran the computation.
   ///
   /// The hook runs at most once, and only on the thread that actually ran
   /// the factory; waiters observing the cached failure do not re-fire it.
   pub fn with_failure_hook<F, H>(factory: F, on_failure: H) -> Self
   where
      F: FnOnce() -> Result<V, ComputeError> + Send + 'static,
      H: FnOnce() + Send + 'static,
   {
      Self::keyed(0, Box::new(factory), Box::new(on_failure))
   }

   /// Map-internal constructor: pending slot with a bound factory, an
   /// eviction hook and a map-assigned identity.
   pub(crate) fn keyed(id: u64, factory: BoxedFactory<V>, on_failure: EvictHook) -> Self {
      Self::from_slot(
         id,
         Slot::Pending {
            factory,
            on_failure: Some(on_failure),
         },
      )
   }

   /// Map-internal constructor: settled slot with a map-assigned identity.
   pub(crate) fn keyed_value(id: u64, value: V) -> Self {
      Self::from_slot(id, Slot::Ready(value))
   }

   fn from_slot(id: u64, slot: Slot<V>) -> Self {
      Self {
         id,
         slot: Mutex::new(slot),
         settled: Condvar::new(),
      }
   }

   pub(crate) fn id(&self) -> u64 {
      self.id
   }

   /// Whether the computation has already produced a value or failed.
   ///
   /// This method never blocks on the computation itself.
   pub fn is_settled(&self) -> bool {
      matches!(&*self.slot.lock(), Slot::Ready(_) | Slot::Failed(_))
   }

   /// Returns the value if the computation already completed successfully.
   ///
   /// Never blocks and never triggers the computation.
   pub fn peek(&self) -> Option<V>
   where
      V: Clone,
   {
      match &*self.slot.lock() {
         Slot::Ready(value) => Some(value.clone()),
         _ => None,
      }
   }

   /// Settles the slot and wakes every waiter.
   fn settle(&self, outcome: Slot<V>) {
      let mut slot = self.slot.lock();
      debug_assert!(matches!(&*slot, Slot::Computing));
      *slot = outcome;
      drop(slot);
      self.settled.notify_all();
   }
}

impl<V: Clone> DeferredCell<V> {
   /// Returns the materialized value, running the wrapped computation if this
   /// is the first access.
   ///
   /// - If the slot is settled, returns the cached value or the cached error.
   /// - If another thread is computing, blocks until it settles the slot and
   ///   then observes the same outcome.
   /// - Otherwise this caller runs the factory itself, outside the slot lock.
   ///
   /// A factory must not re-enter the owning map for its own key; doing so
   /// would wait on this very cell.
   pub fn materialize(&self) -> Result<V, EvalError> {
      let mut slot = self.slot.lock();
      loop {
         match &*slot {
            Slot::Ready(value) => return Ok(value.clone()),
            Slot::Failed(error) => return Err(error.clone()),
            Slot::Computing => self.settled.wait(&mut slot),
            Slot::Pending { .. } => break,
         }
      }
      let Slot::Pending { factory, on_failure } = mem::replace(&mut *slot, Slot::Computing) else {
         unreachable!("slot changed state while the lock was held");
      };
      drop(slot);
      self.run(factory, on_failure)
   }

   /// Runs the factory with the slot marked `Computing`. A panic inside the
   /// factory settles the slot as failed and still fires the eviction hook
   /// before the unwind continues.
   fn run(&self, factory: BoxedFactory<V>, on_failure: Option<EvictHook>) -> Result<V, EvalError> {
      let mut sentinel = PanicSentinel {
         cell: self,
         on_failure,
         armed: true,
      };
      let outcome = factory();
      sentinel.armed = false;
      match outcome {
         Ok(value) => {
            let result = value.clone();
            self.settle(Slot::Ready(value));
            Ok(result)
         }
         Err(cause) => {
            let error = EvalError::Factory(cause);
            self.settle(Slot::Failed(error.clone()));
            // Record first, evict second, surface last: waiters are released
            // as soon as the slot settles, and the entry is gone before the
            // computing caller sees the error.
            if let Some(evict) = sentinel.on_failure.take() {
               evict();
            }
            Err(error)
         }
      }
   }
}

/// Converts a factory panic into a settled failure so waiters are not left
/// blocked on a slot whose computation never finishes.
struct PanicSentinel<'a, V> {
   cell: &'a DeferredCell<V>,
   on_failure: Option<EvictHook>,
   armed: bool,
}

impl<V> Drop for PanicSentinel<'_, V> {
   fn drop(&mut self) {
      if self.armed {
         self.cell.settle(Slot::Failed(EvalError::Panicked));
         if let Some(evict) = self.on_failure.take() {
            evict();
         }
      }
   }
}

impl<V: fmt::Debug> fmt::Debug for DeferredCell<V> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("DeferredCell");
      match &*self.slot.lock() {
         Slot::Ready(value) => d.field(value),
         Slot::Failed(error) => d.field(&format_args!("<failed: {error}>")),
         Slot::Computing => d.field(&format_args!("<computing>")),
         Slot::Pending { .. } => d.field(&format_args!("<pending>")),
      };
      d.finish()
   }
}

impl<V> From<V> for DeferredCell<V> {
   /// Creates a settled cell from the given value.
   fn from(value: V) -> Self {
      Self::with_value(value)
   }
}
