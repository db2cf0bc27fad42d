use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memo_once::{ComputeError, DeferredCell, EvalError};

fn boom() -> ComputeError {
   Arc::new(io::Error::new(io::ErrorKind::Other, "boom"))
}

#[test]
fn test_with_value_is_settled() {
   let cell = DeferredCell::with_value(42);
   assert!(cell.is_settled());
   assert_eq!(cell.peek(), Some(42));
   assert_eq!(cell.materialize().unwrap(), 42);
}

#[test]
fn test_new_is_not_settled() {
   let cell: DeferredCell<i32> = DeferredCell::new(|| Ok(42));
   assert!(!cell.is_settled());
   assert_eq!(cell.peek(), None);
}

#[test]
fn test_materialize_runs_factory_once() {
   let counter = Arc::new(AtomicUsize::new(0));
   let cell = {
      let counter = Arc::clone(&counter);
      DeferredCell::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         Ok(42)
      })
   };

   assert_eq!(cell.materialize().unwrap(), 42);
   assert_eq!(cell.materialize().unwrap(), 42);
   assert!(cell.is_settled());
   assert_eq!(cell.peek(), Some(42));
   // The factory ran exactly once despite two accesses.
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_multi_thread_materialize() {
   let counter = Arc::new(AtomicUsize::new(0));
   let cell = {
      let counter = Arc::clone(&counter);
      Arc::new(DeferredCell::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         // Hold the slot in the computing state long enough for the other
         // threads to pile up as waiters.
         thread::sleep(Duration::from_millis(30));
         Ok(42)
      }))
   };

   let threads: Vec<_> = (0..10)
      .map(|_| {
         let cell = Arc::clone(&cell);
         thread::spawn(move || cell.materialize().unwrap())
      })
      .collect();

   for handle in threads {
      assert_eq!(handle.join().unwrap(), 42);
   }
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_is_cached_per_instance() {
   let counter = Arc::new(AtomicUsize::new(0));
   let cell: DeferredCell<i32> = {
      let counter = Arc::clone(&counter);
      DeferredCell::new(move || {
         counter.fetch_add(1, Ordering::SeqCst);
         Err(boom())
      })
   };

   let first = cell.materialize().unwrap_err();
   assert_eq!(first.to_string(), "boom");

   // A second access observes the same failure without re-running anything.
   let second = cell.materialize().unwrap_err();
   assert_eq!(second.to_string(), "boom");
   assert_eq!(counter.load(Ordering::SeqCst), 1);
   assert!(cell.is_settled());
   assert_eq!(cell.peek(), None);
}

#[test]
fn test_failure_hook_fires_once() {
   let evictions = Arc::new(AtomicUsize::new(0));
   let cell: DeferredCell<i32> = {
      let evictions = Arc::clone(&evictions);
      DeferredCell::with_failure_hook(
         move || Err(boom()),
         move || {
            evictions.fetch_add(1, Ordering::SeqCst);
         },
      )
   };

   assert!(cell.materialize().is_err());
   assert!(cell.materialize().is_err());
   assert_eq!(evictions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hook_not_fired_on_success() {
   let evictions = Arc::new(AtomicUsize::new(0));
   let cell = {
      let evictions = Arc::clone(&evictions);
      DeferredCell::with_failure_hook(
         move || Ok(7),
         move || {
            evictions.fetch_add(1, Ordering::SeqCst);
         },
      )
   };

   assert_eq!(cell.materialize().unwrap(), 7);
   assert_eq!(evictions.load(Ordering::SeqCst), 0);
}

#[test]
fn test_waiters_observe_same_failure() {
   let counter = Arc::new(AtomicUsize::new(0));
   let evictions = Arc::new(AtomicUsize::new(0));
   let cell: Arc<DeferredCell<i32>> = {
      let counter = Arc::clone(&counter);
      let evictions = Arc::clone(&evictions);
      Arc::new(DeferredCell::with_failure_hook(
         move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Err(boom())
         },
         move || {
            evictions.fetch_add(1, Ordering::SeqCst);
         },
      ))
   };

   let runner = {
      let cell = Arc::clone(&cell);
      thread::spawn(move || cell.materialize())
   };
   // Give the runner time to take the factory, then pile on as a waiter.
   thread::sleep(Duration::from_millis(10));
   let waited = cell.materialize();

   assert_eq!(runner.join().unwrap().unwrap_err().to_string(), "boom");
   assert_eq!(waited.unwrap_err().to_string(), "boom");
   // One evaluation, one eviction, no matter how many observers.
   assert_eq!(counter.load(Ordering::SeqCst), 1);
   assert_eq!(evictions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panic_settles_the_slot() {
   let evictions = Arc::new(AtomicUsize::new(0));
   let cell: Arc<DeferredCell<i32>> = {
      let evictions = Arc::clone(&evictions);
      Arc::new(DeferredCell::with_failure_hook(
         move || panic!("factory exploded"),
         move || {
            evictions.fetch_add(1, Ordering::SeqCst);
         },
      ))
   };

   let runner = {
      let cell = Arc::clone(&cell);
      thread::spawn(move || cell.materialize())
   };
   assert!(runner.join().is_err());

   // Later accessors are not stranded; they observe a panic failure.
   let observed = cell.materialize().unwrap_err();
   assert!(observed.is_panic());
   assert!(matches!(observed, EvalError::Panicked));
   assert_eq!(evictions.load(Ordering::SeqCst), 1);
}

#[test]
fn test_from_value() {
   let cell = DeferredCell::from("ready");
   assert!(cell.is_settled());
   assert_eq!(cell.materialize().unwrap(), "ready");
}

#[test]
fn test_debug_states() {
   let pending: DeferredCell<i32> = DeferredCell::new(|| Ok(1));
   assert_eq!(format!("{pending:?}"), "DeferredCell(<pending>)");

   let ready = DeferredCell::with_value(1);
   assert_eq!(format!("{ready:?}"), "DeferredCell(1)");
}
