#![cfg(feature = "async")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memo_once::KeyedMutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_is_mutually_exclusive() {
   let table = Arc::new(KeyedMutex::new());
   let active = Arc::new(AtomicUsize::new(0));

   let tasks: Vec<_> = (0..4)
      .map(|_| {
         let table = Arc::clone(&table);
         let active = Arc::clone(&active);
         tokio::spawn(async move {
            let _guard = table.lock("key").await;
            // No one else may be inside the same key's critical section.
            assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
         })
      })
      .collect();

   for task in tasks {
      task.await.unwrap();
   }
}

#[tokio::test]
async fn test_distinct_keys_do_not_contend() {
   let table = KeyedMutex::new();
   let rendezvous = Arc::new(tokio::sync::Barrier::new(2));

   // Both critical sections must be held at the same time for the barrier to
   // release; if the locks contended this would never finish.
   let run = |key: &'static str| {
      let rendezvous = Arc::clone(&rendezvous);
      let table = &table;
      async move {
         let _guard = table.lock(key).await;
         rendezvous.wait().await;
      }
   };

   tokio::time::timeout(Duration::from_secs(5), async {
      tokio::join!(run("a"), run("b"));
   })
   .await
   .expect("distinct keys blocked on each other");
}

#[tokio::test]
async fn test_slots_are_reclaimed() {
   let table: KeyedMutex<String> = KeyedMutex::new();
   assert!(table.is_empty());

   {
      let guard = table.lock("key".to_string()).await;
      assert_eq!(guard.key(), "key");
      assert_eq!(table.len(), 1);
   }
   // Last acquirer gone, slot gone.
   assert!(table.is_empty());

   // Reacquiring after reclamation works from scratch.
   let _guard = table.lock("key".to_string()).await;
   assert_eq!(table.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiters_keep_the_slot_alive() {
   let table = Arc::new(KeyedMutex::new());

   let first = table.lock("key").await;
   let waiter = {
      let table = Arc::clone(&table);
      tokio::spawn(async move {
         let _guard = table.lock("key").await;
      })
   };
   // Let the waiter register and park on the mutex.
   tokio::time::sleep(Duration::from_millis(20)).await;
   assert_eq!(table.len(), 1);

   drop(first);
   waiter.await.unwrap();
   assert!(table.is_empty());
}

#[tokio::test]
async fn test_cancelled_waiter_releases_its_registration() {
   let table: KeyedMutex<&str> = KeyedMutex::new();

   let held = table.lock("key").await;
   // The second acquisition times out while still waiting; its registration
   // must not leak.
   let attempt = tokio::time::timeout(Duration::from_millis(20), table.lock("key")).await;
   assert!(attempt.is_err());

   drop(held);
   assert!(table.is_empty());

   // The key is lockable again afterwards.
   let _guard = table.lock("key").await;
}
