use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memo_once::AsyncMemoizedMap;

#[tokio::main]
async fn main() {
   let map: Arc<AsyncMemoizedMap<u32, String>> = Arc::new(AsyncMemoizedMap::new());
   let counter = Arc::new(AtomicUsize::new(0));

   let tasks: Vec<_> = (0..5)
      .map(|i| {
         let map = Arc::clone(&map);
         let counter = Arc::clone(&counter);
         tokio::spawn(async move {
            let value = map
               .get_or_insert_async(7, |key| {
                  let key = *key;
                  let counter = Arc::clone(&counter);
                  async move {
                     // Only one of the concurrent tasks gets here
                     counter.fetch_add(1, Ordering::Relaxed);
                     println!("Fetching value for {key}...");
                     tokio::time::sleep(Duration::from_millis(50)).await;
                     Ok(format!("remote data for {key}"))
                  }
               })
               .await
               .unwrap();
            println!("Task {i} got: {value}");
         })
      })
      .collect();

   for task in tasks {
      task.await.unwrap();
   }

   assert_eq!(counter.load(Ordering::Relaxed), 1); // Factory awaited only once
   println!("Final: {:?}", map.as_sync().get(&7).unwrap());
}
