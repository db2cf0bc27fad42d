use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use memo_once::MemoizedMap;

fn main() {
   let map: MemoizedMap<String, String> = MemoizedMap::new();
   let counter = Arc::new(AtomicUsize::new(0));

   let threads: Vec<_> = (0..5)
      .map(|_| {
         let map = map.clone();
         let counter = Arc::clone(&counter);
         thread::spawn(move || {
            let value = map
               .get_or_insert_with("config".to_string(), move |key| {
                  // This closure runs only once, no matter who gets here first
                  counter.fetch_add(1, Ordering::Relaxed);
                  println!("Computing value for {key}...");
                  // Simulate work
                  thread::sleep(Duration::from_millis(50));
                  Ok(format!("expensive data for {key}"))
               })
               .unwrap();
            println!("Thread got: {value}");
         })
      })
      .collect();

   for t in threads {
      t.join().unwrap();
   }

   assert_eq!(counter.load(Ordering::Relaxed), 1); // Factory ran only once
   println!("Final: {:?}", map.get("config").unwrap());
}
