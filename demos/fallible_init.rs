use std::io;
use std::sync::Arc;

use memo_once::{ComputeError, MemoizedMap};

fn fetch(map: &MemoizedMap<&'static str, String>, fail: bool) -> Result<String, memo_once::EvalError> {
   map.get_or_insert_with("data", move |key| {
      println!("Attempting computation for {key} (fail={fail})...");
      if fail {
         Err(Arc::new(io::Error::new(io::ErrorKind::Other, "computation failed")) as ComputeError)
      } else {
         Ok("successfully computed".to_string())
      }
   })
}

fn main() {
   let map: MemoizedMap<&'static str, String> = MemoizedMap::new();

   // First attempt fails; the entry evicts itself instead of caching the error
   match fetch(&map, true) {
      Ok(_) => panic!("Should have failed"),
      Err(e) => println!("Caught error: {e}"),
   }
   assert!(!map.contains_key("data"));

   // Second attempt succeeds because the map healed
   match fetch(&map, false) {
      Ok(data) => println!("Got data: {data}"),
      Err(_) => panic!("Should have succeeded"),
   }
   assert_eq!(map.get("data").unwrap().as_deref(), Some("successfully computed"));

   // Subsequent attempts (even failing ones) return the cached value
   match fetch(&map, true) {
      Ok(data) => println!("Got data again: {data}"),
      Err(_) => panic!("Should have returned the cached value"),
   }
}
