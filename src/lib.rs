//! Concurrent memoized maps with deferred, at-most-once value computation.
//!
//! This crate solves one problem: given a concurrent key/value store,
//! guarantee that an expensive, possibly-failing factory supplied for a key
//! runs **at most once** per successful materialization, even when many
//! threads race to populate the same key. It provides three types:
//!
//! - [`DeferredCell<V>`]: a one-shot computation slot. The wrapped factory
//!   runs at most once per cell instance; concurrent accessors block until
//!   the outcome is known and then all observe the same value or error.
//! - [`MemoizedMap<K, V>`]: a concurrent map whose slots are deferred cells.
//!   Publication is atomic and evaluation happens on first access to the
//!   winning published slot, which makes `get_or_insert_with` race-proof
//!   without any outer lock. A failing slot evicts its own entry, so the
//!   next access retries instead of replaying a cached failure forever.
//! - [`AsyncMemoizedMap<K, V>`]: the same guarantees for suspendable
//!   factories, built on per-key asynchronous locks ([`KeyedMutex`]) and a
//!   double-checked fast path, so waiting never blocks a worker thread.
//!
//! # Features
//!
//! - **Exactly-once factories**: one invocation per successful insert, no
//!   matter how many threads or tasks race on the key.
//! - **Failures are not sticky**: an error propagates to every caller
//!   suspended on the slot, the entry self-evicts, and later calls retry.
//! - **Lock-free reads**: synchronous operations take no lock beyond the
//!   store's own sharding; user code never runs under a store shard lock.
//! - **Per-key async serialization**: asynchronous callers of the same key
//!   are serialized, callers of different keys never wait on each other.
//!
//! # Examples
//!
//! ## Synchronous memoization
//!
//! ```rust
//! use memo_once::MemoizedMap;
//!
//! let map: MemoizedMap<String, u64> = MemoizedMap::new();
//!
//! let value = map.get_or_insert_with("answer".to_string(), |_key| Ok(42)).unwrap();
//! assert_eq!(value, 42);
//!
//! // The slot is settled now; later factories for the key never run.
//! let again = map
//!    .get_or_insert_with("answer".to_string(), |_key| unreachable!())
//!    .unwrap();
//! assert_eq!(again, 42);
//! ```
//!
//! ## Asynchronous memoization
//!
//! ```rust
//! # #[cfg(feature = "async")]
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! use memo_once::AsyncMemoizedMap;
//!
//! let map: AsyncMemoizedMap<u32, String> = AsyncMemoizedMap::new();
//! let value = map
//!    .get_or_insert_async(7, |key| {
//!       let key = *key;
//!       async move { Ok(format!("value for {key}")) }
//!    })
//!    .await
//!    .unwrap();
//! assert_eq!(value, "value for 7");
//! # });
//! ```

/// The asynchronous memoized map.
#[cfg(feature = "async")]
mod async_map;

/// Deferred one-shot computation slot.
mod cell;

/// Error types shared by the sync and async maps.
mod error;

/// Per-key asynchronous lock table.
#[cfg(feature = "async")]
mod lock;

/// The synchronous memoized map.
mod map;

#[cfg(feature = "async")]
pub use async_map::AsyncMemoizedMap;
pub use cell::DeferredCell;
pub use error::{ComputeError, EvalError};
#[cfg(feature = "async")]
pub use lock::{KeyedGuard, KeyedMutex};
pub use map::{Iter, MemoizedMap};
