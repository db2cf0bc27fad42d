//! Error types shared by the synchronous and asynchronous maps.
//!
//! Caller-supplied factories and update closures fail with a [`ComputeError`],
//! an `Arc`-boxed error object. The `Arc` is what lets one failure be handed
//! to every accessor suspended on the same slot without requiring `Clone` of
//! the underlying error type. Operations that force a slot surface an
//! [`EvalError`], which either passes the factory's error through or records
//! that the computation panicked before settling the slot.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shareable failure produced by a caller-supplied factory or update closure.
pub type ComputeError = Arc<dyn StdError + Send + Sync + 'static>;

/// Error surfaced by operations that force a deferred slot.
///
/// Cloneable so that a slot can cache one failure and hand it to every
/// accessor of that instance.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
   /// The factory or update closure backing the slot reported an error.
   ///
   /// Display defers to the underlying error; use
   /// [`compute_error`](Self::compute_error) to inspect or downcast it.
   #[error("{0}")]
   Factory(ComputeError),

   /// The computation panicked before producing a value. The slot settles as
   /// failed so that suspended accessors are not stranded.
   #[error("deferred computation panicked")]
   Panicked,
}

impl EvalError {
   /// Returns the underlying factory error, if this failure carries one.
   pub fn compute_error(&self) -> Option<&ComputeError> {
      match self {
         Self::Factory(inner) => Some(inner),
         Self::Panicked => None,
      }
   }

   /// Whether the computation panicked rather than returning an error.
   pub fn is_panic(&self) -> bool {
      matches!(self, Self::Panicked)
   }
}

impl From<ComputeError> for EvalError {
   fn from(inner: ComputeError) -> Self {
      Self::Factory(inner)
   }
}
