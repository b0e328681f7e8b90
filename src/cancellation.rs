//! Cooperative cancellation primitives.
//!
//! A [`CancellationToken`] is a shared signal carrier threaded through fiber
//! creation sites. Cancellation is always cooperative: a body observes the
//! token (usually via [`CancellationToken::throw_if_canceled`]) and unwinds
//! with the token's cancellation error, and the scheduler checks the token
//! before every step.

use std::{
  fmt::{Debug, Formatter},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
  },
};

use crate::{FiberError, FiberResult};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// A shared, cooperative cancellation signal.
///
/// Tokens are cheap to clone; all clones observe the same signal and compare
/// equal to each other. The [`CancellationToken::none`] token is neutral: it
/// can never become canceled, and requests to cancel it are ignored.
#[derive(Clone)]
pub struct CancellationToken {
  inner: Arc<TokenInner>,
}

struct TokenInner {
  id: u64,
  neutral: bool,
  canceled: AtomicBool,
  callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancellationToken {
  /// Creates a new, un-canceled token.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(TokenInner {
        id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
        neutral: false,
        canceled: AtomicBool::new(false),
        callbacks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Creates a neutral token that can never be canceled.
  pub fn none() -> Self {
    Self {
      inner: Arc::new(TokenInner {
        id: 0,
        neutral: true,
        canceled: AtomicBool::new(false),
        callbacks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// A unique identifier for this token; all clones share it.
  #[inline]
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  /// Signals cancellation. Idempotent; ignored on the neutral token.
  pub fn cancel(&self) {
    if self.inner.neutral {
      return;
    }

    if !self.inner.canceled.swap(true, Ordering::AcqRel) {
      let callbacks = {
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        std::mem::take(&mut *callbacks)
      };

      for callback in callbacks {
        callback();
      }
    }
  }

  /// Has this token been canceled?
  #[inline]
  pub fn is_canceled(&self) -> bool {
    self.inner.canceled.load(Ordering::Acquire)
  }

  /// Raises this token's cancellation if it has been signaled.
  pub fn throw_if_canceled(&self) -> FiberResult<()> {
    if self.is_canceled() {
      Err(self.cancellation())
    } else {
      Ok(())
    }
  }

  /// Builds the cancellation error carrying this token.
  pub fn cancellation(&self) -> FiberError {
    FiberError::Canceled { token: self.clone() }
  }

  /// Registers a callback to run when the token is canceled.
  ///
  /// If the token is already canceled, the callback runs immediately on the
  /// calling thread. Callbacks registered on the neutral token never run.
  pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
    if self.inner.neutral {
      return;
    }

    if self.is_canceled() {
      callback();
      return;
    }

    let mut callbacks = self.inner.callbacks.lock().unwrap();

    // re-check under the lock so a concurrent cancel can't strand the callback
    if self.is_canceled() {
      drop(callbacks);
      callback();
    } else {
      callbacks.push(Box::new(callback));
    }
  }
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

impl PartialEq for CancellationToken {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Eq for CancellationToken {}

impl Debug for CancellationToken {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancellationToken")
      .field("id", &self.inner.id)
      .field("canceled", &self.is_canceled())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_signals_all_clones() {
    let token = CancellationToken::new();
    let clone = token.clone();

    assert!(!clone.is_canceled());
    token.cancel();
    assert!(clone.is_canceled());
  }

  #[test]
  fn test_neutral_token_ignores_cancel() {
    let token = CancellationToken::none();

    token.cancel();

    assert!(!token.is_canceled());
    assert!(token.throw_if_canceled().is_ok());
  }

  #[test]
  fn test_tokens_compare_by_identity() {
    let a = CancellationToken::new();
    let b = CancellationToken::new();

    assert_eq!(a, a.clone());
    assert_ne!(a, b);
  }

  #[test]
  fn test_register_fires_once_on_cancel() {
    use std::sync::atomic::AtomicUsize;

    let token = CancellationToken::new();
    let count = Arc::new(AtomicUsize::new(0));

    let observed = count.clone();
    token.register(move || {
      observed.fetch_add(1, Ordering::SeqCst);
    });

    token.cancel();
    token.cancel();

    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_register_after_cancel_fires_immediately() {
    use std::sync::atomic::AtomicUsize;

    let token = CancellationToken::new();
    let count = Arc::new(AtomicUsize::new(0));

    token.cancel();

    let observed = count.clone();
    token.register(move || {
      observed.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}
