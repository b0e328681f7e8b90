//! Error types for fibers, schedulers and composition primitives.

use std::sync::Arc;

use crate::CancellationToken;

/// The result of a fallible operation in the fiber runtime.
pub type FiberResult<T> = Result<T, FiberError>;

/// Possible errors raised by the fiber runtime.
///
/// Errors raised inside a fiber body terminate only that fiber; the scheduler
/// itself never stops because of one. A body that raises [`FiberError::Canceled`]
/// carrying the fiber's own token terminates the fiber as canceled; any other
/// error (including a cancellation carrying a foreign token) terminates it as
/// faulted, with the error captured for inspection.
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
  /// Cooperative cancellation observed via a [`CancellationToken`].
  #[error("the operation was canceled")]
  Canceled { token: CancellationToken },

  /// A composition supervisor ran past its deadline.
  #[error("the operation timed out")]
  Timeout,

  /// An operation was attempted against a fiber or scheduler in the wrong state.
  #[error("invalid fiber state: {0}")]
  InvalidState(String),

  /// An operation was attempted against a disposed scheduler.
  #[error("the scheduler has been disposed")]
  Disposed,

  /// One or more fibers in a wait set terminated unsuccessfully.
  #[error("{} fiber(s) terminated unsuccessfully", .0.len())]
  Aggregate(Vec<Arc<FiberError>>),

  /// Any other error raised by a fiber body.
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl FiberError {
  /// Creates an [`FiberError::InvalidState`] error with the given message.
  pub fn invalid_state(message: impl Into<String>) -> Self {
    Self::InvalidState(message.into())
  }

  /// Is this error a cooperative cancellation?
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Self::Canceled { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cancellation_carries_its_token() {
    let token = CancellationToken::new();
    let error = token.cancellation();

    match error {
      FiberError::Canceled { token: carried } => assert_eq!(carried, token),
      _ => panic!("expected a cancellation"),
    }
  }

  #[test]
  fn test_aggregate_reports_member_count() {
    let error = FiberError::Aggregate(vec![Arc::new(FiberError::Timeout)]);

    assert_eq!(error.to_string(), "1 fiber(s) terminated unsuccessfully");
  }
}
