use std::sync::atomic::{AtomicU8, Ordering};

/// The lifecycle status of a [`Fiber`].
///
/// The last three statuses are terminal; a fiber enters a terminal status at
/// most once, and all multi-writer transitions go through an atomic
/// compare-and-set so that concurrent starts and cancels race safely.
///
/// [`Fiber`]: crate::Fiber
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FiberStatus {
  /// Built but not yet started.
  Created = 0,
  /// Waiting for an antecedent to activate it.
  WaitingForActivation = 1,
  /// Activated and waiting in a scheduler queue.
  WaitingToRun = 2,
  /// Picked up by its scheduler; remains running while parked between steps.
  Running = 3,
  /// Completed successfully.
  RanToCompletion = 4,
  /// Completed by cancellation.
  Canceled = 5,
  /// Completed with a captured error.
  Faulted = 6,
}

impl FiberStatus {
  /// Is this one of the three terminal statuses?
  #[inline]
  pub fn is_completed(self) -> bool {
    matches!(self, Self::RanToCompletion | Self::Canceled | Self::Faulted)
  }

  /// Has the fiber been started at all?
  #[inline]
  pub fn is_started(self) -> bool {
    !matches!(self, Self::Created | Self::WaitingForActivation)
  }

  fn from_u8(value: u8) -> Self {
    match value {
      0 => Self::Created,
      1 => Self::WaitingForActivation,
      2 => Self::WaitingToRun,
      3 => Self::Running,
      4 => Self::RanToCompletion,
      5 => Self::Canceled,
      _ => Self::Faulted,
    }
  }
}

/// An atomic cell holding a [`FiberStatus`] word.
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
  pub fn new(status: FiberStatus) -> Self {
    Self(AtomicU8::new(status as u8))
  }

  #[inline]
  pub fn load(&self) -> FiberStatus {
    FiberStatus::from_u8(self.0.load(Ordering::Acquire))
  }

  /// Attempts a single `from -> to` transition.
  pub fn transition(&self, from: FiberStatus, to: FiberStatus) -> bool {
    self
      .0
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Moves to the given terminal status from whatever non-terminal status the
  /// cell currently holds, returning the prior status on success.
  pub fn complete(&self, terminal: FiberStatus) -> Option<FiberStatus> {
    debug_assert!(terminal.is_completed());

    let mut current = self.load();

    loop {
      if current.is_completed() {
        return None;
      }

      match self.0.compare_exchange(
        current as u8,
        terminal as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(current),
        Err(actual) => current = FiberStatus::from_u8(actual),
      }
    }
  }
}
