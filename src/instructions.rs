//! Instructions yielded by fibers to their scheduler.

use std::{
  any::Any,
  fmt::{Debug, Formatter},
  sync::Arc,
};

use crate::{AnyValue, Fiber, FiberValue, TimeSpan};

/// What a fiber asks of the scheduler on each step.
///
/// An instruction is the only way a fiber influences scheduling: a body
/// yields one, the scheduler interprets it, and the fiber is parked in
/// whatever queue the instruction implies until it is due to run again.
pub enum Instruction {
  /// Requeue on the ready queue; the fiber runs again no earlier than the
  /// next update.
  YieldToAny,

  /// Sleep until at least the given span has elapsed on the scheduler clock.
  YieldForDuration(TimeSpan),

  /// Park off all queues until the target fiber completes. Both fibers must
  /// be bound to the same scheduler.
  YieldUntilComplete(Fiber),

  /// Run the target fiber next, ahead of everything else. Both fibers must
  /// be bound to the same scheduler, and the target must not have completed.
  YieldToFiber(Fiber),

  /// The fiber is finished; a previously latched result, if any, applies.
  Stop,

  /// Latch the given result and finish as ran-to-completion.
  SetResult(FiberValue),

  /// An opaque payload the scheduler surfaces unchanged to the host adapter.
  Foreign(AnyValue),
}

impl Instruction {
  /// Shorthand for [`Instruction::SetResult`] over an arbitrary value.
  pub fn set_result(value: impl Any + Send + Sync) -> Self {
    Self::SetResult(Arc::new(value))
  }

  /// Shorthand for [`Instruction::Foreign`] over an arbitrary value.
  pub fn foreign(value: impl Any + Send) -> Self {
    Self::Foreign(Box::new(value))
  }
}

impl Debug for Instruction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::YieldToAny => write!(f, "YieldToAny"),
      Self::YieldForDuration(span) => write!(f, "YieldForDuration({})", span),
      Self::YieldUntilComplete(fiber) => write!(f, "YieldUntilComplete({:?})", fiber.id()),
      Self::YieldToFiber(fiber) => write!(f, "YieldToFiber({:?})", fiber.id()),
      Self::Stop => write!(f, "Stop"),
      Self::SetResult(_) => write!(f, "SetResult(..)"),
      Self::Foreign(_) => write!(f, "Foreign(..)"),
    }
  }
}
