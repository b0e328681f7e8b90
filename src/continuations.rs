//! Post-completion continuations for fibers.
//!
//! A continuation is an ordinary fiber created in the waiting-for-activation
//! status and linked to an antecedent. When the antecedent reaches a terminal
//! status the continuation is either activated onto its scheduler or canceled
//! without ever running, depending on its [`ContinuationOptions`].

use crate::{
  current_scheduler, CancellationToken, Fiber, FiberBody, FiberError, FiberResult, FiberScheduler,
  FiberStatus,
};

bitflags::bitflags! {
  /// Controls when a continuation activates, keyed on the terminal status of
  /// its antecedent.
  ///
  /// The `ONLY_ON_*` values are composites of the two complementary `NOT_ON_*`
  /// flags, so a combination that suppresses every terminal status (for
  /// example `ONLY_ON_FAULTED | NOT_ON_FAULTED`) is contradictory and is
  /// rejected when the continuation is created.
  #[derive(Copy, Clone, Debug, Eq, PartialEq)]
  pub struct ContinuationOptions: u8 {
    /// Always activate.
    const NONE = 0;
    /// Suppress activation when the antecedent ran to completion.
    const NOT_ON_RAN_TO_COMPLETION = 1 << 0;
    /// Suppress activation when the antecedent faulted.
    const NOT_ON_FAULTED = 1 << 1;
    /// Suppress activation when the antecedent was canceled.
    const NOT_ON_CANCELED = 1 << 2;
    /// Activate only when the antecedent ran to completion.
    const ONLY_ON_RAN_TO_COMPLETION = Self::NOT_ON_FAULTED.bits() | Self::NOT_ON_CANCELED.bits();
    /// Activate only when the antecedent faulted.
    const ONLY_ON_FAULTED = Self::NOT_ON_RAN_TO_COMPLETION.bits() | Self::NOT_ON_CANCELED.bits();
    /// Activate only when the antecedent was canceled.
    const ONLY_ON_CANCELED = Self::NOT_ON_RAN_TO_COMPLETION.bits() | Self::NOT_ON_FAULTED.bits();
  }
}

impl ContinuationOptions {
  /// Rejects option sets that can never activate.
  pub(crate) fn validate(self) -> FiberResult<()> {
    if self.contains(
      Self::NOT_ON_RAN_TO_COMPLETION | Self::NOT_ON_FAULTED | Self::NOT_ON_CANCELED,
    ) {
      Err(FiberError::invalid_state(
        "continuation options suppress every terminal status",
      ))
    } else {
      Ok(())
    }
  }

  /// Should a continuation with these options activate for the given
  /// antecedent terminal status?
  pub(crate) fn should_activate(self, status: FiberStatus) -> bool {
    let suppressed = match status {
      FiberStatus::RanToCompletion => Self::NOT_ON_RAN_TO_COMPLETION,
      FiberStatus::Faulted => Self::NOT_ON_FAULTED,
      FiberStatus::Canceled => Self::NOT_ON_CANCELED,
      _ => return false,
    };

    !self.contains(suppressed)
  }
}

impl Default for ContinuationOptions {
  fn default() -> Self {
    Self::NONE
  }
}

/// A continuation record queued on an antecedent fiber.
pub(crate) struct Continuation {
  pub fiber: Fiber,
  pub options: ContinuationOptions,
  pub scheduler: Option<FiberScheduler>,
}

impl Continuation {
  /// Activates or cancels the continuation for the antecedent's terminal
  /// status. Runs exactly once, on the antecedent's terminal transition.
  pub(crate) fn fire(self, status: FiberStatus) {
    use crate::Completion;

    if !self.options.should_activate(status) {
      self.fiber.complete(Completion::Canceled);
      return;
    }

    let scheduler = self
      .scheduler
      .or_else(|| self.fiber.antecedent().and_then(|antecedent| antecedent.scheduler()))
      .or_else(current_scheduler);

    let Some(scheduler) = scheduler else {
      log::warn!(
        "continuation {:?} has no scheduler to activate on; canceling it",
        self.fiber.id()
      );
      self.fiber.complete(Completion::Canceled);
      return;
    };

    if let Err(error) = scheduler.queue(&self.fiber) {
      log::warn!(
        "continuation {:?} could not be activated: {}; canceling it",
        self.fiber.id(),
        error
      );
      self.fiber.complete(Completion::Canceled);
    }
  }
}

impl Fiber {
  /// Registers a continuation that always activates, on this fiber's own
  /// scheduler, with the neutral cancellation token.
  ///
  /// The body receives the antecedent (this fiber) so it can observe the
  /// terminal status, result or error.
  pub fn continue_with(
    &self,
    body: impl FnOnce(Fiber) -> FiberResult<()> + Send + 'static,
  ) -> FiberResult<Fiber> {
    self.continue_with_options(body, ContinuationOptions::NONE, CancellationToken::none(), None)
  }

  /// Registers a continuation with explicit options, token and scheduler.
  ///
  /// When `scheduler` is `None`, the continuation activates on this fiber's
  /// scheduler as bound at the moment of the terminal transition. If this
  /// fiber has already completed, the continuation is activated (or canceled)
  /// immediately.
  pub fn continue_with_options(
    &self,
    body: impl FnOnce(Fiber) -> FiberResult<()> + Send + 'static,
    options: ContinuationOptions,
    token: CancellationToken,
    scheduler: Option<&FiberScheduler>,
  ) -> FiberResult<Fiber> {
    options.validate()?;

    let antecedent = self.clone();
    let continuation = Fiber::with_body(
      FiberBody::Action(Box::new(move || body(antecedent))),
      token,
      FiberStatus::WaitingForActivation,
    );

    continuation.set_antecedent(self.clone());

    let record = Continuation {
      fiber: continuation.clone(),
      options,
      scheduler: scheduler.cloned(),
    };

    // either queued for the terminal transition to drain, or fired right here
    // when the antecedent has already completed
    if let Some((record, status)) = self.enqueue_continuation(record) {
      record.fire(status);
    }

    Ok(continuation)
  }
}
