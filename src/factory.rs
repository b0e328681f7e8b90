//! The canonical constructor surface for fibers.

use crate::{
  composition, AnyValue, CancellationToken, ContinuationOptions, Fiber, FiberBody, FiberResult,
  FiberScheduler, FiberStatus, Instruction, StepOutcome, StepSequence, TimeSpan,
};

/// Creates fibers with captured defaults: a scheduler, a cancellation token
/// and continuation options.
///
/// The `from_*` constructors build unstarted fibers; the `start_new_*`
/// variants also queue them onto the factory's scheduler. Both exist for each
/// body shape: a lazy step sequence, a one-shot thunk producing an
/// instruction, and a one-shot action (with or without an opaque state
/// value).
#[derive(Clone)]
pub struct FiberFactory {
  scheduler: FiberScheduler,
  token: CancellationToken,
  continuation_options: ContinuationOptions,
}

impl FiberFactory {
  /// Creates a factory over the given scheduler, with the neutral token and
  /// default continuation options.
  pub fn new(scheduler: &FiberScheduler) -> Self {
    Self {
      scheduler: scheduler.clone(),
      token: CancellationToken::none(),
      continuation_options: ContinuationOptions::NONE,
    }
  }

  /// Derives a factory that captures the given cancellation token.
  pub fn with_token(mut self, token: CancellationToken) -> Self {
    self.token = token;
    self
  }

  /// Derives a factory that applies the given default continuation options.
  pub fn with_continuation_options(mut self, options: ContinuationOptions) -> Self {
    self.continuation_options = options;
    self
  }

  /// The scheduler fibers from this factory start on.
  #[inline]
  pub fn scheduler(&self) -> &FiberScheduler {
    &self.scheduler
  }

  /// The cancellation token captured by fibers from this factory.
  #[inline]
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Creates an unstarted fiber over a step sequence.
  pub fn from_sequence(&self, sequence: Box<dyn StepSequence>) -> Fiber {
    self.build(FiberBody::Sequence(sequence))
  }

  /// Creates an unstarted fiber over a closure-based step sequence.
  pub fn from_fn(&self, body: impl FnMut() -> FiberResult<StepOutcome> + Send + 'static) -> Fiber {
    self.from_sequence(Box::new(body))
  }

  /// Creates an unstarted fiber over a one-shot thunk producing an
  /// instruction.
  pub fn from_thunk(
    &self,
    thunk: impl FnOnce() -> FiberResult<Instruction> + Send + 'static,
  ) -> Fiber {
    self.build(FiberBody::Thunk(Box::new(thunk)))
  }

  /// Creates an unstarted fiber over a one-shot action.
  pub fn from_action(&self, action: impl FnOnce() -> FiberResult<()> + Send + 'static) -> Fiber {
    self.build(FiberBody::Action(Box::new(action)))
  }

  /// Creates an unstarted fiber over a one-shot action taking an opaque
  /// state value.
  pub fn from_action_with(
    &self,
    action: impl FnOnce(AnyValue) -> FiberResult<()> + Send + 'static,
    state: AnyValue,
  ) -> Fiber {
    self.build(FiberBody::ActionWith {
      action: Box::new(action),
      state,
    })
  }

  /// Creates and starts a fiber over a step sequence.
  pub fn start_new(&self, sequence: Box<dyn StepSequence>) -> FiberResult<Fiber> {
    self.start(self.from_sequence(sequence))
  }

  /// Creates and starts a fiber over a closure-based step sequence.
  pub fn start_new_fn(
    &self,
    body: impl FnMut() -> FiberResult<StepOutcome> + Send + 'static,
  ) -> FiberResult<Fiber> {
    self.start(self.from_fn(body))
  }

  /// Creates and starts a fiber over a one-shot thunk.
  pub fn start_new_thunk(
    &self,
    thunk: impl FnOnce() -> FiberResult<Instruction> + Send + 'static,
  ) -> FiberResult<Fiber> {
    self.start(self.from_thunk(thunk))
  }

  /// Creates and starts a fiber over a one-shot action.
  pub fn start_new_action(
    &self,
    action: impl FnOnce() -> FiberResult<()> + Send + 'static,
  ) -> FiberResult<Fiber> {
    self.start(self.from_action(action))
  }

  /// Creates and starts a fiber over a one-shot action taking an opaque
  /// state value.
  pub fn start_new_action_with(
    &self,
    action: impl FnOnce(AnyValue) -> FiberResult<()> + Send + 'static,
    state: AnyValue,
  ) -> FiberResult<Fiber> {
    self.start(self.from_action_with(action, state))
  }

  /// Registers a continuation on the given fiber using this factory's
  /// defaults.
  pub fn continue_with(
    &self,
    antecedent: &Fiber,
    body: impl FnOnce(Fiber) -> FiberResult<()> + Send + 'static,
  ) -> FiberResult<Fiber> {
    antecedent.continue_with_options(
      body,
      self.continuation_options,
      self.token.clone(),
      Some(&self.scheduler),
    )
  }

  /// Starts a delay fiber using this factory's defaults.
  pub fn delay(&self, duration: TimeSpan) -> FiberResult<Fiber> {
    composition::delay(&self.scheduler, duration, &self.token)
  }

  /// Starts a when-all supervisor using this factory's defaults.
  pub fn when_all(
    &self,
    fibers: impl IntoIterator<Item = Fiber>,
    timeout: Option<TimeSpan>,
  ) -> FiberResult<Fiber> {
    composition::when_all(&self.scheduler, fibers, timeout, &self.token)
  }

  /// Starts a when-any supervisor using this factory's defaults.
  pub fn when_any(
    &self,
    fibers: impl IntoIterator<Item = Fiber>,
    timeout: Option<TimeSpan>,
  ) -> FiberResult<Fiber> {
    composition::when_any(&self.scheduler, fibers, timeout, &self.token)
  }

  fn build(&self, body: FiberBody) -> Fiber {
    Fiber::with_body(body, self.token.clone(), FiberStatus::Created)
  }

  fn start(&self, fiber: Fiber) -> FiberResult<Fiber> {
    self.scheduler.queue(&fiber)?;

    Ok(fiber)
  }
}
