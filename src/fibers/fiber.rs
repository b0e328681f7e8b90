use std::{
  any::Any,
  cell::RefCell,
  fmt::{Debug, Formatter},
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, OnceLock,
  },
  task::Waker,
};

use super::{FiberBody, FiberStatus, StatusCell, StepOutcome, StepSequence, StepValue};
use crate::{
  AnyValue, CancellationToken, Continuation, FastHashMap, FiberError, FiberResult, FiberScheduler,
  FiberValue, Instruction, SmallVec,
};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
  static CURRENT_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

/// The fiber currently being stepped on this thread, if any.
///
/// Bodies invoked by the scheduler observe themselves here for the duration of
/// their step, including when one fiber yields to another inline.
pub fn current_fiber() -> Option<Fiber> {
  CURRENT_FIBER.with(|slot| slot.borrow().clone())
}

/// A unique identifier for a [`Fiber`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
  fn next() -> Self {
    Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
  }
}

/// A cooperatively-scheduled unit of execution.
///
/// A fiber owns a body (see [`FiberBody`]) and is driven one observable
/// [`Instruction`] at a time by the scheduler it is bound to. Handles are
/// cheap to clone; all clones observe the same underlying fiber and compare
/// equal to each other.
///
/// A fiber transitions to one of the three terminal statuses at most once.
/// On that transition its completion subscribers are woken and its queued
/// continuations are drained exactly once, in the order they were enqueued.
#[derive(Clone)]
pub struct Fiber {
  inner: Arc<FiberInner>,
}

struct FiberInner {
  id: FiberId,
  status: StatusCell,
  token: CancellationToken,
  cancel_requested: AtomicBool,
  scheduled: AtomicBool,
  scheduler: OnceLock<FiberScheduler>,
  state: Mutex<FiberState>,
}

struct FiberState {
  body: Option<FiberBody>,
  nested: SmallVec<[Box<dyn StepSequence>; 2]>,
  result: Option<FiberValue>,
  error: Option<Arc<FiberError>>,
  antecedent: Option<Fiber>,
  continuations: Vec<Continuation>,
  callbacks: SmallVec<[Box<dyn FnOnce(&Fiber) + Send>; 2]>,
  wakers: SmallVec<[Waker; 2]>,
  properties: FastHashMap<String, AnyValue>,
}

/// The observable result of driving a fiber one step.
pub(crate) enum StepResult {
  /// The fiber yielded an instruction and is parked until it runs again.
  Yielded(Instruction),
  /// The fiber reached a terminal status.
  Completed,
}

/// How a fiber terminates.
pub(crate) enum Completion {
  Success,
  Canceled,
  Fault(Arc<FiberError>),
}

enum Interpreted {
  Retry,
  Yield(Instruction),
  Completed,
}

impl Fiber {
  /// Creates a fiber over the given body in the given initial status.
  pub(crate) fn with_body(body: FiberBody, token: CancellationToken, status: FiberStatus) -> Self {
    debug_assert!(!status.is_started());

    Self {
      inner: Arc::new(FiberInner {
        id: FiberId::next(),
        status: StatusCell::new(status),
        token,
        cancel_requested: AtomicBool::new(false),
        scheduled: AtomicBool::new(false),
        scheduler: OnceLock::new(),
        state: Mutex::new(FiberState {
          body: Some(body),
          nested: SmallVec::new(),
          result: None,
          error: None,
          antecedent: None,
          continuations: Vec::new(),
          callbacks: SmallVec::new(),
          wakers: SmallVec::new(),
          properties: FastHashMap::default(),
        }),
      }),
    }
  }

  /// The unique identifier of this fiber.
  #[inline]
  pub fn id(&self) -> FiberId {
    self.inner.id
  }

  /// The current lifecycle status of this fiber.
  #[inline]
  pub fn status(&self) -> FiberStatus {
    self.inner.status.load()
  }

  /// The cancellation token captured when this fiber was created.
  #[inline]
  pub fn token(&self) -> &CancellationToken {
    &self.inner.token
  }

  /// Has this fiber reached a terminal status?
  #[inline]
  pub fn is_completed(&self) -> bool {
    self.status().is_completed()
  }

  /// The scheduler this fiber is bound to, once it has been activated.
  pub fn scheduler(&self) -> Option<FiberScheduler> {
    self.inner.scheduler.get().cloned()
  }

  /// The fiber this one continues from, if it was created by `continue_with`.
  pub fn antecedent(&self) -> Option<Fiber> {
    self.inner.state.lock().unwrap().antecedent.clone()
  }

  /// The result value, once the fiber has run to completion.
  pub fn result(&self) -> Option<FiberValue> {
    self.inner.state.lock().unwrap().result.clone()
  }

  /// The captured error, once the fiber has faulted.
  pub fn error(&self) -> Option<Arc<FiberError>> {
    self.inner.state.lock().unwrap().error.clone()
  }

  /// Starts this fiber on the given scheduler.
  ///
  /// Fails with an invalid-state error if the fiber has already been started.
  pub fn start(&self, scheduler: &FiberScheduler) -> FiberResult<()> {
    let status = self.status();

    if status.is_started() {
      return Err(FiberError::invalid_state(format!(
        "fiber {:?} cannot be started from status {:?}",
        self.inner.id, status
      )));
    }

    scheduler.queue(self)
  }

  /// Requests cancellation of this fiber. Idempotent; a no-op once the fiber
  /// has terminated.
  ///
  /// A fiber that has not yet run transitions straight to canceled without
  /// executing any body code. A running fiber observes the request at its
  /// next step.
  pub fn cancel(&self) {
    loop {
      let status = self.status();

      match status {
        status if status.is_completed() => return,
        FiberStatus::Running => {
          self.inner.cancel_requested.store(true, Ordering::Release);

          if let Some(scheduler) = self.scheduler() {
            scheduler.notify();
          }

          return;
        }
        status => {
          if self.complete_from(Completion::Canceled, Some(status)) {
            return;
          }
          // raced with a start or another cancel; retry against the new status
        }
      }
    }
  }

  /// Builds the instruction that parks the calling fiber until this one
  /// completes.
  pub fn wait_until_complete(&self) -> Instruction {
    Instruction::YieldUntilComplete(self.clone())
  }

  /// Associates an opaque property value with this fiber.
  ///
  /// Properties are intended for host adapters (e.g. to stash engine-native
  /// handles) and should only be touched from the scheduler thread.
  pub fn set_property(&self, key: impl Into<String>, value: AnyValue) {
    self.inner.state.lock().unwrap().properties.insert(key.into(), value);
  }

  /// Removes and returns the property stored under the given key.
  pub fn take_property(&self, key: &str) -> Option<AnyValue> {
    self.inner.state.lock().unwrap().properties.remove(key)
  }

  /// Is a property stored under the given key?
  pub fn has_property(&self, key: &str) -> bool {
    self.inner.state.lock().unwrap().properties.contains_key(key)
  }

  pub(crate) fn set_antecedent(&self, antecedent: Fiber) {
    self.inner.state.lock().unwrap().antecedent = Some(antecedent);
  }

  /// Binds this fiber to a scheduler; the binding is set exactly once.
  pub(crate) fn bind(&self, scheduler: &FiberScheduler) -> FiberResult<()> {
    let bound = self.inner.scheduler.get_or_init(|| scheduler.clone());

    if bound == scheduler {
      Ok(())
    } else {
      Err(FiberError::invalid_state(format!(
        "fiber {:?} is already bound to another scheduler",
        self.inner.id
      )))
    }
  }

  pub(crate) fn transition(&self, from: FiberStatus, to: FiberStatus) -> bool {
    self.inner.status.transition(from, to)
  }

  pub(crate) fn cancel_requested(&self) -> bool {
    self.inner.cancel_requested.load(Ordering::Acquire) || self.inner.token.is_canceled()
  }

  /// Does this fiber currently occupy a ready or sleep queue slot?
  pub(crate) fn is_scheduled(&self) -> bool {
    self.inner.scheduled.load(Ordering::Acquire)
  }

  /// Claims a queue slot for this fiber; false if it already occupies one.
  pub(crate) fn mark_scheduled(&self) -> bool {
    !self.inner.scheduled.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn clear_scheduled(&self) {
    self.inner.scheduled.store(false, Ordering::Release);
  }

  /// Registers a completion callback, or runs it immediately if the fiber has
  /// already terminated.
  pub(crate) fn on_completed(&self, callback: Box<dyn FnOnce(&Fiber) + Send>) {
    {
      let mut state = self.inner.state.lock().unwrap();

      if !self.is_completed() {
        state.callbacks.push(callback);
        return;
      }
    }

    callback(self);
  }

  /// Registers a task waker; false if the fiber has already terminated.
  pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
    let mut state = self.inner.state.lock().unwrap();

    if self.is_completed() {
      return false;
    }

    state.wakers.push(waker.clone());
    true
  }

  /// Snapshots the terminal outcome of this fiber, if it has one yet.
  pub(crate) fn outcome(&self) -> Option<Result<Option<FiberValue>, Arc<FiberError>>> {
    match self.status() {
      FiberStatus::RanToCompletion => Some(Ok(self.result())),
      FiberStatus::Canceled => Some(Err(Arc::new(self.inner.token.cancellation()))),
      FiberStatus::Faulted => {
        let error = self
          .error()
          .unwrap_or_else(|| Arc::new(FiberError::invalid_state("fault with no captured error")));

        Some(Err(error))
      }
      _ => None,
    }
  }

  /// Registers a continuation record. When the fiber has already completed
  /// the record is handed back with the terminal status so the caller can
  /// fire it immediately.
  pub(crate) fn enqueue_continuation(
    &self,
    continuation: Continuation,
  ) -> Option<(Continuation, FiberStatus)> {
    let mut state = self.inner.state.lock().unwrap();
    let status = self.status();

    if status.is_completed() {
      return Some((continuation, status));
    }

    state.continuations.push(continuation);
    None
  }

  /// Terminates this fiber from any non-terminal status.
  pub(crate) fn complete(&self, completion: Completion) -> bool {
    self.complete_from(completion, None)
  }

  fn complete_from(&self, completion: Completion, from: Option<FiberStatus>) -> bool {
    let terminal = match completion {
      Completion::Success => FiberStatus::RanToCompletion,
      Completion::Canceled => FiberStatus::Canceled,
      Completion::Fault(_) => FiberStatus::Faulted,
    };

    let transitioned = match from {
      Some(status) => self.inner.status.transition(status, terminal),
      None => self.inner.status.complete(terminal).is_some(),
    };

    if !transitioned {
      return false;
    }

    let (callbacks, wakers, continuations) = {
      let mut state = self.inner.state.lock().unwrap();

      if let Completion::Fault(error) = &completion {
        state.error = Some(error.clone());
      }

      // release body resources eagerly; nothing will step this fiber again
      state.body = None;
      state.nested.clear();

      (
        std::mem::take(&mut state.callbacks),
        std::mem::take(&mut state.wakers),
        std::mem::take(&mut state.continuations),
      )
    };

    for callback in callbacks {
      callback(self);
    }

    for waker in wakers {
      waker.wake();
    }

    for continuation in continuations {
      continuation.fire(terminal);
    }

    if let Some(scheduler) = self.scheduler() {
      scheduler.notify();
    }

    true
  }

  /// Terminates this fiber with a raised error, classifying a matching-token
  /// cancellation as canceled and everything else as a fault.
  pub(crate) fn fail(&self, error: FiberError) {
    let completion = match error {
      FiberError::Canceled { ref token } if *token == self.inner.token => Completion::Canceled,
      other => Completion::Fault(Arc::new(other)),
    };

    self.complete(completion);
  }

  /// Advances this fiber by exactly one observable instruction.
  ///
  /// Must be called on the owner thread of the scheduler the fiber is bound
  /// to, with the fiber in the running status.
  pub(crate) fn step(&self, scheduler: &FiberScheduler) -> StepResult {
    if self.status() != FiberStatus::Running {
      self.fail(FiberError::invalid_state(format!(
        "fiber {:?} cannot be stepped from status {:?}",
        self.inner.id,
        self.status()
      )));

      return StepResult::Completed;
    }

    let _scope = CurrentFiberScope::enter(self.clone());

    // a cancel requested while parked (or signaled on the token) wins against
    // whatever the body would have yielded next
    if self.cancel_requested() {
      self.complete(Completion::Canceled);
      return StepResult::Completed;
    }

    loop {
      // pull the innermost body piece out of the state so body code is free
      // to re-enter this fiber (queue continuations, read properties, ...)
      let mut source = {
        let mut state = self.inner.state.lock().unwrap();

        match state.nested.pop() {
          Some(sequence) => Source::Nested(sequence),
          None => Source::Body(state.body.take()),
        }
      };

      let nested = matches!(source, Source::Nested(_));

      let outcome = {
        let stepped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match &mut source {
          Source::Nested(sequence) => sequence.step(),
          Source::Body(slot) => FiberBody::advance(slot),
        }));

        match stepped {
          Ok(outcome) => outcome,
          Err(payload) => Err(FiberError::Other(anyhow::anyhow!(
            "fiber body panicked: {}",
            panic_message(payload.as_ref())
          ))),
        }
      };

      match outcome {
        Err(error) => {
          self.fail(error);
          return StepResult::Completed;
        }
        Ok(StepOutcome::Done) => {
          if nested {
            // finished one nesting level; the outer sequence resumes within
            // the same step
            continue;
          }

          self.complete(Completion::Success);
          return StepResult::Completed;
        }
        Ok(StepOutcome::Yielded(StepValue::Instruction(Instruction::Stop))) if nested => {
          // a bare stop inside a nested sequence only ends that nesting level
          continue;
        }
        Ok(StepOutcome::Yielded(value)) => {
          self.restore(source);

          match self.interpret(scheduler, value) {
            Interpreted::Retry => continue,
            Interpreted::Yield(instruction) => return StepResult::Yielded(instruction),
            Interpreted::Completed => return StepResult::Completed,
          }
        }
      }
    }
  }

  fn restore(&self, source: Source) {
    let mut state = self.inner.state.lock().unwrap();

    match source {
      Source::Nested(sequence) => state.nested.push(sequence),
      Source::Body(slot) => state.body = slot,
    }
  }

  fn interpret(&self, scheduler: &FiberScheduler, value: StepValue) -> Interpreted {
    match value {
      StepValue::Continue => Interpreted::Yield(Instruction::YieldToAny),
      StepValue::Foreign(payload) => Interpreted::Yield(Instruction::Foreign(payload)),
      StepValue::Sequence(sequence) => {
        self.inner.state.lock().unwrap().nested.push(sequence);
        Interpreted::Retry
      }
      StepValue::Fiber(target) => self.interpret_wait(scheduler, target),
      StepValue::Instruction(instruction) => match instruction {
        Instruction::Stop => {
          self.complete(Completion::Success);
          Interpreted::Completed
        }
        Instruction::SetResult(value) => {
          self.inner.state.lock().unwrap().result = Some(value);
          self.complete(Completion::Success);
          Interpreted::Completed
        }
        Instruction::YieldUntilComplete(target) => self.interpret_wait(scheduler, target),
        Instruction::YieldToFiber(target) => {
          if target == *self {
            self.fail(FiberError::invalid_state("a fiber cannot yield to itself"));
            return Interpreted::Completed;
          }

          if target.is_completed() {
            self.fail(FiberError::invalid_state("cannot yield to a completed fiber"));
            return Interpreted::Completed;
          }

          match target.scheduler() {
            Some(ref bound) if bound == scheduler => {
              Interpreted::Yield(Instruction::YieldToFiber(target))
            }
            Some(_) => {
              self.fail(FiberError::invalid_state(
                "cannot yield to a fiber bound to another scheduler",
              ));
              Interpreted::Completed
            }
            None => {
              self.fail(FiberError::invalid_state(
                "cannot yield to a fiber that has not been started",
              ));
              Interpreted::Completed
            }
          }
        }
        instruction => Interpreted::Yield(instruction),
      },
    }
  }

  fn interpret_wait(&self, scheduler: &FiberScheduler, target: Fiber) -> Interpreted {
    if target == *self {
      self.fail(FiberError::invalid_state("a fiber cannot wait on itself"));
      return Interpreted::Completed;
    }

    if let Some(ref bound) = target.scheduler() {
      if bound != scheduler {
        self.fail(FiberError::invalid_state(
          "cannot wait on a fiber bound to another scheduler",
        ));
        return Interpreted::Completed;
      }
    }

    Interpreted::Yield(Instruction::YieldUntilComplete(target))
  }
}

enum Source {
  Nested(Box<dyn StepSequence>),
  Body(Option<FiberBody>),
}

impl PartialEq for Fiber {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl Eq for Fiber {}

impl std::hash::Hash for Fiber {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.inner.id.hash(state);
  }
}

impl Debug for Fiber {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Fiber")
      .field("id", &self.inner.id)
      .field("status", &self.status())
      .finish()
  }
}

struct CurrentFiberScope {
  prior: Option<Fiber>,
}

impl CurrentFiberScope {
  fn enter(fiber: Fiber) -> Self {
    Self {
      prior: CURRENT_FIBER.with(|slot| slot.borrow_mut().replace(fiber)),
    }
  }
}

impl Drop for CurrentFiberScope {
  fn drop(&mut self) {
    let prior = self.prior.take();

    CURRENT_FIBER.with(|slot| *slot.borrow_mut() = prior);
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn idle_fiber() -> Fiber {
    Fiber::with_body(
      FiberBody::Action(Box::new(|| Ok(()))),
      CancellationToken::none(),
      FiberStatus::Created,
    )
  }

  #[test]
  fn test_cancel_before_start_runs_no_body_code() {
    let ran = Arc::new(AtomicBool::new(false));
    let observed = ran.clone();

    let fiber = Fiber::with_body(
      FiberBody::Action(Box::new(move || {
        observed.store(true, Ordering::SeqCst);
        Ok(())
      })),
      CancellationToken::none(),
      FiberStatus::Created,
    );

    fiber.cancel();

    assert_eq!(fiber.status(), FiberStatus::Canceled);
    assert!(!ran.load(Ordering::SeqCst));
  }

  #[test]
  fn test_cancel_is_idempotent() {
    let fiber = idle_fiber();

    fiber.cancel();
    fiber.cancel();

    assert_eq!(fiber.status(), FiberStatus::Canceled);
  }

  #[test]
  fn test_handles_compare_by_identity() {
    let a = idle_fiber();
    let b = idle_fiber();

    assert_eq!(a, a.clone());
    assert_ne!(a, b);
    assert_ne!(a.id(), b.id());
  }

  #[test]
  fn test_properties_round_trip() {
    let fiber = idle_fiber();

    fiber.set_property("host.handle", Box::new(7usize));

    assert!(fiber.has_property("host.handle"));

    let value = fiber.take_property("host.handle").expect("property should exist");
    assert_eq!(*value.downcast::<usize>().expect("expected a usize"), 7);
    assert!(!fiber.has_property("host.handle"));
  }

  #[test]
  fn test_completion_callback_runs_immediately_when_already_completed() {
    let fiber = idle_fiber();
    fiber.cancel();

    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();

    fiber.on_completed(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

    assert!(observed.load(Ordering::SeqCst));
  }

  #[test]
  fn test_matching_token_failure_cancels_instead_of_faulting() {
    let token = CancellationToken::new();
    let fiber = Fiber::with_body(
      FiberBody::Action(Box::new(|| Ok(()))),
      token.clone(),
      FiberStatus::Created,
    );

    fiber.fail(token.cancellation());

    assert_eq!(fiber.status(), FiberStatus::Canceled);
    assert!(fiber.error().is_none());
  }

  #[test]
  fn test_foreign_token_failure_faults() {
    let fiber = Fiber::with_body(
      FiberBody::Action(Box::new(|| Ok(()))),
      CancellationToken::new(),
      FiberStatus::Created,
    );

    let foreign = CancellationToken::new();
    fiber.fail(foreign.cancellation());

    assert_eq!(fiber.status(), FiberStatus::Faulted);
    assert!(fiber.error().is_some());
  }
}
