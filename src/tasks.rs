//! Bridges fibers into the standard future surface.
//!
//! A [`YieldableTask`] wraps a fiber body so external code can `await` (or
//! [`block`] on) its completion: the task's output mirrors the fiber's
//! terminal status. Plain, non-yielding callbacks do not need the fiber state
//! machine at all: submit those through [`SchedulerContext::post`] or
//! [`SchedulerContext::send`], which run them inline on the owner thread.
//!
//! [`block`]: BlockableFuture::block
//! [`SchedulerContext::post`]: crate::SchedulerContext::post
//! [`SchedulerContext::send`]: crate::SchedulerContext::send

use std::{
  future::Future,
  pin::Pin,
  sync::{Arc, Condvar, Mutex},
  task::{Context, Poll, Wake, Waker},
};

use crate::{
  CancellationToken, Fiber, FiberBody, FiberError, FiberResult, FiberScheduler, FiberStatus,
  FiberValue, Instruction, StepOutcome, StepSequence,
};

/// The output of a completed [`YieldableTask`]: the fiber's result value on
/// success, or its terminal error.
pub type TaskOutcome = Result<Option<FiberValue>, Arc<FiberError>>;

/// A task whose body runs as a fiber on a [`FiberScheduler`].
///
/// The task completes when the fiber reaches a terminal status: a fiber that
/// ran to completion yields its (possibly absent) result value, a canceled
/// fiber yields its token's cancellation, and a faulted fiber yields the
/// captured error. Cancellation requests are forwarded to the fiber.
///
/// Because step sequences must run on the owner thread, a task is bound to
/// exactly one scheduler at [`YieldableTask::start`]; starting it a second
/// time, or on a scheduler other than the one its fiber is bound to, is an
/// invalid-state error.
pub struct YieldableTask {
  fiber: Fiber,
}

impl YieldableTask {
  /// Creates a task over a step sequence.
  pub fn from_sequence(sequence: Box<dyn StepSequence>, token: CancellationToken) -> Self {
    Self::with_body(FiberBody::Sequence(sequence), token)
  }

  /// Creates a task over a closure-based step sequence.
  pub fn from_fn(
    body: impl FnMut() -> FiberResult<StepOutcome> + Send + 'static,
    token: CancellationToken,
  ) -> Self {
    Self::from_sequence(Box::new(body), token)
  }

  /// Creates a task over a one-shot thunk producing an instruction.
  pub fn from_thunk(
    thunk: impl FnOnce() -> FiberResult<Instruction> + Send + 'static,
    token: CancellationToken,
  ) -> Self {
    Self::with_body(FiberBody::Thunk(Box::new(thunk)), token)
  }

  /// Creates a task that yields a single, already-built instruction.
  pub fn from_instruction(instruction: Instruction, token: CancellationToken) -> Self {
    Self::from_thunk(move || Ok(instruction), token)
  }

  fn with_body(body: FiberBody, token: CancellationToken) -> Self {
    Self {
      fiber: Fiber::with_body(body, token, FiberStatus::Created),
    }
  }

  /// The fiber driving this task.
  #[inline]
  pub fn fiber(&self) -> &Fiber {
    &self.fiber
  }

  /// Starts the task's fiber on the given scheduler.
  pub fn start(&self, scheduler: &FiberScheduler) -> FiberResult<()> {
    self.fiber.start(scheduler)
  }

  /// Forwards a cancellation request to the task's fiber.
  pub fn cancel(&self) {
    self.fiber.cancel();
  }

  /// Snapshots the task outcome, if the fiber has terminated yet.
  pub fn outcome(&self) -> Option<TaskOutcome> {
    self.fiber.outcome()
  }
}

impl Future for YieldableTask {
  type Output = TaskOutcome;

  fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
    if let Some(outcome) = self.fiber.outcome() {
      return Poll::Ready(outcome);
    }

    if self.fiber.register_waker(context.waker()) {
      Poll::Pending
    } else {
      // completed between the snapshot and the registration
      Poll::Ready(self.fiber.outcome().expect("fiber should have completed"))
    }
  }
}

/// Blocks the current thread until the given future completes.
///
/// This is a minimal condvar-parking executor intended for driving a
/// [`YieldableTask`] (or any other future) from a plain thread while the
/// scheduler runs elsewhere. Blocking the scheduler's own owner thread on a
/// task scheduled there would deadlock.
pub fn block_on<F: Future>(future: F) -> F::Output {
  let signal = Arc::new(Signal::new());
  let waker = Waker::from(signal.clone());
  let mut context = Context::from_waker(&waker);

  let mut future = Box::pin(future);

  loop {
    match future.as_mut().poll(&mut context) {
      Poll::Ready(value) => return value,
      Poll::Pending => signal.wait(),
    }
  }
}

/// Allows a [`Future`] to be blocked on.
pub trait BlockableFuture: Future {
  /// Blocks the current thread until the future completes.
  fn block(self) -> Self::Output;
}

impl<F: Future> BlockableFuture for F {
  #[inline]
  fn block(self) -> Self::Output {
    block_on(self)
  }
}

/// A one-shot wake-up event shared between the blocked thread and wakers.
struct Signal {
  notified: Mutex<bool>,
  condvar: Condvar,
}

impl Signal {
  fn new() -> Self {
    Self {
      notified: Mutex::new(false),
      condvar: Condvar::new(),
    }
  }

  fn wait(&self) {
    let mut notified = self.notified.lock().unwrap();

    while !*notified {
      notified = self.condvar.wait(notified).unwrap();
    }

    *notified = false;
  }

  fn notify(&self) {
    let mut notified = self.notified.lock().unwrap();

    *notified = true;
    self.condvar.notify_one();
  }
}

impl Wake for Signal {
  fn wake(self: Arc<Self>) {
    self.notify();
  }
}

#[cfg(test)]
mod tests {
  use std::{thread, time::Duration};

  use super::*;
  use crate::{SchedulerOptions, StepValue};

  #[test]
  fn test_block_on_ready_future() {
    let value = block_on(std::future::ready(42));

    assert_eq!(value, 42);
  }

  #[test]
  fn test_task_mirrors_successful_completion() {
    let scheduler = FiberScheduler::with_options(SchedulerOptions {
      allow_inlining: false,
      ..Default::default()
    });

    let task = YieldableTask::from_fn(
      || StepOutcome::yields(Instruction::set_result(42u32)),
      CancellationToken::none(),
    );

    task.start(&scheduler).expect("starting should succeed");
    scheduler.update(0.).expect("update should succeed");

    let outcome = task.outcome().expect("task should have completed");
    let result = outcome.expect("task should have succeeded");
    let result = result.expect("result should be set");

    assert_eq!(result.downcast_ref::<u32>(), Some(&42));
  }

  #[test]
  fn test_task_mirrors_cancellation() {
    let scheduler = FiberScheduler::new();
    let token = CancellationToken::new();

    let task = YieldableTask::from_fn(|| StepOutcome::yields(StepValue::Continue), token);

    task.start(&scheduler).expect("starting should succeed");
    task.cancel();

    scheduler.update(0.).expect("update should succeed");
    scheduler.update(1.).expect("update should succeed");

    let outcome = task.outcome().expect("task should have completed");
    let error = outcome.expect_err("task should have been canceled");

    assert!(error.is_cancellation());
    assert_eq!(task.fiber().status(), FiberStatus::Canceled);
  }

  #[test]
  fn test_task_cannot_start_twice() {
    let scheduler = FiberScheduler::new();
    let task = YieldableTask::from_fn(|| StepOutcome::done(), CancellationToken::none());

    task.start(&scheduler).expect("first start should succeed");

    assert!(matches!(
      task.start(&scheduler),
      Err(FiberError::InvalidState(_))
    ));
  }

  #[test]
  fn test_task_can_be_awaited_across_threads() {
    let scheduler = FiberScheduler::new();

    let mut remaining = 3;
    let task = YieldableTask::from_fn(
      move || {
        if remaining == 0 {
          return StepOutcome::yields(Instruction::set_result("finished"));
        }

        remaining -= 1;
        StepOutcome::yields(StepValue::Continue)
      },
      CancellationToken::none(),
    );

    task.start(&scheduler).expect("starting should succeed");

    let waiter = thread::spawn(move || {
      let outcome = task.block();
      let result = outcome.expect("task should have succeeded");
      let result = result.expect("result should be set");

      *result.downcast_ref::<&str>().expect("expected a str result")
    });

    // drive updates until the waiter observes completion
    for tick in 0..100 {
      scheduler.update(tick as f64 * 0.01).expect("update should succeed");

      thread::sleep(Duration::from_millis(1));

      if waiter.is_finished() {
        break;
      }
    }

    assert_eq!(waiter.join().expect("waiter should not panic"), "finished");
  }
}
