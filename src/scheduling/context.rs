use std::sync::mpsc;

use crate::{
  AnyValue, CancellationToken, Fiber, FiberBody, FiberError, FiberResult, FiberScheduler,
  FiberStatus,
};

/// Lets foreign code post callbacks back onto a scheduler's owner thread.
///
/// `post` enqueues a callback fiber and returns immediately; `send` waits for
/// the callback to finish, inlining it when the caller is already on the
/// owner thread.
///
/// A caveat on `send`: scheduler teardown drops queued work rather than
/// completing it, so do not issue `send` against a scheduler whose lifetime
/// you do not own. In that case the call reports the scheduler as disposed
/// instead of the callback's completion.
#[derive(Clone)]
pub struct SchedulerContext {
  scheduler: FiberScheduler,
}

impl SchedulerContext {
  pub(crate) fn new(scheduler: FiberScheduler) -> Self {
    Self { scheduler }
  }

  /// The scheduler this context targets.
  #[inline]
  pub fn scheduler(&self) -> &FiberScheduler {
    &self.scheduler
  }

  /// Enqueues the callback to run on the owner thread and returns
  /// immediately. Safe to call from any thread.
  pub fn post(
    &self,
    callback: impl FnOnce(Option<AnyValue>) + Send + 'static,
    state: Option<AnyValue>,
  ) -> FiberResult<Fiber> {
    let fiber = Fiber::with_body(
      FiberBody::Action(Box::new(move || {
        callback(state);
        Ok(())
      })),
      CancellationToken::none(),
      FiberStatus::Created,
    );

    self.scheduler.queue_deferred(&fiber)?;

    Ok(fiber)
  }

  /// Runs the callback on the owner thread and waits for it to finish.
  ///
  /// On the owner thread the callback is invoked inline; from any other
  /// thread it is posted and the call blocks on a one-shot completion event.
  pub fn send(
    &self,
    callback: impl FnOnce(Option<AnyValue>) + Send + 'static,
    state: Option<AnyValue>,
  ) -> FiberResult<()> {
    if self.scheduler.is_owner_thread() {
      self.scheduler.ensure_not_disposed()?;

      callback(state);
      return Ok(());
    }

    let (sender, receiver) = mpsc::channel();

    self.post(
      move |state| {
        callback(state);
        let _ = sender.send(());
      },
      state,
    )?;

    // the sender is dropped unfired when the scheduler tears down the queued
    // fiber, which surfaces here as a disposed error rather than a hang
    receiver.recv().map_err(|_| FiberError::Disposed)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  use super::*;

  #[test]
  fn test_post_defers_to_the_next_update() {
    let scheduler = FiberScheduler::new();
    let context = scheduler.context();

    let count = Arc::new(AtomicUsize::new(0));
    let observed = count.clone();

    context
      .post(
        move |_| {
          observed.fetch_add(1, Ordering::SeqCst);
        },
        None,
      )
      .expect("posting should succeed");

    // post never inlines, even on the owner thread
    assert_eq!(count.load(Ordering::SeqCst), 0);

    scheduler.update(0.).expect("update should succeed");

    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_send_inlines_on_the_owner_thread() {
    let scheduler = FiberScheduler::new();
    let context = scheduler.context();

    let count = Arc::new(AtomicUsize::new(0));
    let observed = count.clone();

    context
      .send(
        move |_| {
          observed.fetch_add(1, Ordering::SeqCst);
        },
        None,
      )
      .expect("sending should succeed");

    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_post_passes_its_state_through() {
    let scheduler = FiberScheduler::new();
    let context = scheduler.context();

    let observed = Arc::new(AtomicUsize::new(0));
    let target = observed.clone();

    context
      .post(
        move |state| {
          let state = state.expect("state should be present");
          let value = state.downcast::<usize>().expect("expected a usize state");

          target.store(*value, Ordering::SeqCst);
        },
        Some(Box::new(42usize)),
      )
      .expect("posting should succeed");

    scheduler.update(0.).expect("update should succeed");

    assert_eq!(observed.load(Ordering::SeqCst), 42);
  }
}
