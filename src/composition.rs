//! Composition primitives built on the fiber primitive.
//!
//! [`when_all`], [`when_any`] and [`delay`] are ordinary supervisor fibers
//! with no privileged access to scheduler internals: their bodies poll
//! conditions between plain yields, and their timeouts read the scheduler's
//! current-time marker rather than the wall clock, so a host driving
//! synthetic time through `update` gets fully deterministic behavior.

use std::sync::Arc;

use crate::{
  CancellationToken, Fiber, FiberBody, FiberError, FiberResult, FiberScheduler, FiberStatus,
  Instruction, StepOutcome, StepSequence, StepValue, TimeSpan,
};

/// Starts a fiber that completes once all of the given fibers have completed.
///
/// On success the supervisor's result is `true`. If any member faulted or was
/// canceled, the supervisor waits for every member to terminate and then
/// re-raises the failures as an aggregate fault. A signaled token cancels the
/// supervisor; an elapsed timeout faults it with a timeout error. An empty
/// set completes successfully on the supervisor's first step.
pub fn when_all(
  scheduler: &FiberScheduler,
  fibers: impl IntoIterator<Item = Fiber>,
  timeout: Option<TimeSpan>,
  token: &CancellationToken,
) -> FiberResult<Fiber> {
  let supervisor = WhenAllSupervisor {
    members: fibers.into_iter().collect(),
    common: SupervisorState::new(scheduler.clone(), timeout, token.clone()),
  };

  start_supervisor(scheduler, Box::new(supervisor), token)
}

/// Starts a fiber that completes once any of the given fibers has completed.
///
/// The supervisor's result is the first-completed fiber. Losers are left
/// untouched and nothing is propagated from them. An elapsed timeout faults
/// the supervisor with a timeout error; an empty set completes canceled.
pub fn when_any(
  scheduler: &FiberScheduler,
  fibers: impl IntoIterator<Item = Fiber>,
  timeout: Option<TimeSpan>,
  token: &CancellationToken,
) -> FiberResult<Fiber> {
  let supervisor = WhenAnySupervisor {
    members: fibers.into_iter().collect(),
    common: SupervisorState::new(scheduler.clone(), timeout, token.clone()),
  };

  start_supervisor(scheduler, Box::new(supervisor), token)
}

/// Starts a fiber that completes once the given span has elapsed on the
/// scheduler clock, or cancels when the token is signaled.
///
/// A zero (or negative) span completes on the supervisor's first step.
pub fn delay(
  scheduler: &FiberScheduler,
  duration: TimeSpan,
  token: &CancellationToken,
) -> FiberResult<Fiber> {
  let supervisor = DelaySupervisor {
    duration,
    started_at: None,
    common: SupervisorState::new(scheduler.clone(), None, token.clone()),
  };

  start_supervisor(scheduler, Box::new(supervisor), token)
}

fn start_supervisor(
  scheduler: &FiberScheduler,
  body: Box<dyn StepSequence>,
  token: &CancellationToken,
) -> FiberResult<Fiber> {
  let fiber = Fiber::with_body(FiberBody::Sequence(body), token.clone(), FiberStatus::Created);

  scheduler.queue(&fiber)?;

  Ok(fiber)
}

/// State shared by every supervisor: the scheduler clock, the deadline and
/// the cancellation token.
struct SupervisorState {
  scheduler: FiberScheduler,
  timeout: Option<TimeSpan>,
  deadline: Option<f64>,
  token: CancellationToken,
}

impl SupervisorState {
  fn new(scheduler: FiberScheduler, timeout: Option<TimeSpan>, token: CancellationToken) -> Self {
    Self {
      scheduler,
      timeout,
      deadline: None,
      token,
    }
  }

  /// Checks the token and the deadline, in that order; the deadline is
  /// captured from the scheduler clock on the first poll.
  fn check(&mut self) -> FiberResult<f64> {
    self.token.throw_if_canceled()?;

    let now = self.scheduler.time();
    let deadline = *self.deadline.get_or_insert_with(|| {
      self
        .timeout
        .map(|timeout| now + timeout.total_seconds().max(0.) as f64)
        .unwrap_or(f64::INFINITY)
    });

    if now >= deadline {
      return Err(FiberError::Timeout);
    }

    Ok(now)
  }
}

struct WhenAllSupervisor {
  members: Vec<Fiber>,
  common: SupervisorState,
}

impl StepSequence for WhenAllSupervisor {
  fn step(&mut self) -> FiberResult<StepOutcome> {
    self.common.check()?;

    if !self.members.iter().all(|member| member.is_completed()) {
      return StepOutcome::yields(StepValue::Continue);
    }

    let failures: Vec<Arc<FiberError>> = self
      .members
      .iter()
      .filter_map(|member| match member.status() {
        FiberStatus::Faulted => Some(
          member
            .error()
            .unwrap_or_else(|| Arc::new(FiberError::invalid_state("fault with no captured error"))),
        ),
        FiberStatus::Canceled => Some(Arc::new(member.token().cancellation())),
        _ => None,
      })
      .collect();

    if failures.is_empty() {
      StepOutcome::yields(Instruction::set_result(true))
    } else {
      Err(FiberError::Aggregate(failures))
    }
  }
}

struct WhenAnySupervisor {
  members: Vec<Fiber>,
  common: SupervisorState,
}

impl StepSequence for WhenAnySupervisor {
  fn step(&mut self) -> FiberResult<StepOutcome> {
    if self.members.is_empty() {
      return Err(self.common.token.cancellation());
    }

    self.common.check()?;

    match self.members.iter().find(|member| member.is_completed()) {
      Some(winner) => StepOutcome::yields(Instruction::set_result(winner.clone())),
      None => StepOutcome::yields(StepValue::Continue),
    }
  }
}

struct DelaySupervisor {
  duration: TimeSpan,
  started_at: Option<f64>,
  common: SupervisorState,
}

impl StepSequence for DelaySupervisor {
  fn step(&mut self) -> FiberResult<StepOutcome> {
    let now = self.common.check()?;
    let started_at = *self.started_at.get_or_insert(now);

    if now - started_at >= self.duration.total_seconds().max(0.) as f64 {
      StepOutcome::done()
    } else {
      StepOutcome::yields(StepValue::Continue)
    }
  }
}
