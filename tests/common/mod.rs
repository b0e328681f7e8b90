#![allow(dead_code)] // each test binary uses its own slice of these helpers

use std::sync::{Arc, Mutex};

use weave::{
  FiberResult, FiberScheduler, Instruction, SchedulerOptions, StepOutcome, StepSequence, StepValue,
  TimeSpan,
};

/// A shared list the test fibers write observations into.
pub type Witness = Arc<Mutex<Vec<i32>>>;

pub fn witness() -> Witness {
  Arc::new(Mutex::new(Vec::new()))
}

/// A scheduler that never inlines, so tests control execution order purely
/// through `update` ticks.
pub fn deferred_scheduler() -> FiberScheduler {
  FiberScheduler::with_options(SchedulerOptions {
    allow_inlining: false,
    ..Default::default()
  })
}

/// Drives the scheduler at a fixed cadence until the predicate holds,
/// returning the virtual time at which it first did.
pub fn drive_until(
  scheduler: &FiberScheduler,
  step: f64,
  max_ticks: usize,
  mut predicate: impl FnMut() -> bool,
) -> f64 {
  for tick in 0..=max_ticks {
    let now = tick as f64 * step;

    scheduler.update(now).expect("update should succeed");

    if predicate() {
      return now;
    }
  }

  panic!("predicate did not hold within {max_ticks} ticks");
}

/// A scripted body: writes values into a witness list between sleeps, with
/// arbitrarily nested sub-scripts.
pub enum Script {
  Write(i32),
  Sleep(f32),
  Nest(Vec<Script>),
}

pub struct ScriptSequence {
  steps: std::vec::IntoIter<Script>,
  witness: Witness,
}

impl ScriptSequence {
  pub fn new(steps: Vec<Script>, witness: Witness) -> Self {
    Self {
      steps: steps.into_iter(),
      witness,
    }
  }
}

impl StepSequence for ScriptSequence {
  fn step(&mut self) -> FiberResult<StepOutcome> {
    loop {
      match self.steps.next() {
        None => return StepOutcome::done(),
        Some(Script::Write(value)) => {
          self.witness.lock().unwrap().push(value);
        }
        Some(Script::Sleep(seconds)) => {
          return StepOutcome::yields(Instruction::YieldForDuration(TimeSpan::from_seconds(
            seconds,
          )));
        }
        Some(Script::Nest(inner)) => {
          return StepOutcome::yields(StepValue::Sequence(Box::new(ScriptSequence::new(
            inner,
            self.witness.clone(),
          ))));
        }
      }
    }
  }
}
