use super::{StepOutcome, StepSequence, StepValue};
use crate::{AnyValue, FiberResult, Instruction};

/// The work a fiber carries: exactly one of a lazy step sequence, a one-shot
/// thunk producing an instruction, or a one-shot action.
///
/// All variants collapse to the same stepping contract: sequences are stepped
/// repeatedly until exhausted, thunks yield their single instruction and are
/// done on the following step, and actions run once and finish immediately.
/// The `With` variants additionally carry an opaque user-state value that is
/// handed to the body when it runs.
pub enum FiberBody {
  /// A lazy sequence of yields.
  Sequence(Box<dyn StepSequence>),
  /// A one-shot thunk producing a single instruction.
  Thunk(Box<dyn FnOnce() -> FiberResult<Instruction> + Send>),
  /// A one-shot action.
  Action(Box<dyn FnOnce() -> FiberResult<()> + Send>),
  /// A one-shot action with an opaque state value.
  ActionWith {
    action: Box<dyn FnOnce(AnyValue) -> FiberResult<()> + Send>,
    state: AnyValue,
  },
}

impl FiberBody {
  /// Advances the body in the given slot by one move.
  ///
  /// One-shot variants are consumed out of the slot on their first move, so a
  /// later call observes the empty slot and reports the body as exhausted.
  pub(crate) fn advance(slot: &mut Option<FiberBody>) -> FiberResult<StepOutcome> {
    match slot.take() {
      None => Ok(StepOutcome::Done),
      Some(FiberBody::Sequence(mut sequence)) => match sequence.step() {
        Ok(StepOutcome::Yielded(value)) => {
          *slot = Some(FiberBody::Sequence(sequence));
          Ok(StepOutcome::Yielded(value))
        }
        other => other,
      },
      Some(FiberBody::Thunk(thunk)) => {
        let instruction = thunk()?;
        Ok(StepOutcome::Yielded(StepValue::Instruction(instruction)))
      }
      Some(FiberBody::Action(action)) => {
        action()?;
        Ok(StepOutcome::Done)
      }
      Some(FiberBody::ActionWith { action, state }) => {
        action(state)?;
        Ok(StepOutcome::Done)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_action_runs_once_and_finishes() {
    let mut slot = Some(FiberBody::Action(Box::new(|| Ok(()))));

    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Done)));
    assert!(slot.is_none());
    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Done)));
  }

  #[test]
  fn test_thunk_yields_its_instruction_then_finishes() {
    let mut slot = Some(FiberBody::Thunk(Box::new(|| Ok(Instruction::YieldToAny))));

    let first = FiberBody::advance(&mut slot);
    assert!(matches!(
      first,
      Ok(StepOutcome::Yielded(StepValue::Instruction(Instruction::YieldToAny)))
    ));

    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Done)));
  }

  #[test]
  fn test_action_with_receives_its_state() {
    let mut slot = Some(FiberBody::ActionWith {
      action: Box::new(|state| {
        let value = state.downcast::<u32>().expect("expected a u32 state");
        assert_eq!(*value, 42);
        Ok(())
      }),
      state: Box::new(42u32),
    });

    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Done)));
  }

  #[test]
  fn test_sequence_is_restored_until_exhausted() {
    let mut remaining = 1;
    let sequence = move || {
      if remaining == 0 {
        return StepOutcome::done();
      }

      remaining -= 1;
      StepOutcome::yields(StepValue::Continue)
    };

    let mut slot = Some(FiberBody::Sequence(Box::new(sequence)));

    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Yielded(_))));
    assert!(slot.is_some());
    assert!(matches!(FiberBody::advance(&mut slot), Ok(StepOutcome::Done)));
    assert!(slot.is_none());
  }
}
