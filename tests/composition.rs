use weave::{
  when_all, when_any, CancellationToken, Fiber, FiberError, FiberFactory, FiberStatus, Instruction,
  TimeSpan,
};

use crate::common::{deferred_scheduler, drive_until};

mod common;

/// Six fibers sleep for three seconds; a two second when-all deadline fires
/// first, while every member is still running, and the members finish on
/// their own schedule afterwards.
#[test]
fn when_all_times_out_without_disturbing_its_members() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let members: Vec<Fiber> = (0..6)
    .map(|_| {
      factory
        .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(3.))))
        .expect("queueing should succeed")
    })
    .collect();

  let all = factory
    .when_all(members.clone(), Some(TimeSpan::from_seconds(2.)))
    .expect("queueing should succeed");

  let faulted_at = drive_until(&scheduler, 0.1, 100, || all.is_completed());

  assert!(faulted_at <= 2.1, "timed out too late, at {faulted_at}");
  assert_eq!(all.status(), FiberStatus::Faulted);

  let error = all.error().expect("the timeout should be captured");
  assert!(matches!(*error, FiberError::Timeout));

  // the members were not disturbed: still sleeping, then completing on time
  for member in &members {
    assert_eq!(member.status(), FiberStatus::Running);
  }

  let all_done_at = drive_until(&scheduler, 0.1, 100, || {
    members.iter().all(|member| member.is_completed())
  });

  assert!(all_done_at <= 3.2, "members finished too late, at {all_done_at}");

  for member in &members {
    assert_eq!(member.status(), FiberStatus::RanToCompletion);
  }
}

/// A when-all over healthy fibers completes with a `true` result.
#[test]
fn when_all_completes_when_every_member_does() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let members: Vec<Fiber> = (0..3)
    .map(|index| {
      factory
        .start_new_thunk(move || {
          Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(
            index as f32,
          )))
        })
        .expect("queueing should succeed")
    })
    .collect();

  let all = factory
    .when_all(members, None)
    .expect("queueing should succeed");

  drive_until(&scheduler, 0.1, 100, || all.is_completed());

  assert_eq!(all.status(), FiberStatus::RanToCompletion);

  let result = all.result().expect("result should be set");
  assert_eq!(result.downcast_ref::<bool>(), Some(&true));
}

/// A faulted member surfaces as an aggregate fault once every member has
/// terminated.
#[test]
fn when_all_aggregates_member_failures() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let healthy = factory
    .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(1.))))
    .expect("queueing should succeed");

  let faulty = factory
    .start_new_action(|| Err(anyhow::anyhow!("deliberate failure").into()))
    .expect("queueing should succeed");

  let all = factory
    .when_all([healthy.clone(), faulty.clone()], None)
    .expect("queueing should succeed");

  drive_until(&scheduler, 0.1, 100, || all.is_completed());

  assert_eq!(all.status(), FiberStatus::Faulted);

  let error = all.error().expect("the aggregate should be captured");

  match &*error {
    FiberError::Aggregate(failures) => assert_eq!(failures.len(), 1),
    other => panic!("expected an aggregate fault, got {other}"),
  }

  // the healthy member terminated before the aggregate was raised
  assert_eq!(healthy.status(), FiberStatus::RanToCompletion);
}

/// The when-any result is the first member to complete; losers are left
/// running and nothing is propagated from them.
#[test]
fn when_any_yields_the_first_completed_fiber() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let slow = factory
    .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(5.))))
    .expect("queueing should succeed");

  let fast = factory
    .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(1.))))
    .expect("queueing should succeed");

  let any = factory
    .when_any([slow.clone(), fast.clone()], None)
    .expect("queueing should succeed");

  drive_until(&scheduler, 0.1, 100, || any.is_completed());

  assert_eq!(any.status(), FiberStatus::RanToCompletion);

  let result = any.result().expect("result should be set");
  let winner = result.downcast_ref::<Fiber>().expect("expected a fiber result");

  assert_eq!(*winner, fast);
  assert!(!slow.is_completed());
}

/// A when-any with no completion in time faults with a timeout.
#[test]
fn when_any_times_out() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let slow = factory
    .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(9.))))
    .expect("queueing should succeed");

  let any = factory
    .when_any([slow], Some(TimeSpan::from_seconds(1.)))
    .expect("queueing should succeed");

  drive_until(&scheduler, 0.1, 100, || any.is_completed());

  assert_eq!(any.status(), FiberStatus::Faulted);

  let error = any.error().expect("the timeout should be captured");
  assert!(matches!(*error, FiberError::Timeout));
}

/// A canceled token propagates as cancellation of the supervisor itself.
#[test]
fn when_all_cancels_on_its_token() {
  let scheduler = deferred_scheduler();
  let token = CancellationToken::new();
  let factory = FiberFactory::new(&scheduler);

  let member = factory
    .start_new_thunk(|| Ok(Instruction::YieldForDuration(TimeSpan::from_seconds(9.))))
    .expect("queueing should succeed");

  let all = when_all(
    &scheduler,
    [member],
    None,
    &token,
  )
  .expect("queueing should succeed");

  scheduler.update(0.).expect("update should succeed");
  token.cancel();
  drive_until(&scheduler, 0.1, 10, || all.is_completed());

  assert_eq!(all.status(), FiberStatus::Canceled);
  assert!(all.error().is_none());
}

/// Delays track virtual time, so a host driving synthetic `now` values gets
/// deterministic wake-ups.
#[test]
fn delay_follows_the_scheduler_clock() {
  let scheduler = deferred_scheduler();
  let factory = FiberFactory::new(&scheduler);

  let fiber = factory
    .delay(TimeSpan::from_seconds(2.5))
    .expect("queueing should succeed");

  let completed_at = drive_until(&scheduler, 0.5, 100, || fiber.is_completed());

  assert_eq!(fiber.status(), FiberStatus::RanToCompletion);
  assert_eq!(completed_at, 2.5);
}

/// Empty wait sets resolve immediately: when-all successfully, when-any as
/// canceled.
#[test]
fn empty_wait_sets_resolve_immediately() {
  let scheduler = deferred_scheduler();
  let none = CancellationToken::none();

  let all = when_all(&scheduler, [], None, &none).expect("queueing should succeed");
  let any = when_any(&scheduler, [], None, &none).expect("queueing should succeed");

  scheduler.update(0.).expect("update should succeed");

  assert_eq!(all.status(), FiberStatus::RanToCompletion);
  assert_eq!(any.status(), FiberStatus::Canceled);
}
