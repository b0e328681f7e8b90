use std::{
  cell::{Cell, RefCell},
  collections::VecDeque,
  fmt::{Debug, Formatter},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
  },
  thread::{self, ThreadId},
  time::{Duration, Instant},
};

use crate::{
  CancellationToken, Fiber, FiberError, FiberResult, FiberStatus, HostAdapter, Instruction,
  SchedulerContext, StepResult, UpdateClock,
};

thread_local! {
  static CURRENT_SCHEDULER: RefCell<Option<FiberScheduler>> = const { RefCell::new(None) };
  static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The scheduler currently dispatching on this thread, if any.
pub fn current_scheduler() -> Option<FiberScheduler> {
  CURRENT_SCHEDULER.with(|slot| slot.borrow().clone())
}

/// Configuration for a [`FiberScheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
  /// Permit `queue` calls from the owner thread to execute the fiber inline
  /// instead of deferring it to the next update.
  pub allow_inlining: bool,
  /// Recursion cap for inline execution; past it fibers are enqueued instead.
  pub max_inline_depth: usize,
  /// Cadence of the blocking [`FiberScheduler::run`] loop; `0` is unthrottled.
  pub updates_per_second: f32,
}

impl Default for SchedulerOptions {
  fn default() -> Self {
    Self {
      allow_inlining: true,
      max_inline_depth: 10,
      updates_per_second: 0.,
    }
  }
}

/// A single-threaded cooperative dispatcher for [`Fiber`]s.
///
/// A scheduler owns the thread it was created on; all fiber bodies,
/// continuations and queue mutations execute there. The only operations that
/// are safe from other threads are [`queue`], [`Fiber::cancel`] and the post
/// side of the [`SchedulerContext`]; they enqueue work and rouse the owner
/// thread via the scheduler's wake-up signal.
///
/// Progress happens in units of [`update`]: one pass over the ready queue
/// followed by a wake scan of the sleep queue. A frame-driven host calls
/// `update` itself with its own notion of `now`; standalone programs can hand
/// the thread over to the blocking [`run`] loop instead.
///
/// Handles are cheap to clone and all clones observe the same scheduler.
///
/// [`queue`]: FiberScheduler::queue
/// [`update`]: FiberScheduler::update
/// [`run`]: FiberScheduler::run
#[derive(Clone)]
pub struct FiberScheduler {
  core: Arc<SchedulerCore>,
}

struct SchedulerCore {
  options: SchedulerOptions,
  owner: ThreadId,
  disposed: AtomicBool,
  foreign_warned: AtomicBool,
  state: Mutex<SchedulerState>,
  signal: Condvar,
  fault_handler: Mutex<Option<FaultHandler>>,
  adapter: Mutex<Option<Arc<dyn HostAdapter>>>,
}

struct SchedulerState {
  ready: VecDeque<Fiber>,
  sleeping: Vec<Sleeper>,
  now: f64,
}

struct Sleeper {
  fiber: Fiber,
  wake_at: f64,
}

type FaultHandler = Arc<dyn Fn(&Fiber, &Arc<FiberError>) + Send + Sync>;

impl FiberScheduler {
  /// Creates a scheduler owned by the calling thread, with default options.
  pub fn new() -> Self {
    Self::with_options(SchedulerOptions::default())
  }

  /// Creates a scheduler owned by the calling thread.
  pub fn with_options(options: SchedulerOptions) -> Self {
    Self {
      core: Arc::new(SchedulerCore {
        options,
        owner: thread::current().id(),
        disposed: AtomicBool::new(false),
        foreign_warned: AtomicBool::new(false),
        state: Mutex::new(SchedulerState {
          ready: VecDeque::new(),
          sleeping: Vec::new(),
          now: 0.,
        }),
        signal: Condvar::new(),
        fault_handler: Mutex::new(None),
        adapter: Mutex::new(None),
      }),
    }
  }

  /// The options this scheduler was created with.
  #[inline]
  pub fn options(&self) -> &SchedulerOptions {
    &self.core.options
  }

  /// The current-time marker, in seconds, last passed to [`Self::update`].
  pub fn time(&self) -> f64 {
    self.core.state.lock().unwrap().now
  }

  /// Is the calling thread this scheduler's owner thread?
  #[inline]
  pub fn is_owner_thread(&self) -> bool {
    thread::current().id() == self.core.owner
  }

  /// Has this scheduler been disposed?
  #[inline]
  pub fn is_disposed(&self) -> bool {
    self.core.disposed.load(Ordering::Acquire)
  }

  /// A synchronization context for posting callbacks onto this scheduler.
  pub fn context(&self) -> SchedulerContext {
    SchedulerContext::new(self.clone())
  }

  /// Installs a hook observing fiber faults. Without one, each fault is
  /// logged once and swallowed.
  pub fn set_fault_handler(
    &self,
    handler: impl Fn(&Fiber, &Arc<FiberError>) + Send + Sync + 'static,
  ) {
    *self.core.fault_handler.lock().unwrap() = Some(Arc::new(handler));
  }

  /// Installs the host adapter that receives foreign yield payloads.
  pub fn set_host_adapter(&self, adapter: impl HostAdapter + 'static) {
    *self.core.adapter.lock().unwrap() = Some(Arc::new(adapter));
  }

  /// Queues a fiber for execution on this scheduler.
  ///
  /// Safe to call from any thread. An unstarted fiber is activated and bound
  /// to this scheduler; a fiber parked by a host adapter is requeued. On the
  /// owner thread the fiber may execute inline immediately, gated by
  /// [`SchedulerOptions::allow_inlining`] and the inline depth cap; otherwise
  /// it is appended to the ready queue and the wake-up signal is fired.
  pub fn queue(&self, fiber: &Fiber) -> FiberResult<()> {
    self.ensure_not_disposed()?;

    if !self.activate(fiber)? {
      return Ok(());
    }

    if fiber.is_scheduled() {
      return Ok(());
    }

    let can_inline = self.is_owner_thread()
      && self.core.options.allow_inlining
      && INLINE_DEPTH.with(|depth| depth.get()) < self.core.options.max_inline_depth;

    if can_inline {
      let _depth = InlineDepthScope::enter();

      self.execute(fiber.clone());
    } else {
      self.enqueue(fiber);
    }

    Ok(())
  }

  /// Queues a fiber without ever inlining it, even on the owner thread.
  pub(crate) fn queue_deferred(&self, fiber: &Fiber) -> FiberResult<()> {
    self.ensure_not_disposed()?;

    if self.activate(fiber)? {
      self.enqueue(fiber);
    }

    Ok(())
  }

  /// Performs one unit of progress at the given monotonic time (in seconds).
  ///
  /// Phase A drains the ready queue by exactly one pass: fibers requeued
  /// during the pass run on the next update, not this one. Phase B scans the
  /// sleep queue, waking fibers whose deadline has passed or which have a
  /// pending cancel; the rest keep their relative order.
  ///
  /// The time marker is monotonic: a regressing `now` is clamped.
  pub fn update(&self, now: f64) -> FiberResult<()> {
    self.ensure_not_disposed()?;
    self.ensure_owner_thread("update")?;

    let _scope = CurrentSchedulerScope::enter(self.clone());

    let pass = {
      let mut state = self.core.state.lock().unwrap();

      state.now = now.max(state.now);
      state.ready.len()
    };

    for _ in 0..pass {
      let Some(fiber) = self.core.state.lock().unwrap().ready.pop_front() else {
        break;
      };

      fiber.clear_scheduled();
      self.execute(fiber);
    }

    let mut state = self.core.state.lock().unwrap();
    let now = state.now;
    let sleepers = std::mem::take(&mut state.sleeping);

    for sleeper in sleepers {
      if sleeper.fiber.is_completed() {
        // canceled in its sleep; nothing left to run
        sleeper.fiber.clear_scheduled();
      } else if sleeper.wake_at <= now || sleeper.fiber.cancel_requested() {
        state.ready.push_back(sleeper.fiber);
      } else {
        state.sleeping.push(sleeper);
      }
    }

    Ok(())
  }

  /// Runs the dispatch loop on the calling thread until the token is
  /// signaled, the scheduler is disposed, or the root fiber (when given)
  /// terminates.
  ///
  /// Between updates the loop sleeps on the wake-up signal, bounded by the
  /// earliest sleep-queue deadline, or throttled to the configured
  /// [`SchedulerOptions::updates_per_second`] when that is positive.
  pub fn run(&self, root: Option<&Fiber>, token: &CancellationToken) -> FiberResult<()> {
    self.ensure_not_disposed()?;
    self.ensure_owner_thread("run")?;

    log::trace!("entering scheduler run loop");

    // rouse the loop promptly when the token fires
    let rouse = self.clone();
    token.register(move || rouse.notify());

    let interval = (self.core.options.updates_per_second > 0.)
      .then(|| Duration::from_secs_f32(1. / self.core.options.updates_per_second));

    // the loop continues the virtual timeline from wherever host-driven
    // updates left the current-time marker
    let clock = UpdateClock::start_at(self.time());

    loop {
      if self.is_disposed() || token.is_canceled() {
        log::trace!("exiting scheduler run loop");
        return Ok(());
      }

      match self.update(clock.now()) {
        Ok(()) => {}
        // disposed between the loop check and the update; a clean exit
        Err(FiberError::Disposed) => return Ok(()),
        Err(error) => return Err(error),
      }

      if let Some(root) = root {
        if root.is_completed() {
          return Ok(());
        }
      }

      if let Some(interval) = interval {
        self.sleep_for_cycle(interval, token);
      } else {
        self.sleep_until_work(&clock, token);
      }
    }
  }

  /// Drives a single fiber one step immediately, outside the normal queues.
  ///
  /// This is the re-entry point for host adapters: when an engine-native wait
  /// completes, the host steps the parked fiber through here (or simply
  /// requeues it via [`Self::queue`]). Must be called on the owner thread.
  pub fn run_single_step(&self, fiber: &Fiber) -> FiberResult<()> {
    self.ensure_not_disposed()?;
    self.ensure_owner_thread("run_single_step")?;

    if !self.activate(fiber)? {
      return Ok(());
    }

    // if the fiber sat in a queue, it is now being driven directly
    self.remove_from_queues(fiber);
    self.execute(fiber.clone());

    Ok(())
  }

  /// Disposes the scheduler: queued fibers are dropped, blocked `run` loops
  /// return, and subsequent operations fail. Idempotent.
  pub fn dispose(&self) {
    if self.core.disposed.swap(true, Ordering::AcqRel) {
      return;
    }

    log::trace!("disposing scheduler");

    let (ready, sleeping) = {
      let mut state = self.core.state.lock().unwrap();

      (
        std::mem::take(&mut state.ready),
        std::mem::take(&mut state.sleeping),
      )
    };

    for fiber in ready {
      fiber.clear_scheduled();
    }

    for sleeper in sleeping {
      sleeper.fiber.clear_scheduled();
    }

    self.notify();
  }

  /// Fires the wake-up signal so a blocked [`Self::run`] loop re-evaluates.
  pub(crate) fn notify(&self) {
    // taking the lock orders the notify after any in-flight wait registration
    let _guard = self.core.state.lock().unwrap();

    self.core.signal.notify_all();
  }

  pub(crate) fn ensure_not_disposed(&self) -> FiberResult<()> {
    if self.is_disposed() {
      Err(FiberError::Disposed)
    } else {
      Ok(())
    }
  }

  /// Requeues a fiber previously parked on a completion subscription.
  fn resume(&self, fiber: &Fiber) {
    if fiber.is_completed() || self.is_disposed() {
      return;
    }

    self.enqueue(fiber);
  }

  /// Moves an unstarted fiber to waiting-to-run and binds it to this
  /// scheduler; false when the fiber has already terminated.
  fn activate(&self, fiber: &Fiber) -> FiberResult<bool> {
    loop {
      let status = fiber.status();

      match status {
        FiberStatus::Created | FiberStatus::WaitingForActivation => {
          fiber.bind(self)?;

          if fiber.transition(status, FiberStatus::WaitingToRun) {
            log::trace!("activated fiber {:?}", fiber.id());
            return Ok(true);
          }
          // raced with a concurrent start or cancel; re-examine
        }
        FiberStatus::WaitingToRun | FiberStatus::Running => {
          fiber.bind(self)?;
          return Ok(true);
        }
        _ => return Ok(false),
      }
    }
  }

  /// Appends a fiber to the ready queue and fires the wake-up signal.
  fn enqueue(&self, fiber: &Fiber) {
    if fiber.mark_scheduled() {
      self.core.state.lock().unwrap().ready.push_back(fiber.clone());
    }

    self.notify();
  }

  /// Executes one step of the given fiber and interprets its yield.
  fn execute(&self, fiber: Fiber) {
    debug_assert!(self.is_owner_thread());

    loop {
      match fiber.status() {
        FiberStatus::WaitingToRun => {
          if fiber.transition(FiberStatus::WaitingToRun, FiberStatus::Running) {
            break;
          }
          // raced with a cancel; re-examine
        }
        FiberStatus::Running => break,
        _ => return,
      }
    }

    let _scope = CurrentSchedulerScope::enter(self.clone());

    match fiber.step(self) {
      StepResult::Yielded(instruction) => self.interpret(fiber, instruction),
      StepResult::Completed => {
        if fiber.status() == FiberStatus::Faulted {
          self.surface_fault(&fiber);
        }
      }
    }
  }

  /// Routes a yielded instruction into the appropriate queue or subscription.
  fn interpret(&self, fiber: Fiber, instruction: Instruction) {
    match instruction {
      Instruction::YieldToAny => self.enqueue(&fiber),
      Instruction::YieldForDuration(span) => {
        if fiber.mark_scheduled() {
          let mut state = self.core.state.lock().unwrap();
          let wake_at = state.now + span.total_seconds().max(0.) as f64;

          state.sleeping.push(Sleeper { fiber, wake_at });
        }
      }
      Instruction::YieldUntilComplete(target) => {
        if target.is_completed() {
          self.enqueue(&fiber);
        } else {
          let scheduler = self.clone();

          target.on_completed(Box::new(move |_| scheduler.resume(&fiber)));
        }
      }
      Instruction::YieldToFiber(target) => {
        self.remove_from_queues(&target);

        let can_inline =
          INLINE_DEPTH.with(|depth| depth.get()) < self.core.options.max_inline_depth;

        if can_inline {
          self.enqueue(&fiber);

          let _depth = InlineDepthScope::enter();

          self.execute(target);
        } else {
          // past the cap the switch degrades to queueing, target first so it
          // still runs ahead of the yielder
          self.enqueue(&target);
          self.enqueue(&fiber);
        }
      }
      Instruction::Foreign(payload) => {
        let adapter = self.core.adapter.lock().unwrap().clone();

        match adapter {
          Some(adapter) => adapter.push_native_yield(&fiber, payload),
          None => {
            if !self.core.foreign_warned.swap(true, Ordering::Relaxed) {
              log::warn!("foreign yield with no host adapter installed; treating as a plain yield");
            }

            self.enqueue(&fiber);
          }
        }
      }
      Instruction::Stop | Instruction::SetResult(_) => {
        debug_assert!(false, "terminal instructions are interpreted inside the step");
      }
    }
  }

  fn remove_from_queues(&self, fiber: &Fiber) {
    let mut state = self.core.state.lock().unwrap();

    state.ready.retain(|queued| queued != fiber);
    state.sleeping.retain(|sleeper| sleeper.fiber != *fiber);

    fiber.clear_scheduled();
  }

  fn surface_fault(&self, fiber: &Fiber) {
    let Some(error) = fiber.error() else { return };
    let handler = self.core.fault_handler.lock().unwrap().clone();

    match handler {
      Some(handler) => handler(fiber, &error),
      None => log::error!("fiber {:?} faulted: {}", fiber.id(), error),
    }
  }

  /// Sleeps out the remainder of a throttled update cycle.
  fn sleep_for_cycle(&self, interval: Duration, token: &CancellationToken) {
    let cycle_started = Instant::now();
    let mut state = self.core.state.lock().unwrap();

    loop {
      if self.is_disposed() || token.is_canceled() {
        return;
      }

      let Some(remaining) = interval.checked_sub(cycle_started.elapsed()) else {
        return;
      };

      let (guard, _) = self.core.signal.wait_timeout(state, remaining).unwrap();
      state = guard;
    }
  }

  /// Sleeps until the wake-up signal or the earliest sleep deadline.
  fn sleep_until_work(&self, clock: &UpdateClock, token: &CancellationToken) {
    let state = self.core.state.lock().unwrap();

    if !state.ready.is_empty() || self.is_disposed() || token.is_canceled() {
      return;
    }

    let next_wake = state
      .sleeping
      .iter()
      .map(|sleeper| sleeper.wake_at)
      .fold(f64::INFINITY, f64::min);

    if next_wake.is_finite() {
      let wait = (next_wake - clock.now()).max(0.);

      if wait > 0. {
        drop(
          self
            .core
            .signal
            .wait_timeout(state, Duration::from_secs_f64(wait))
            .unwrap(),
        );
      }
    } else {
      drop(self.core.signal.wait(state).unwrap());
    }
  }

  fn ensure_owner_thread(&self, operation: &str) -> FiberResult<()> {
    if self.is_owner_thread() {
      Ok(())
    } else {
      Err(FiberError::invalid_state(format!(
        "{operation} must be called from the scheduler's owner thread"
      )))
    }
  }
}

impl Default for FiberScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl PartialEq for FiberScheduler {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.core, &other.core)
  }
}

impl Eq for FiberScheduler {}

impl Debug for FiberScheduler {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FiberScheduler")
      .field("owner", &self.core.owner)
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

struct InlineDepthScope;

impl InlineDepthScope {
  fn enter() -> Self {
    INLINE_DEPTH.with(|depth| depth.set(depth.get() + 1));
    Self
  }
}

impl Drop for InlineDepthScope {
  fn drop(&mut self) {
    INLINE_DEPTH.with(|depth| depth.set(depth.get() - 1));
  }
}

struct CurrentSchedulerScope {
  prior: Option<FiberScheduler>,
}

impl CurrentSchedulerScope {
  fn enter(scheduler: FiberScheduler) -> Self {
    Self {
      prior: CURRENT_SCHEDULER.with(|slot| slot.borrow_mut().replace(scheduler)),
    }
  }
}

impl Drop for CurrentSchedulerScope {
  fn drop(&mut self) {
    let prior = self.prior.take();

    CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = prior);
  }
}
