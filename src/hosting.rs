//! The interface a frame-driven host implements to embed the scheduler.
//!
//! A host (typically a game engine) that owns the frame loop drives the
//! scheduler itself: it calls [`FiberScheduler::update`] once per frame with
//! its own monotonic `now` and [`FiberScheduler::queue`] to submit or resume
//! work, instead of handing the thread to [`FiberScheduler::run`].
//!
//! Foreign yields are the other half of the embedding: when a fiber body
//! yields a value the core does not understand, the scheduler parks the fiber
//! and surfaces the payload to the installed [`HostAdapter`] unchanged. The
//! adapter translates it into the host's native wait primitive and, once that
//! wait resolves, re-enters the fiber through [`FiberScheduler::queue`] or
//! [`FiberScheduler::run_single_step`].
//!
//! [`FiberScheduler::update`]: crate::FiberScheduler::update
//! [`FiberScheduler::queue`]: crate::FiberScheduler::queue
//! [`FiberScheduler::run`]: crate::FiberScheduler::run
//! [`FiberScheduler::run_single_step`]: crate::FiberScheduler::run_single_step

use crate::{AnyValue, Fiber};

/// The property key under which host-native handles are associated.
pub const NATIVE_HANDLE_KEY: &str = "host.native_handle";

/// Receives foreign yield payloads from the scheduler.
///
/// The core never interprets the payload; it is transported opaquely from the
/// yielding body to this adapter. The fiber is parked off all queues when the
/// adapter is invoked, and stays parked until the host resumes it.
pub trait HostAdapter: Send + Sync {
  /// Translates a foreign yield payload into a host-native wait for the
  /// given (parked) fiber.
  fn push_native_yield(&self, fiber: &Fiber, payload: AnyValue);
}

impl<T: HostAdapter + ?Sized> HostAdapter for std::sync::Arc<T> {
  fn push_native_yield(&self, fiber: &Fiber, payload: AnyValue) {
    (**self).push_native_yield(fiber, payload);
  }
}

/// Stores a host-native handle on the fiber's property map, so that other
/// fibers can wait on fibers whose progress is driven by the host.
///
/// Should only be called from the scheduler thread.
pub fn associate_native_handle(fiber: &Fiber, handle: AnyValue) {
  fiber.set_property(NATIVE_HANDLE_KEY, handle);
}

/// Removes and returns the host-native handle associated with the fiber.
pub fn take_native_handle(fiber: &Fiber) -> Option<AnyValue> {
  fiber.take_property(NATIVE_HANDLE_KEY)
}
