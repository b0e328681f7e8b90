//! The fiber primitive and its execution driver.

pub use body::*;
pub use fiber::*;
pub use status::*;
pub use steps::*;

mod body;
mod fiber;
mod status;
mod steps;

use std::{any::Any, sync::Arc};

/// An opaque value carried through the runtime: user state, foreign yield
/// payloads and per-fiber properties.
pub type AnyValue = Box<dyn Any + Send>;

/// An opaque, shareable fiber result value.
pub type FiberValue = Arc<dyn Any + Send + Sync>;
