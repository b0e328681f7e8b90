use std::{
  fmt::{Display, Formatter},
  ops::{Add, Mul, Sub},
  time::Duration,
};

/// A span of virtual time, in seconds.
///
/// Durations handed to the scheduler (sleep instructions, wait-set timeouts)
/// are measured on the scheduler's own clock, not the wall clock, so a span
/// is just a count of seconds on whatever timeline the host drives through
/// `update`.
#[derive(Default, Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct TimeSpan {
  seconds: f32,
}

impl TimeSpan {
  pub const ZERO: Self = Self { seconds: 0. };

  #[inline]
  pub fn from_millis(milliseconds: f32) -> TimeSpan {
    Self::from_seconds(milliseconds / 1000.)
  }

  #[inline]
  pub fn from_seconds(seconds: f32) -> TimeSpan {
    Self { seconds }
  }

  #[inline]
  pub fn total_seconds(&self) -> f32 {
    self.seconds
  }
}

impl Add for TimeSpan {
  type Output = TimeSpan;

  #[inline]
  fn add(self, rhs: Self) -> Self::Output {
    TimeSpan::from_seconds(self.seconds + rhs.seconds)
  }
}

impl Sub for TimeSpan {
  type Output = TimeSpan;

  #[inline]
  fn sub(self, rhs: Self) -> Self::Output {
    TimeSpan::from_seconds(self.seconds - rhs.seconds)
  }
}

impl Mul<f32> for TimeSpan {
  type Output = TimeSpan;

  #[inline]
  fn mul(self, rhs: f32) -> Self::Output {
    TimeSpan::from_seconds(self.seconds * rhs)
  }
}

impl From<Duration> for TimeSpan {
  #[inline]
  fn from(value: Duration) -> Self {
    Self::from_seconds(value.as_secs_f32())
  }
}

impl From<TimeSpan> for Duration {
  #[inline]
  fn from(value: TimeSpan) -> Self {
    Duration::from_secs_f32(value.seconds.max(0.))
  }
}

impl Display for TimeSpan {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}s", self.seconds)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_span_arithmetic() {
    let a = TimeSpan::from_seconds(2.);
    let b = TimeSpan::from_millis(500.);

    assert_eq!((a + b).total_seconds(), 2.5);
    assert_eq!((a - b).total_seconds(), 1.5);
    assert_eq!((a * 2.).total_seconds(), 4.);
  }

  #[test]
  fn test_span_duration_round_trip() {
    let span = TimeSpan::from(Duration::from_millis(250));

    assert_eq!(span.total_seconds(), 0.25);
    assert_eq!(Duration::from(span), Duration::from_millis(250));
  }

  #[test]
  fn test_negative_spans_clamp_to_zero_duration() {
    let span = TimeSpan::from_seconds(-1.);

    assert_eq!(Duration::from(span), Duration::ZERO);
  }
}
