//! Injectable time for the memstore: production code asks a
//! [`TimeProvider`] for "now" so tests can drive retention and eviction
//! deterministically with a [`MockProvider`].

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{fmt::Debug, ops::Add, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

/// A moment in time, nanosecond precision, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from nanoseconds since the epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Construct from milliseconds since the epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Nanoseconds since the epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// `self - other`, or `None` if `other` is later than `self`.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        (self.0 - other.0).to_std().ok()
    }

    /// `self + duration`, or `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let d = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(d).map(Self)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("time overflow")
    }
}

/// Source of "now".
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new wall-clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A manually advanced clock for tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a clock frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance by `duration`, returning the new "now".
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_advances_deterministically() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now().timestamp_nanos(), 0);

        provider.inc(Duration::from_nanos(250));
        assert_eq!(provider.now().timestamp_nanos(), 250);

        provider.set(Time::from_timestamp_millis(5));
        assert_eq!(provider.now().timestamp_nanos(), 5_000_000);
    }

    #[test]
    fn duration_since_is_checked() {
        let early = Time::from_timestamp_nanos(10);
        let late = Time::from_timestamp_nanos(500);
        assert_eq!(late.checked_duration_since(early), Some(Duration::from_nanos(490)));
        assert_eq!(early.checked_duration_since(late), None);
    }
}
