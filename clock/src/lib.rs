//! Time abstraction used across the ingestion engine, so that quiescence
//! deadlines and TTLs can be driven by a mock provider in tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::time::Duration;

/// An absolute instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create a time from milliseconds since the unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).unwrap())
    }

    /// Milliseconds since the unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns `self - other` if `other` is not in the future of `self`.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        (self.0 - other.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + ChronoDuration::from_std(rhs).expect("duration overflow"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - ChronoDuration::from_std(rhs).expect("duration overflow"))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of wall-clock time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// [`TimeProvider`] whose output is controlled by tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the current time.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the current time by `duration` and return the new value.
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
    fn mock_provider_advances() {
        let provider = MockProvider::new(Time::from_timestamp_millis(100));
        assert_eq!(provider.now().timestamp_millis(), 100);

        provider.inc(Duration::from_millis(400));
        assert_eq!(provider.now().timestamp_millis(), 500);

        provider.set(Time::from_timestamp_millis(42));
        assert_eq!(provider.now().timestamp_millis(), 42);
    }

    #[test]
    fn duration_since_saturates() {
        let t0 = Time::from_timestamp_millis(1_000);
        let t1 = t0 + Duration::from_secs(5);

        assert_eq!(t1.checked_duration_since(t0), Some(Duration::from_secs(5)));
        assert_eq!(t0.checked_duration_since(t1), None);
    }
}
