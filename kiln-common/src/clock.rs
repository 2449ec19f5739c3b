// Copyright 2026 kiln Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// A deadline that never expires.
pub const NEVER: u64 = u64::MAX;

/// The clock pair shared by caches of one debugger session.
///
/// The wall side is a monotonic microsecond counter measured from the creation of the clock. The user side is a
/// counter advanced from outside, typically once per rendered frame, so that eviction can age nodes by interaction
/// rather than by time alone.
///
/// Clones share both counters.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    origin: Instant,
    user: AtomicU64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// Create a clock whose wall side starts at zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                origin: Instant::now(),
                user: AtomicU64::new(0),
            }),
        }
    }

    /// Microseconds elapsed since the clock was created.
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.inner.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Current value of the user activity counter.
    pub fn user_clock(&self) -> u64 {
        self.inner.user.load(Ordering::Acquire)
    }

    /// Advance the user activity counter by one and return the new value.
    pub fn advance_user_clock(&self) -> u64 {
        self.advance_user_clock_by(1)
    }

    /// Advance the user activity counter by `ticks` and return the new value.
    pub fn advance_user_clock_by(&self, ticks: u64) -> u64 {
        self.inner.user.fetch_add(ticks, Ordering::AcqRel) + ticks
    }

    /// Absolute deadline `timeout` from now, in clock microseconds.
    pub fn deadline_after(&self, timeout: Duration) -> u64 {
        let timeout = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        self.now_us().saturating_add(timeout)
    }

    /// Returns `true` if `deadline_us` is already reached.
    pub fn is_expired(&self, deadline_us: u64) -> bool {
        deadline_us != NEVER && self.now_us() >= deadline_us
    }

    /// Translate a clock deadline into an [`Instant`].
    ///
    /// Returns `None` for [`NEVER`] and for deadlines too far away to represent.
    pub fn instant_of(&self, deadline_us: u64) -> Option<Instant> {
        if deadline_us == NEVER {
            return None;
        }
        self.inner.origin.checked_add(Duration::from_micros(deadline_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_is_monotonic() {
        let clock = Clock::new();
        let mut last = clock.now_us();
        for _ in 0..1000 {
            let now = clock.now_us();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_user_clock_is_shared_between_clones() {
        let clock = Clock::new();
        let cloned = clock.clone();

        assert_eq!(clock.user_clock(), 0);
        assert_eq!(cloned.advance_user_clock(), 1);
        assert_eq!(clock.advance_user_clock_by(4), 5);
        assert_eq!(cloned.user_clock(), 5);
    }

    #[test]
    fn test_deadline() {
        let clock = Clock::new();

        let now = clock.now_us();
        assert!(clock.is_expired(now));
        assert!(!clock.is_expired(NEVER));
        assert!(clock.instant_of(NEVER).is_none());

        let deadline = clock.deadline_after(Duration::from_secs(60));
        assert!(!clock.is_expired(deadline));
        let instant = clock.instant_of(deadline).unwrap();
        assert!(instant > Instant::now());
    }
}
