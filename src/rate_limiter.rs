//! Drift-correcting permit pacing for producer workers.
//!
//! The limiter never sleeps a fixed interval. Permit `n` is due at
//! `start + n / rate`, so oversleeping on one permit is paid back by issuing
//! the following ones immediately. The backlog that can be paid back is
//! bounded by `max_catch_up`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
struct Schedule {
    start: Instant,
    issued: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// Permits per second, 0 = unlimited
    rate: u64,
    max_catch_up: Duration,
    schedule: Mutex<Schedule>,
    issued_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: u64, max_catch_up: Duration) -> Self {
        Self {
            rate,
            max_catch_up,
            schedule: Mutex::new(Schedule {
                start: Instant::now(),
                issued: 0,
            }),
            issued_total: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Permits handed out since construction, across resyncs
    pub fn issued(&self) -> u64 {
        self.issued_total.load(Ordering::Relaxed)
    }

    /// Wait until the next permit is due. Cannot fail, only delay.
    pub async fn acquire(&self) {
        self.issued_total.fetch_add(1, Ordering::Relaxed);
        if self.rate == 0 {
            return;
        }

        let due = self.reserve();
        if due > Instant::now() {
            sleep_until(due).await;
        }
    }

    /// Restart the schedule at the current instant, dropping any backlog.
    ///
    /// Called after a flow-control pause so that time spent blocked by the
    /// broker is not replayed as a burst.
    pub fn resync(&self) {
        let mut schedule = self.schedule.lock();
        schedule.start = Instant::now();
        schedule.issued = 0;
    }

    fn reserve(&self) -> Instant {
        let mut schedule = self.schedule.lock();
        let now = Instant::now();
        let mut due = schedule.start + self.offset(schedule.issued);

        if now > due {
            let lag = now - due;
            if lag > self.max_catch_up {
                let excess = lag - self.max_catch_up;
                schedule.start += excess;
                due += excess;
            }
        }

        schedule.issued += 1;
        due
    }

    fn offset(&self, issued: u64) -> Duration {
        let nanos = issued as u128 * 1_000_000_000u128 / self.rate as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}
