//! Per-worker counters.
//!
//! Each worker is the only writer of its own [`Counters`]; the stats
//! aggregator reads them without taking any lock. Writers always bump the
//! "earlier" counter (`sent`, `received`) before the "later" one
//! (`confirmed`, `acked`) and readers load in the opposite order, so every
//! snapshot satisfies `confirmed <= sent` and `acked <= received`.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    confirmed: AtomicU64,
    rejected: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    integrity_failures: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Release);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_confirmed(&self) {
        self.confirmed.fetch_add(1, Ordering::Release);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Release);
    }

    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(1, Ordering::Release);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_acked(&self, count: u64) {
        self.acked.fetch_add(count, Ordering::Release);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        // later counters first
        let confirmed = self.confirmed.load(Ordering::Acquire);
        let rejected = self.rejected.load(Ordering::Acquire);
        let acked = self.acked.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Relaxed);
        let integrity_failures = self.integrity_failures.load(Ordering::Relaxed);
        let sent = self.sent.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Acquire);

        CounterSnapshot {
            sent,
            confirmed,
            rejected,
            received,
            acked,
            errors,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            integrity_failures,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub received: u64,
    pub acked: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub integrity_failures: u64,
}

impl CounterSnapshot {
    /// Publishes still waiting on a confirm (or lost to a timeout)
    pub fn unconfirmed(&self) -> u64 {
        self.sent.saturating_sub(self.confirmed + self.rejected)
    }

    pub fn unacked(&self) -> u64 {
        self.received.saturating_sub(self.acked)
    }

    pub fn is_consistent(&self) -> bool {
        self.confirmed <= self.sent && self.acked <= self.received
    }

    /// Per-field difference against an earlier snapshot of the same counters
    pub fn delta_since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent.saturating_sub(earlier.sent),
            confirmed: self.confirmed.saturating_sub(earlier.confirmed),
            rejected: self.rejected.saturating_sub(earlier.rejected),
            received: self.received.saturating_sub(earlier.received),
            acked: self.acked.saturating_sub(earlier.acked),
            errors: self.errors.saturating_sub(earlier.errors),
            bytes_sent: self.bytes_sent.saturating_sub(earlier.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(earlier.bytes_received),
            integrity_failures: self
                .integrity_failures
                .saturating_sub(earlier.integrity_failures),
        }
    }
}

impl Add for CounterSnapshot {
    type Output = CounterSnapshot;

    fn add(mut self, rhs: CounterSnapshot) -> CounterSnapshot {
        self += rhs;
        self
    }
}

impl AddAssign for CounterSnapshot {
    fn add_assign(&mut self, rhs: CounterSnapshot) {
        self.sent += rhs.sent;
        self.confirmed += rhs.confirmed;
        self.rejected += rhs.rejected;
        self.received += rhs.received;
        self.acked += rhs.acked;
        self.errors += rhs.errors;
        self.bytes_sent += rhs.bytes_sent;
        self.bytes_received += rhs.bytes_received;
        self.integrity_failures += rhs.integrity_failures;
    }
}

impl std::iter::Sum for CounterSnapshot {
    fn sum<I: Iterator<Item = CounterSnapshot>>(iter: I) -> Self {
        iter.fold(CounterSnapshot::default(), |acc, s| acc + s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_and_delta() {
        let counters = Counters::new();
        counters.record_sent(100);
        counters.record_sent(100);
        counters.record_confirmed();
        counters.record_rejected();
        let first = counters.snapshot();
        assert_eq!(first.sent, 2);
        assert_eq!(first.bytes_sent, 200);
        assert_eq!(first.unconfirmed(), 0);

        counters.record_sent(100);
        let second = counters.snapshot();
        let delta = second.delta_since(&first);
        assert_eq!(delta.sent, 1);
        assert_eq!(delta.confirmed, 0);
        assert_eq!(second.unconfirmed(), 1);
    }

    #[test]
    fn test_sum_of_snapshots() {
        let a = CounterSnapshot {
            received: 10,
            acked: 8,
            ..Default::default()
        };
        let b = CounterSnapshot {
            received: 5,
            acked: 5,
            ..Default::default()
        };
        let total: CounterSnapshot = vec![a, b].into_iter().sum();
        assert_eq!(total.received, 15);
        assert_eq!(total.unacked(), 2);
    }

    #[test]
    fn test_concurrent_reader_sees_consistent_counts() {
        let counters = Arc::new(Counters::new());
        let writer = {
            let counters = counters.clone();
            std::thread::spawn(move || {
                for _ in 0..200_000 {
                    counters.record_sent(1);
                    counters.record_confirmed();
                    counters.record_received(1);
                    counters.record_acked(1);
                }
            })
        };

        let mut previous = CounterSnapshot::default();
        while !writer.is_finished() {
            let snapshot = counters.snapshot();
            assert!(snapshot.is_consistent(), "{:?}", snapshot);
            assert!(snapshot.sent >= previous.sent);
            assert!(snapshot.acked >= previous.acked);
            previous = snapshot;
        }
        writer.join().unwrap();

        let last = counters.snapshot();
        assert_eq!(last.confirmed, 200_000);
        assert!(last.is_consistent());
    }
}
