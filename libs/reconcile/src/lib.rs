//! Reconciliation loop primitives.
//!
//! This library provides the bookkeeping a reconciliation loop needs that is
//! independent of what is being reconciled. Key concepts:
//!
//! - **Attempt**: one pass over a resource that ended in failure. Attempts
//!   are counted since the last success, not since the last trigger.
//! - **Flight**: a pass currently executing for a key. At most one flight
//!   exists per key; triggers that arrive meanwhile are coalesced into a
//!   single rerun.
//! - **Deadline**: a wall-clock budget measured from the first time an
//!   operation was attempted, surviving across retries.
//!
//! # Invariants
//!
//! - A key is never in flight twice
//! - Coalescing is bounded: any number of concurrent triggers yields at most
//!   one rerun
//! - Attempt counters only move forward until explicitly cleared

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// An operation outlived its deadline.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// The retry budget is spent.
    #[error("{resource} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        resource: String,
        attempts: u32,
        last_error: String,
    },
}

/// Convergence status for a resource after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Current matches desired.
    Converged,

    /// Progress was made but another pass is needed.
    Converging,

    /// Requires intervention; automatic passes have stopped.
    Diverged,

    /// The resource no longer exists.
    Gone,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged | Self::Gone)
    }

    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,

    /// No retries remain.
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
struct Attempts {
    count: u32,
    last_error: String,
}

/// Failed-attempt bookkeeping per key.
///
/// With `max_retries = n` a key may fail `n + 1` times; the last of those is
/// reported as exhausted.
#[derive(Debug)]
pub struct AttemptTracker<K> {
    max_retries: u32,
    attempts: Mutex<HashMap<K, Attempts>>,
}

impl<K: Eq + Hash + Clone> AttemptTracker<K> {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a failure for `key`.
    pub fn record_failure(&self, key: &K, error: impl Into<String>) -> AttemptOutcome {
        let mut attempts = self.attempts.lock();
        let entry = attempts.entry(key.clone()).or_insert(Attempts {
            count: 0,
            last_error: String::new(),
        });
        entry.count += 1;
        entry.last_error = error.into();

        AttemptOutcome {
            attempt: entry.count,
            exhausted: entry.count > self.max_retries,
        }
    }

    /// Failed attempts recorded for `key` since it was last cleared.
    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts.lock().get(key).map_or(0, |a| a.count)
    }

    pub fn last_error(&self, key: &K) -> Option<String> {
        self.attempts.lock().get(key).map(|a| a.last_error.clone())
    }

    pub fn is_exhausted(&self, key: &K) -> bool {
        self.attempts(key) > self.max_retries
    }

    /// Forget every failure for `key` (on success, a new generation, or an
    /// explicit re-trigger).
    pub fn clear(&self, key: &K) {
        self.attempts.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deadlines measured from the first time each key was started.
///
/// Uses tokio's clock so paused-time tests can drive it.
#[derive(Debug)]
pub struct DeadlineTracker<K> {
    budget: Duration,
    started: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> DeadlineTracker<K> {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Start the clock for `key` if it is not already running and return the
    /// time left.
    pub fn start(&self, key: &K) -> Duration {
        let now = Instant::now();
        let started = *self.started.lock().entry(key.clone()).or_insert(now);
        self.budget.saturating_sub(now.duration_since(started))
    }

    /// Time since `key` was first started.
    pub fn elapsed(&self, key: &K) -> Option<Duration> {
        self.started.lock().get(key).map(|s| s.elapsed())
    }

    /// Time left for `key`, or `None` when its clock is not running.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        self.elapsed(key).map(|e| self.budget.saturating_sub(e))
    }

    /// The budget is spent for `key`.
    pub fn is_expired(&self, key: &K) -> bool {
        self.elapsed(key).is_some_and(|e| e >= self.budget)
    }

    pub fn clear(&self, key: &K) {
        self.started.lock().remove(key);
    }
}

#[derive(Debug, Default)]
struct Flight {
    dirty: bool,
}

type Flights<K> = Arc<Mutex<HashMap<K, Flight>>>;

/// Per-key single-flight guard.
///
/// ```text
/// trigger(a) ──> Acquired ───────── pass ───────── take_rerun? yes ── pass ── take_rerun? no ──> released
/// trigger(a) ──────> Coalesced (marks dirty)
/// trigger(a) ────────────> Coalesced (already dirty)
/// ```
///
/// Entries exist only while a key is in flight, so the map never outgrows
/// the set of concurrently running passes.
#[derive(Debug)]
pub struct KeyedFlight<K> {
    flights: Flights<K>,
}

impl<K> Clone for KeyedFlight<K> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`KeyedFlight::try_acquire`].
#[derive(Debug)]
pub enum Acquire<K: Eq + Hash + Clone> {
    /// The caller owns the key until the permit is released.
    Acquired(FlightPermit<K>),

    /// Another pass holds the key and will rerun once.
    Coalesced,
}

impl<K: Eq + Hash + Clone> KeyedFlight<K> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn try_acquire(&self, key: &K) -> Acquire<K> {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get_mut(key) {
            flight.dirty = true;
            return Acquire::Coalesced;
        }
        flights.insert(key.clone(), Flight::default());
        Acquire::Acquired(FlightPermit {
            key: key.clone(),
            flights: Arc::clone(&self.flights),
            released: false,
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.lock().contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

/// Exclusive hold on one key.
#[derive(Debug)]
pub struct FlightPermit<K: Eq + Hash + Clone> {
    key: K,
    flights: Flights<K>,
    released: bool,
}

impl<K: Eq + Hash + Clone> FlightPermit<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Consume a pending rerun request.
    ///
    /// Returns `true` when a trigger was coalesced during the pass; the
    /// permit is still held and the caller must run again. Returns `false`
    /// and releases the key otherwise. The check and the release happen
    /// under one lock, so no trigger can slip between them.
    pub fn take_rerun(&mut self) -> bool {
        let mut flights = self.flights.lock();
        match flights.get_mut(&self.key) {
            Some(flight) if flight.dirty => {
                flight.dirty = false;
                true
            }
            _ => {
                flights.remove(&self.key);
                self.released = true;
                false
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightPermit<K> {
    fn drop(&mut self) {
        if !self.released {
            self.flights.lock().remove(&self.key);
        }
    }
}

/// Default resync period.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Default retry limit per resource.
pub const DEFAULT_MAXIMUM_RETRY: u32 = 10;

/// Default delay before a failed pass is retried.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default budget for tearing a resource down.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_attempt_tracker() {
        let tracker = AttemptTracker::new(2);

        assert_eq!(
            tracker.record_failure(&"vm-1", "e1"),
            AttemptOutcome { attempt: 1, exhausted: false }
        );
        assert!(!tracker.record_failure(&"vm-1", "e2").exhausted);
        let third = tracker.record_failure(&"vm-1", "e3");
        assert_eq!(third.attempt, 3);
        assert!(third.exhausted);

        assert!(tracker.is_exhausted(&"vm-1"));
        assert!(!tracker.is_exhausted(&"vm-2"));
        assert_eq!(tracker.last_error(&"vm-1").as_deref(), Some("e3"));

        tracker.clear(&"vm-1");
        assert_eq!(tracker.attempts(&"vm-1"), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_zero_retries_exhausts_on_first_failure() {
        let tracker = AttemptTracker::new(0);
        assert!(tracker.record_failure(&1u32, "boom").exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_measured_from_first_start() {
        let deadlines = DeadlineTracker::new(Duration::from_secs(10));

        assert_eq!(deadlines.start(&"vm"), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(deadlines.start(&"vm"), Duration::from_secs(6));
        assert!(!deadlines.is_expired(&"vm"));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(deadlines.start(&"vm"), Duration::ZERO);
        assert!(deadlines.is_expired(&"vm"));

        deadlines.clear(&"vm");
        assert!(deadlines.elapsed(&"vm").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_reads_without_starting() {
        let deadlines = DeadlineTracker::new(Duration::from_secs(10));
        assert!(deadlines.remaining(&"vm").is_none());

        deadlines.start(&"vm");
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(deadlines.remaining(&"vm"), Some(Duration::from_secs(7)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(deadlines.remaining(&"vm"), Some(Duration::ZERO));
    }

    #[test]
    fn test_flight_coalesces_into_single_rerun() {
        let flights = KeyedFlight::new();

        let Acquire::Acquired(mut permit) = flights.try_acquire(&"vm") else {
            panic!("first acquire must succeed");
        };
        assert!(matches!(flights.try_acquire(&"vm"), Acquire::Coalesced));
        assert!(matches!(flights.try_acquire(&"vm"), Acquire::Coalesced));
        assert!(matches!(flights.try_acquire(&"other"), Acquire::Acquired(_)));

        assert!(permit.take_rerun());
        assert!(flights.is_in_flight(&"vm"));
        assert!(!permit.take_rerun());
        assert!(!flights.is_in_flight(&"vm"));
        assert_eq!(flights.in_flight(), 0);
    }

    #[test]
    fn test_dropped_permit_releases_key() {
        let flights = KeyedFlight::new();
        {
            let _permit = flights.try_acquire(&"vm");
            assert!(flights.is_in_flight(&"vm"));
        }
        assert!(matches!(flights.try_acquire(&"vm"), Acquire::Acquired(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_flight_per_key() {
        let flights = KeyedFlight::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = flights.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let passes = Arc::clone(&passes);
            handles.push(tokio::spawn(async move {
                let Acquire::Acquired(mut permit) = flights.try_acquire(&"vm") else {
                    return;
                };
                loop {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    passes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if !permit.take_rerun() {
                        break;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(passes.load(Ordering::SeqCst) >= 1);
        assert!(!flights.is_in_flight(&"vm"));
    }

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(ConvergenceStatus::Gone.is_converged());
        assert!(ConvergenceStatus::Converging.is_converging());
        assert!(!ConvergenceStatus::Diverged.is_converged());
    }
}
