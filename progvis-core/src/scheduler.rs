//! Coalescing flush scheduler
//!
//! Collapses bursts of flush requests into one delivery attempt. Each
//! request pushes the deadline out to `now + wait`, but never past
//! `first + max_wait` where `first` is the earliest unflushed request of the
//! burst, so a steady stream of requests cannot starve delivery.
//!
//! Two windows share a single deadline:
//! - `coalesce` for ordinary step/log traffic (10s by default)
//! - `settle` for lifecycle transitions (100ms, capped at 1s)
//!
//! The scheduler does no I/O. The delivery worker sleeps until
//! [`CoalescingScheduler::deadline`] and calls [`CoalescingScheduler::fire`].

use tokio::time::{Duration, Instant};

/// Debounce window with a maximum-delay ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushWindow {
    /// Quiet period after the latest request
    pub wait: Duration,
    /// Ceiling measured from the first request of a burst
    pub max_wait: Duration,
}

impl FlushWindow {
    pub const fn new(wait: Duration, max_wait: Duration) -> Self {
        Self { wait, max_wait }
    }
}

#[derive(Debug, Default)]
struct Burst {
    first: Option<Instant>,
    deadline: Option<Instant>,
}

impl Burst {
    fn push(&mut self, now: Instant, window: FlushWindow) {
        let first = *self.first.get_or_insert(now);
        self.deadline = Some((now + window.wait).min(first + window.max_wait));
    }

    fn clear(&mut self) {
        self.first = None;
        self.deadline = None;
    }
}

/// Explicit "last fired" + "pending" state behind a single timer
#[derive(Debug)]
pub struct CoalescingScheduler {
    coalesce: FlushWindow,
    settle: FlushWindow,
    normal: Burst,
    forced: Burst,
    last_fired: Option<Instant>,
    fired: u64,
}

impl CoalescingScheduler {
    pub fn new(coalesce: FlushWindow, settle: FlushWindow) -> Self {
        Self {
            coalesce,
            settle,
            normal: Burst::default(),
            forced: Burst::default(),
            last_fired: None,
            fired: 0,
        }
    }

    /// Ask for a flush through the ordinary coalescing window
    pub fn request(&mut self, now: Instant) {
        self.normal.push(now, self.coalesce);
    }

    /// Ask for a prompt flush through the short settle window
    pub fn force(&mut self, now: Instant) {
        self.forced.push(now, self.settle);
    }

    /// Drop any pending flush
    pub fn cancel(&mut self) {
        self.normal.clear();
        self.forced.clear();
    }

    /// When the single armed timer should go off, if any
    pub fn deadline(&self) -> Option<Instant> {
        match (self.normal.deadline, self.forced.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    /// Returns true if the deadline has passed
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Record that the timer went off; the burst is consumed
    pub fn fire(&mut self, now: Instant) {
        self.cancel();
        self.last_fired = Some(now);
        self.fired += 1;
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }

    /// Number of times the timer has fired
    pub fn fired(&self) -> u64 {
        self.fired
    }
}
