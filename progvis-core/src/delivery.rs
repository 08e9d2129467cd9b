//! Delivery controller
//!
//! Decides whether a flush may start an exchange and what to do once it
//! resolves. It owns the token, the in-flight flag, the pending-retry flag
//! and the consecutive-failure count. It never touches the session; the
//! worker restores buffers when [`DeliveryController::settle`] reports a
//! failure.
//!
//! - At most one exchange is in flight. A flush arriving meanwhile sets the
//!   retry flag instead.
//! - Success resets the failure count; a pending retry flushes again at once.
//! - A retryable failure re-arms a flush, promptly if a retry was pending.
//! - 401 clears the token and halts uploads for good.
//! - Reaching `max_consecutive_failures` halts uploads for good.

use crate::transport::{DeliveryFailure, Exchange};

/// Why uploads stopped permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Collector rejected the token
    Unauthorized,
    /// Too many consecutive retryable failures
    TooManyFailures,
}

/// Why a flush did not start an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No token configured; running local-only
    NoToken,
    Halted(HaltReason),
}

/// Answer to "may I start an exchange now?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start an exchange authenticated with this token
    Proceed(String),
    /// One is already in flight; retry flagged for when it resolves
    Deferred,
    Skipped(SkipReason),
}

/// What to schedule after an exchange resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Nothing owed
    Idle,
    /// Flush again through the settle window
    FlushNow,
    /// Flush again through the coalescing window
    FlushLater,
    /// Uploads are over
    Halt(HaltReason),
}

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Exchanges started
    pub attempts: u64,
    /// Exchanges acknowledged by the collector
    pub successes: u64,
    /// Exchanges that failed for any reason
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Set once uploads stop for good
    pub halted: Option<HaltReason>,
}

/// Arbitrates flushes against the single in-flight exchange
#[derive(Debug)]
pub struct DeliveryController {
    token: Option<String>,
    in_flight: bool,
    retry_requested: bool,
    max_consecutive_failures: u32,
    stats: DeliveryStats,
}

impl DeliveryController {
    /// Blank tokens count as missing
    pub fn new(token: Option<String>, max_consecutive_failures: u32) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
            in_flight: false,
            retry_requested: false,
            max_consecutive_failures: max_consecutive_failures.max(1),
            stats: DeliveryStats::default(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn retry_requested(&self) -> bool {
        self.retry_requested
    }

    pub fn halted(&self) -> Option<HaltReason> {
        self.stats.halted
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Decide whether a flush may start an exchange
    pub fn admit(&mut self) -> Admission {
        if let Some(reason) = self.stats.halted {
            return Admission::Skipped(SkipReason::Halted(reason));
        }
        let Some(token) = self.token.clone() else {
            return Admission::Skipped(SkipReason::NoToken);
        };
        if self.in_flight {
            self.retry_requested = true;
            return Admission::Deferred;
        }

        self.in_flight = true;
        self.stats.attempts += 1;
        Admission::Proceed(token)
    }

    /// Record the outcome of the in-flight exchange
    pub fn settle(&mut self, exchange: &Exchange) -> FollowUp {
        self.in_flight = false;

        match exchange {
            Exchange::Success { .. } => {
                self.stats.successes += 1;
                self.stats.consecutive_failures = 0;
                if std::mem::take(&mut self.retry_requested) {
                    FollowUp::FlushNow
                } else {
                    FollowUp::Idle
                }
            }
            Exchange::Failure(failure) => {
                self.stats.failures += 1;
                self.stats.consecutive_failures += 1;
                self.settle_failure(failure)
            }
        }
    }

    fn settle_failure(&mut self, failure: &DeliveryFailure) -> FollowUp {
        if !failure.is_retryable() {
            self.token = None;
            return self.halt(HaltReason::Unauthorized);
        }
        if self.stats.consecutive_failures >= self.max_consecutive_failures {
            return self.halt(HaltReason::TooManyFailures);
        }
        if std::mem::take(&mut self.retry_requested) {
            FollowUp::FlushNow
        } else {
            FollowUp::FlushLater
        }
    }

    fn halt(&mut self, reason: HaltReason) -> FollowUp {
        self.retry_requested = false;
        self.stats.halted = Some(reason);
        FollowUp::Halt(reason)
    }
}
