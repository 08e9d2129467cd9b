//! Session state and sequencing
//!
//! A [`Session`] is the mutable record of one monitored job. Steps and log
//! messages share one [`Sequencer`], so the collector can rebuild the
//! interleaving of both buffers from sequence numbers alone.
//!
//! ## Delivery split
//!
//! [`Session::detach`] swaps the event buffers for empty ones and returns a
//! [`Snapshot`] holding the detached events. Events recorded while that
//! snapshot is in flight accumulate separately. On failure
//! [`Session::reattach`] puts the detached events back in front of them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::{CollectedContext, ARGV_NOT_COLLECTED, HOST_NOT_COLLECTED};
use crate::error::{Error, Result};
use crate::types::{EventBatch, LogMessage, Outcome, SessionState, Step};

/// Session shared between the caller-facing reporter and the delivery worker
pub(crate) type SharedSession = Arc<Mutex<Session>>;

/// Lock a shared session, recovering the data if a holder panicked.
pub(crate) fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Issues sequence numbers shared by steps and log messages.
///
/// Never reset, never reused.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number
    pub fn issue(&mut self) -> u64 {
        let sequence = self.next;
        self.next += 1;
        sequence
    }

    /// Number of sequence numbers issued so far
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// Wire document describing a session at the moment a delivery began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
    pub argv: String,
    pub host: String,
    pub state: SessionState,
    #[serde(rename = "start")]
    pub start_time: i64,
    #[serde(rename = "end_ts")]
    pub end_time: Option<i64>,
    #[serde(rename = "expected")]
    pub expected_total: Option<i64>,
    #[serde(rename = "curr")]
    pub current_total: i64,
    pub steps: Vec<Step>,
    #[serde(rename = "msgs")]
    pub messages: Vec<LogMessage>,
    /// Client send time in Unix milliseconds
    pub client_ms: i64,
}

impl Snapshot {
    /// Give back the events carried by this snapshot
    pub fn into_events(self) -> EventBatch {
        EventBatch {
            steps: self.steps,
            messages: self.messages,
        }
    }
}

/// One monitored job
#[derive(Debug)]
pub struct Session {
    id: String,
    name: String,
    context: Option<CollectedContext>,
    state: SessionState,
    start_time: i64,
    end_time: Option<i64>,
    expected_total: Option<i64>,
    current_total: i64,
    steps: Vec<Step>,
    messages: Vec<LogMessage>,
    sequencer: Sequencer,
}

impl Session {
    /// Create a session in the `init` state with a fresh random id
    pub fn new(
        name: impl Into<String>,
        expected_total: Option<i64>,
        context: Option<CollectedContext>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.into(),
            context,
            state: SessionState::Init,
            start_time: unix_now(),
            end_time: None,
            expected_total,
            current_total: 0,
            steps: Vec::new(),
            messages: Vec::new(),
            sequencer: Sequencer::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> Option<&CollectedContext> {
        self.context.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }

    pub fn expected_total(&self) -> Option<i64> {
        self.expected_total
    }

    pub fn current_total(&self) -> i64 {
        self.current_total
    }

    /// Steps buffered locally and not yet delivered
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Log messages buffered locally and not yet delivered
    pub fn messages(&self) -> &[LogMessage] {
        &self.messages
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true when nothing is buffered
    pub fn is_drained(&self) -> bool {
        self.steps.is_empty() && self.messages.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::Terminal {
                name: self.name.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    /// Record a progress step.
    ///
    /// Returns true when this step moved the session from `init` to
    /// `running`.
    pub fn record_step(&mut self, delta: i64) -> Result<bool> {
        self.ensure_open()?;
        if delta <= 0 {
            return Err(Error::InvalidDelta(delta));
        }

        self.current_total = self
            .current_total
            .checked_add(delta)
            .ok_or(Error::TotalOverflow {
                total: self.current_total,
                delta,
            })?;
        self.steps.push(Step {
            sequence: self.sequencer.issue(),
            timestamp: unix_now(),
            delta,
        });

        if self.state == SessionState::Init {
            self.state = SessionState::Running;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record a log message, returning its sequence number
    pub fn record_message(&mut self, payload: serde_json::Value) -> Result<u64> {
        self.ensure_open()?;

        let sequence = self.sequencer.issue();
        self.messages.push(LogMessage {
            sequence,
            timestamp: unix_now(),
            payload,
        });
        Ok(sequence)
    }

    /// Move to a terminal state and stamp `end_time`
    pub fn finish(&mut self, outcome: Outcome) -> Result<()> {
        self.ensure_open()?;
        self.state = outcome.into();
        self.end_time = Some(unix_now());
        Ok(())
    }

    fn to_snapshot(&self, steps: Vec<Step>, messages: Vec<LogMessage>) -> Snapshot {
        let (argv, host) = match &self.context {
            Some(context) => (context.argv.clone(), context.host.clone()),
            None => (
                ARGV_NOT_COLLECTED.to_string(),
                HOST_NOT_COLLECTED.to_string(),
            ),
        };

        Snapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            argv,
            host,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            expected_total: self.expected_total,
            current_total: self.current_total,
            steps,
            messages,
            client_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Copy of the session without touching the buffers
    pub fn snapshot(&self) -> Snapshot {
        self.to_snapshot(self.steps.clone(), self.messages.clone())
    }

    /// Swap the buffers for empty ones and return them inside a snapshot
    pub fn detach(&mut self) -> Snapshot {
        let steps = std::mem::take(&mut self.steps);
        let messages = std::mem::take(&mut self.messages);
        self.to_snapshot(steps, messages)
    }

    /// Put events from a failed delivery back in front of the buffers.
    ///
    /// Allowed in terminal states: this restores data, it does not record new
    /// events.
    pub fn reattach(&mut self, mut events: EventBatch) {
        events.steps.append(&mut self.steps);
        events.messages.append(&mut self.messages);
        self.steps = events.steps;
        self.messages = events.messages;
    }
}
