//! Core domain types for progvis
//!
//! These types describe one monitored job as it is buffered locally and
//! relayed to the progress collector.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One monitored job, from construction to a terminal state |
//! | **Step** | "I advanced N units" event recorded by the job |
//! | **Log message** | Arbitrary JSON payload recorded by the job |
//! | **Sequence** | Counter shared by steps and log messages; orders both buffers |
//! | **Snapshot** | Copy of the session taken when a delivery attempt begins |

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================
// Lifecycle
// ============================================

/// Lifecycle state of a session.
///
/// `Init` → `Running` → `Done` | `Error`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Constructed, no step recorded yet
    #[default]
    Init,
    /// At least one step recorded
    Running,
    /// Caller signalled success
    Done,
    /// Caller signalled failure, or an uncaught panic was captured
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Running => "running",
            SessionState::Done => "done",
            SessionState::Error => "error",
        }
    }

    /// Returns true for `Done` and `Error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(SessionState::Init),
            "running" => Ok(SessionState::Running),
            "done" => Ok(SessionState::Done),
            "error" => Ok(SessionState::Error),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// How a session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error,
}

impl From<Outcome> for SessionState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => SessionState::Done,
            Outcome::Error => SessionState::Error,
        }
    }
}

// ============================================
// Buffered events
// ============================================

/// A recorded progress step.
///
/// Field names on the wire are `s`, `t`, `p`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the session-wide sequence
    #[serde(rename = "s")]
    pub sequence: u64,
    /// Unix timestamp (seconds) when the step was recorded
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Units advanced; always positive
    #[serde(rename = "p")]
    pub delta: i64,
}

/// A recorded log message.
///
/// Field names on the wire are `s`, `t`, `m`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Position in the session-wide sequence
    #[serde(rename = "s")]
    pub sequence: u64,
    /// Unix timestamp (seconds) when the message was recorded
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Owned copy of the caller's payload
    #[serde(rename = "m")]
    pub payload: serde_json::Value,
}

/// Events detached from a session for one delivery attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub steps: Vec<Step>,
    pub messages: Vec<LogMessage>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len() + self.messages.len()
    }
}
