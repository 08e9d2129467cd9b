//! # progvis-core
//!
//! Core library for progvis - a client-side progress reporter.
//!
//! A long-running job records "advanced N steps" and log events; the
//! reporter buffers them locally and relays them to a remote collector
//! without blocking the job.
//!
//! This library provides:
//! - Session state with a shared event sequence
//! - A coalescing flush scheduler
//! - A gzip/JSON HTTP transport
//! - A delivery controller with retry and give-up rules
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! Reporter::step/log/done/error
//!     → Session (locked briefly)          → Signal to worker
//! Worker: CoalescingScheduler deadline    → DeliveryController::admit
//!     → Session::detach → Transport::deliver (5s timeout)
//!     → DeliveryController::settle        → clear / reattach / re-arm / halt
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use progvis_core::{Config, Reporter};
//!
//! let config = Config::load().expect("failed to load config");
//! let reporter_config = config.reporter.apply_env(|key| std::env::var(key).ok());
//!
//! let reporter = Reporter::start(Some("nightly-import"), Some(100), &reporter_config);
//! reporter.step();
//! reporter.log("imported first batch");
//! reporter.done();
//! reporter.close();
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, ReporterConfig};
pub use delivery::{DeliveryStats, HaltReason};
pub use error::{Error, Result};
pub use reporter::Reporter;
pub use session::{Session, Snapshot};
pub use transport::{DeliveryFailure, Exchange, HttpTransport, Transport};
pub use types::*;

// Public modules
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod reporter;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;

mod panic_capture;
mod worker;
