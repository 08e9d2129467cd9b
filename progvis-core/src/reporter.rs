//! Caller-facing progress reporter
//!
//! [`Reporter`] is what a monitored job talks to. Every call is synchronous
//! and returns without waiting on the network: it mutates the session under
//! a short lock and nudges the delivery worker. Nothing here ever returns an
//! error or panics on misuse; problems become `tracing` diagnostics.
//!
//! ```rust,no_run
//! use progvis_core::{Reporter, ReporterConfig};
//!
//! let config = ReporterConfig::default().apply_env(|key| std::env::var(key).ok());
//! let reporter = Reporter::start(Some("process-things"), Some(40), &config);
//! for thing in 0..40 {
//!     reporter.step();
//!     reporter.log(&serde_json::json!({ "thing": thing }));
//! }
//! reporter.done();
//! reporter.close();
//! ```

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ReporterConfig;
use crate::context::{resolve_name, CollectedContext};
use crate::delivery::{DeliveryController, DeliveryStats};
use crate::error::Result;
use crate::panic_capture;
use crate::scheduler::CoalescingScheduler;
use crate::session::{lock, Session, SharedSession, Snapshot};
use crate::transport::{DeliveryFailure, Exchange, HttpTransport, Transport};
use crate::types::{Outcome, SessionState};
use crate::worker::{Signal, Worker};

/// Where the delivery worker runs
enum WorkerHandle {
    /// Spawned onto the caller's Tokio runtime
    Task(tokio::task::JoinHandle<()>),
    /// Dedicated thread with its own current-thread runtime
    Thread(std::thread::JoinHandle<()>),
}

/// Buffers progress and log events for one job and relays them to the
/// collector in the background
pub struct Reporter {
    session: SharedSession,
    signals: mpsc::UnboundedSender<Signal>,
    stats: watch::Receiver<DeliveryStats>,
    worker: Option<WorkerHandle>,
}

impl Reporter {
    /// Start a session that uploads over HTTP.
    ///
    /// An invalid configuration is reported and the reporter runs local-only.
    pub fn start(name: Option<&str>, expected_total: Option<i64>, config: &ReporterConfig) -> Self {
        match HttpTransport::new(config) {
            Ok(transport) => Self::with_transport(name, expected_total, config, Arc::new(transport)),
            Err(e) => {
                tracing::error!(error = %e, "Progress uploads disabled");
                let local_only = ReporterConfig {
                    token: None,
                    collect_context: config.collect_context,
                    capture_panics: config.capture_panics,
                    ..ReporterConfig::default()
                };
                Self::with_transport(name, expected_total, &local_only, Arc::new(NullTransport))
            }
        }
    }

    /// Start a session that delivers through `transport`
    pub fn with_transport(
        name: Option<&str>,
        expected_total: Option<i64>,
        config: &ReporterConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        if !config.has_token() {
            tracing::error!(
                "Client token is required but is not configured, progress stays local"
            );
        }

        let context = config.collect_context.then(CollectedContext::gather);
        let session: SharedSession = Arc::new(Mutex::new(Session::new(
            resolve_name(name),
            expected_total,
            context,
        )));

        let (signals, receiver) = mpsc::unbounded_channel();
        let (stats_tx, stats) = watch::channel(DeliveryStats::default());

        let worker = Worker::new(
            Arc::clone(&session),
            transport,
            CoalescingScheduler::new(config.coalesce_window(), config.settle_window()),
            DeliveryController::new(config.token.clone(), config.max_consecutive_failures),
            config.timeout(),
            stats_tx,
        );

        if config.capture_panics {
            panic_capture::install(Arc::downgrade(&session), signals.clone());
        }

        let reporter = Self {
            worker: spawn_worker(worker, receiver),
            session,
            signals,
            stats,
        };

        {
            let session = lock(&reporter.session);
            tracing::info!(
                session = %session.id(),
                name = %session.name(),
                expected = ?session.expected_total(),
                "Progress session started"
            );
        }

        // announce the init state
        reporter.signal(Signal::Force);
        reporter
    }

    fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            tracing::trace!("Delivery worker is gone, progress stays local");
        }
    }

    /// Absorb a rejected call into a warning
    fn absorb<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring progress call");
                None
            }
        }
    }

    /// Record one unit of progress
    pub fn step(&self) {
        self.step_by(1);
    }

    /// Record `delta` units of progress; `delta` must be positive
    pub fn step_by(&self, delta: i64) {
        let result = lock(&self.session).record_step(delta);
        match self.absorb(result) {
            Some(true) => self.signal(Signal::Force),
            Some(false) => self.signal(Signal::Request),
            None => {}
        }
    }

    /// Record a log message.
    ///
    /// The payload is serialized immediately, so later changes by the
    /// caller do not leak into the buffer.
    pub fn log<T: Serialize + ?Sized>(&self, payload: &T) {
        let result = serde_json::to_value(payload)
            .map_err(Into::into)
            .and_then(|value| lock(&self.session).record_message(value));
        if self.absorb(result).is_some() {
            self.signal(Signal::Request);
        }
    }

    /// Mark the job as successfully finished
    pub fn done(&self) {
        self.finish(Outcome::Done);
    }

    /// Mark the job as failed
    pub fn error(&self) {
        self.finish(Outcome::Error);
    }

    fn finish(&self, outcome: Outcome) {
        let result = lock(&self.session).finish(outcome);
        if self.absorb(result).is_some() {
            tracing::info!(state = %SessionState::from(outcome), "Progress session finished");
            self.signal(Signal::Force);
        }
    }

    /// Session identifier
    pub fn id(&self) -> String {
        lock(&self.session).id().to_string()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session).state()
    }

    /// Copy of the session including undelivered events
    pub fn snapshot(&self) -> Snapshot {
        lock(&self.session).snapshot()
    }

    /// Delivery statistics as last published by the worker
    pub fn stats(&self) -> DeliveryStats {
        self.stats.borrow().clone()
    }

    /// Deliver what is owed and stop the worker, waiting for it.
    ///
    /// Blocks the calling thread when the worker has its own thread. Inside a
    /// Tokio runtime use [`Reporter::shutdown`] instead; here the request is
    /// only signalled. Returns the delivery statistics at that point.
    pub fn close(mut self) -> DeliveryStats {
        match self.worker.take() {
            Some(WorkerHandle::Thread(handle)) => {
                self.signal(Signal::Shutdown(None));
                if handle.join().is_err() {
                    tracing::error!("Delivery worker panicked");
                }
            }
            Some(WorkerHandle::Task(_)) => self.signal(Signal::Shutdown(None)),
            None => {}
        }
        self.stats()
    }

    /// Deliver what is owed, stop the worker and return final statistics
    pub async fn shutdown(mut self) -> DeliveryStats {
        let Some(worker) = self.worker.take() else {
            return self.stats();
        };
        let (ack, done) = oneshot::channel();
        self.signal(Signal::Shutdown(Some(ack)));

        match worker {
            WorkerHandle::Task(handle) => {
                let _ = done.await;
                let _ = handle.await;
            }
            WorkerHandle::Thread(handle) => {
                let _ = done.await;
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
            }
        }
        self.stats()
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if self.worker.take().is_some() {
            self.signal(Signal::Shutdown(None));
        }
    }
}

fn spawn_worker(worker: Worker, receiver: mpsc::UnboundedReceiver<Signal>) -> Option<WorkerHandle> {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return Some(WorkerHandle::Task(handle.spawn(worker.run(receiver))));
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create delivery runtime, progress stays local");
            return None;
        }
    };

    match std::thread::Builder::new()
        .name("progvis-delivery".to_string())
        .spawn(move || runtime.block_on(worker.run(receiver)))
    {
        Ok(handle) => Some(WorkerHandle::Thread(handle)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to spawn delivery thread, progress stays local");
            None
        }
    }
}

/// Stand-in when the HTTP transport cannot be configured; never given a token
struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn deliver(&self, _snapshot: &Snapshot, _token: &str) -> Exchange {
        Exchange::Failure(DeliveryFailure::Network(
            "no HTTP client available".to_string(),
        ))
    }
}
