//! Background delivery worker
//!
//! Runs on a Tokio runtime and owns the [`CoalescingScheduler`] and
//! [`DeliveryController`]. Record calls on the reporter only lock the session
//! and send a [`Signal`]; all waiting happens here.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};

use crate::delivery::{Admission, DeliveryController, DeliveryStats, FollowUp, HaltReason};
use crate::scheduler::CoalescingScheduler;
use crate::session::{lock, SharedSession, Snapshot};
use crate::transport::{DeliveryFailure, Exchange, Transport};

/// Requests from the reporter to the worker
#[derive(Debug)]
pub(crate) enum Signal {
    /// Flush through the coalescing window
    Request,
    /// Flush through the settle window (lifecycle transitions)
    Force,
    /// Deliver what is owed, then stop; acknowledged when done
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Exchange currently on the wire
struct InFlight {
    snapshot: Arc<Snapshot>,
    handle: JoinHandle<Exchange>,
}

impl InFlight {
    /// Events carried by the snapshot, for reattaching after a failure
    fn into_snapshot(self) -> Snapshot {
        Arc::try_unwrap(self.snapshot).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// Resolve the in-flight exchange, or never if there is none
async fn settled(in_flight: &mut Option<InFlight>) -> Exchange {
    match in_flight {
        Some(flight) => match (&mut flight.handle).await {
            Ok(exchange) => exchange,
            Err(e) => Exchange::Failure(DeliveryFailure::Network(format!(
                "delivery task failed: {}",
                e
            ))),
        },
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

pub(crate) struct Worker {
    session: SharedSession,
    transport: Arc<dyn Transport>,
    scheduler: CoalescingScheduler,
    controller: DeliveryController,
    request_timeout: Duration,
    stats: watch::Sender<DeliveryStats>,
}

impl Worker {
    pub(crate) fn new(
        session: SharedSession,
        transport: Arc<dyn Transport>,
        scheduler: CoalescingScheduler,
        controller: DeliveryController,
        request_timeout: Duration,
        stats: watch::Sender<DeliveryStats>,
    ) -> Self {
        Self {
            session,
            transport,
            scheduler,
            controller,
            request_timeout,
            stats,
        }
    }

    pub(crate) async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>) {
        let mut in_flight: Option<InFlight> = None;

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(Signal::Request) => self.scheduler.request(Instant::now()),
                    Some(Signal::Force) => self.scheduler.force(Instant::now()),
                    Some(Signal::Shutdown(ack)) => {
                        self.drain(in_flight.take()).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        return;
                    }
                    None => {
                        self.drain(in_flight.take()).await;
                        return;
                    }
                },
                _ = sleep_until_deadline(deadline) => {
                    self.scheduler.fire(Instant::now());
                    if let Some(flight) = self.begin() {
                        in_flight = Some(flight);
                    }
                }
                exchange = settled(&mut in_flight) => {
                    if let Some(flight) = in_flight.take() {
                        self.complete(flight, exchange);
                    }
                }
            }
        }
    }

    /// Ask the controller for permission and start an exchange
    fn begin(&mut self) -> Option<InFlight> {
        let admission = self.controller.admit();
        self.publish_stats();

        match admission {
            Admission::Proceed(token) => {
                let snapshot = Arc::new(lock(&self.session).detach());
                tracing::debug!(
                    session = %snapshot.id,
                    state = %snapshot.state,
                    steps = snapshot.steps.len(),
                    msgs = snapshot.messages.len(),
                    "Starting delivery"
                );

                let transport = Arc::clone(&self.transport);
                let payload = Arc::clone(&snapshot);
                let request_timeout = self.request_timeout;
                let handle = tokio::spawn(async move {
                    match timeout(request_timeout, transport.deliver(&payload, &token)).await {
                        Ok(exchange) => exchange,
                        Err(_) => Exchange::Failure(DeliveryFailure::Timeout),
                    }
                });

                Some(InFlight { snapshot, handle })
            }
            Admission::Deferred => {
                tracing::debug!("Delivery in flight, retry queued");
                None
            }
            Admission::Skipped(reason) => {
                tracing::trace!(?reason, "Delivery skipped");
                None
            }
        }
    }

    /// Apply an exchange outcome to the session and the scheduler
    fn complete(&mut self, flight: InFlight, exchange: Exchange) {
        let follow_up = self.controller.settle(&exchange);
        let snapshot = flight.into_snapshot();

        match &exchange {
            Exchange::Success { status, body } => {
                tracing::debug!(
                    session = %snapshot.id,
                    status,
                    response_bytes = body.len(),
                    "Delivered progress"
                );
            }
            Exchange::Failure(failure) => {
                tracing::warn!(
                    session = %snapshot.id,
                    error = %failure,
                    failures = self.controller.stats().consecutive_failures,
                    "Failed to deliver progress"
                );
                lock(&self.session).reattach(snapshot.into_events());
            }
        }

        let now = Instant::now();
        match follow_up {
            FollowUp::Idle => {}
            FollowUp::FlushNow => self.scheduler.force(now),
            FollowUp::FlushLater => self.scheduler.request(now),
            FollowUp::Halt(reason) => {
                self.scheduler.cancel();
                match reason {
                    HaltReason::Unauthorized => tracing::error!(
                        "Client token is invalid, uploads disabled for this process"
                    ),
                    HaltReason::TooManyFailures => tracing::error!(
                        failures = self.controller.stats().consecutive_failures,
                        "Giving up on uploads after repeated failures, data stays buffered locally"
                    ),
                }
            }
        }

        self.publish_stats();
    }

    /// Finish the in-flight exchange, then make one last attempt if owed
    async fn drain(&mut self, mut in_flight: Option<InFlight>) {
        let mut owed = self.scheduler.is_armed();
        self.scheduler.cancel();

        if in_flight.is_some() {
            let exchange = settled(&mut in_flight).await;
            if let Some(flight) = in_flight.take() {
                self.complete(flight, exchange);
            }
            owed |= self.scheduler.is_armed();
            self.scheduler.cancel();
        }

        owed |= !lock(&self.session).is_drained();
        if !owed {
            return;
        }

        let mut last = self.begin();
        if last.is_some() {
            let exchange = settled(&mut last).await;
            if let Some(flight) = last.take() {
                self.complete(flight, exchange);
            }
        }
        self.scheduler.cancel();
    }

    fn publish_stats(&self) {
        let stats = self.controller.stats().clone();
        self.stats.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}
