//! End-to-end tests for the reporter, scheduler and delivery controller
//!
//! A scripted in-memory transport stands in for the collector. Tokio's clock
//! is paused, so coalescing windows and the request timeout elapse instantly
//! and deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use progvis_core::{
    logging, DeliveryFailure, Exchange, HaltReason, Reporter, ReporterConfig, SessionState,
    Snapshot, Transport,
};
use tokio::sync::Notify;
use tokio::time::sleep;

// ============================================
// Scripted transport
// ============================================

#[derive(Clone)]
enum Reply {
    Ok,
    Status(u16),
    Unauthorized,
    Network,
    /// Never answers; the reporter's timeout must fire
    Hang,
    /// Wait for the gate, then answer with the inner reply
    Held(Arc<Notify>, Box<Reply>),
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    sent: Mutex<Vec<Snapshot>>,
    tokens: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            sent: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn then(self: &Arc<Self>, reply: Reply) -> Arc<Self> {
        self.script.lock().unwrap().push_back(reply);
        Arc::clone(self)
    }

    fn sent(&self) -> Vec<Snapshot> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

async fn answer(mut reply: Reply) -> Exchange {
    if let Reply::Held(gate, inner) = reply {
        gate.notified().await;
        reply = *inner;
    }

    match reply {
        Reply::Ok => Exchange::Success {
            status: 200,
            body: "{\"ok\":true}".to_string(),
        },
        Reply::Status(status) => Exchange::from_response(status, "nope".to_string()),
        Reply::Unauthorized => Exchange::from_response(401, String::new()),
        Reply::Network => {
            Exchange::Failure(DeliveryFailure::Network("connection refused".to_string()))
        }
        Reply::Hang => {
            sleep(Duration::from_secs(3600)).await;
            Exchange::Success {
                status: 200,
                body: String::new(),
            }
        }
        Reply::Held(..) => unreachable!("holds do not nest"),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, snapshot: &Snapshot, token: &str) -> Exchange {
        self.sent.lock().unwrap().push(snapshot.clone());
        self.tokens.lock().unwrap().push(token.to_string());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let exchange = answer(reply).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        exchange
    }
}

fn with_token() -> ReporterConfig {
    ReporterConfig {
        token: Some("pv_test".to_string()),
        ..Default::default()
    }
}

fn start(config: &ReporterConfig, transport: &Arc<ScriptedTransport>) -> Reporter {
    logging::init_test();
    Reporter::with_transport(
        Some("test-job"),
        Some(10),
        config,
        Arc::clone(transport) as Arc<dyn Transport>,
    )
}

fn step_sequences(snapshot: &Snapshot) -> Vec<u64> {
    snapshot.steps.iter().map(|s| s.sequence).collect()
}

fn message_sequences(snapshot: &Snapshot) -> Vec<u64> {
    snapshot.messages.iter().map(|m| m.sequence).collect()
}

// ============================================
// Local-only operation
// ============================================

#[tokio::test(start_paused = true)]
async fn test_ten_steps_without_token_stay_local() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    reporter.step();
    assert_eq!(reporter.state(), SessionState::Running);
    for _ in 1..10 {
        reporter.step();
    }

    sleep(Duration::from_secs(30)).await;

    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.current_total, 10);
    assert_eq!(step_sequences(&snapshot), (0..10).collect::<Vec<u64>>());
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(reporter.stats().attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ten_steps_with_unreachable_collector_stay_buffered() {
    let transport = ScriptedTransport::new(Reply::Network);
    let reporter = start(&with_token(), &transport);

    for _ in 0..10 {
        reporter.step();
    }
    assert_eq!(reporter.state(), SessionState::Running);

    // attempts at 0.1s, 10.1s and 20.1s all fail
    sleep(Duration::from_secs(25)).await;

    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.current_total, 10);
    assert_eq!(step_sequences(&snapshot), (0..10).collect::<Vec<u64>>());
    assert_eq!(transport.sent_count(), 3);
    assert_eq!(reporter.stats().consecutive_failures, 3);
    assert_eq!(reporter.stats().halted, None);
}

// ============================================
// Misuse is absorbed
// ============================================

#[tokio::test(start_paused = true)]
async fn test_invalid_deltas_are_ignored() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    reporter.step_by(0);
    reporter.step_by(-5);

    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.current_total, 0);
    assert!(snapshot.steps.is_empty());
    assert_eq!(reporter.state(), SessionState::Init);
}

#[tokio::test(start_paused = true)]
async fn test_overflowing_step_is_ignored() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    reporter.step_by(i64::MAX);
    reporter.step();

    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.current_total, i64::MAX);
    assert_eq!(step_sequences(&snapshot), vec![0]);
    assert_eq!(reporter.state(), SessionState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_second_terminal_signal_is_a_no_op() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    reporter.step_by(3);
    reporter.done();
    let first = reporter.snapshot();
    assert_eq!(first.state, SessionState::Done);
    assert!(first.end_time.is_some());

    sleep(Duration::from_secs(2)).await;
    reporter.done();
    reporter.error();
    reporter.step();
    reporter.log("too late");

    let second = reporter.snapshot();
    assert_eq!(second.state, SessionState::Done);
    assert_eq!(second.end_time, first.end_time);
    assert_eq!(second.current_total, 3);
    assert_eq!(second.steps.len(), 1);
    assert!(second.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_log_payload_is_copied() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    let mut payload = serde_json::json!({"thing": 1, "result": 2});
    reporter.log(&payload);
    payload["result"] = serde_json::json!(99);

    let snapshot = reporter.snapshot();
    assert_eq!(snapshot.messages[0].payload["result"], 2);
}

// ============================================
// Delivery
// ============================================

#[tokio::test(start_paused = true)]
async fn test_construction_announces_init_state() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let _reporter = start(&with_token(), &transport);

    sleep(Duration::from_secs(1)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].state, SessionState::Init);
    assert_eq!(sent[0].name, "test-job");
    assert_eq!(sent[0].expected_total, Some(10));
    assert_eq!(transport.tokens.lock().unwrap()[0], "pv_test");
}

#[tokio::test(start_paused = true)]
async fn test_success_clears_sent_events_and_keeps_new_ones_in_order() {
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new(Reply::Ok).then(Reply::Held(
        Arc::clone(&gate),
        Box::new(Reply::Ok),
    ));
    let reporter = start(&with_token(), &transport);

    reporter.step(); // seq 0
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.sent_count(), 1);

    // recorded while the first exchange is in flight
    reporter.log(&serde_json::json!({"during": true})); // seq 1
    reporter.step(); // seq 2
    let local = reporter.snapshot();
    assert_eq!(step_sequences(&local), vec![2]);
    assert_eq!(message_sequences(&local), vec![1]);

    gate.notify_one();
    sleep(Duration::from_secs(20)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(step_sequences(&sent[0]), vec![0]);
    assert!(sent[0].messages.is_empty());
    assert_eq!(step_sequences(&sent[1]), vec![2]);
    assert_eq!(message_sequences(&sent[1]), vec![1]);

    let local = reporter.snapshot();
    assert!(local.steps.is_empty());
    assert!(local.messages.is_empty());
    assert_eq!(reporter.stats().successes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_exchange_is_merged_back_in_front() {
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new(Reply::Ok).then(Reply::Held(
        Arc::clone(&gate),
        Box::new(Reply::Status(503)),
    ));
    let reporter = start(&with_token(), &transport);

    reporter.step(); // seq 0
    reporter.log("before"); // seq 1
    sleep(Duration::from_secs(1)).await;

    reporter.step(); // seq 2
    reporter.log("during"); // seq 3

    gate.notify_one();
    sleep(Duration::from_secs(1)).await;

    let local = reporter.snapshot();
    assert_eq!(step_sequences(&local), vec![0, 2]);
    assert_eq!(message_sequences(&local), vec![1, 3]);
    assert_eq!(reporter.stats().consecutive_failures, 1);

    // retried through the coalescing window
    sleep(Duration::from_secs(15)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(step_sequences(&sent[1]), vec![0, 2]);
    assert_eq!(message_sequences(&sent[1]), vec![1, 3]);
    assert_eq!(reporter.stats().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_bursts_are_coalesced() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&with_token(), &transport);

    for _ in 0..100 {
        reporter.step();
    }
    sleep(Duration::from_secs(1)).await;
    // init announcement and the running transition collapse into one
    assert_eq!(transport.sent_count(), 1);

    for i in 0..50 {
        reporter.log(&serde_json::json!({ "i": i }));
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_secs(30)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].steps.len(), 100);
    assert_eq!(sent[0].state, SessionState::Running);
    assert_eq!(sent[1].messages.len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_traffic_is_not_starved() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&with_token(), &transport);

    reporter.step();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.sent_count(), 1);

    // one step every 500ms for 25s; a plain debounce would never fire
    for _ in 0..50 {
        reporter.step();
        sleep(Duration::from_millis(500)).await;
    }

    assert!(transport.sent_count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_flush_while_in_flight_is_deferred_not_overlapped() {
    let gate = Arc::new(Notify::new());
    let transport = ScriptedTransport::new(Reply::Ok).then(Reply::Held(
        Arc::clone(&gate),
        Box::new(Reply::Ok),
    ));
    let reporter = start(&with_token(), &transport);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.sent_count(), 1);

    reporter.step();
    reporter.done();
    sleep(Duration::from_millis(500)).await;
    // the settle timer fired but found an exchange in flight
    assert_eq!(transport.sent_count(), 1);

    gate.notify_one();
    sleep(Duration::from_secs(2)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].state, SessionState::Done);
    assert!(sent[1].end_time.is_some());
    assert_eq!(step_sequences(&sent[1]), vec![0]);
    assert_eq!(transport.max_active(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_disables_uploads() {
    let transport = ScriptedTransport::new(Reply::Ok).then(Reply::Unauthorized);
    let reporter = start(&with_token(), &transport);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(reporter.stats().halted, Some(HaltReason::Unauthorized));

    for _ in 0..3 {
        reporter.step();
    }
    reporter.done();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(transport.sent_count(), 1);
    let local = reporter.snapshot();
    assert_eq!(local.steps.len(), 3);
    assert_eq!(local.state, SessionState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_five_timeouts() {
    let transport = ScriptedTransport::new(Reply::Hang);
    let reporter = start(&with_token(), &transport);

    reporter.step();
    reporter.log("first");

    // each attempt times out after 5s and is retried 10s later
    sleep(Duration::from_secs(120)).await;

    assert_eq!(transport.sent_count(), 5);
    let stats = reporter.stats();
    assert_eq!(stats.attempts, 5);
    assert_eq!(stats.failures, 5);
    assert_eq!(stats.halted, Some(HaltReason::TooManyFailures));

    reporter.step();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.sent_count(), 5);

    let local = reporter.snapshot();
    assert_eq!(step_sequences(&local), vec![0, 2]);
    assert_eq!(message_sequences(&local), vec![1]);
    assert_eq!(local.current_total, 2);
}

// ============================================
// Shutdown
// ============================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_delivers_final_state() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&with_token(), &transport);

    reporter.step();
    reporter.log("only message");
    reporter.done();
    reporter.shutdown().await;

    let sent = transport.sent();
    let last = sent.last().expect("final delivery");
    assert_eq!(last.state, SessionState::Done);
    assert_eq!(last.steps.len(), 1);
    assert_eq!(last.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_token_sends_nothing() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&ReporterConfig::default(), &transport);

    reporter.step();
    reporter.done();
    let stats = reporter.shutdown().await;

    assert_eq!(transport.sent_count(), 0);
    assert_eq!(stats.attempts, 0);
}

#[test]
fn test_close_outside_runtime_uses_own_thread() {
    let transport = ScriptedTransport::new(Reply::Ok);
    let reporter = start(&with_token(), &transport);

    reporter.step_by(2);
    reporter.error();
    let stats = reporter.close();
    assert!(stats.successes >= 1);
    assert_eq!(stats.failures, 0);

    let sent = transport.sent();
    let last = sent.last().expect("final delivery");
    assert_eq!(last.state, SessionState::Error);
    assert_eq!(last.current_total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_collect_context_is_opt_in() {
    let transport = ScriptedTransport::new(Reply::Ok);

    let private = start(&ReporterConfig::default(), &transport);
    assert_eq!(private.snapshot().argv, "not collected");
    assert_eq!(private.snapshot().host, "not.collected");

    let config = ReporterConfig {
        collect_context: true,
        ..Default::default()
    };
    let public = start(&config, &transport);
    assert_ne!(public.snapshot().argv, "not collected");
    assert_ne!(public.snapshot().host, "not.collected");
}
