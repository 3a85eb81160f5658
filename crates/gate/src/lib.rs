//! Concurrency gating for local inference backends.
//!
//! Local model servers degrade badly under concurrent load: a second request
//! against a llama.cpp or Ollama instance doubles latency or OOMs the
//! process outright. [`ConcurrencyGate`] caps in-flight requests at a small
//! fixed ceiling and queues the rest in FIFO order, with a per-request queue
//! timeout and optional adaptive throttling that shrinks the ceiling when
//! the backend starts erroring or slowing down.
//!
//! Cancellation is cooperative: a queued request aborts immediately, but a
//! request already running is only signalled through its own token and is
//! allowed to finish.

mod metrics;

pub use metrics::MetricsSnapshot;

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use turnstile_config::GateConfig;
use turnstile_core::{ClientError, EventBus, GateError, TelemetryEvent};

use crate::metrics::PerformanceMetrics;

/// Error-rate EWMA above which the ceiling is halved.
const ERROR_RATE_LIMIT: f64 = 0.2;

/// Average work latency above which the ceiling is reduced.
const SLOW_LATENCY_MS: f64 = 30_000.0;

const ERROR_CEILING_FACTOR: f64 = 0.5;
const LATENCY_CEILING_FACTOR: f64 = 0.7;

struct Waiter {
    ticket: Uuid,
    admit: oneshot::Sender<Result<(), GateError>>,
}

struct GateState {
    config: GateConfig,
    active: HashSet<Uuid>,
    queue: VecDeque<Waiter>,
    metrics: PerformanceMetrics,
}

/// Tracks one ticket for the whole of `execute`. Dropping it removes the
/// ticket wherever it currently lives — still queued, or holding an active
/// slot — so a caller dropping the future at any await point (an outer
/// timeout composed around `execute`) can never leak a slot. This also
/// closes the race where a grant is sent but the receiver is dropped before
/// it is polled: the ticket is already in `active` by then, and only the
/// guard releases it.
struct TicketGuard {
    state: Arc<Mutex<GateState>>,
    ticket: Uuid,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.retain(|w| w.ticket != self.ticket);
        if state.active.remove(&self.ticket) {
            ConcurrencyGate::pump(&mut state);
        }
    }
}

enum Admission {
    Immediate,
    Queued {
        rx: oneshot::Receiver<Result<(), GateError>>,
        timeout: Duration,
    },
}

/// Bounded-concurrency gate with FIFO queueing.
///
/// Cheap to clone; clones share one gate.
#[derive(Clone)]
pub struct ConcurrencyGate {
    state: Arc<Mutex<GateState>>,
    events: Option<Arc<EventBus>>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                config,
                active: HashSet::new(),
                queue: VecDeque::new(),
                metrics: PerformanceMetrics::default(),
            })),
            events: None,
        }
    }

    /// Attach a telemetry bus; queueing publishes `RequestThrottled`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run `work` under the gate.
    ///
    /// Admits immediately when a slot is free and nobody is queued ahead;
    /// otherwise waits in FIFO order up to the configured queue timeout.
    /// `cancel` aborts a queued request; once the work is running it is
    /// advisory and the work decides how to honor it.
    pub async fn execute<T, F>(
        &self,
        request_id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, GateError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let ticket = Uuid::new_v4();
        let guard = TicketGuard {
            state: Arc::clone(&self.state),
            ticket,
        };
        let queued_at = Instant::now();

        let admission = {
            let mut state = self.lock();
            if state.queue.is_empty() && state.active.len() < Self::effective_limit(&state) {
                state.active.insert(ticket);
                Admission::Immediate
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter { ticket, admit: tx });
                let queued = state.queue.len();
                let active = state.active.len();
                let timeout = Duration::from_millis(state.config.queue_timeout_ms);
                drop(state);

                debug!(request_id, queued, active, "request queued for execution slot");
                if let Some(events) = &self.events {
                    events.publish(TelemetryEvent::RequestThrottled {
                        request_id: request_id.to_string(),
                        queued,
                        active,
                        timestamp: Utc::now(),
                    });
                }
                Admission::Queued { rx, timeout }
            }
        };

        if let Admission::Queued { mut rx, timeout } = admission {
            tokio::select! {
                grant = &mut rx => Self::accept_grant(grant)?,
                _ = tokio::time::sleep(timeout) => {
                    if self.remove_from_queue(ticket) {
                        let waited_ms = queued_at.elapsed().as_millis() as u64;
                        warn!(request_id, waited_ms, "request timed out in gate queue");
                        return Err(GateError::QueueTimeout { waited_ms });
                    }
                    // A grant raced the timeout; it is sitting in the channel.
                    Self::accept_grant(rx.await)?;
                }
                _ = cancel.cancelled() => {
                    if self.remove_from_queue(ticket) {
                        debug!(request_id, "queued request cancelled");
                        return Err(GateError::Aborted);
                    }
                    Self::accept_grant(rx.await)?;
                }
            }
        }

        let wait_ms = queued_at.elapsed().as_millis() as u64;
        let started = Instant::now();
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        {
            let mut state = self.lock();
            match &outcome {
                Ok(Ok(_)) => state.metrics.record_success(latency_ms, wait_ms),
                // A cancellation says nothing about backend health.
                Ok(Err(ClientError::Cancelled)) => state.metrics.record_success(latency_ms, wait_ms),
                Ok(Err(_)) | Err(_) => state.metrics.record_failure(wait_ms),
            }
        }
        // Releases the slot and admits the next waiter.
        drop(guard);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GateError::Backend(e)),
            Err(panic) => {
                let reason = panic_message(panic);
                warn!(request_id, %reason, "gated work panicked");
                Err(GateError::WorkPanicked(reason))
            }
        }
    }

    /// Reject every queued request with [`GateError::QueueCleared`] and
    /// return how many were rejected. Active requests are untouched.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.lock();
        let drained: Vec<Waiter> = state.queue.drain(..).collect();
        drop(state);

        let rejected = drained.len();
        for waiter in drained {
            let _ = waiter.admit.send(Err(GateError::QueueCleared));
        }
        if rejected > 0 {
            debug!(rejected, "gate queue cleared");
        }
        rejected
    }

    /// Replace the gate's configuration. A raised ceiling admits queued
    /// requests immediately; a lowered one takes effect as slots free up.
    pub fn set_config(&self, config: GateConfig) {
        let mut state = self.lock();
        state.config = config;
        Self::pump(&mut state);
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.lock().metrics.snapshot()
    }

    /// Current ceiling after adaptive adjustments.
    pub fn current_limit(&self) -> usize {
        let state = self.lock();
        Self::effective_limit(&state)
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The lock is only held for queue bookkeeping; a poisoned state is
        // still coherent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn effective_limit(state: &GateState) -> usize {
        let base = state.config.max_concurrent_requests;
        if !state.config.adaptive_throttling {
            return base;
        }
        if state.metrics.error_rate() > ERROR_RATE_LIMIT {
            return ((base as f64 * ERROR_CEILING_FACTOR).floor() as usize).max(1);
        }
        if let Some(latency) = state.metrics.avg_latency_ms() {
            if latency > SLOW_LATENCY_MS {
                return ((base as f64 * LATENCY_CEILING_FACTOR).floor() as usize).max(1);
            }
        }
        base
    }

    /// Admit queued waiters while slots are free. Called with every slot
    /// release and config change, always under the state lock.
    fn pump(state: &mut GateState) {
        while state.active.len() < Self::effective_limit(state) {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.active.insert(waiter.ticket);
            if waiter.admit.send(Ok(())).is_err() {
                // Receiver gave up; free the slot for the next waiter.
                state.active.remove(&waiter.ticket);
            }
        }
    }

    /// Returns `true` when the ticket was still queued (and is now gone).
    fn remove_from_queue(&self, ticket: Uuid) -> bool {
        let mut state = self.lock();
        let before = state.queue.len();
        state.queue.retain(|w| w.ticket != ticket);
        state.queue.len() < before
    }

    fn accept_grant(
        grant: Result<Result<(), GateError>, oneshot::error::RecvError>,
    ) -> Result<(), GateError> {
        match grant {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GateError::Aborted),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(max: usize, timeout_ms: u64, adaptive: bool) -> GateConfig {
        GateConfig {
            max_concurrent_requests: max,
            queue_timeout_ms: timeout_ms,
            adaptive_throttling: adaptive,
        }
    }

    /// Spawn a gated request whose work blocks until `release` fires, then
    /// reports its id on `done`.
    fn spawn_blocked(
        gate: &ConcurrencyGate,
        id: usize,
        done: mpsc::UnboundedSender<usize>,
    ) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let gate = gate.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let result = gate
                .execute(&format!("req-{id}"), &cancel, async move {
                    let _ = release_rx.await;
                    Ok::<usize, ClientError>(id)
                })
                .await;
            if result.is_ok() {
                let _ = done.send(id);
            }
        });
        release_tx
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn caps_active_requests_and_admits_fifo() {
        let gate = ConcurrencyGate::new(config(2, 600_000, false));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let releases: Vec<_> = (0..4)
            .map(|i| spawn_blocked(&gate, i, done_tx.clone()))
            .collect();
        settle().await;

        assert_eq!(gate.active_count(), 2);
        assert_eq!(gate.queued_count(), 2);

        let mut order = Vec::new();
        for release in releases {
            let _ = release.send(());
            settle().await;
            order.push(done_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(gate.active_count(), 0);
        assert_eq!(gate.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_rejects_only_the_waiter() {
        let gate = ConcurrencyGate::new(config(1, 5_000, false));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let release = spawn_blocked(&gate, 0, done_tx.clone());
        settle().await;
        assert_eq!(gate.active_count(), 1);

        let cancel = CancellationToken::new();
        let result = gate
            .execute("late", &cancel, async { Ok::<(), ClientError>(()) })
            .await;
        match result {
            Err(GateError::QueueTimeout { waited_ms }) => assert!(waited_ms >= 5_000),
            other => panic!("expected queue timeout, got {other:?}"),
        }

        // The active request is unaffected by its neighbor's timeout.
        let _ = release.send(());
        assert_eq!(done_rx.recv().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_a_queued_request() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let _release = spawn_blocked(&gate, 0, done_tx);
        settle().await;

        let cancel = CancellationToken::new();
        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move {
            gate2
                .execute("cancelled", &cancel2, async { Ok::<(), ClientError>(()) })
                .await
        });
        settle().await;
        assert_eq!(gate.queued_count(), 1);

        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(GateError::Aborted)));
        assert_eq!(gate.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_rejects_every_waiter() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let _release = spawn_blocked(&gate, 0, done_tx);
        settle().await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                gate.execute(&format!("waiter-{i}"), &cancel, async {
                    Ok::<(), ClientError>(())
                })
                .await
            }));
        }
        settle().await;
        assert_eq!(gate.queued_count(), 3);

        assert_eq!(gate.clear_queue(), 3);
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(GateError::QueueCleared)));
        }
        assert_eq!(gate.active_count(), 1);
    }

    #[tokio::test]
    async fn backend_errors_shrink_the_ceiling() {
        let gate = ConcurrencyGate::new(config(4, 600_000, true));
        let cancel = CancellationToken::new();

        assert_eq!(gate.current_limit(), 4);
        for i in 0..6 {
            let result = gate
                .execute(&format!("fail-{i}"), &cancel, async {
                    Err::<(), ClientError>(ClientError::ApiError {
                        status_code: 500,
                        message: "backend overloaded".into(),
                    })
                })
                .await;
            assert!(matches!(result, Err(GateError::Backend(_))));
        }

        assert!(gate.metrics().error_rate > ERROR_RATE_LIMIT);
        assert_eq!(gate.current_limit(), 2);
    }

    #[tokio::test]
    async fn adaptive_ceiling_never_drops_below_one() {
        let gate = ConcurrencyGate::new(config(1, 600_000, true));
        let cancel = CancellationToken::new();
        for i in 0..10 {
            let _ = gate
                .execute(&format!("fail-{i}"), &cancel, async {
                    Err::<(), ClientError>(ClientError::Network("reset".into()))
                })
                .await;
        }
        assert_eq!(gate.current_limit(), 1);
    }

    #[tokio::test]
    async fn disabling_adaptive_throttling_keeps_the_base_limit() {
        let gate = ConcurrencyGate::new(config(4, 600_000, false));
        let cancel = CancellationToken::new();
        for i in 0..10 {
            let _ = gate
                .execute(&format!("fail-{i}"), &cancel, async {
                    Err::<(), ClientError>(ClientError::Network("reset".into()))
                })
                .await;
        }
        assert_eq!(gate.current_limit(), 4);
    }

    async fn panicking_work() -> Result<(), ClientError> {
        panic!("llama backend exploded")
    }

    #[tokio::test]
    async fn panicking_work_becomes_an_error_and_frees_the_slot() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let cancel = CancellationToken::new();

        let result = gate.execute("boom", &cancel, panicking_work()).await;
        match result {
            Err(GateError::WorkPanicked(message)) => {
                assert!(message.contains("llama backend exploded"));
            }
            other => panic!("expected panic error, got {other:?}"),
        }

        assert_eq!(gate.active_count(), 0);
        let value = gate
            .execute("after", &cancel, async { Ok::<u32, ClientError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn raising_the_limit_admits_queued_waiters() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let releases: Vec<_> = (0..3)
            .map(|i| spawn_blocked(&gate, i, done_tx.clone()))
            .collect();
        settle().await;
        assert_eq!(gate.queued_count(), 2);

        gate.set_config(config(3, 600_000, false));
        settle().await;
        assert_eq!(gate.active_count(), 3);
        assert_eq!(gate.queued_count(), 0);

        for release in releases {
            let _ = release.send(());
        }
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_publishes_throttle_telemetry() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let gate = ConcurrencyGate::new(config(1, 600_000, false)).with_events(bus);

        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        let _release = spawn_blocked(&gate, 0, done_tx.clone());
        settle().await;
        let _release2 = spawn_blocked(&gate, 1, done_tx);
        settle().await;

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            TelemetryEvent::RequestThrottled { queued, active, .. } => {
                assert_eq!(*queued, 1);
                assert_eq!(*active, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_an_in_flight_execute_frees_the_slot() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let cancel = CancellationToken::new();

        // A caller-composed deadline around `execute` drops the future
        // mid-work; the slot must come back anyway.
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            gate.execute("slow", &cancel, async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok::<(), ClientError>(())
            }),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(gate.active_count(), 0);

        let value = gate
            .execute("next", &cancel, async { Ok::<u32, ClientError>(9) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_execute_admits_the_next_waiter() {
        let gate = ConcurrencyGate::new(config(1, 600_000, false));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _ = tokio::time::timeout(
                    Duration::from_millis(50),
                    gate.execute("holder", &cancel, async {
                        tokio::time::sleep(Duration::from_secs(600)).await;
                        Ok::<(), ClientError>(())
                    }),
                )
                .await;
            })
        };
        settle().await;
        assert_eq!(gate.active_count(), 1);

        let release = spawn_blocked(&gate, 1, done_tx);
        settle().await;
        assert_eq!(gate.queued_count(), 1);

        // The holder's deadline fires and its execute future is dropped;
        // the queued request takes the freed slot.
        holder.await.unwrap();
        assert_eq!(gate.queued_count(), 0);
        assert_eq!(gate.active_count(), 1);

        let _ = release.send(());
        assert_eq!(done_rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn metrics_track_successes_and_failures() {
        let gate = ConcurrencyGate::new(config(2, 600_000, false));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            gate.execute("ok", &cancel, async { Ok::<(), ClientError>(()) })
                .await
                .unwrap();
        }
        let _ = gate
            .execute("bad", &cancel, async {
                Err::<(), ClientError>(ClientError::Timeout("60s".into()))
            })
            .await;

        let snap = gate.metrics();
        assert_eq!(snap.completed, 4);
        assert_eq!(snap.failed, 1);
        assert!(snap.error_rate > 0.0);
    }
}
