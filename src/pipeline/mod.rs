//! The in-process event bus: single logical ingress, fixed fan-out to
//! sinks (bounded intake, ordered shutdown) that always runs every sink
//! (store, frontend push, plugin manager, recent-ring buffer) rather
//! than short-circuiting, since every sink must see every accepted
//! event.

mod aggregate;
mod sessions;

pub use sessions::{SessionManager, SessionManagerConfig};

use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventLevel};
use crate::store::EventStore;
use aggregate::Aggregator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub intake_capacity: usize,
    pub warn_block_budget: Duration,
    pub recent_ring_capacity: usize,
    pub frontend_channel_capacity: usize,
    pub aggregation_window: Duration,
    pub max_derivation_depth: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            intake_capacity: 10_000,
            warn_block_budget: Duration::from_millis(50),
            recent_ring_capacity: 500,
            frontend_channel_capacity: 1000,
            aggregation_window: Duration::from_secs(1),
            max_derivation_depth: 3,
        }
    }
}

#[derive(Default)]
pub struct PipelineMetrics {
    pub queue_depth: AtomicI64,
    pub dropped_total: AtomicU64,
    pub depth_exceeded_total: AtomicU64,
    events_last_minute: Mutex<Vec<std::time::Instant>>,
}

impl PipelineMetrics {
    pub fn record_accept(&self) {
        let mut window = self.events_last_minute.lock().unwrap();
        let now = std::time::Instant::now();
        window.push(now);
        window.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
    }

    pub fn events_per_second_1m(&self) -> f64 {
        let window = self.events_last_minute.lock().unwrap();
        window.len() as f64 / 60.0
    }
}

/// Sinks registered on the pipeline; run in the fixed order the
/// fan-out step prescribes regardless of what each individual sink does.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    async fn accept(&self, event: &Event) -> CoreResult<Vec<Event>>;
}

/// Lossy newest-N ring buffer per session, sink (3) in the fan-out order.
pub struct RecentRing {
    capacity: usize,
    buffers: Mutex<HashMap<String, std::collections::VecDeque<Event>>>,
}

impl RecentRing {
    pub fn new(capacity: usize) -> Self {
        RecentRing {
            capacity,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, event: &Event) {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.entry(event.session_id.clone()).or_default();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(event.clone());
    }

    pub fn recent(&self, session_id: &str, limit: usize) -> Vec<Event> {
        let buffers = self.buffers.lock().unwrap();
        buffers
            .get(session_id)
            .map(|buf| buf.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

pub struct EventPipeline {
    config: PipelineConfig,
    intake_tx: mpsc::Sender<Event>,
    metrics: Arc<PipelineMetrics>,
    recent_ring: Arc<RecentRing>,
    frontend_tx: mpsc::Sender<Event>,
    frontend_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventPipeline {
    /// Spawns the intake task; `plugin_sink` is invoked in fan-out
    /// position (6) and may return derived events to re-emit.
    pub fn start(
        config: PipelineConfig,
        store: Arc<EventStore>,
        sessions: Arc<SessionManager>,
        plugin_sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (intake_tx, mut intake_rx) = mpsc::channel(config.intake_capacity);
        let (frontend_tx, frontend_rx) = mpsc::channel(config.frontend_channel_capacity);
        let metrics = Arc::new(PipelineMetrics::default());
        let recent_ring = Arc::new(RecentRing::new(config.recent_ring_capacity));
        let shutdown = Arc::new(Notify::new());

        let pipeline = Arc::new(EventPipeline {
            config: config.clone(),
            intake_tx: intake_tx.clone(),
            metrics: metrics.clone(),
            recent_ring: recent_ring.clone(),
            frontend_tx: frontend_tx.clone(),
            frontend_rx: Mutex::new(Some(frontend_rx)),
            shutdown: shutdown.clone(),
            worker: Mutex::new(None),
        });

        let loop_self = pipeline.clone();
        let handle = tokio::spawn(async move {
            let mut aggregator = Aggregator::new(config.aggregation_window);
            let sweep_interval = (config.aggregation_window / 4).max(Duration::from_millis(50));
            let mut sweep_ticker = tokio::time::interval(sweep_interval);
            sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe_event = intake_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                        loop_self
                            .fan_out(event, &sessions, &store, &frontend_tx, &recent_ring, &plugin_sink, &mut aggregator)
                            .await;
                    }
                    _ = sweep_ticker.tick() => {
                        // A run with no followup event on its device would
                        // otherwise sit open until shutdown; sweep expired
                        // windows on a timer so they reach the store promptly.
                        for event in aggregator.sweep_expired(std::time::Instant::now()) {
                            loop_self.dispatch(event, &store, &frontend_tx, &recent_ring, &plugin_sink).await;
                        }
                    }
                    _ = shutdown.notified() => {
                        // Drain whatever is already queued before closing, bounded by the
                        // shutdown cascade's drain deadline (enforced by the caller's timeout).
                        while let Ok(event) = intake_rx.try_recv() {
                            metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            loop_self
                                .fan_out(event, &sessions, &store, &frontend_tx, &recent_ring, &plugin_sink, &mut aggregator)
                                .await;
                        }
                        break;
                    }
                }
            }
            aggregator.flush_all(|event| {
                let _ = store.write_event(event);
            });
            debug!("pipeline intake loop stopped");
        });

        *pipeline.worker.lock().unwrap() = Some(handle);
        pipeline
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn recent_ring(&self) -> Arc<RecentRing> {
        self.recent_ring.clone()
    }

    pub fn take_frontend_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.frontend_rx.lock().unwrap().take()
    }

    /// Accepts a producer-submitted event. Full intake: `warn+` blocks
    /// up to `warn_block_budget`; `debug`/`info` are dropped immediately,
    /// incrementing `dropped_total`.
    pub async fn emit(&self, event: Event) -> CoreResult<()> {
        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        if event.level >= EventLevel::Warn {
            match tokio::time::timeout(self.config.warn_block_budget, self.intake_tx.send(event)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => {
                    self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    Err(CoreError::overload("pipeline intake closed"))
                }
                Err(_) => {
                    self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
                    Err(CoreError::overload("pipeline intake full, warn+ event dropped after budget"))
                }
            }
        } else {
            match self.intake_tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    self.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        }
    }

    async fn fan_out(
        &self,
        mut event: Event,
        sessions: &Arc<SessionManager>,
        store: &Arc<EventStore>,
        frontend_tx: &mpsc::Sender<Event>,
        recent_ring: &Arc<RecentRing>,
        plugin_sink: &Arc<dyn EventSink>,
        aggregator: &mut Aggregator,
    ) {
        // (1) session routing + id/relative_time assignment.
        if !sessions.resolve_and_stamp(&mut event) {
            return; // unbound event outside the allow-unbound set: dropped.
        }
        self.metrics.record_accept();

        // (2) coalesce identical consecutive events within the rolling window.
        if let Some(folded) = aggregator.offer(event) {
            self.dispatch(folded, store, frontend_tx, recent_ring, plugin_sink).await;
        }
    }

    async fn dispatch(
        &self,
        event: Event,
        store: &Arc<EventStore>,
        frontend_tx: &mpsc::Sender<Event>,
        recent_ring: &Arc<RecentRing>,
        plugin_sink: &Arc<dyn EventSink>,
    ) {
        // (3) recent-ring buffer: lossy, newest-N per session.
        recent_ring.push(&event);

        // (4) frontend push channel: lossy if the consumer is slow.
        let _ = frontend_tx.try_send(event.clone());

        // (5) store write buffer.
        if let Err(e) = store.write_event(event.clone()) {
            warn!(event_id = %event.id, error = %e, "store intake rejected event");
        }

        // (6) plugin manager; derived events are re-emitted with parent_event_id
        // set and depth incremented, discarded past the configured max.
        if event.derivation_depth >= self.config.max_derivation_depth {
            return;
        }
        match plugin_sink.accept(&event).await {
            Ok(derived) => {
                for mut d in derived {
                    let next_depth = event.derivation_depth + 1;
                    if next_depth > self.config.max_derivation_depth {
                        self.metrics.depth_exceeded_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    d.parent_event_id = Some(event.id.clone());
                    d.derivation_depth = next_depth;
                    let _ = self.emit(d).await;
                }
            }
            Err(e) => warn!(error = %e, "plugin manager rejected event"),
        }
    }

    /// Closes intake and awaits the worker, bounded by `deadline`.
    pub async fn stop(&self, deadline: Duration) {
        self.shutdown.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("pipeline drain exceeded deadline; stopping anyway");
            }
        }
    }
}
