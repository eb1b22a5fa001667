//! Top-level coordinator wiring the bus, registry, and algorithm together.
//!
//! The manager owns the algorithm instance and its context, subscribes to
//! the L1 topic, fans enqueued messages out to worker tasks, drives the
//! algorithm's periodic update, emits the L2 heartbeat, and evicts silent
//! nodes. All algorithm calls are serialized: workers, the ticker, and
//! the monitor all take the context lock before touching the algorithm.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fusion_bus::{BusTransport, MessageHandler};

use crate::algorithm::{AlgorithmError, FusionAlgorithm};
use crate::clock::{epoch_millis, Clock, SystemClock};
use crate::context::AlgorithmContext;
use crate::messages::{self, L1Payload, L1ToL2Message, L2Payload, L2ToL1Message, SystemCommand};
use crate::registry::NodeRegistry;

/// How long an idle worker waits before re-checking the running flag.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Coordinator configuration. Defaults match the deployed system.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub bus_url: String,
    pub l1_to_l2_topic: String,
    pub l2_to_l1_topic: String,
    pub heartbeat_topic: String,

    /// Silence after which an L1 node is evicted.
    pub node_timeout: Duration,
    /// Cadence of the L2 liveness heartbeat.
    pub heartbeat_interval: Duration,
    /// Cadence of the algorithm's periodic update.
    pub algorithm_update_interval: Duration,

    pub worker_threads: usize,
    pub message_queue_size: usize,

    pub debug: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            bus_url: "redis://127.0.0.1:6379".to_string(),
            l1_to_l2_topic: "l1_to_l2".to_string(),
            l2_to_l1_topic: "l2_to_l1".to_string(),
            heartbeat_topic: "l2_heartbeat".to_string(),
            node_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            algorithm_update_interval: Duration::from_millis(100),
            worker_threads: 2,
            message_queue_size: 1000,
            debug: false,
        }
    }
}

/// Configuration-level failures surfaced at the start/set boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no algorithm set; call set_algorithm before start")]
    NoAlgorithm,

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("cannot change the algorithm while the system is running")]
    AlgorithmChangeWhileRunning,
}

/// Manager lifecycle: Created -> Ready (algorithm set) -> Running -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Ready,
    Running,
    Stopped,
}

/// Read-only runtime snapshot.
#[derive(Debug, Clone)]
pub struct SystemStats {
    pub messages_processed: u64,
    pub messages_sent: u64,
    pub active_nodes: usize,
    pub uptime: Duration,
    pub current_algorithm_state: String,
}

// ============================================================================
// BOUNDED MESSAGE QUEUE
// ============================================================================

/// Bounded FIFO with drop-oldest overflow, paired with a notifier that
/// wakes one idle worker per push.
pub struct BoundedQueue {
    inner: Mutex<VecDeque<L1ToL2Message>>,
    notify: Notify,
    capacity: usize,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a message. At capacity the oldest message is dropped to
    /// make room; fresh data beats stale data for fusion.
    pub fn push(&self, message: L1ToL2Message) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                warn!("message queue full, dropping oldest message");
                queue.pop_front();
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<L1ToL2Message> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Resolves when a push (or shutdown broadcast) signals the queue.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wakes every waiting worker, used on shutdown.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

// ============================================================================
// FUSION MANAGER
// ============================================================================

struct StatsCounters {
    messages_processed: AtomicU64,
    messages_sent: AtomicU64,
    start_time: Instant,
}

/// The L2 coordinator.
pub struct FusionManager {
    config: FusionConfig,
    bus: Arc<dyn BusTransport>,

    registry: Arc<NodeRegistry>,
    algorithm: RwLock<Option<Arc<dyn FusionAlgorithm>>>,
    context: Mutex<AlgorithmContext>,
    queue: Arc<BoundedQueue>,

    running: Arc<AtomicBool>,
    lifecycle: Mutex<ManagerState>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Flipped on stop; the subscription loop and every periodic sleep
    /// select on it so shutdown never waits out a full interval.
    shutdown: Mutex<Option<watch::Sender<bool>>>,

    stats: StatsCounters,
    /// Instance-scoped counter behind `L2_<n>` message ids. Two managers
    /// in one process produce overlapping ids on purpose; each is its
    /// own isolated L2 instance.
    message_counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl FusionManager {
    pub fn new(config: FusionConfig, bus: Arc<dyn BusTransport>) -> Arc<Self> {
        Self::with_clock(config, bus, Arc::new(SystemClock))
    }

    /// Test entry point: inject the clock driving the registry and the
    /// algorithm context.
    pub fn with_clock(
        config: FusionConfig,
        bus: Arc<dyn BusTransport>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let queue = Arc::new(BoundedQueue::new(config.message_queue_size));
        Arc::new(Self {
            registry: Arc::new(NodeRegistry::with_clock(Arc::clone(&clock))),
            algorithm: RwLock::new(None),
            context: Mutex::new(AlgorithmContext::with_clock(Arc::clone(&clock))),
            queue,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(ManagerState::Created),
            handles: tokio::sync::Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            stats: StatsCounters {
                messages_processed: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                start_time: clock.now(),
            },
            message_counter: AtomicU64::new(0),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn state(&self) -> ManagerState {
        *self.lifecycle.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Installs the fusion algorithm. Refused while running.
    pub fn set_algorithm(&self, algorithm: Box<dyn FusionAlgorithm>) -> Result<(), ConfigError> {
        if self.is_running() {
            return Err(ConfigError::AlgorithmChangeWhileRunning);
        }
        info!(algorithm = algorithm.name(), "algorithm installed");
        *self.algorithm.write() = Some(Arc::from(algorithm));
        *self.lifecycle.lock() = ManagerState::Ready;
        Ok(())
    }

    /// Starts the coordinator: initializes the algorithm, then spawns
    /// the workers, ticker, heartbeat, monitor, and bus subscription.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConfigError> {
        if self.is_running() {
            return Ok(());
        }

        // Initialize under the exclusive algorithm lock; nothing else is
        // running yet, but lifecycle calls never share with dispatch.
        {
            let algorithm = self.algorithm.write();
            let algorithm = algorithm.as_ref().ok_or(ConfigError::NoAlgorithm)?;
            let mut ctx = self.context.lock();
            ctx.update_interval = self.config.algorithm_update_interval;
            if let Err(e) = algorithm.initialize(&mut ctx) {
                error!(error = %e, "algorithm initialize failed");
            }
        }

        self.running.store(true, Ordering::Release);
        *self.lifecycle.lock() = ManagerState::Running;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        let mut handles = self.handles.lock().await;
        for n in 0..self.config.worker_threads {
            let mgr = Arc::clone(self);
            handles.push(tokio::spawn(async move { mgr.worker_loop(n).await }));
        }

        let mgr = Arc::clone(self);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { mgr.ticker_loop(rx).await }));

        let mgr = Arc::clone(self);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { mgr.heartbeat_loop(rx).await }));

        let mgr = Arc::clone(self);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { mgr.monitor_loop(rx).await }));

        let mgr = Arc::clone(self);
        handles.push(tokio::spawn(async move { mgr.subscription_loop(shutdown_rx).await }));

        info!(
            algorithm = self.algorithm_name().as_deref().unwrap_or("?"),
            workers = self.config.worker_threads,
            "fusion manager started"
        );
        Ok(())
    }

    /// Stops everything: flips the running flag, wakes and joins every
    /// task, then shuts the algorithm down. An algorithm shutdown error
    /// is reported only after all tasks have joined.
    pub async fn stop(&self) -> Result<(), AlgorithmError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        *self.lifecycle.lock() = ManagerState::Stopped;

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        self.queue.wake_all();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "task join failed during shutdown");
            }
        }
        drop(handles);

        // Whatever is still queued dies with the run.
        self.queue.clear();

        let result = {
            let algorithm = self.algorithm.write();
            match algorithm.as_ref() {
                Some(algorithm) => {
                    let mut ctx = self.context.lock();
                    algorithm.shutdown(&mut ctx)
                }
                None => Ok(()),
            }
        };

        info!("fusion manager stopped");
        result
    }

    pub fn algorithm_name(&self) -> Option<String> {
        self.algorithm.read().as_ref().map(|a| a.name().to_string())
    }

    /// Delivers an external trigger to the algorithm and publishes any
    /// outputs it produced.
    pub async fn trigger_algorithm_event(&self, trigger: &str, data: Option<&str>) {
        let outputs = self.run_trigger(trigger, data);
        self.publish_outputs(outputs).await;
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            messages_processed: self.stats.messages_processed.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            active_nodes: self.registry.active(self.config.node_timeout).len(),
            uptime: self.clock.now().duration_since(self.stats.start_time),
            current_algorithm_state: self.context.lock().current_state_name.clone(),
        }
    }

    /// Queue depth, exposed for diagnostics.
    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Classifies one decoded inbound message on the subscription task.
    /// Liveness traffic hits the registry directly; everything else is
    /// queued for the workers.
    fn dispatch_inbound(
        registry: &NodeRegistry,
        queue: &BoundedQueue,
        message: L1ToL2Message,
    ) {
        // Sender registration first, so a node becomes visible on its
        // very first message of any kind.
        registry.register(message.sender.clone());

        match &message.payload {
            L1Payload::NodeStatus(report) => {
                registry.update_status(&message.sender.node_id, report.status);
            }
            L1Payload::Heartbeat(_) => {
                registry.touch_heartbeat(&message.sender.node_id);
            }
            _ => queue.push(message),
        }
    }

    async fn subscription_loop(self: Arc<Self>, cancel: watch::Receiver<bool>) {
        let registry = Arc::clone(&self.registry);
        let queue = Arc::clone(&self.queue);

        let handler: MessageHandler = Box::new(move |payload: &[u8]| {
            match messages::decode::<L1ToL2Message>(payload) {
                Ok(message) => Self::dispatch_inbound(&registry, &queue, message),
                Err(e) => warn!(error = %e, "dropping undecodable L1 message"),
            }
        });

        if let Err(e) = self
            .bus
            .subscribe(&self.config.l1_to_l2_topic, handler, cancel)
            .await
        {
            // No automatic re-subscribe; the operator restarts the
            // coordinator if the bus died underneath it.
            error!(error = %e, "bus subscription ended");
        }
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        while self.running.load(Ordering::Acquire) {
            match self.queue.pop() {
                Some(message) => {
                    let outputs = self.process_message(&message);
                    self.publish_outputs(outputs).await;
                }
                None => {
                    let _ = tokio::time::timeout(WORKER_IDLE_WAIT, self.queue.wait()).await;
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Runs `process_inbound` under the algorithm (shared) and context
    /// (exclusive) locks, returning the outputs to publish lock-free.
    fn process_message(&self, message: &L1ToL2Message) -> Vec<L2ToL1Message> {
        let algorithm = self.algorithm.read();
        let Some(algorithm) = algorithm.as_ref() else {
            return Vec::new();
        };

        let mut ctx = self.context.lock();
        match algorithm.process_inbound(&mut ctx, message) {
            Ok(()) => {
                self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
                ctx.drain_outputs()
            }
            Err(e) => {
                error!(error = %e, message_id = %message.message_id, "process_inbound failed");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic tasks
    // ------------------------------------------------------------------

    async fn ticker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        while self.running.load(Ordering::Acquire) {
            let outputs = self.run_update();
            self.publish_outputs(outputs).await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.algorithm_update_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn run_update(&self) -> Vec<L2ToL1Message> {
        let algorithm = self.algorithm.read();
        let Some(algorithm) = algorithm.as_ref() else {
            return Vec::new();
        };

        let mut ctx = self.context.lock();
        match algorithm.update(&mut ctx) {
            Ok(()) => ctx.drain_outputs(),
            Err(e) => {
                error!(error = %e, "algorithm update failed");
                Vec::new()
            }
        }
    }

    fn run_trigger(&self, trigger: &str, data: Option<&str>) -> Vec<L2ToL1Message> {
        let algorithm = self.algorithm.read();
        let Some(algorithm) = algorithm.as_ref() else {
            return Vec::new();
        };

        let mut ctx = self.context.lock();
        match algorithm.handle_trigger(&mut ctx, trigger, data) {
            Ok(()) => ctx.drain_outputs(),
            Err(e) => {
                error!(error = %e, trigger, "handle_trigger failed");
                Vec::new()
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        while self.running.load(Ordering::Acquire) {
            self.send_heartbeat().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn send_heartbeat(&self) {
        let message = L2ToL1Message::broadcast(
            self.next_message_id(),
            epoch_millis(),
            L2Payload::System(SystemCommand::SyncTime),
        );

        match messages::encode(&message) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&self.config.heartbeat_topic, &payload).await {
                    error!(error = %e, "failed to send heartbeat");
                }
            }
            Err(e) => error!(error = %e, "failed to encode heartbeat"),
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let sweep_interval = self.config.node_timeout / 4;
        while self.running.load(Ordering::Acquire) {
            let evicted = self.registry.sweep_and_remove(self.config.node_timeout);
            for node_id in evicted {
                warn!(node_id = %node_id, "node timeout detected");
                let outputs = self.run_trigger("node_timeout", Some(&node_id));
                self.publish_outputs(outputs).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Publishes drained outputs in append order. Failures are logged
    /// and never bubble to the algorithm; a failed publish is simply not
    /// counted as sent.
    async fn publish_outputs(&self, outputs: Vec<L2ToL1Message>) {
        for message in outputs {
            let payload = match messages::encode(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, message_id = %message.message_id, "failed to encode output");
                    continue;
                }
            };

            match self.bus.publish(&self.config.l2_to_l1_topic, &payload).await {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    debug!(message_id = %message.message_id,
                           target = %message.target_node_id, "sent message to L1");
                }
                Err(e) => error!(error = %e, message_id = %message.message_id,
                                 "failed to send message to L1"),
            }
        }
    }

    fn next_message_id(&self) -> String {
        format!("L2_{}", self.message_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Heartbeat, NodeIdentity, NodeType};
    use crate::tracking::TargetTrackingAlgorithm;
    use fusion_bus::LocalBus;
    use std::collections::BTreeMap;

    fn message(n: u64) -> L1ToL2Message {
        L1ToL2Message {
            message_id: format!("m{n}"),
            sender: NodeIdentity::new("imu_001", NodeType::Imu),
            timestamp_ms: n,
            payload: L1Payload::Heartbeat(Heartbeat {
                node_id: "imu_001".into(),
                timestamp_ms: n,
                status_info: BTreeMap::new(),
            }),
        }
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = BoundedQueue::new(3);
        for n in 1..=5 {
            queue.push(message(n));
        }

        assert_eq!(queue.len(), 3);
        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.message_id)
            .collect();
        assert_eq!(order, vec!["m3", "m4", "m5"]);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn start_requires_an_algorithm() {
        let mgr = FusionManager::new(FusionConfig::default(), Arc::new(LocalBus::new()));
        assert_eq!(mgr.state(), ManagerState::Created);
        assert!(matches!(mgr.start().await, Err(ConfigError::NoAlgorithm)));
    }

    #[tokio::test]
    async fn set_algorithm_is_refused_while_running() {
        let mgr = FusionManager::new(
            FusionConfig {
                worker_threads: 1,
                ..FusionConfig::default()
            },
            Arc::new(LocalBus::new()),
        );
        mgr.set_algorithm(Box::new(TargetTrackingAlgorithm::new()))
            .unwrap();
        assert_eq!(mgr.state(), ManagerState::Ready);

        mgr.start().await.unwrap();
        assert_eq!(mgr.state(), ManagerState::Running);

        let err = mgr.set_algorithm(Box::new(TargetTrackingAlgorithm::new()));
        assert!(matches!(err, Err(ConfigError::AlgorithmChangeWhileRunning)));

        mgr.stop().await.unwrap();
        assert_eq!(mgr.state(), ManagerState::Stopped);

        // Not running anymore: swapping is allowed again.
        assert!(mgr.set_algorithm(Box::new(TargetTrackingAlgorithm::new())).is_ok());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mgr = FusionManager::new(FusionConfig::default(), Arc::new(LocalBus::new()));
        mgr.stop().await.unwrap();
        mgr.stop().await.unwrap();
    }

    #[test]
    fn heartbeat_ids_count_up_per_instance() {
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let a = FusionManager::new(FusionConfig::default(), bus.clone());
        let b = FusionManager::new(FusionConfig::default(), bus);

        assert_eq!(a.next_message_id(), "L2_0");
        assert_eq!(a.next_message_id(), "L2_1");
        // Second instance overlaps on purpose: the counter is
        // instance-scoped, not process-global.
        assert_eq!(b.next_message_id(), "L2_0");
    }

    #[test]
    fn dispatch_routes_liveness_around_the_queue() {
        let registry = NodeRegistry::new();
        let queue = BoundedQueue::new(10);

        FusionManager::dispatch_inbound(&registry, &queue, message(1));
        assert!(queue.is_empty());
        assert!(registry.get("imu_001").is_some());
    }
}
