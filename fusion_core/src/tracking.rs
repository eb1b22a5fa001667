//! Reference multi-sensor target-tracking algorithm.
//!
//! Demonstrates the framework: a four-state machine (IDLE, ACQUIRING,
//! TRACKING, LOST), radar/lidar ingestion into a fused target map, task
//! creation through the assignment strategy, and gimbal tasking of the
//! coherent device.
//!
//! All mutable tracking state lives in the [`AlgorithmContext`]; the
//! algorithm object itself is shareable and drives its state machine
//! through interior mutability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::algorithm::{AlgorithmError, FusionAlgorithm, StrategySet};
use crate::clock::epoch_millis;
use crate::context::AlgorithmContext;
use crate::messages::{
    CapabilityAdvertisement, ControlCommand, FusionResult, L1Payload, L1ToL2Message,
    L2Payload, L2ToL1Message, LidarData, LidarPoint, RadarData, SensorData, SystemCommand,
};
use crate::state_machine::{State, StateMachine, Transition};
use crate::strategies::{
    ConfidenceBasedPrioritizer, DeviceAssignmentStrategy, SingleDeviceAssignmentStrategy,
    TargetPrioritizer,
};
use crate::target::Target;
use crate::tasks::{TaskManager, TaskPriority, TaskType};

/// Context key holding the fused target map.
const TARGETS_KEY: &str = "targets";
const DETECTION_COUNT_KEY: &str = "detection_count";
const DEFAULT_DEVICE_KEY: &str = "default_device_id";
const ACQUISITION_START_KEY: &str = "acquisition_start";
const LOST_START_KEY: &str = "lost_start";

/// Radar returns below this cross-section are clutter.
const MIN_RCS: f64 = 0.1;
/// Detections associate to an existing target within this distance.
const ASSOCIATION_RADIUS: f64 = 5.0;
/// Lidar points within this distance belong to the same cluster.
const CLUSTER_LINK_DISTANCE: f64 = 1.0;
/// Clusters below this size are noise, not objects.
const MIN_CLUSTER_POINTS: usize = 10;
/// Confidence added per radar association.
const RADAR_CONFIDENCE_BOOST: f64 = 0.8;
/// Confidence added per lidar cluster association.
const LIDAR_CONFIDENCE_BOOST: f64 = 0.6;
/// How long to search in LOST before giving up.
const LOST_SEARCH_WINDOW: Duration = Duration::from_secs(30);
/// Cadence of the fusion-result broadcast.
const STATUS_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Tuning knobs of the tracker.
#[derive(Debug, Clone)]
pub struct TrackingParams {
    /// Confidence a candidate must exceed to be confirmed.
    pub min_confidence_threshold: f64,
    /// Confidence a target needs before acquisition bumps apply.
    pub acquisition_threshold: f64,
    /// Below this confidence a tracked target counts as gone.
    pub lost_threshold: f64,
    /// Distinct sensors that must agree before confirmation.
    pub min_sensor_consensus: usize,
    /// Silence after which a target's confidence starts decaying.
    pub target_timeout: Duration,
    /// Blend factor applied to new position measurements. Kept under its
    /// historical name; it weights the measurement, not the noise.
    pub position_noise: f64,
    /// Smoothing factor for the velocity estimate (weight of the old
    /// estimate).
    pub velocity_alpha: f64,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.7,
            acquisition_threshold: 0.5,
            lost_threshold: 0.3,
            min_sensor_consensus: 2,
            target_timeout: Duration::from_secs(10),
            position_noise: 0.1,
            velocity_alpha: 0.8,
        }
    }
}

/// Shared innards: everything the state-machine hooks and the hook
/// methods both need.
struct TrackerCore {
    params: TrackingParams,
    tasks: TaskManager,
    strategies: StrategySet,
    /// Device that receives POINT_GIMBAL commands.
    gimbal_device: String,
}

/// The reference fusion algorithm.
pub struct TargetTrackingAlgorithm {
    core: Arc<TrackerCore>,
    machine: Mutex<StateMachine<AlgorithmContext>>,
    last_status_broadcast: Mutex<Option<Instant>>,
}

impl TargetTrackingAlgorithm {
    pub const NAME: &'static str = "TargetTrackingAlgorithm";

    pub fn new() -> Self {
        Self::with_params(TrackingParams::default())
    }

    pub fn with_params(params: TrackingParams) -> Self {
        let strategies = StrategySet::new(
            Arc::new(ConfidenceBasedPrioritizer),
            Arc::new(SingleDeviceAssignmentStrategy::new("default_device")),
        );
        Self::build(params, strategies, "coherent_001")
    }

    /// Full constructor for callers that want non-default policies or a
    /// different gimbal-equipped device.
    pub fn with_strategies(
        params: TrackingParams,
        prioritizer: Arc<dyn TargetPrioritizer>,
        assignment: Arc<dyn DeviceAssignmentStrategy>,
    ) -> Self {
        Self::build(params, StrategySet::new(prioritizer, assignment), "coherent_001")
    }

    fn build(params: TrackingParams, strategies: StrategySet, gimbal_device: &str) -> Self {
        let core = Arc::new(TrackerCore {
            params,
            tasks: TaskManager::new(),
            strategies,
            gimbal_device: gimbal_device.to_string(),
        });

        Self {
            machine: Mutex::new(Self::build_machine(Arc::clone(&core))),
            core,
            last_status_broadcast: Mutex::new(None),
        }
    }

    fn build_machine(core: Arc<TrackerCore>) -> StateMachine<AlgorithmContext> {
        StateMachine::new()
            .add_state(State::new("IDLE").on_enter(|ctx: &mut AlgorithmContext| {
                debug!("entered IDLE, scanning for targets");
                ctx.set_data("scanning", true);
            }))
            .add_state(State::new("ACQUIRING").on_enter(|ctx: &mut AlgorithmContext| {
                debug!("entered ACQUIRING");
                let now = ctx.now();
                ctx.set_data(ACQUISITION_START_KEY, now);
            }))
            .add_state(State::new("TRACKING").on_enter(move |ctx: &mut AlgorithmContext| {
                debug!("entered TRACKING");
                core.point_gimbal_at_best(ctx);
            }))
            .add_state(State::new("LOST").on_enter(|ctx: &mut AlgorithmContext| {
                debug!("entered LOST");
                let now = ctx.now();
                ctx.set_data(LOST_START_KEY, now);
            }))
            .initial_state("IDLE")
            .add_transition(Transition::new("IDLE", "ACQUIRING", "detection"))
            .add_transition(Transition::new("ACQUIRING", "TRACKING", "confirmed"))
            .add_transition(Transition::new("ACQUIRING", "IDLE", "false_positive"))
            .add_transition(Transition::new("TRACKING", "LOST", "lost"))
            .add_transition(Transition::new("LOST", "TRACKING", "reacquired"))
            .add_transition(Transition::new("LOST", "IDLE", "timeout"))
            // Reset routes every state back to IDLE; the IDLE self-loop
            // still fires exit/enter.
            .add_transition(Transition::new("IDLE", "IDLE", "reset"))
            .add_transition(Transition::new("ACQUIRING", "IDLE", "reset"))
            .add_transition(Transition::new("TRACKING", "IDLE", "reset"))
            .add_transition(Transition::new("LOST", "IDLE", "reset"))
    }

    /// Task-assignment state owned by this algorithm instance.
    pub fn task_manager(&self) -> &TaskManager {
        &self.core.tasks
    }

    /// Swappable strategy slots.
    pub fn strategies(&self) -> &StrategySet {
        &self.core.strategies
    }

    pub fn params(&self) -> &TrackingParams {
        &self.core.params
    }

    /// Fires a state-machine trigger and mirrors the resulting state
    /// into the context.
    fn fire(&self, ctx: &mut AlgorithmContext, trigger: &str) -> bool {
        let mut machine = self.machine.lock();
        let fired = machine.try_transition(ctx, trigger);
        ctx.current_state_name = machine.current().to_string();
        fired
    }

    fn current_state(&self) -> String {
        self.machine.lock().current().to_string()
    }

    // ------------------------------------------------------------------
    // Per-state update behavior
    // ------------------------------------------------------------------

    fn scan_for_targets(&self, ctx: &mut AlgorithmContext) {
        let detections = self.core.refresh_detection_count(ctx);
        if detections > 0 {
            self.fire(ctx, "detection");
        }
    }

    fn evaluate_candidates(&self, ctx: &mut AlgorithmContext) {
        let params = &self.core.params;
        let mut targets = self.core.targets(ctx);

        let mut confirmed = false;
        for target in targets.values_mut() {
            if target.confidence > params.acquisition_threshold
                && target.sensor_detections.len() >= params.min_sensor_consensus
            {
                target.confidence = (target.confidence + 0.1).min(1.0);
                if target.confidence > params.min_confidence_threshold {
                    confirmed = true;
                }
            }
        }
        self.core.store_targets(ctx, targets);

        if confirmed {
            self.fire(ctx, "confirmed");
        }
    }

    fn update_tracking(&self, ctx: &mut AlgorithmContext) {
        let params = &self.core.params;
        let now = ctx.now();
        let mut targets = self.core.targets(ctx);

        for target in targets.values_mut() {
            if now.duration_since(target.last_update) > params.target_timeout {
                target.confidence *= 0.9;
            }
        }

        let surviving: Vec<Target> = targets
            .values()
            .filter(|t| t.confidence > params.lost_threshold)
            .cloned()
            .collect();

        self.core.store_targets(ctx, targets);

        if surviving.is_empty() {
            self.fire(ctx, "lost");
        } else {
            for target in &surviving {
                self.core.emit_gimbal_command(ctx, target);
            }
        }
    }

    fn search_for_lost_targets(&self, ctx: &mut AlgorithmContext) {
        let lost_start = ctx.get_data::<Instant>(LOST_START_KEY).copied();
        if let Some(start) = lost_start {
            if ctx.now().duration_since(start) > LOST_SEARCH_WINDOW {
                self.fire(ctx, "timeout");
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping shared by every update
    // ------------------------------------------------------------------

    /// Drops targets that have been silent for twice the timeout.
    fn remove_stale_targets(&self, ctx: &mut AlgorithmContext) {
        let horizon = self.core.params.target_timeout * 2;
        let now = ctx.now();
        let mut targets = self.core.targets(ctx);

        let before = targets.len();
        targets.retain(|id, target| {
            let keep = now.duration_since(target.last_update) <= horizon;
            if !keep {
                info!(target_id = %id, "removing stale target");
            }
            keep
        });

        if targets.len() != before {
            self.core.store_targets(ctx, targets);
        }
    }

    fn broadcast_status(&self, ctx: &mut AlgorithmContext) {
        let now = ctx.now();
        let due = {
            let last = self.last_status_broadcast.lock();
            last.map_or(true, |t| now.duration_since(t) > STATUS_BROADCAST_INTERVAL)
        };
        if !due {
            return;
        }
        *self.last_status_broadcast.lock() = Some(now);

        let targets = self.core.targets(ctx);
        let overall = if targets.is_empty() {
            0.0
        } else {
            targets.values().map(|t| t.confidence).sum::<f64>() / targets.len() as f64
        };

        let result_data = serde_json::json!({
            "target_count": targets.len(),
            "state": ctx.current_state_name,
        })
        .to_string();

        ctx.add_output(L2ToL1Message::broadcast(
            format!("fusion_result_{}", epoch_millis()),
            epoch_millis(),
            L2Payload::FusionResult(FusionResult {
                algorithm_name: Self::NAME.to_string(),
                result_type: "target_tracks".to_string(),
                confidence: overall,
                result_data,
            }),
        ));
    }
}

impl Default for TargetTrackingAlgorithm {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionAlgorithm for TargetTrackingAlgorithm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "Multi-sensor target tracking with acquisition/tracking state machine"
    }

    fn initialize(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
        ctx.set_data(TARGETS_KEY, HashMap::<String, Target>::new());
        ctx.set_data(DETECTION_COUNT_KEY, 0usize);

        // Single-device bring-up: one do-everything device is always
        // registered so tracking tasks have somewhere to land.
        let default_device = "default_device".to_string();
        self.core.tasks.register_capabilities(
            &default_device,
            vec![
                "radar".to_string(),
                "lidar".to_string(),
                "camera".to_string(),
                "gimbal_control".to_string(),
            ],
        );
        ctx.set_data(DEFAULT_DEVICE_KEY, default_device);

        let mut machine = self.machine.lock();
        machine.start(ctx);
        ctx.current_state_name = machine.current().to_string();
        drop(machine);

        info!(state = %ctx.current_state_name, "target tracking algorithm initialized");
        Ok(())
    }

    fn process_inbound(
        &self,
        ctx: &mut AlgorithmContext,
        message: &L1ToL2Message,
    ) -> Result<(), AlgorithmError> {
        ctx.record_message(message.clone());
        let node_id = message.sender.node_id.clone();

        match &message.payload {
            L1Payload::SensorData(SensorData::Radar(radar)) => {
                self.core.process_radar(ctx, &node_id, radar);
            }
            L1Payload::SensorData(SensorData::Lidar(lidar)) => {
                self.core.process_lidar(ctx, &node_id, lidar);
            }
            L1Payload::SensorData(SensorData::Image(image)) => {
                // Vision processing is out of scope; dimensions are noted
                // for capability diagnostics only.
                debug!(node_id = %node_id, width = image.width, height = image.height,
                       "image frame received");
            }
            L1Payload::SensorData(_) => {
                // IMU and GPS streams feed no tracking logic yet.
            }
            L1Payload::Capability(capability) => {
                self.core.process_capability(&node_id, capability);
            }
            // Heartbeats and status reports are consumed by the registry
            // before the queue; nothing to do if one slips through.
            L1Payload::NodeStatus(_) | L1Payload::Heartbeat(_) => {}
        }

        Ok(())
    }

    fn update(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
        match self.current_state().as_str() {
            "IDLE" => self.scan_for_targets(ctx),
            "ACQUIRING" => self.evaluate_candidates(ctx),
            "TRACKING" => self.update_tracking(ctx),
            "LOST" => self.search_for_lost_targets(ctx),
            _ => {}
        }

        self.core.tasks.tick(ctx);
        self.remove_stale_targets(ctx);
        self.core.refresh_detection_count(ctx);
        self.broadcast_status(ctx);

        ctx.last_update = ctx.now();
        Ok(())
    }

    fn handle_trigger(
        &self,
        ctx: &mut AlgorithmContext,
        trigger: &str,
        data: Option<&str>,
    ) -> Result<(), AlgorithmError> {
        match trigger {
            "reset" => {
                info!("resetting target tracking state");
                ctx.set_data(TARGETS_KEY, HashMap::<String, Target>::new());
                ctx.set_data(DETECTION_COUNT_KEY, 0usize);
                self.fire(ctx, "reset");
            }
            "node_timeout" => {
                let node_id = data.ok_or_else(|| AlgorithmError::InvalidTriggerData {
                    trigger: trigger.to_string(),
                    reason: "missing node id".to_string(),
                })?;
                warn!(node_id, "node timed out, decaying its contributions");
                self.core.handle_node_timeout(ctx, node_id);
            }
            "target_detected" => {
                self.fire(ctx, "detection");
            }
            "target_lost" => {
                self.fire(ctx, "lost");
            }
            other => {
                // Unknown names go straight to the machine; no match is a
                // silent no-op.
                self.fire(ctx, other);
            }
        }
        Ok(())
    }

    fn shutdown(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
        ctx.add_output(L2ToL1Message::broadcast(
            format!("shutdown_{}", epoch_millis()),
            epoch_millis(),
            L2Payload::System(SystemCommand::Shutdown),
        ));
        info!("target tracking algorithm shut down");
        Ok(())
    }
}

impl TrackerCore {
    fn targets(&self, ctx: &AlgorithmContext) -> HashMap<String, Target> {
        ctx.get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .cloned()
            .unwrap_or_default()
    }

    fn store_targets(&self, ctx: &mut AlgorithmContext, targets: HashMap<String, Target>) {
        ctx.set_data(TARGETS_KEY, targets);
    }

    /// Recounts targets that look real (confidence above the noise
    /// floor) into the detection-count slot.
    fn refresh_detection_count(&self, ctx: &mut AlgorithmContext) -> usize {
        let count = self
            .targets(ctx)
            .values()
            .filter(|t| t.confidence > 0.3)
            .count();
        ctx.set_data(DETECTION_COUNT_KEY, count);
        count
    }

    fn process_radar(&self, ctx: &mut AlgorithmContext, node_id: &str, radar: &RadarData) {
        let mut targets = self.targets(ctx);

        for detection in &radar.detections {
            if detection.rcs <= MIN_RCS {
                continue;
            }

            // Polar to Cartesian in the sensor frame.
            let position = Vector3::new(
                detection.range * detection.azimuth.cos() * detection.elevation.cos(),
                detection.range * detection.azimuth.sin() * detection.elevation.cos(),
                detection.range * detection.elevation.sin(),
            );

            let target_id = match Self::closest_target(&targets, &position) {
                Some(id) => id,
                None => self.spawn_target(ctx, &mut targets, position),
            };

            if let Some(target) = targets.get_mut(&target_id) {
                Self::update_target_position(
                    target,
                    position,
                    RADAR_CONFIDENCE_BOOST,
                    node_id,
                    ctx.now(),
                    &self.params,
                );
            }
        }

        self.store_targets(ctx, targets);
    }

    fn process_lidar(&self, ctx: &mut AlgorithmContext, node_id: &str, lidar: &LidarData) {
        let mut targets = self.targets(ctx);

        for cluster in Self::cluster_points(&lidar.points) {
            if cluster.len() < MIN_CLUSTER_POINTS {
                continue;
            }

            let mut centroid = Vector3::zeros();
            for point in &cluster {
                centroid += Vector3::new(point.x, point.y, point.z);
            }
            centroid /= cluster.len() as f64;

            let target_id = match Self::closest_target(&targets, &centroid) {
                Some(id) => id,
                None => self.spawn_target(ctx, &mut targets, centroid),
            };

            if let Some(target) = targets.get_mut(&target_id) {
                Self::update_target_position(
                    target,
                    centroid,
                    LIDAR_CONFIDENCE_BOOST,
                    node_id,
                    ctx.now(),
                    &self.params,
                );
            }
        }

        self.store_targets(ctx, targets);
    }

    fn process_capability(&self, node_id: &str, capability: &CapabilityAdvertisement) {
        info!(
            node_id,
            sensor_types = capability.sensor_types.len(),
            rate_hz = capability.update_rate_hz,
            "capability advertisement"
        );
        // Advertised sensors double as device capabilities so the
        // assignment strategies can consider this node.
        if !capability.sensor_types.is_empty() {
            self.tasks
                .register_capabilities(node_id, capability.sensor_types.clone());
        }
    }

    /// Creates a target at `position` and opens a HIGH-priority tracking
    /// task on whichever device the assignment strategy picks.
    fn spawn_target(
        &self,
        ctx: &AlgorithmContext,
        targets: &mut HashMap<String, Target>,
        position: Vector3<f64>,
    ) -> String {
        let target_id = format!("target_{}", targets.len());
        let mut target = Target::new(&target_id, ctx.now());
        target.position = position;

        let assignment = self.strategies.assignment();
        if let Some(device) = assignment.select_for_target(&target, &self.tasks, ctx) {
            let task_id = self
                .tasks
                .create(&target_id, TaskType::TrackTarget, TaskPriority::High);
            self.tasks.assign(task_id, &device);
            info!(task = %task_id, target_id = %target_id, device = %device,
                  "created tracking task for new target");
        }

        targets.insert(target_id.clone(), target);
        target_id
    }

    fn closest_target(targets: &HashMap<String, Target>, position: &Vector3<f64>) -> Option<String> {
        let mut closest: Option<(String, f64)> = None;
        for (id, target) in targets {
            let distance = (target.position - position).norm();
            if distance < ASSOCIATION_RADIUS
                && closest.as_ref().map_or(true, |(_, best)| distance < *best)
            {
                closest = Some((id.clone(), distance));
            }
        }
        closest.map(|(id, _)| id)
    }

    fn update_target_position(
        target: &mut Target,
        measurement: Vector3<f64>,
        confidence_boost: f64,
        sensor_id: &str,
        now: Instant,
        params: &TrackingParams,
    ) {
        // Measurement blend. The historical weighting gives the
        // measurement only `position_noise` of the new estimate.
        let alpha = params.position_noise;
        target.position = target.position * (1.0 - alpha) + measurement * alpha;

        // The residual is taken against the already-blended position;
        // see TrackingParams for the estimator's quirks.
        let dt = now.duration_since(target.last_update).as_secs_f64();
        if dt > 0.0 {
            let instantaneous = (measurement - target.position) / dt;
            target.velocity = target.velocity * params.velocity_alpha
                + instantaneous * (1.0 - params.velocity_alpha);
        }

        target.confidence = (target.confidence + confidence_boost).min(1.0);
        target.last_update = now;
        *target.sensor_detections.entry(sensor_id.to_string()).or_insert(0) += 1;
    }

    /// Connected components over the point cloud, linking any two points
    /// within the cluster distance.
    fn cluster_points(points: &[LidarPoint]) -> Vec<Vec<LidarPoint>> {
        let mut visited = vec![false; points.len()];
        let mut clusters = Vec::new();

        for start in 0..points.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;

            let mut cluster = Vec::new();
            let mut frontier = std::collections::VecDeque::from([start]);

            while let Some(current) = frontier.pop_front() {
                cluster.push(points[current]);
                for (other, seen) in visited.iter_mut().enumerate() {
                    if *seen {
                        continue;
                    }
                    let dx = points[current].x - points[other].x;
                    let dy = points[current].y - points[other].y;
                    let dz = points[current].z - points[other].z;
                    if (dx * dx + dy * dy + dz * dz).sqrt() < CLUSTER_LINK_DISTANCE {
                        *seen = true;
                        frontier.push_back(other);
                    }
                }
            }

            clusters.push(cluster);
        }

        clusters
    }

    /// Points the gimbal of the coherent device at the best target per
    /// the current prioritizer.
    fn point_gimbal_at_best(&self, ctx: &mut AlgorithmContext) {
        let best: Option<Target> = {
            let targets = self.targets(ctx);
            let refs: Vec<&Target> = targets.values().collect();
            self.strategies.prioritizer().best(&refs, ctx).cloned()
        };

        if let Some(target) = best {
            self.emit_gimbal_command(ctx, &target);
        }
    }

    fn emit_gimbal_command(&self, ctx: &mut AlgorithmContext, target: &Target) {
        let range = target.range();
        if range <= 0.0 {
            return;
        }

        let theta = target.position.y.atan2(target.position.x);
        let phi = (target.position.z / range).asin();

        ctx.add_output(L2ToL1Message::to_node(
            format!("gimbal_{}", epoch_millis()),
            &self.gimbal_device,
            epoch_millis(),
            L2Payload::Control(ControlCommand::PointGimbal { theta, phi }),
        ));

        info!(target_id = %target.target_id, device = %self.gimbal_device,
              theta, phi, "tasking coherent device");
    }

    /// A timed-out node stops vouching for its targets: its detection
    /// counts are dropped and affected confidences take a 20% hit.
    fn handle_node_timeout(&self, ctx: &mut AlgorithmContext, node_id: &str) {
        let mut targets = self.targets(ctx);
        for target in targets.values_mut() {
            if target.sensor_detections.remove(node_id).is_some() {
                target.confidence *= 0.8;
            }
        }
        self.store_targets(ctx, targets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{NodeIdentity, NodeType, RadarDetection};

    fn radar_message(node: &str, detections: Vec<RadarDetection>) -> L1ToL2Message {
        L1ToL2Message {
            message_id: format!("{node}_msg"),
            sender: NodeIdentity::new(node, NodeType::Radar),
            timestamp_ms: 0,
            payload: L1Payload::SensorData(SensorData::Radar(RadarData {
                max_range: 200.0,
                angular_resolution: 0.1,
                detections,
            })),
        }
    }

    fn detection(range: f64, azimuth: f64, elevation: f64, rcs: f64) -> RadarDetection {
        RadarDetection {
            range,
            azimuth,
            elevation,
            velocity: 0.0,
            rcs,
        }
    }

    fn init() -> (TargetTrackingAlgorithm, AlgorithmContext) {
        let algo = TargetTrackingAlgorithm::new();
        let mut ctx = AlgorithmContext::new();
        algo.initialize(&mut ctx).unwrap();
        (algo, ctx)
    }

    #[test]
    fn initialize_lands_in_idle_with_default_device() {
        let (algo, ctx) = init();
        assert_eq!(ctx.current_state_name, "IDLE");
        assert_eq!(ctx.get_data::<bool>("scanning"), Some(&true));
        assert!(algo
            .task_manager()
            .capabilities_of("default_device")
            .contains(&"gimbal_control".to_string()));
    }

    #[test]
    fn radar_detection_creates_target_at_cartesian_position() {
        let (algo, mut ctx) = init();
        let msg = radar_message("radar_001", vec![detection(50.0, 0.0, 0.0, 1.0)]);
        algo.process_inbound(&mut ctx, &msg).unwrap();

        let targets = ctx
            .get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .unwrap();
        assert_eq!(targets.len(), 1);
        let target = targets.values().next().unwrap();

        // First blend starts from the detection itself, so the smoothed
        // position equals the measurement.
        assert!((target.position - Vector3::new(50.0, 0.0, 0.0)).norm() < 1e-9);
        assert_eq!(target.confidence, RADAR_CONFIDENCE_BOOST);
        assert_eq!(target.sensor_detections.get("radar_001"), Some(&1));

        // A HIGH-priority tracking task landed on the default device.
        let tasks = algo.task_manager().by_device("default_device");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::TrackTarget);
        assert_eq!(tasks[0].priority, TaskPriority::High);

        // Processing alone does not transition the machine.
        assert_eq!(ctx.current_state_name, "IDLE");
    }

    #[test]
    fn small_rcs_returns_are_filtered() {
        let (algo, mut ctx) = init();
        let msg = radar_message("radar_001", vec![detection(50.0, 0.0, 0.0, 0.05)]);
        algo.process_inbound(&mut ctx, &msg).unwrap();

        let targets = ctx
            .get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn nearby_detection_associates_instead_of_spawning() {
        let (algo, mut ctx) = init();
        algo.process_inbound(
            &mut ctx,
            &radar_message("radar_001", vec![detection(50.0, 0.0, 0.0, 1.0)]),
        )
        .unwrap();
        // 2 m away: inside the association radius.
        algo.process_inbound(
            &mut ctx,
            &radar_message("radar_002", vec![detection(52.0, 0.0, 0.0, 1.0)]),
        )
        .unwrap();

        let targets = ctx
            .get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .unwrap();
        assert_eq!(targets.len(), 1);
        let target = targets.values().next().unwrap();
        assert_eq!(target.sensor_detections.len(), 2);
    }

    #[test]
    fn update_in_idle_fires_detection() {
        let (algo, mut ctx) = init();
        algo.process_inbound(
            &mut ctx,
            &radar_message("radar_001", vec![detection(50.0, 0.0, 0.0, 1.0)]),
        )
        .unwrap();

        algo.update(&mut ctx).unwrap();
        assert_eq!(ctx.current_state_name, "ACQUIRING");
        assert!(ctx.get_data::<Instant>(ACQUISITION_START_KEY).is_some());
    }

    #[test]
    fn reset_returns_to_idle_from_any_state_and_clears_targets() {
        for staging in ["detection", "confirmed", "lost"] {
            let (algo, mut ctx) = init();

            // Drive to the state under test via raw triggers.
            algo.handle_trigger(&mut ctx, "detection", None).unwrap();
            if staging != "detection" {
                algo.handle_trigger(&mut ctx, "confirmed", None).unwrap();
            }
            if staging == "lost" {
                algo.handle_trigger(&mut ctx, "target_lost", None).unwrap();
            }
            assert_ne!(ctx.current_state_name, "IDLE");

            ctx.set_data(TARGETS_KEY, {
                let mut m = HashMap::new();
                m.insert("t".to_string(), Target::new("t", ctx.now()));
                m
            });

            algo.handle_trigger(&mut ctx, "reset", None).unwrap();
            assert_eq!(ctx.current_state_name, "IDLE");
            let targets = ctx
                .get_data::<HashMap<String, Target>>(TARGETS_KEY)
                .unwrap();
            assert!(targets.is_empty());
        }
    }

    #[test]
    fn node_timeout_requires_a_node_id() {
        let (algo, mut ctx) = init();
        assert!(algo.handle_trigger(&mut ctx, "node_timeout", None).is_err());
    }

    #[test]
    fn node_timeout_decays_contributed_targets() {
        let (algo, mut ctx) = init();
        algo.process_inbound(
            &mut ctx,
            &radar_message("radar_001", vec![detection(50.0, 0.0, 0.0, 1.0)]),
        )
        .unwrap();

        algo.handle_trigger(&mut ctx, "node_timeout", Some("radar_001"))
            .unwrap();

        let targets = ctx
            .get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .unwrap();
        let target = targets.values().next().unwrap();
        assert!((target.confidence - RADAR_CONFIDENCE_BOOST * 0.8).abs() < 1e-9);
        assert!(!target.sensor_detections.contains_key("radar_001"));
    }

    #[test]
    fn unknown_trigger_is_silently_ignored() {
        let (algo, mut ctx) = init();
        algo.handle_trigger(&mut ctx, "no_such_trigger", None).unwrap();
        assert_eq!(ctx.current_state_name, "IDLE");
    }

    #[test]
    fn capability_advertisement_registers_the_node_as_a_device() {
        let (algo, mut ctx) = init();
        let msg = L1ToL2Message {
            message_id: "cap_1".into(),
            sender: NodeIdentity::new("camera_007", NodeType::Camera),
            timestamp_ms: 0,
            payload: L1Payload::Capability(CapabilityAdvertisement {
                node_id: "camera_007".into(),
                sensor_types: vec!["camera".into()],
                data_formats: vec!["rgb_image".into()],
                update_rate_hz: 30.0,
                parameters: Default::default(),
            }),
        };
        algo.process_inbound(&mut ctx, &msg).unwrap();

        assert_eq!(
            algo.task_manager().capabilities_of("camera_007"),
            vec!["camera".to_string()]
        );
    }

    #[test]
    fn lidar_cluster_spawns_target_at_centroid() {
        let (algo, mut ctx) = init();

        // A tight 12-point blob around (20, 5, 0) plus two isolated
        // points that must not form a target.
        let mut points = Vec::new();
        for i in 0..12 {
            points.push(LidarPoint {
                x: 20.0 + (i as f64) * 0.05,
                y: 5.0,
                z: 0.0,
                intensity: 0.8,
            });
        }
        points.push(LidarPoint { x: 100.0, y: 0.0, z: 0.0, intensity: 0.5 });
        points.push(LidarPoint { x: -50.0, y: 9.0, z: 2.0, intensity: 0.5 });

        let msg = L1ToL2Message {
            message_id: "lidar_1".into(),
            sender: NodeIdentity::new("lidar_001", NodeType::Lidar),
            timestamp_ms: 0,
            payload: L1Payload::SensorData(SensorData::Lidar(LidarData {
                angular_resolution: 0.05,
                range_min: 0.5,
                range_max: 150.0,
                num_points: points.len() as u32,
                points,
            })),
        };
        algo.process_inbound(&mut ctx, &msg).unwrap();

        let targets = ctx
            .get_data::<HashMap<String, Target>>(TARGETS_KEY)
            .unwrap();
        assert_eq!(targets.len(), 1);
        let target = targets.values().next().unwrap();
        assert!((target.position.x - 20.275).abs() < 1e-6);
        assert!((target.position.y - 5.0).abs() < 1e-9);
        assert_eq!(target.confidence, LIDAR_CONFIDENCE_BOOST);
    }

    #[test]
    fn shutdown_broadcasts_a_system_shutdown() {
        let (algo, mut ctx) = init();
        algo.shutdown(&mut ctx).unwrap();

        let outputs = ctx.drain_outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].is_broadcast());
        assert!(matches!(
            outputs[0].payload,
            L2Payload::System(SystemCommand::Shutdown)
        ));
    }
}
