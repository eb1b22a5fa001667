//! Pluggable policy objects composed into fusion algorithms.
//!
//! Two policy seams exist: ranking targets ([`TargetPrioritizer`]) and
//! picking a device to service a target ([`DeviceAssignmentStrategy`]).
//! Algorithms hold strategies behind their own lock so they can be swapped
//! while the algorithm is live.

use crate::context::AlgorithmContext;
use crate::target::Target;
use crate::tasks::{TaskManager, TaskType};

// ============================================================================
// TARGET PRIORITIZATION
// ============================================================================

/// Ranks targets by importance. Higher scores come first.
pub trait TargetPrioritizer: Send + Sync {
    /// Priority score for one target.
    fn priority(&self, target: &Target, ctx: &AlgorithmContext) -> f64;

    /// Sorts targets by descending priority. Stable: equal-priority
    /// targets keep their input order.
    fn sort<'a>(&self, mut targets: Vec<&'a Target>, ctx: &AlgorithmContext) -> Vec<&'a Target> {
        targets.sort_by(|a, b| {
            self.priority(b, ctx)
                .partial_cmp(&self.priority(a, ctx))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        targets
    }

    /// Picks the highest-priority target; ties go to the earliest in scan
    /// order. `None` on an empty slice.
    fn best<'a>(&self, targets: &[&'a Target], ctx: &AlgorithmContext) -> Option<&'a Target> {
        let mut best: Option<(&'a Target, f64)> = None;
        for &t in targets {
            let p = self.priority(t, ctx);
            match best {
                Some((_, bp)) if p <= bp => {}
                _ => best = Some((t, p)),
            }
        }
        best.map(|(t, _)| t)
    }

    fn name(&self) -> &'static str;
}

/// Priority is the target's confidence, nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfidenceBasedPrioritizer;

impl TargetPrioritizer for ConfidenceBasedPrioritizer {
    fn priority(&self, target: &Target, _ctx: &AlgorithmContext) -> f64 {
        target.confidence
    }

    fn name(&self) -> &'static str {
        "ConfidenceBasedPrioritizer"
    }
}

/// Weights for the threat score components.
#[derive(Debug, Clone, Copy)]
pub struct ThreatWeights {
    /// Closer targets score higher.
    pub range: f64,
    /// Faster targets score higher.
    pub velocity: f64,
    /// Better-confirmed targets score higher.
    pub confidence: f64,
    /// Approaching targets score higher.
    pub heading: f64,
}

impl Default for ThreatWeights {
    fn default() -> Self {
        Self {
            range: 0.3,
            velocity: 0.2,
            confidence: 0.3,
            heading: 0.2,
        }
    }
}

/// Composite threat score over range, speed, confidence, and approach
/// geometry, clamped to [0, 1].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreatBasedPrioritizer {
    weights: ThreatWeights,
}

impl ThreatBasedPrioritizer {
    pub fn new(weights: ThreatWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ThreatWeights {
        self.weights
    }
}

impl TargetPrioritizer for ThreatBasedPrioritizer {
    fn priority(&self, target: &Target, _ctx: &AlgorithmContext) -> f64 {
        let w = &self.weights;
        let range = target.range();
        let speed = target.speed();

        // Exponential falloff with distance; 1.0 at the origin.
        let range_score = if range > 0.0 { (-range / 100.0).exp() } else { 1.0 };
        // Normalized against a 50 m/s reference speed.
        let velocity_score = (speed / 50.0).min(1.0);
        let confidence_score = target.confidence;

        let mut priority = w.range * range_score
            + w.velocity * velocity_score
            + w.confidence * confidence_score;

        // Approach component of the velocity, undefined at zero range or
        // zero speed.
        if range > 0.0 && speed > 0.0 {
            let approach = -target.position.dot(&target.velocity) / (range * speed);
            priority += w.heading * approach.max(0.0);
        }

        priority.clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "ThreatBasedPrioritizer"
    }
}

// ============================================================================
// DEVICE ASSIGNMENT
// ============================================================================

/// Picks which device should service a target or task.
pub trait DeviceAssignmentStrategy: Send + Sync {
    /// Best device for tracking this target, or `None` if nothing fits.
    fn select_for_target(
        &self,
        target: &Target,
        tasks: &TaskManager,
        ctx: &AlgorithmContext,
    ) -> Option<String>;

    /// Best device for a specific task type.
    fn select_for_task(
        &self,
        target: &Target,
        task_type: TaskType,
        tasks: &TaskManager,
        ctx: &AlgorithmContext,
    ) -> Option<String>;

    /// How well a device fits a target, in [0, 1]. Zero means unusable.
    fn suitability(
        &self,
        device_id: &str,
        target: &Target,
        tasks: &TaskManager,
        ctx: &AlgorithmContext,
    ) -> f64;

    fn name(&self) -> &'static str;
}

/// Routes every task to one fixed device. The single-device deployment
/// policy.
#[derive(Debug, Clone)]
pub struct SingleDeviceAssignmentStrategy {
    device_id: String,
}

impl SingleDeviceAssignmentStrategy {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

impl DeviceAssignmentStrategy for SingleDeviceAssignmentStrategy {
    fn select_for_target(
        &self,
        _target: &Target,
        _tasks: &TaskManager,
        _ctx: &AlgorithmContext,
    ) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn select_for_task(
        &self,
        _target: &Target,
        _task_type: TaskType,
        _tasks: &TaskManager,
        _ctx: &AlgorithmContext,
    ) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn suitability(
        &self,
        device_id: &str,
        _target: &Target,
        _tasks: &TaskManager,
        _ctx: &AlgorithmContext,
    ) -> f64 {
        if device_id == self.device_id {
            1.0
        } else {
            0.0
        }
    }

    fn name(&self) -> &'static str {
        "SingleDeviceAssignmentStrategy"
    }
}

/// Scores devices by their registered capabilities against what a task
/// type needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityBasedAssignmentStrategy;

impl CapabilityBasedAssignmentStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Capability set a task type calls for.
    pub fn required_capabilities(task_type: TaskType) -> &'static [&'static str] {
        match task_type {
            TaskType::TrackTarget => &["radar", "lidar", "camera", "gimbal_control"],
            TaskType::ScanArea => &["radar", "lidar", "camera"],
            TaskType::PointGimbal => &["gimbal_control", "coherent"],
            TaskType::CalibrateSensor => &["calibration"],
            TaskType::MonitorStatus => &[],
        }
    }
}

impl DeviceAssignmentStrategy for CapabilityBasedAssignmentStrategy {
    fn select_for_target(
        &self,
        target: &Target,
        tasks: &TaskManager,
        ctx: &AlgorithmContext,
    ) -> Option<String> {
        self.select_for_task(target, TaskType::TrackTarget, tasks, ctx)
    }

    fn select_for_task(
        &self,
        target: &Target,
        _task_type: TaskType,
        tasks: &TaskManager,
        ctx: &AlgorithmContext,
    ) -> Option<String> {
        let mut best: Option<(String, f64)> = None;
        for device_id in tasks.registered_devices() {
            let score = self.suitability(&device_id, target, tasks, ctx);
            if score <= 0.0 {
                continue;
            }
            match &best {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best = Some((device_id, score)),
            }
        }
        best.map(|(id, _)| id)
    }

    fn suitability(
        &self,
        device_id: &str,
        target: &Target,
        tasks: &TaskManager,
        _ctx: &AlgorithmContext,
    ) -> f64 {
        let capabilities = tasks.capabilities_of(device_id);
        if capabilities.is_empty() {
            return 0.0;
        }

        let has = |cap: &str| capabilities.iter().any(|c| c == cap);
        let has_sensor = has("radar") || has("lidar") || has("camera");
        let has_gimbal = has("gimbal_control") || has("coherent");

        let mut score: f64 = 0.0;
        if has_sensor {
            score += 0.5;
        }
        if has_gimbal {
            score += 0.5;
        }
        // Coherent hardware is worth reserving for well-confirmed tracks.
        if has("coherent") && target.confidence > 0.8 {
            score += 0.2;
        }

        score.min(1.0)
    }

    fn name(&self) -> &'static str {
        "CapabilityBasedAssignmentStrategy"
    }
}
