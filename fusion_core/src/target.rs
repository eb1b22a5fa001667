//! Fused target representation used by the tracking algorithm and the
//! prioritization strategies.

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::Vector3;

/// One fused object hypothesis.
#[derive(Debug, Clone)]
pub struct Target {
    pub target_id: String,
    /// Smoothed position estimate in sensor-frame Cartesian meters.
    pub position: Vector3<f64>,
    /// Smoothed velocity estimate in m/s.
    pub velocity: Vector3<f64>,
    /// Belief that the target is real, in [0, 1].
    pub confidence: f64,
    /// When a sensor last contributed to this target.
    pub last_update: Instant,
    /// Detection count per contributing sensor node.
    pub sensor_detections: HashMap<String, u32>,
}

impl Target {
    pub fn new(target_id: impl Into<String>, now: Instant) -> Self {
        Self {
            target_id: target_id.into(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            confidence: 0.0,
            last_update: now,
            sensor_detections: HashMap::new(),
        }
    }

    /// Distance to the origin (range for gimbal pointing).
    pub fn range(&self) -> f64 {
        self.position.norm()
    }

    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }
}
