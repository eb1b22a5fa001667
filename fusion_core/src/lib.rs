//! Fusenet Core - L2 Sensor-Fusion Coordination Engines
//!
//! This library is the middle tier of a two-level sensing stack: L1 nodes
//! (radar, lidar, camera, IMU, GPS, gimbal-equipped coherent devices)
//! publish detections and liveness over a pub/sub bus, and the L2
//! coordinator here fuses them, tracks targets, and tasks devices back.
//!
//! The pieces, leaves first:
//! 1. **Node Registry**: concurrent liveness roster with atomic sweep-and-evict
//! 2. **Task Manager**: target/device/task assignment index with per-task state machines
//! 3. **Algorithm Framework**: pluggable algorithm contract, context, and factory registry
//! 4. **Strategies**: swappable target-prioritization and device-assignment policies
//! 5. **Target Tracking**: the reference fusion algorithm (IDLE/ACQUIRING/TRACKING/LOST)
//! 6. **Fusion Manager**: the coordinator wiring bus, queue, workers, and timers together

pub mod algorithm;
pub mod clock;
pub mod context;
pub mod manager;
pub mod messages;
pub mod registry;
pub mod state_machine;
pub mod strategies;
pub mod target;
pub mod tasks;
pub mod tracking;

// Re-export key types for convenience
pub use algorithm::{AlgorithmError, AlgorithmRegistry, FusionAlgorithm, StrategySet};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::AlgorithmContext;
pub use manager::{BoundedQueue, ConfigError, FusionConfig, FusionManager, ManagerState, SystemStats};
pub use registry::NodeRegistry;
pub use state_machine::{State, StateMachine, Transition};
pub use strategies::{
    CapabilityBasedAssignmentStrategy, ConfidenceBasedPrioritizer, DeviceAssignmentStrategy,
    SingleDeviceAssignmentStrategy, TargetPrioritizer, ThreatBasedPrioritizer, ThreatWeights,
};
pub use target::Target;
pub use tasks::{Task, TaskId, TaskManager, TaskPriority, TaskSnapshot, TaskStats, TaskStatus, TaskType};
pub use tracking::{TargetTrackingAlgorithm, TrackingParams};
