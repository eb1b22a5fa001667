//! Fusion algorithm contract, factory registry, and strategy slots.
//!
//! An algorithm is a passive object the manager drives: every mutable
//! thing it works on lives in the [`AlgorithmContext`], so hook dispatch
//! only ever needs a shared reference to the algorithm itself. That is
//! what lets the manager hold its algorithm lock in shared mode during
//! calls and exclusively only around lifecycle changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::context::AlgorithmContext;
use crate::messages::L1ToL2Message;
use crate::strategies::{DeviceAssignmentStrategy, TargetPrioritizer};

/// Failure surfaced by an algorithm hook. The manager logs these and
/// keeps going; a bad message or tick never takes the coordinator down.
#[derive(Debug, Error)]
pub enum AlgorithmError {
    #[error("invalid data for trigger '{trigger}': {reason}")]
    InvalidTriggerData { trigger: String, reason: String },

    #[error("algorithm failure: {0}")]
    Failed(String),
}

impl AlgorithmError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Contract every fusion algorithm implements.
///
/// Hook order as driven by the manager: `initialize` once on start,
/// `process_inbound` per queued message, `update` on the tick cadence,
/// `handle_trigger` for external events, `shutdown` once on stop. The
/// manager guarantees at most one hook runs at a time.
pub trait FusionAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str;

    /// Sets up state machines and seed data. Runs under the exclusive
    /// algorithm lock.
    fn initialize(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError>;

    /// Consumes one inbound L1 message.
    fn process_inbound(
        &self,
        ctx: &mut AlgorithmContext,
        message: &L1ToL2Message,
    ) -> Result<(), AlgorithmError>;

    /// Periodic update on the configured cadence.
    fn update(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError>;

    /// Handles a named external event. Well-known names may have domain
    /// side effects; anything else falls through to the state machine,
    /// where an unknown trigger is a silent no-op.
    fn handle_trigger(
        &self,
        ctx: &mut AlgorithmContext,
        trigger: &str,
        data: Option<&str>,
    ) -> Result<(), AlgorithmError>;

    /// Final cleanup. Runs under the exclusive algorithm lock.
    fn shutdown(&self, ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError>;
}

// ============================================================================
// FACTORY REGISTRY
// ============================================================================

/// Builds a fresh algorithm instance per call.
pub type AlgorithmFactory = Box<dyn Fn() -> Box<dyn FusionAlgorithm> + Send + Sync>;

/// Name -> factory map for plugin-style algorithm selection.
///
/// Registration resolves the key by constructing a throwaway instance and
/// asking it for its name, so an algorithm cannot be registered under a
/// name it does not answer to.
pub struct AlgorithmRegistry {
    factories: RwLock<HashMap<String, AlgorithmFactory>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, factory: F)
    where
        F: Fn() -> Box<dyn FusionAlgorithm> + Send + Sync + 'static,
    {
        let name = factory().name().to_string();
        self.factories.write().insert(name, Box::new(factory));
    }

    /// Creates a fresh instance of the named algorithm.
    pub fn create(&self, name: &str) -> Option<Box<dyn FusionAlgorithm>> {
        let factories = self.factories.read();
        factories.get(name).map(|f| f())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// STRATEGY SLOTS
// ============================================================================

/// Swappable strategy pair for strategy-based algorithms.
///
/// The slots sit behind their own reader-writer locks, independent of the
/// manager's algorithm lock, so an operator can swap a policy while an
/// algorithm call is in flight. Callers read the `Arc` out under the lock
/// and must not cache it across suspension points.
pub struct StrategySet {
    prioritizer: RwLock<Arc<dyn TargetPrioritizer>>,
    assignment: RwLock<Arc<dyn DeviceAssignmentStrategy>>,
}

impl StrategySet {
    pub fn new(
        prioritizer: Arc<dyn TargetPrioritizer>,
        assignment: Arc<dyn DeviceAssignmentStrategy>,
    ) -> Self {
        Self {
            prioritizer: RwLock::new(prioritizer),
            assignment: RwLock::new(assignment),
        }
    }

    pub fn prioritizer(&self) -> Arc<dyn TargetPrioritizer> {
        Arc::clone(&self.prioritizer.read())
    }

    pub fn assignment(&self) -> Arc<dyn DeviceAssignmentStrategy> {
        Arc::clone(&self.assignment.read())
    }

    pub fn set_prioritizer(&self, prioritizer: Arc<dyn TargetPrioritizer>) {
        *self.prioritizer.write() = prioritizer;
    }

    pub fn set_assignment(&self, assignment: Arc<dyn DeviceAssignmentStrategy>) {
        *self.assignment.write() = assignment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::{ConfidenceBasedPrioritizer, SingleDeviceAssignmentStrategy};

    struct Dummy;

    impl FusionAlgorithm for Dummy {
        fn name(&self) -> &str {
            "Dummy"
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn initialize(&self, _ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
            Ok(())
        }
        fn process_inbound(
            &self,
            _ctx: &mut AlgorithmContext,
            _message: &L1ToL2Message,
        ) -> Result<(), AlgorithmError> {
            Ok(())
        }
        fn update(&self, _ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
            Ok(())
        }
        fn handle_trigger(
            &self,
            _ctx: &mut AlgorithmContext,
            _trigger: &str,
            _data: Option<&str>,
        ) -> Result<(), AlgorithmError> {
            Ok(())
        }
        fn shutdown(&self, _ctx: &mut AlgorithmContext) -> Result<(), AlgorithmError> {
            Ok(())
        }
    }

    #[test]
    fn registry_keys_on_self_reported_name() {
        let registry = AlgorithmRegistry::new();
        registry.register(|| Box::new(Dummy));

        assert!(registry.contains("Dummy"));
        assert!(!registry.contains("Other"));
        assert_eq!(registry.available(), vec!["Dummy".to_string()]);

        let algo = registry.create("Dummy").unwrap();
        assert_eq!(algo.name(), "Dummy");
        assert!(registry.create("Other").is_none());
    }

    #[test]
    fn strategy_slots_swap_under_readers() {
        let set = StrategySet::new(
            Arc::new(ConfidenceBasedPrioritizer),
            Arc::new(SingleDeviceAssignmentStrategy::new("a")),
        );

        assert_eq!(set.prioritizer().name(), "ConfidenceBasedPrioritizer");
        let held = set.assignment();

        set.set_assignment(Arc::new(SingleDeviceAssignmentStrategy::new("b")));

        // The old Arc stays valid for whoever grabbed it; new readers see
        // the replacement.
        assert_eq!(held.name(), "SingleDeviceAssignmentStrategy");
        assert_eq!(set.assignment().name(), "SingleDeviceAssignmentStrategy");
    }
}
