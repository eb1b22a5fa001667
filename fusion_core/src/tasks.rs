//! Tasks and the target/device/task assignment index.
//!
//! A [`Task`] binds one target to (at most) one device and carries its own
//! little state machine. The [`TaskManager`] owns every task and keeps the
//! reverse indices (`by_target`, `by_device`, `primary_device`) consistent
//! under a single lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::context::AlgorithmContext;
use crate::state_machine::{State, StateMachine, Transition};

/// Terminal tasks older than this get garbage-collected.
const CLEANUP_RETENTION: Duration = Duration::from_secs(60 * 60);
/// Minimum spacing between cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Monotonic task identifier, unique within one [`TaskManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    TrackTarget,
    ScanArea,
    PointGimbal,
    CalibrateSensor,
    MonitorStatus,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackTarget => "TRACK_TARGET",
            Self::ScanArea => "SCAN_AREA",
            Self::PointGimbal => "POINT_GIMBAL",
            Self::CalibrateSensor => "CALIBRATE_SENSOR",
            Self::MonitorStatus => "MONITOR_STATUS",
        }
    }
}

/// Scheduling weight. Metadata at this layer; only strategies act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Assigned,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Assigned => "ASSIGNED",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Per-task machine states: INITIALIZING -> EXECUTING -> COMPLETING, with
/// an ERROR detour that `retry` routes back to INITIALIZING.
fn default_task_machine() -> StateMachine<AlgorithmContext> {
    StateMachine::new()
        .add_state(State::new("INITIALIZING"))
        .add_state(State::new("EXECUTING"))
        .add_state(State::new("COMPLETING"))
        .add_state(State::new("ERROR"))
        .initial_state("INITIALIZING")
        .add_transition(Transition::new("INITIALIZING", "EXECUTING", "start"))
        .add_transition(Transition::new("EXECUTING", "COMPLETING", "complete"))
        .add_transition(Transition::new("INITIALIZING", "ERROR", "error"))
        .add_transition(Transition::new("EXECUTING", "ERROR", "error"))
        .add_transition(Transition::new("ERROR", "INITIALIZING", "retry"))
}

/// A unit of work bound to one target and, once assigned, one device.
pub struct Task {
    id: TaskId,
    target_id: String,
    /// Empty until a device is assigned.
    device_id: String,
    task_type: TaskType,
    priority: TaskPriority,
    status: TaskStatus,

    created: Instant,
    assigned: Option<Instant>,
    started: Option<Instant>,
    completed: Option<Instant>,

    parameters: HashMap<String, Box<dyn Any + Send + Sync>>,
    machine: StateMachine<AlgorithmContext>,

    /// 0..=100, clamped on write.
    progress: f64,
    status_message: String,
}

impl Task {
    fn new(
        id: TaskId,
        target_id: impl Into<String>,
        task_type: TaskType,
        priority: TaskPriority,
        now: Instant,
    ) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            device_id: String::new(),
            task_type,
            priority,
            status: TaskStatus::Created,
            created: now,
            assigned: None,
            started: None,
            completed: None,
            parameters: HashMap::new(),
            machine: default_task_machine(),
            progress: 0.0,
            status_message: String::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn machine_state(&self) -> &str {
        self.machine.current()
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    fn set_device(&mut self, device_id: &str, now: Instant) {
        self.device_id = device_id.to_string();
        if self.status == TaskStatus::Created {
            self.status = TaskStatus::Assigned;
            self.assigned = Some(now);
        }
    }

    fn set_status(&mut self, status: TaskStatus, now: Instant) {
        self.status = status;
        match status {
            TaskStatus::Active => {
                // First activation only; pauses and resumes keep it.
                if self.started.is_none() {
                    self.started = Some(now);
                }
            }
            TaskStatus::Completed => {
                self.completed = Some(now);
                self.progress = 100.0;
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed = Some(now);
            }
            _ => {}
        }
    }

    fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 100.0);
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created)
    }

    pub fn execution_time(&self, now: Instant) -> Duration {
        match (self.started, self.completed) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => now.duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

/// Read-only copy of a task's bookkeeping fields, handed out by queries
/// so callers never hold references into the locked tables.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub target_id: String,
    pub device_id: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub progress: f64,
    pub status_message: String,
    pub machine_state: String,
}

impl TaskSnapshot {
    fn of(task: &Task) -> Self {
        Self {
            id: task.id,
            target_id: task.target_id.clone(),
            device_id: task.device_id.clone(),
            task_type: task.task_type,
            priority: task.priority,
            status: task.status,
            progress: task.progress,
            status_message: task.status_message.clone(),
            machine_state: task.machine.current().to_string(),
        }
    }
}

/// Counters reported by [`TaskManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub registered_devices: usize,
    pub targets_with_assignments: usize,
}

struct TaskTables {
    tasks: HashMap<TaskId, Task>,
    by_target: HashMap<String, Vec<TaskId>>,
    by_device: HashMap<String, Vec<TaskId>>,
    primary_device: HashMap<String, String>,
    /// Persistent device info; survives `clear_all`.
    device_capabilities: HashMap<String, Vec<String>>,
    next_id: u64,
    last_cleanup: Instant,
}

/// Tri-partite index over tasks, targets, and devices.
///
/// One reader-writer lock guards all five maps plus the id counter, so
/// every query sees the indices in a consistent state.
pub struct TaskManager {
    tables: RwLock<TaskTables>,
    clock: Arc<dyn Clock>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            tables: RwLock::new(TaskTables {
                tasks: HashMap::new(),
                by_target: HashMap::new(),
                by_device: HashMap::new(),
                primary_device: HashMap::new(),
                device_capabilities: HashMap::new(),
                next_id: 1,
                last_cleanup: now,
            }),
            clock,
        }
    }

    /// Creates a task for a target. The task starts unassigned.
    pub fn create(
        &self,
        target_id: &str,
        task_type: TaskType,
        priority: TaskPriority,
    ) -> TaskId {
        let now = self.clock.now();
        let mut t = self.tables.write();

        let id = TaskId(t.next_id);
        t.next_id += 1;

        t.tasks
            .insert(id, Task::new(id, target_id, task_type, priority, now));
        t.by_target.entry(target_id.to_string()).or_default().push(id);

        id
    }

    /// Assigns (or reassigns) a task to a device and records the device
    /// as the target's primary. Returns `false` for unknown tasks.
    pub fn assign(&self, task_id: TaskId, device_id: &str) -> bool {
        let now = self.clock.now();
        let mut guard = self.tables.write();
        let t = &mut *guard;

        let Some(task) = t.tasks.get_mut(&task_id) else {
            return false;
        };

        let prev_device = task.device_id.clone();
        if !prev_device.is_empty() && prev_device != device_id {
            Self::unlink(&mut t.by_device, &prev_device, task_id);
        }

        task.set_device(device_id, now);
        let target_id = task.target_id.clone();

        let bucket = t.by_device.entry(device_id.to_string()).or_default();
        if !bucket.contains(&task_id) {
            bucket.push(task_id);
        }
        t.primary_device.insert(target_id, device_id.to_string());

        true
    }

    fn unlink(index: &mut HashMap<String, Vec<TaskId>>, key: &str, task_id: TaskId) {
        if let Some(bucket) = index.get_mut(key) {
            bucket.retain(|id| *id != task_id);
            if bucket.is_empty() {
                index.remove(key);
            }
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.tables.read().tasks.get(&task_id).map(TaskSnapshot::of)
    }

    pub fn by_target(&self, target_id: &str) -> Vec<TaskSnapshot> {
        let t = self.tables.read();
        t.by_target
            .get(target_id)
            .into_iter()
            .flatten()
            .filter_map(|id| t.tasks.get(id).map(TaskSnapshot::of))
            .collect()
    }

    pub fn by_device(&self, device_id: &str) -> Vec<TaskSnapshot> {
        let t = self.tables.read();
        t.by_device
            .get(device_id)
            .into_iter()
            .flatten()
            .filter_map(|id| t.tasks.get(id).map(TaskSnapshot::of))
            .collect()
    }

    pub fn primary_device_of(&self, target_id: &str) -> Option<String> {
        self.tables.read().primary_device.get(target_id).cloned()
    }

    pub fn register_capabilities(&self, device_id: &str, capabilities: Vec<String>) {
        self.tables
            .write()
            .device_capabilities
            .insert(device_id.to_string(), capabilities);
    }

    pub fn capabilities_of(&self, device_id: &str) -> Vec<String> {
        self.tables
            .read()
            .device_capabilities
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of every device that ever registered capabilities.
    pub fn registered_devices(&self) -> Vec<String> {
        self.tables.read().device_capabilities.keys().cloned().collect()
    }

    /// Removes a task and scrubs every index referring to it. The
    /// target's primary-device entry goes away with its last task.
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut t = self.tables.write();

        let Some(task) = t.tasks.remove(&task_id) else {
            return false;
        };

        Self::unlink(&mut t.by_target, &task.target_id, task_id);
        if !t.by_target.contains_key(&task.target_id) {
            t.primary_device.remove(&task.target_id);
        }
        if !task.device_id.is_empty() {
            Self::unlink(&mut t.by_device, &task.device_id, task_id);
        }

        true
    }

    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) -> bool {
        let now = self.clock.now();
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task_id) {
            Some(task) => {
                task.set_status(status, now);
                true
            }
            None => false,
        }
    }

    pub fn set_progress(&self, task_id: TaskId, progress: f64) -> bool {
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task_id) {
            Some(task) => {
                task.set_progress(progress);
                true
            }
            None => false,
        }
    }

    pub fn set_status_message(&self, task_id: TaskId, message: impl Into<String>) -> bool {
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task_id) {
            Some(task) => {
                task.status_message = message.into();
                true
            }
            None => false,
        }
    }

    /// Stores an arbitrary typed parameter on a task.
    pub fn set_task_parameter<T: Send + Sync + 'static>(
        &self,
        task_id: TaskId,
        key: impl Into<String>,
        value: T,
    ) -> bool {
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task_id) {
            Some(task) => {
                task.parameters.insert(key.into(), Box::new(value));
                true
            }
            None => false,
        }
    }

    /// Reads a task parameter back. Absent key or mismatched type both
    /// come back as `None`.
    pub fn task_parameter<T: Clone + 'static>(&self, task_id: TaskId, key: &str) -> Option<T> {
        let t = self.tables.read();
        t.tasks
            .get(&task_id)?
            .parameters
            .get(key)?
            .downcast_ref::<T>()
            .cloned()
    }

    /// Fires a trigger on one task's state machine.
    pub fn trigger_task(&self, task_id: TaskId, ctx: &mut AlgorithmContext, trigger: &str) -> bool {
        let mut t = self.tables.write();
        match t.tasks.get_mut(&task_id) {
            Some(task) => task.machine.try_transition(ctx, trigger),
            None => false,
        }
    }

    /// Runs the per-task `on_update` hook for every ACTIVE task, then —
    /// at most once per cleanup interval — garbage-collects terminal
    /// tasks past retention.
    ///
    /// Updates run under the shared lock; the lock is dropped before the
    /// cleanup takes the exclusive lock, so the two never nest.
    pub fn tick(&self, ctx: &mut AlgorithmContext) {
        let now = self.clock.now();

        let cleanup_due = {
            let t = self.tables.read();
            for task in t.tasks.values() {
                if task.is_active() {
                    task.machine.update(ctx);
                }
            }
            now.duration_since(t.last_cleanup) >= CLEANUP_INTERVAL
        };

        if cleanup_due {
            self.cleanup_terminal_tasks(now);
        }
    }

    fn cleanup_terminal_tasks(&self, now: Instant) {
        let expired: Vec<TaskId> = {
            let mut t = self.tables.write();
            t.last_cleanup = now;
            t.tasks
                .values()
                .filter(|task| {
                    task.status.is_terminal()
                        && task
                            .completed
                            .is_some_and(|done| now.duration_since(done) >= CLEANUP_RETENTION)
                })
                .map(|task| task.id)
                .collect()
        };

        for id in &expired {
            self.remove(*id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "cleaned up terminal tasks");
        }
    }

    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let t = self.tables.read();
        t.tasks
            .values()
            .filter(|task| task.is_active())
            .map(TaskSnapshot::of)
            .collect()
    }

    pub fn stats(&self) -> TaskStats {
        let t = self.tables.read();
        let mut stats = TaskStats {
            total: t.tasks.len(),
            registered_devices: t.device_capabilities.len(),
            targets_with_assignments: t.primary_device.len(),
            ..TaskStats::default()
        };

        for task in t.tasks.values() {
            match task.status {
                TaskStatus::Active => stats.active += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed | TaskStatus::Cancelled => stats.failed += 1,
                _ => {}
            }
        }

        stats
    }

    /// Drops all tasks and assignments. Device capabilities persist;
    /// they describe hardware, not workload.
    pub fn clear_all(&self) {
        let mut t = self.tables.write();
        t.tasks.clear();
        t.by_target.clear();
        t.by_device.clear();
        t.primary_device.clear();
    }

    /// Verifies the reverse-index invariant. Test support.
    #[doc(hidden)]
    pub fn is_consistent(&self) -> bool {
        let t = self.tables.read();

        // Every task appears in its target bucket, and in its device
        // bucket iff assigned, with the primary device matching.
        for task in t.tasks.values() {
            let in_target = t
                .by_target
                .get(&task.target_id)
                .is_some_and(|b| b.contains(&task.id));
            if !in_target {
                return false;
            }
            if !task.device_id.is_empty() {
                let in_device = t
                    .by_device
                    .get(&task.device_id)
                    .is_some_and(|b| b.contains(&task.id));
                if !in_device {
                    return false;
                }
            }
        }

        // No dangling ids and no empty buckets in either reverse index.
        let clean = |index: &HashMap<String, Vec<TaskId>>| {
            index
                .values()
                .all(|b| !b.is_empty() && b.iter().all(|id| t.tasks.contains_key(id)))
        };
        clean(&t.by_target) && clean(&t.by_device)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn task_ids_are_strictly_increasing() {
        let tm = TaskManager::new();
        let a = tm.create("t1", TaskType::TrackTarget, TaskPriority::Normal);
        let b = tm.create("t1", TaskType::ScanArea, TaskPriority::Normal);
        let c = tm.create("t2", TaskType::TrackTarget, TaskPriority::High);
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "task_1");
    }

    #[test]
    fn create_then_assign_updates_all_indices() {
        let tm = TaskManager::new();
        let id = tm.create("target_0", TaskType::TrackTarget, TaskPriority::High);

        let task = tm.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.device_id.is_empty());

        assert!(tm.assign(id, "radar_001"));
        let task = tm.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.device_id, "radar_001");

        assert_eq!(tm.by_target("target_0").len(), 1);
        assert_eq!(tm.by_device("radar_001").len(), 1);
        assert_eq!(tm.primary_device_of("target_0").as_deref(), Some("radar_001"));
        assert!(tm.is_consistent());
    }

    #[test]
    fn reassignment_moves_between_device_buckets() {
        let tm = TaskManager::new();
        let id = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);

        assert!(tm.assign(id, "dev_a"));
        assert!(tm.assign(id, "dev_b"));

        assert!(tm.by_device("dev_a").is_empty());
        assert_eq!(tm.by_device("dev_b").len(), 1);
        assert_eq!(tm.primary_device_of("t").as_deref(), Some("dev_b"));
        assert!(tm.is_consistent());
    }

    #[test]
    fn assign_unknown_task_fails() {
        let tm = TaskManager::new();
        assert!(!tm.assign(TaskId(99), "dev"));
    }

    #[test]
    fn remove_scrubs_indices_and_primary_device() {
        let tm = TaskManager::new();
        let a = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        let b = tm.create("t", TaskType::ScanArea, TaskPriority::Normal);
        tm.assign(a, "dev");
        tm.assign(b, "dev");

        assert!(tm.remove(a));
        // Target still has a task, so the primary device stays.
        assert_eq!(tm.primary_device_of("t").as_deref(), Some("dev"));

        assert!(tm.remove(b));
        assert!(tm.primary_device_of("t").is_none());
        assert!(tm.by_target("t").is_empty());
        assert!(tm.by_device("dev").is_empty());
        assert!(tm.is_consistent());

        assert!(!tm.remove(b));
    }

    #[test]
    fn progress_is_clamped() {
        let tm = TaskManager::new();
        let id = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);

        tm.set_progress(id, 250.0);
        assert_eq!(tm.get(id).unwrap().progress, 100.0);
        tm.set_progress(id, -5.0);
        assert_eq!(tm.get(id).unwrap().progress, 0.0);
        tm.set_progress(id, 42.5);
        assert_eq!(tm.get(id).unwrap().progress, 42.5);
    }

    #[test]
    fn completed_pins_progress_but_failed_does_not() {
        let tm = TaskManager::new();
        let a = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        let b = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);

        tm.set_progress(a, 30.0);
        tm.set_status(a, TaskStatus::Completed);
        assert_eq!(tm.get(a).unwrap().progress, 100.0);

        tm.set_progress(b, 30.0);
        tm.set_status(b, TaskStatus::Failed);
        assert_eq!(tm.get(b).unwrap().progress, 30.0);
    }

    #[test]
    fn started_is_set_once_on_first_activation() {
        let clock = ManualClock::new();
        let tm = TaskManager::with_clock(clock.clone());
        let id = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        tm.assign(id, "dev");

        tm.set_status(id, TaskStatus::Active);
        clock.advance(Duration::from_secs(10));
        tm.set_status(id, TaskStatus::Paused);
        tm.set_status(id, TaskStatus::Active);
        clock.advance(Duration::from_secs(5));
        tm.set_status(id, TaskStatus::Completed);

        // Execution time spans from the *first* activation.
        let t = self::read_task(&tm, id, |task| task.execution_time(clock.now()));
        assert_eq!(t, Duration::from_secs(15));
    }

    // Small helper so tests can inspect owner-side fields.
    fn read_task<R>(tm: &TaskManager, id: TaskId, f: impl FnOnce(&Task) -> R) -> R {
        let t = tm.tables.read();
        f(t.tasks.get(&id).unwrap())
    }

    #[test]
    fn task_parameters_miss_on_wrong_type() {
        let tm = TaskManager::new();
        let id = tm.create("t", TaskType::CalibrateSensor, TaskPriority::Low);

        assert!(tm.set_task_parameter(id, "gain", 2.5_f64));
        assert_eq!(tm.task_parameter::<f64>(id, "gain"), Some(2.5));
        assert_eq!(tm.task_parameter::<String>(id, "gain"), None);
        assert_eq!(tm.task_parameter::<f64>(id, "missing"), None);
    }

    #[test]
    fn per_task_machine_walks_its_lifecycle() {
        let tm = TaskManager::new();
        let mut ctx = AlgorithmContext::new();
        let id = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);

        assert_eq!(tm.get(id).unwrap().machine_state, "INITIALIZING");
        assert!(tm.trigger_task(id, &mut ctx, "start"));
        assert_eq!(tm.get(id).unwrap().machine_state, "EXECUTING");
        assert!(tm.trigger_task(id, &mut ctx, "error"));
        assert_eq!(tm.get(id).unwrap().machine_state, "ERROR");
        assert!(tm.trigger_task(id, &mut ctx, "retry"));
        assert_eq!(tm.get(id).unwrap().machine_state, "INITIALIZING");

        // complete is not valid from INITIALIZING.
        assert!(!tm.trigger_task(id, &mut ctx, "complete"));
    }

    #[test]
    fn clear_all_keeps_device_capabilities() {
        let tm = TaskManager::new();
        tm.register_capabilities("dev", vec!["radar".into(), "gimbal_control".into()]);
        let id = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        tm.assign(id, "dev");

        tm.clear_all();

        assert_eq!(tm.stats().total, 0);
        assert!(tm.primary_device_of("t").is_none());
        assert_eq!(tm.capabilities_of("dev").len(), 2);
        assert_eq!(tm.registered_devices(), vec!["dev".to_string()]);
    }

    #[test]
    fn stats_bucket_by_status() {
        let tm = TaskManager::new();
        tm.register_capabilities("dev", vec!["radar".into()]);

        let a = tm.create("t1", TaskType::TrackTarget, TaskPriority::Normal);
        let b = tm.create("t1", TaskType::ScanArea, TaskPriority::Normal);
        let c = tm.create("t2", TaskType::TrackTarget, TaskPriority::Normal);
        tm.assign(a, "dev");
        tm.set_status(a, TaskStatus::Active);
        tm.set_status(b, TaskStatus::Completed);
        tm.set_status(c, TaskStatus::Cancelled);

        let stats = tm.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.registered_devices, 1);
        assert_eq!(stats.targets_with_assignments, 1);
    }

    #[test]
    fn cleanup_reaps_old_terminal_tasks_only() {
        let clock = ManualClock::new();
        let tm = TaskManager::with_clock(clock.clone());
        let mut ctx = AlgorithmContext::new();

        let old_done = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        tm.set_status(old_done, TaskStatus::Completed);
        let still_running = tm.create("t", TaskType::TrackTarget, TaskPriority::Normal);
        tm.set_status(still_running, TaskStatus::Active);

        // Past retention and past the cleanup interval.
        clock.advance(Duration::from_secs(2 * 60 * 60));
        let fresh_done = tm.create("t", TaskType::ScanArea, TaskPriority::Normal);
        tm.set_status(fresh_done, TaskStatus::Completed);

        tm.tick(&mut ctx);

        assert!(tm.get(old_done).is_none());
        assert!(tm.get(still_running).is_some());
        assert!(tm.get(fresh_done).is_some());
        assert!(tm.is_consistent());
    }

    #[test]
    fn indices_stay_consistent_under_random_operations() {
        use rand::Rng;

        let tm = TaskManager::new();
        let mut rng = rand::thread_rng();
        let targets = ["t0", "t1", "t2"];
        let devices = ["d0", "d1"];
        let mut ids: Vec<TaskId> = Vec::new();

        for _ in 0..2_000 {
            match rng.gen_range(0..4) {
                0 => {
                    let id = tm.create(
                        targets[rng.gen_range(0..targets.len())],
                        TaskType::TrackTarget,
                        TaskPriority::Normal,
                    );
                    ids.push(id);
                }
                1 if !ids.is_empty() => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    tm.assign(id, devices[rng.gen_range(0..devices.len())]);
                }
                2 if !ids.is_empty() => {
                    let idx = rng.gen_range(0..ids.len());
                    tm.remove(ids.swap_remove(idx));
                }
                _ if !ids.is_empty() => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    tm.set_status(id, TaskStatus::Active);
                }
                _ => {}
            }
            assert!(tm.is_consistent());
        }
    }
}
