//! Execution backends for the stale action set.
//!
//! All backends share one contract: given an [`ExecutionBatch`], run every
//! pending action whose prerequisites succeed, record results, and return
//! whether the whole batch succeeded. A failing action never halts its
//! siblings; transitively dependent actions are skipped, not started.

use crate::{
    config::BuildConfig,
    error::Result,
    graph::{ActionGraph, ActionId},
};
use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc},
    time::SystemTime,
};

pub mod farm;
pub mod hybrid;
pub mod local;

pub use farm::{FarmExecutor, SdkFarmExecutor};
pub use hybrid::HybridExecutor;
pub use local::LocalExecutor;

/// Outcome of one executed action.
#[derive(Clone, Copy, Debug)]
pub struct ActionResult {
    pub exit_code: i32,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl ActionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// A spawn failure, reported with exit code 1.
    pub fn spawn_failed(start_time: SystemTime) -> Self {
        Self { exit_code: 1, start_time, end_time: SystemTime::now() }
    }
}

/// Per-action scheduling state within a batch.
#[derive(Clone, Copy, Debug)]
pub enum ActionState {
    Pending,
    Finished(ActionResult),
    /// Never started because a transitive prerequisite failed.
    Skipped,
}

/// Readiness of an action with respect to its prerequisite actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Every prerequisite finished with exit code 0 (or was never stale).
    Ready,
    /// Some prerequisite is still pending or in flight.
    Waiting,
    /// Some prerequisite failed or was itself skipped.
    FailedPrerequisite,
}

/// The work list and shared result state one executor invocation operates
/// on. Executors may carve up `pending`; `states` is the source of truth for
/// ordering decisions and the final outcome.
pub struct ExecutionBatch<'a> {
    pub graph: &'a ActionGraph,
    /// Stale actions to run, in scheduling priority order.
    pub pending: Vec<ActionId>,
    pub states: HashMap<ActionId, ActionState>,
    /// Checked before every spawn; set to stop starting new work.
    pub cancel: Arc<AtomicBool>,
    pub log_detailed_stats: bool,
}

impl<'a> ExecutionBatch<'a> {
    pub fn new(graph: &'a ActionGraph, pending: Vec<ActionId>) -> Self {
        let states = pending.iter().map(|id| (*id, ActionState::Pending)).collect();
        Self {
            graph,
            pending,
            states,
            cancel: Arc::new(AtomicBool::new(false)),
            log_detailed_stats: false,
        }
    }

    /// Whether `id` may start now. Prerequisites outside the stale set count
    /// as complete.
    pub fn readiness(&self, id: ActionId) -> Readiness {
        let mut readiness = Readiness::Ready;
        for prereq in self.graph.prerequisites(id) {
            match self.states.get(prereq) {
                None => {}
                Some(ActionState::Finished(result)) if result.succeeded() => {}
                Some(ActionState::Finished(_)) | Some(ActionState::Skipped) => {
                    return Readiness::FailedPrerequisite;
                }
                Some(ActionState::Pending) => readiness = Readiness::Waiting,
            }
        }
        readiness
    }

    /// Records a result and invalidates the produced items so downstream
    /// checks observe the fresh filesystem state.
    pub fn mark_finished(&mut self, id: ActionId, result: ActionResult) {
        for item in &self.graph[id].produced_items {
            item.invalidate();
        }
        if !result.succeeded() {
            error!("{} failed with exit code {}", self.graph[id], result.exit_code);
        }
        self.states.insert(id, ActionState::Finished(result));
    }

    pub fn mark_skipped(&mut self, id: ActionId) {
        warn!("skipping {} because a prerequisite failed", self.graph[id]);
        self.states.insert(id, ActionState::Skipped);
    }

    pub fn result(&self, id: ActionId) -> Option<ActionResult> {
        match self.states.get(&id) {
            Some(ActionState::Finished(result)) => Some(*result),
            _ => None,
        }
    }

    /// True when every action in the batch finished with exit code 0.
    pub fn all_succeeded(&self) -> bool {
        self.states.values().all(|state| match state {
            ActionState::Finished(result) => result.succeeded(),
            ActionState::Pending | ActionState::Skipped => false,
        })
    }
}

/// A scheduling backend.
pub trait Executor {
    fn name(&self) -> &'static str;

    /// Drains the batch. Returns `Ok(true)` only when every action
    /// succeeded; action failures are recorded in the batch rather than
    /// surfaced as errors.
    fn execute(&self, batch: &mut ExecutionBatch<'_>) -> Result<bool>;
}

/// Picks the best available backend: hybrid when a farm and the local pool
/// can be combined, then the general farm, then the SDK farm, then the local
/// parallel pool, degenerating to a single-process pool.
pub fn select_executor(config: &BuildConfig) -> Box<dyn Executor> {
    let farm = config
        .allow_remote_farm
        .then(|| config.farm_driver.clone())
        .flatten()
        .map(|driver| FarmExecutor::new(driver, config));
    let sdk_farm = config
        .allow_sdk_farm
        .then(|| config.sdk_farm_driver.clone())
        .flatten()
        .map(|driver| SdkFarmExecutor::new(driver, config));

    let remote: Option<Box<dyn Executor>> = match (farm, sdk_farm) {
        (Some(farm), _) => Some(Box::new(farm)),
        (None, Some(sdk_farm)) => Some(Box::new(sdk_farm)),
        (None, None) => None,
    };

    match remote {
        Some(remote) if config.allow_hybrid => {
            Box::new(HybridExecutor::new(remote, config))
        }
        Some(remote) => remote,
        None if config.max_processor_count <= 1 => Box::new(LocalExecutor::single()),
        None => Box::new(LocalExecutor::new(config)),
    }
}
