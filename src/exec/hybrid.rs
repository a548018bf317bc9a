//! Hybrid local/remote partitioning.
//!
//! A farm has a fixed per-batch overhead and shines on broad fan-out; the
//! handful of final link and codegen steps at the bottom of the graph run
//! faster locally. The hybrid executor peels leaf actions — actions no other
//! scheduled action depends on — off the stale set for local execution and
//! sends the interior to the farm.

use crate::{
    config::BuildConfig,
    error::Result,
    exec::{ExecutionBatch, Executor, LocalExecutor},
    graph::{ActionGraph, ActionId},
};
use std::collections::HashMap;

pub struct HybridExecutor {
    remote: Box<dyn Executor>,
    local: LocalExecutor,
    max_local_actions: usize,
}

impl HybridExecutor {
    pub fn new(remote: Box<dyn Executor>, config: &BuildConfig) -> Self {
        Self {
            remote,
            local: LocalExecutor::new(config),
            max_local_actions: config.max_local_actions,
        }
    }
}

/// Splits `ids` into `(local, remote)`: iteratively peel off actions whose
/// remaining in-set dependent count reaches zero, until no new leaves appear
/// or `max_local` have accumulated. The partition is exact and disjoint.
pub fn partition_leaves(
    graph: &ActionGraph,
    ids: &[ActionId],
    max_local: usize,
) -> (Vec<ActionId>, Vec<ActionId>) {
    let mut dependent_count: HashMap<ActionId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for id in ids {
        for prereq in graph.prerequisites(*id) {
            if let Some(count) = dependent_count.get_mut(prereq) {
                *count += 1;
            }
        }
    }

    let mut local = Vec::new();
    let mut wave: Vec<ActionId> = ids
        .iter()
        .copied()
        .filter(|id| dependent_count.get(id) == Some(&0))
        .collect();
    'peel: while !wave.is_empty() {
        let mut next_wave = Vec::new();
        for id in wave {
            if local.len() >= max_local {
                break 'peel;
            }
            local.push(id);
            for prereq in graph.prerequisites(id) {
                if let Some(count) = dependent_count.get_mut(prereq) {
                    *count -= 1;
                    if *count == 0 {
                        next_wave.push(*prereq);
                    }
                }
            }
        }
        wave = next_wave;
    }

    let remote = ids.iter().copied().filter(|id| !local.contains(id)).collect();
    (local, remote)
}

impl Executor for HybridExecutor {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn execute(&self, batch: &mut ExecutionBatch<'_>) -> Result<bool> {
        let (local, remote) =
            partition_leaves(batch.graph, &batch.pending, self.max_local_actions);
        if remote.is_empty() {
            return self.local.execute(batch);
        }
        debug!(
            "hybrid split: {} interior actions remote, {} leaf actions local",
            remote.len(),
            local.len()
        );

        // the interior runs first; the leaves depend on it
        batch.pending = remote;
        self.remote.execute(batch)?;
        batch.pending = local;
        self.local.execute(batch)?;
        Ok(batch.all_succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::{Action, ActionKind},
        items::ItemRegistry,
    };
    use std::{
        collections::HashSet,
        path::{Path, PathBuf},
    };

    fn compile(registry: &ItemRegistry, dir: &Path, source: &str, object: &str) -> Action {
        let mut action = Action::new(ActionKind::Compile);
        action.command_path = PathBuf::from("/usr/bin/cc");
        action.command_arguments = format!("-c {source} -o {object}");
        action.prerequisite_items = vec![registry.file(dir.join(source))];
        action.produced_items = vec![registry.file(dir.join(object))];
        action
    }

    fn link(registry: &ItemRegistry, dir: &Path, inputs: &[&str], output: &str) -> Action {
        let mut action = Action::new(ActionKind::Link);
        action.command_path = PathBuf::from("/usr/bin/ld");
        action.command_arguments = format!("-o {output}");
        action.prerequisite_items =
            inputs.iter().map(|input| registry.file(dir.join(input))).collect();
        action.produced_items = vec![registry.file(dir.join(output))];
        action
    }

    fn fan_out_graph() -> ActionGraph {
        let registry = ItemRegistry::new();
        let dir = Path::new("/work");
        let mut actions: Vec<Action> = (0..6)
            .map(|n| compile(&registry, dir, &format!("s{n}.cpp"), &format!("s{n}.o")))
            .collect();
        let objects: Vec<String> = (0..6).map(|n| format!("s{n}.o")).collect();
        let object_names: Vec<&str> = objects.iter().map(String::as_str).collect();
        actions.push(link(&registry, dir, &object_names, "game"));
        ActionGraph::link(actions).unwrap()
    }

    #[test]
    fn partition_is_exact_and_disjoint() {
        let graph = fan_out_graph();
        let ids: Vec<ActionId> = graph.ids().collect();
        let (local, remote) = partition_leaves(&graph, &ids, 3);

        let local_set: HashSet<_> = local.iter().collect();
        let remote_set: HashSet<_> = remote.iter().collect();
        assert!(local_set.is_disjoint(&remote_set));
        assert_eq!(local.len() + remote.len(), ids.len());
        assert!(local.len() <= 3);

        // the link is the only initial leaf
        assert_eq!(local[0], ActionId(6));
    }

    #[test]
    fn peeling_uncovers_new_leaves() {
        let graph = fan_out_graph();
        let ids: Vec<ActionId> = graph.ids().collect();
        // a large budget peels the whole graph wave by wave
        let (local, remote) = partition_leaves(&graph, &ids, 100);
        assert_eq!(local.len(), 7);
        assert!(remote.is_empty());

        // the link is peeled before the compiles it depends on
        assert_eq!(local[0], ActionId(6));
    }

    #[test]
    fn subset_partition_ignores_outside_dependents() {
        let graph = fan_out_graph();
        // only the compiles are scheduled; with the link absent they are all
        // immediate leaves
        let ids: Vec<ActionId> = (0..6).map(ActionId).collect();
        let (local, remote) = partition_leaves(&graph, &ids, 2);
        assert_eq!(local.len(), 2);
        assert_eq!(remote.len(), 4);
    }
}
