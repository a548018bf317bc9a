//! The build driver.
//!
//! Drives one invocation end to end: warm the metadata cache, link the
//! graph, compute the stale set, pick an executor, run it, verify link
//! outputs and persist the caches that changed.

use crate::{
    action::{Action, ActionKind},
    error::{BuildError, Result},
    exec::{self, ActionState, ExecutionBatch},
    graph::{ActionGraph, ActionId, StalenessAnalyzer, StalenessContext},
    prefetch::MetadataPrefetcher,
    BuildEngine,
};
use std::{path::PathBuf, time::Duration};

/// Result of one executed (or skipped) action, for reporting.
#[derive(Clone, Debug)]
pub struct ExecutedAction {
    pub description: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// What one engine invocation did.
#[derive(Clone, Debug, Default)]
pub struct BuildOutcome {
    /// Every scheduled action completed with exit code 0.
    pub success: bool,
    /// Nothing was stale; no action was spawned.
    pub up_to_date: bool,
    pub executed: Vec<ExecutedAction>,
    /// Actions never started because a transitive prerequisite failed.
    pub skipped: usize,
}

pub(crate) struct BuildDriver<'a> {
    engine: &'a BuildEngine,
}

impl<'a> BuildDriver<'a> {
    pub(crate) fn new(engine: &'a BuildEngine) -> Self {
        Self { engine }
    }

    pub(crate) fn run(&self, actions: Vec<Action>, targets: &[PathBuf]) -> Result<BuildOutcome> {
        let config = self.engine.config();
        let registry = self.engine.registry();

        let prefetcher = MetadataPrefetcher::new(registry.clone(), config.prefetch_threads);
        prefetcher.queue_engine_root(&config.engine_root);
        prefetcher.queue_directory(&config.project_root);

        // checked while the prefetch runs; a change invalidates every
        // generated-code input, so the incremental state cannot be trusted
        let force_rebuild = match self.engine.external_dependencies() {
            Some(dependencies) => dependencies.has_changes()?,
            None => false,
        };

        prefetcher.wait();

        let graph = ActionGraph::link(actions)?;
        let closure = graph.prerequisite_closure(targets, registry);
        let scheduled = graph.sorted_for_execution(&closure);

        // the analyzer always runs, even on a forced rebuild, so every
        // produced item's command-line fingerprint is brought up to date
        let analyzer = StalenessAnalyzer::new(
            &graph,
            StalenessContext {
                history: self.engine.histories(),
                dependency_lists: self.engine.dependency_lists(),
                registry,
                mtime_slop: config.mtime_slop,
                ignore_import_library_changes: config.ignore_import_library_changes,
            },
        );
        let mut stale = analyzer.gather(&scheduled)?;
        if force_rebuild {
            warn!("external dependencies changed; rebuilding all scheduled actions");
            stale = scheduled.clone();
        }

        if stale.is_empty() {
            info!("Target is up to date");
            self.engine.persist_caches()?;
            return Ok(BuildOutcome { success: true, up_to_date: true, ..Default::default() });
        }

        if config.validate_output_path_lengths {
            graph.validate_output_path_lengths(
                &stale,
                &config.project_root,
                config.path_length_warning_budget,
            )?;
        }
        graph.delete_scheduled_items(&stale)?;
        graph.prepare_output_directories(&stale)?;

        let executor = exec::select_executor(config);
        info!(
            "executing {} of {} actions with the {} executor",
            stale.len(),
            graph.len(),
            executor.name()
        );
        let mut batch = ExecutionBatch::new(&graph, stale.clone());
        batch.cancel = self.engine.cancel_token();
        batch.log_detailed_stats = config.log_detailed_stats;
        let success = executor.execute(&mut batch)?;

        self.verify_link_outputs(&graph, &stale, &batch)?;
        self.engine.persist_caches()?;

        let outcome = collect_outcome(&graph, &stale, &batch, success);
        if config.log_detailed_stats {
            log_summary(&outcome);
        }
        Ok(outcome)
    }

    /// A link step that reports success but leaves an output missing means
    /// the toolchain failed silently; surfacing it here beats shipping a
    /// half-linked binary.
    fn verify_link_outputs(
        &self,
        graph: &ActionGraph,
        stale: &[ActionId],
        batch: &ExecutionBatch<'_>,
    ) -> Result<()> {
        for id in stale {
            let action = &graph[*id];
            if action.kind != ActionKind::Link {
                continue;
            }
            let Some(result) = batch.result(*id) else { continue };
            if !result.succeeded() {
                continue;
            }
            for item in &action.produced_items {
                if !item.exists() {
                    return Err(BuildError::MissingLinkOutput {
                        description: action.to_string(),
                        item: item.path().to_path_buf(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn collect_outcome(
    graph: &ActionGraph,
    stale: &[ActionId],
    batch: &ExecutionBatch<'_>,
    success: bool,
) -> BuildOutcome {
    let mut executed = Vec::new();
    let mut skipped = 0;
    for id in stale {
        match batch.states.get(id) {
            Some(ActionState::Finished(result)) => executed.push(ExecutedAction {
                description: graph[*id].to_string(),
                exit_code: result.exit_code,
                duration: result
                    .end_time
                    .duration_since(result.start_time)
                    .unwrap_or(Duration::ZERO),
            }),
            Some(ActionState::Skipped) => skipped += 1,
            _ => {}
        }
    }
    BuildOutcome { success, up_to_date: false, executed, skipped }
}

/// Per-action wall-clock summary, slowest first.
fn log_summary(outcome: &BuildOutcome) {
    let mut rows: Vec<&ExecutedAction> = outcome.executed.iter().collect();
    rows.sort_by(|a, b| b.duration.cmp(&a.duration));
    info!("action timing:");
    for row in rows {
        info!("{:>9.2}s  {}", row.duration.as_secs_f64(), row.description);
    }
    let total: Duration = outcome.executed.iter().map(|row| row.duration).sum();
    info!("{:>9.2}s  total ({} actions, {} skipped)", total.as_secs_f64(), outcome.executed.len(), outcome.skipped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counts_skips_and_failures() {
        let outcome = BuildOutcome {
            success: false,
            up_to_date: false,
            executed: vec![ExecutedAction {
                description: "Compile: a.cpp".into(),
                exit_code: 1,
                duration: Duration::from_millis(20),
            }],
            skipped: 2,
        };
        assert!(!outcome.success);
        assert_eq!(outcome.skipped, 2);
        log_summary(&outcome);
    }
}
