//! Distributed-farm execution.
//!
//! Both farm backends work the same way: every remotely-eligible action is
//! written into a task script, the farm's driver process is spawned once
//! over that script, and all scripted actions are marked complete when it
//! exits. Remotely-ineligible actions fall through to the local executor in
//! a single pass afterwards, with the scripted results already recorded.

use crate::{
    config::BuildConfig,
    error::{BuildError, Result},
    exec::{ActionResult, ExecutionBatch, Executor, LocalExecutor},
    graph::ActionId,
    utils,
};
use itertools::Itertools;
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

/// General distributed-farm backend.
pub struct FarmExecutor {
    driver: PathBuf,
    script_dir: PathBuf,
    local: LocalExecutor,
}

impl FarmExecutor {
    pub fn new(driver: PathBuf, config: &BuildConfig) -> Self {
        Self {
            driver,
            script_dir: config.intermediate_dir.clone(),
            local: LocalExecutor::new(config),
        }
    }
}

impl Executor for FarmExecutor {
    fn name(&self) -> &'static str {
        "farm"
    }

    fn execute(&self, batch: &mut ExecutionBatch<'_>) -> Result<bool> {
        run_farm(&self.driver, &self.script_dir, &self.local, batch, Eligibility::General, |_, _| {
            Ok(())
        })
    }
}

/// Farm backend specialised for one vendor SDK: the driver additionally
/// needs per-toolchain template files and include-rewrite rules so agents
/// can relocate generated headers.
pub struct SdkFarmExecutor {
    driver: PathBuf,
    script_dir: PathBuf,
    local: LocalExecutor,
}

impl SdkFarmExecutor {
    pub fn new(driver: PathBuf, config: &BuildConfig) -> Self {
        Self {
            driver,
            script_dir: config.intermediate_dir.clone(),
            local: LocalExecutor::new(config),
        }
    }
}

impl Executor for SdkFarmExecutor {
    fn name(&self) -> &'static str {
        "sdk-farm"
    }

    fn execute(&self, batch: &mut ExecutionBatch<'_>) -> Result<bool> {
        run_farm(&self.driver, &self.script_dir, &self.local, batch, Eligibility::Sdk, |dir, batch| {
            write_toolchain_templates(dir, batch)?;
            write_rewrite_rules(dir)
        })
    }
}

/// Which remote-eligibility flag a farm consults.
#[derive(Clone, Copy)]
enum Eligibility {
    General,
    Sdk,
}

impl Eligibility {
    fn allows(self, batch: &ExecutionBatch<'_>, id: ActionId) -> bool {
        let action = &batch.graph[id];
        match self {
            Eligibility::General => action.can_execute_remotely,
            Eligibility::Sdk => action.can_execute_on_sdk_farm,
        }
    }
}

fn run_farm(
    driver: &Path,
    script_dir: &Path,
    local: &LocalExecutor,
    batch: &mut ExecutionBatch<'_>,
    eligibility: Eligibility,
    prepare: impl Fn(&Path, &ExecutionBatch<'_>) -> Result<()>,
) -> Result<bool> {
    let (remote, local_only): (Vec<ActionId>, Vec<ActionId>) =
        batch.pending.iter().copied().partition(|id| eligibility.allows(batch, *id));

    if remote.is_empty() {
        return local.execute(batch);
    }

    prepare(script_dir, batch)?;
    let script = write_task_script(script_dir, batch, &remote)?;
    info!("dispatching {} actions to the build farm via \"{}\"", remote.len(), driver.display());

    let start_time = SystemTime::now();
    let status = Command::new(driver)
        .arg(&script)
        .status()
        .map_err(|err| BuildError::io(err, driver))?;
    let exit_code = status.code().unwrap_or(1);
    let end_time = SystemTime::now();
    if exit_code != 0 {
        error!("farm driver exited with code {exit_code}");
    }

    for id in &remote {
        batch.mark_finished(*id, ActionResult { exit_code, start_time, end_time });
    }

    // one local pass over the remainder, with the scripted results recorded
    batch.pending = local_only;
    local.execute(batch)?;
    Ok(batch.all_succeeded())
}

/// One task per line: working directory, command and arguments, tab
/// separated, in scheduling order so the farm sees high-fan-out work first.
fn write_task_script(
    script_dir: &Path,
    batch: &ExecutionBatch<'_>,
    ids: &[ActionId],
) -> Result<PathBuf> {
    let mut script = String::new();
    for id in ids {
        let action = &batch.graph[*id];
        let _ = writeln!(
            script,
            "{}\t{}\t{}",
            action.working_directory.display(),
            action.command_path.display(),
            action.command_arguments
        );
    }
    let path = script_dir.join("farm-tasks.txt");
    utils::replace_file(&path, script.as_bytes())?;
    trace!("wrote farm task script \"{}\" with {} tasks", path.display(), ids.len());
    Ok(path)
}

/// One template per distinct tool, describing how an agent re-invokes it.
fn write_toolchain_templates(script_dir: &Path, batch: &ExecutionBatch<'_>) -> Result<()> {
    let tools: Vec<&Path> = batch
        .pending
        .iter()
        .map(|id| batch.graph[*id].command_path.as_path())
        .unique()
        .collect();
    for tool in tools {
        let stem = tool.file_stem().and_then(|stem| stem.to_str()).unwrap_or("tool");
        let template = format!(
            "executable={}\nworking_directory=%WORKING_DIRECTORY%\narguments=%ARGUMENTS%\noutput=%OUTPUT%\n",
            tool.display()
        );
        utils::replace_file(script_dir.join(format!("{stem}.template")), template.as_bytes())?;
    }
    Ok(())
}

/// Rules that let farm agents rewrite include paths of generated headers to
/// their local staging area.
fn write_rewrite_rules(script_dir: &Path) -> Result<()> {
    let rules = "\
# include rewrite rules for farm agents
pattern=*.generated.h\trewrite=%STAGING%/generated
pattern=*.gen.cpp\trewrite=%STAGING%/generated
";
    utils::replace_file(script_dir.join("include-rewrite.rules"), rules.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::{Action, ActionKind},
        graph::ActionGraph,
        items::ItemRegistry,
    };
    use std::fs;

    #[test]
    fn task_script_lists_each_eligible_action() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();

        let mut action = Action::new(ActionKind::Compile);
        action.working_directory = dir.path().to_path_buf();
        action.command_path = PathBuf::from("/usr/bin/cc");
        action.command_arguments = "-c a.cpp -o a.o".to_string();
        action.can_execute_remotely = true;
        action.produced_items = vec![registry.file(dir.path().join("a.o"))];

        let graph = ActionGraph::link(vec![action]).unwrap();
        let batch = ExecutionBatch::new(&graph, vec![ActionId(0)]);
        let script = write_task_script(dir.path(), &batch, &[ActionId(0)]).unwrap();

        let content = fs::read_to_string(script).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("/usr/bin/cc\t-c a.cpp -o a.o"));
    }

    #[test]
    fn sdk_preparation_emits_templates_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();

        let mut action = Action::new(ActionKind::Compile);
        action.command_path = PathBuf::from("/usr/bin/cc");
        action.produced_items = vec![registry.file(dir.path().join("a.o"))];
        let graph = ActionGraph::link(vec![action]).unwrap();
        let batch = ExecutionBatch::new(&graph, vec![ActionId(0)]);

        write_toolchain_templates(dir.path(), &batch).unwrap();
        write_rewrite_rules(dir.path()).unwrap();

        let template = fs::read_to_string(dir.path().join("cc.template")).unwrap();
        assert!(template.contains("executable=/usr/bin/cc"));
        assert!(dir.path().join("include-rewrite.rules").exists());
    }
}
