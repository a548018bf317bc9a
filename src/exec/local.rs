//! Local execution: a pool of parallel child processes driven by a single
//! coordinator thread.

use crate::{
    action::Action,
    config::BuildConfig,
    error::Result,
    exec::{ActionResult, ActionState, ExecutionBatch, Executor, Readiness},
    graph::ActionId,
    utils,
};
use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    process::{Child, Command, Stdio},
    sync::atomic::Ordering,
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

/// How long the coordinator sleeps between scheduling scans.
const COORDINATOR_POLL: Duration = Duration::from_millis(100);

/// Retry budget for configuring a freshly spawned child's priority.
const PRIORITY_RETRIES: u32 = 100;
const PRIORITY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Computes the degree of parallelism from the host's core topology.
///
/// Hyperthreaded hosts with more than four physical cores get a value
/// between the physical and logical counts; everything is capped by
/// available memory (one action per GiB on 16 GiB+ hosts, one per 1.5 GiB
/// below that) and clamped to the configured maximum.
pub fn parallel_degree(config: &BuildConfig) -> usize {
    let physical = num_cpus::get_physical().max(1);
    let logical = num_cpus::get().max(1);

    let mut degree = if logical == physical {
        physical
    } else if physical > 4 && logical > physical {
        ((physical + logical) / 2).max(logical.saturating_sub(4))
    } else if logical > physical {
        ((physical as f64) * config.processor_count_multiplier).round() as usize
    } else {
        physical
    };

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_mib = (system.total_memory() / (1024 * 1024)) as usize;
    if total_mib > 0 {
        let memory_cap = if total_mib >= 16 * 1024 { total_mib / 1024 } else { total_mib / 1536 };
        degree = degree.min(memory_cap.max(1));
    }

    degree.clamp(1, config.max_processor_count.max(1))
}

/// Runs actions as local child processes, at most `degree` at a time.
pub struct LocalExecutor {
    degree: usize,
}

impl LocalExecutor {
    pub fn new(config: &BuildConfig) -> Self {
        let degree = parallel_degree(config);
        debug!("local executor runs up to {degree} actions in parallel");
        Self { degree }
    }

    /// Single-process fallback.
    pub fn single() -> Self {
        Self { degree: 1 }
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn execute(&self, batch: &mut ExecutionBatch<'_>) -> Result<bool> {
        let mut running: HashMap<ActionId, JoinHandle<ActionResult>> = HashMap::new();

        loop {
            // reap finished workers
            let finished: Vec<ActionId> =
                running.iter().filter(|(_, handle)| handle.is_finished()).map(|(id, _)| *id).collect();
            for id in finished {
                let handle = running.remove(&id).unwrap();
                let result = handle
                    .join()
                    .unwrap_or_else(|_| ActionResult::spawn_failed(SystemTime::now()));
                batch.mark_finished(id, result);
            }

            let waiting: Vec<ActionId> = batch
                .pending
                .iter()
                .copied()
                .filter(|id| {
                    matches!(batch.states.get(id), Some(ActionState::Pending))
                        && !running.contains_key(id)
                })
                .collect();
            if waiting.is_empty() && running.is_empty() {
                break;
            }

            for id in waiting {
                if running.len() >= self.degree {
                    break;
                }
                match batch.readiness(id) {
                    Readiness::Ready => {
                        if batch.cancel.load(Ordering::Relaxed) {
                            batch.mark_skipped(id);
                            continue;
                        }
                        running.insert(id, spawn_worker(batch.graph[id].clone()));
                    }
                    Readiness::FailedPrerequisite => batch.mark_skipped(id),
                    Readiness::Waiting => {}
                }
            }

            thread::sleep(COORDINATOR_POLL);
        }

        Ok(batch.all_succeeded())
    }
}

/// One worker thread per child process: spawns, lowers priority, forwards
/// output and waits for exit.
fn spawn_worker(action: Action) -> JoinHandle<ActionResult> {
    thread::spawn(move || run_action(&action))
}

fn run_action(action: &Action) -> ActionResult {
    let start_time = SystemTime::now();
    if action.should_log_status {
        info!("{}", action.status_description);
    }
    if action.print_debug_info {
        debug!("{}", action.command_line());
    }

    let mut command = Command::new(&action.command_path);
    command.args(utils::split_arguments(&action.command_arguments));
    if !action.working_directory.as_os_str().is_empty() {
        command.current_dir(&action.working_directory);
    }
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("failed to start {}: {err}", action.command_path.display());
            return ActionResult::spawn_failed(start_time);
        }
    };

    if let Err(err) = lower_priority(&child) {
        error!("failed to configure priority for {}: {err}", action);
        let _ = child.kill();
        let _ = child.wait();
        return ActionResult::spawn_failed(start_time);
    }

    let stdout = child.stdout.take().map(|out| forward_output(out, false));
    let stderr = child.stderr.take().map(|out| forward_output(out, true));

    let exit_code = match child.wait() {
        Ok(status) => status.code().unwrap_or(1),
        Err(err) => {
            error!("failed waiting for {}: {err}", action);
            1
        }
    };
    for reader in [stdout, stderr].into_iter().flatten() {
        let _ = reader.join();
    }

    ActionResult { exit_code, start_time, end_time: SystemTime::now() }
}

/// Streams a child pipe to the log, one line at a time.
fn forward_output<R: std::io::Read + Send + 'static>(
    pipe: R,
    is_stderr: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(|line| line.ok()) {
            if is_stderr {
                warn!("{line}");
            } else {
                info!("{line}");
            }
        }
    })
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Lowers the child to below-normal priority so interactive work
        /// stays responsive while a build saturates the machine.
        fn lower_priority(child: &Child) -> std::io::Result<()> {
            let pid = child.id();
            for attempt in 0..PRIORITY_RETRIES {
                let outcome =
                    unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, 10) };
                if outcome == 0 {
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                // the child may still be mid-exec
                if attempt + 1 == PRIORITY_RETRIES {
                    return Err(err);
                }
                thread::sleep(PRIORITY_RETRY_DELAY);
            }
            Ok(())
        }
    } else {
        fn lower_priority(_child: &Child) -> std::io::Result<()> {
            let _ = (PRIORITY_RETRIES, PRIORITY_RETRY_DELAY);
            Ok(())
        }
    }
}
