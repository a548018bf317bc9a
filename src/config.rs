//! Typed configuration for a single build invocation.

use crate::utils;
use std::{path::PathBuf, time::Duration};

/// All knobs the engine consults during one build. Upstream configuration
/// layers (command line, per-project overlays) are expected to fill this
/// struct explicitly; the engine never reads configuration files itself.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// Root of the shared engine tree. Caches and histories for files under
    /// this root are kept in the engine scope.
    pub engine_root: PathBuf,
    /// Root of the project being built.
    pub project_root: PathBuf,
    /// Directory for per-build artefacts: cache files, farm task scripts.
    pub intermediate_dir: PathBuf,

    /// Hard upper bound on the number of concurrently executing actions.
    pub max_processor_count: usize,
    /// Multiplier applied to the physical core count on hosts where the
    /// logical count exceeds it outside the hyperthreading heuristic.
    pub processor_count_multiplier: f64,
    /// Number of worker threads used to warm the file metadata cache.
    pub prefetch_threads: usize,

    /// Tolerance when comparing prerequisite timestamps to execution times.
    pub mtime_slop: Duration,
    /// Do not consider dependents out of date when only an import library
    /// produced alongside a shared library has changed.
    pub ignore_import_library_changes: bool,

    /// Maximum number of leaf actions the hybrid executor keeps local.
    pub max_local_actions: usize,
    /// Whether the general distributed farm may be used, given a driver.
    pub allow_remote_farm: bool,
    /// Path to the farm driver executable, if one is installed.
    pub farm_driver: Option<PathBuf>,
    /// Whether the SDK-specific farm may be used, given a driver.
    pub allow_sdk_farm: bool,
    /// Path to the SDK farm driver executable, if one is installed.
    pub sdk_farm_driver: Option<PathBuf>,
    /// Whether local/remote hybrid partitioning may be used when both a farm
    /// and the local pool are available.
    pub allow_hybrid: bool,

    /// Emit the per-action wall-clock summary at the end of the run.
    pub log_detailed_stats: bool,
    /// Enforce the platform output-path length limit. Defaults to on for
    /// Windows hosts, where the limit is real.
    pub validate_output_path_lengths: bool,
    /// Warn when a produced item sits deeper than this many characters below
    /// the workspace root.
    pub path_length_warning_budget: usize,

    /// Optional user-maintained list of external files whose modification
    /// forces regeneration of generated-code inputs.
    pub external_dependencies_file: Option<PathBuf>,
}

impl BuildConfig {
    /// Absolute output-path limit enforced on Windows hosts.
    pub const MAX_OUTPUT_PATH_LENGTH: usize = 256;

    pub fn new(
        engine_root: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
        intermediate_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine_root: utils::normalize_path(engine_root.into()),
            project_root: utils::normalize_path(project_root.into()),
            intermediate_dir: utils::normalize_path(intermediate_dir.into()),
            max_processor_count: usize::MAX,
            processor_count_multiplier: 1.0,
            prefetch_threads: 4,
            mtime_slop: utils::MTIME_SLOP,
            ignore_import_library_changes: false,
            max_local_actions: 8,
            allow_remote_farm: true,
            farm_driver: None,
            allow_sdk_farm: true,
            sdk_farm_driver: None,
            allow_hybrid: true,
            log_detailed_stats: false,
            validate_output_path_lengths: cfg!(windows),
            path_length_warning_budget: 180,
            external_dependencies_file: None,
        }
    }

    /// Storage location of the engine-scope action history.
    pub fn engine_history_path(&self) -> PathBuf {
        self.engine_root.join("intermediate").join("action-history.bin")
    }

    /// Storage location of the project-scope action history.
    pub fn project_history_path(&self) -> PathBuf {
        self.intermediate_dir.join("action-history.bin")
    }

    /// Storage location of the engine-scope source metadata cache.
    pub fn engine_metadata_path(&self) -> PathBuf {
        self.engine_root.join("intermediate").join("source-metadata.bin")
    }

    /// Storage location of the project-scope source metadata cache.
    pub fn project_metadata_path(&self) -> PathBuf {
        self.intermediate_dir.join("source-metadata.bin")
    }
}
