#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod archive;
pub mod utils;

mod config;
pub use config::BuildConfig;

pub mod items;
pub use items::{DirectoryItem, FileItem, ItemRegistry};

pub mod prefetch;
pub use prefetch::MetadataPrefetcher;

pub mod metadata;
pub use metadata::SourceFileMetadataCache;

pub mod deplist;
pub use deplist::DependencyListCache;

pub mod external;
pub use external::ExternalDependencyList;

pub mod history;
pub use history::{ActionHistory, HistoryRouter};

pub mod action;
pub use action::{
    read_action_archive, write_action_archive, Action, ActionDescriptor, ActionGraphFile,
    ActionKind,
};

pub mod graph;
pub use graph::{ActionGraph, ActionId, StalenessAnalyzer, StalenessContext};

pub mod exec;

mod build;
pub use build::{BuildOutcome, ExecutedAction};

use build::BuildDriver;
use error::Result;
use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

/// One build invocation's worth of shared state: the interned item registry,
/// the persistent caches for both scopes, and the configuration.
///
/// Construct with [`BuildEngine::builder`], feed it the action list produced
/// by rule evaluation, and it takes care of linking, staleness analysis,
/// scheduling and cache persistence.
#[derive(Debug)]
pub struct BuildEngine {
    config: BuildConfig,
    registry: Arc<ItemRegistry>,
    engine_metadata: Arc<SourceFileMetadataCache>,
    project_metadata: Arc<SourceFileMetadataCache>,
    histories: HistoryRouter,
    dependency_lists: DependencyListCache,
    external_dependencies: Option<ExternalDependencyList>,
    cancel: Arc<AtomicBool>,
}

impl BuildEngine {
    /// Convenience function to call `BuildEngineBuilder::default()`.
    pub fn builder() -> BuildEngineBuilder {
        BuildEngineBuilder::default()
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ItemRegistry> {
        &self.registry
    }

    /// Interns a file handle; shorthand for going through the registry.
    pub fn item(&self, path: impl AsRef<Path>) -> FileItem {
        self.registry.file(path)
    }

    /// The project-scope metadata cache; engine files are answered by its
    /// parent scope transparently.
    pub fn metadata_cache(&self) -> &Arc<SourceFileMetadataCache> {
        &self.project_metadata
    }

    pub fn histories(&self) -> &HistoryRouter {
        &self.histories
    }

    pub fn dependency_lists(&self) -> &DependencyListCache {
        &self.dependency_lists
    }

    pub fn external_dependencies(&self) -> Option<&ExternalDependencyList> {
        self.external_dependencies.as_ref()
    }

    /// Token checked before every spawn; see [`BuildEngine::request_cancel`].
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Stops new actions from starting. Actions already running drain to
    /// completion; their dependents are skipped.
    pub fn request_cancel(&self) {
        self.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Executes `actions`, restricted to the producers of `targets` and
    /// their transitive prerequisites. Empty `targets` builds everything.
    pub fn execute_actions(
        &self,
        actions: Vec<Action>,
        targets: &[PathBuf],
    ) -> Result<BuildOutcome> {
        BuildDriver::new(self).run(actions, targets)
    }

    /// Writes every dirty persistent cache once. Called by the driver at the
    /// end of a run; callers using the caches directly may call it too.
    pub fn persist_caches(&self) -> Result<()> {
        self.engine_metadata.save_if_dirty()?;
        self.project_metadata.save_if_dirty()?;
        self.histories.save_all_if_dirty()?;
        Ok(())
    }
}

/// Builder for [`BuildEngine`].
#[derive(Default)]
pub struct BuildEngineBuilder {
    engine_root: Option<PathBuf>,
    project_root: Option<PathBuf>,
    intermediate_dir: Option<PathBuf>,
    config_overrides: Option<Box<dyn FnOnce(&mut BuildConfig) + Send>>,
}

impl BuildEngineBuilder {
    #[must_use]
    pub fn engine_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_root = Some(path.into());
        self
    }

    #[must_use]
    pub fn project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    #[must_use]
    pub fn intermediate_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.intermediate_dir = Some(path.into());
        self
    }

    /// Applies arbitrary configuration overrides before the engine loads its
    /// caches.
    #[must_use]
    pub fn configure(mut self, overrides: impl FnOnce(&mut BuildConfig) + Send + 'static) -> Self {
        self.config_overrides = Some(Box::new(overrides));
        self
    }

    pub fn build(self) -> Result<BuildEngine> {
        let project_root = self
            .project_root
            .ok_or_else(|| error::BuildError::msg("a project root is required"))?;
        let engine_root = self.engine_root.unwrap_or_else(|| project_root.clone());
        let intermediate_dir =
            self.intermediate_dir.unwrap_or_else(|| project_root.join("intermediate"));

        let mut config = BuildConfig::new(engine_root, project_root, intermediate_dir);
        if let Some(overrides) = self.config_overrides {
            overrides(&mut config);
        }

        let registry = Arc::new(ItemRegistry::new());
        let engine_metadata = SourceFileMetadataCache::load_or_new(
            config.engine_metadata_path(),
            &config.engine_root,
            None,
            &registry,
        );
        let project_metadata = SourceFileMetadataCache::load_or_new(
            config.project_metadata_path(),
            &config.project_root,
            Some(engine_metadata.clone()),
            &registry,
        );

        let mut histories = HistoryRouter::new();
        histories.mount(config.project_history_path(), &config.project_root);
        histories.mount(config.engine_history_path(), &config.engine_root);

        let external_dependencies =
            config.external_dependencies_file.clone().map(ExternalDependencyList::load);

        Ok(BuildEngine {
            config,
            registry,
            engine_metadata,
            project_metadata,
            histories,
            dependency_lists: DependencyListCache::new(),
            external_dependencies,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }
}
