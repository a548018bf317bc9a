//! Change detection for external dependencies.
//!
//! Users can maintain a plain text file naming files outside the engine's
//! view — SDK headers, code generators, schema files. The engine snapshots
//! their modification times next to the list; when any of them moves, the
//! run must regenerate all generated-code inputs rather than trust the
//! incremental state.

use crate::{error::Result, utils};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// The user-maintained list plus the engine's last-seen timestamps.
#[derive(Debug)]
pub struct ExternalDependencyList {
    list_path: PathBuf,
    snapshot_path: PathBuf,
    entries: Vec<PathBuf>,
}

impl ExternalDependencyList {
    /// Reads the list at `list_path`; one path per line, `#` comments and
    /// blank lines ignored. A missing list is an empty list.
    pub fn load(list_path: impl Into<PathBuf>) -> Self {
        let list_path = list_path.into();
        let entries = fs::read_to_string(&list_path)
            .map(|content| {
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(|line| utils::normalize_path(line))
                    .collect()
            })
            .unwrap_or_default();
        let snapshot_path = list_path.with_extension("snapshot");
        Self { list_path, snapshot_path, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn current_state(&self) -> BTreeMap<PathBuf, i64> {
        self.entries
            .iter()
            .map(|path| {
                let mtime = fs::metadata(path)
                    .and_then(|meta| meta.modified())
                    .map(utils::mtime_millis)
                    .unwrap_or(0);
                (path.clone(), mtime)
            })
            .collect()
    }

    fn recorded_state(&self) -> BTreeMap<PathBuf, i64> {
        let Ok(content) = fs::read_to_string(&self.snapshot_path) else {
            return BTreeMap::new();
        };
        content
            .lines()
            .filter_map(|line| {
                let (mtime, path) = line.split_once('\t')?;
                Some((PathBuf::from(path), mtime.parse().ok()?))
            })
            .collect()
    }

    /// True when any listed file changed since the last snapshot. Rewrites
    /// the snapshot so the next run sees the new state as clean.
    pub fn has_changes(&self) -> Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        let current = self.current_state();
        let changed = current != self.recorded_state();
        if changed {
            debug!(
                "external dependency change detected via \"{}\"",
                self.list_path.display()
            );
            let mut out = String::new();
            for (path, mtime) in &current {
                out.push_str(&format!("{mtime}\t{}\n", path.display()));
            }
            utils::replace_file(&self.snapshot_path, out.as_bytes())?;
        }
        Ok(changed)
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}
