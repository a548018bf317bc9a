//! Persistent per-output command-line fingerprints.
//!
//! Every produced file remembers the MD5 of the command line that last
//! produced it. Changing an action's command forces a rebuild even when the
//! output's timestamp is newer than all of its inputs. The digest is taken
//! over the upper-case-folded, UTF-16LE-encoded command line so histories
//! written on case-insensitive hosts remain valid everywhere.

use crate::{
    archive::{ArchiveReader, ArchiveWriter},
    error::Result,
    items::FileItem,
    utils,
};
use md5::{Digest, Md5};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Current version of the on-disk history format. A bump invalidates every
/// stored fingerprint, forcing a full rebuild.
const ACTION_HISTORY_VERSION: i32 = 2;

/// Computes the 16-byte fingerprint of a producing command line.
pub fn command_fingerprint(command_line: &str) -> [u8; 16] {
    let folded = command_line.to_uppercase();
    let mut hasher = Md5::new();
    for unit in folded.encode_utf16() {
        hasher.update(unit.to_le_bytes());
    }
    hasher.finalize().into()
}

#[derive(Debug, Default)]
struct HistoryState {
    fingerprints: HashMap<PathBuf, [u8; 16]>,
    dirty: bool,
}

/// Fingerprint store for produced items under one base directory.
#[derive(Debug)]
pub struct ActionHistory {
    storage_path: PathBuf,
    base_directory: PathBuf,
    state: Mutex<HistoryState>,
}

impl ActionHistory {
    fn load(storage_path: PathBuf, base_directory: PathBuf) -> Self {
        let mut state = HistoryState::default();
        match Self::read_fingerprints(&storage_path) {
            Ok(Some(fingerprints)) => state.fingerprints = fingerprints,
            Ok(None) => {}
            Err(err) => {
                warn!("discarding action history \"{}\": {err}", storage_path.display());
            }
        }
        Self { storage_path, base_directory, state: Mutex::new(state) }
    }

    fn read_fingerprints(path: &Path) -> Result<Option<HashMap<PathBuf, [u8; 16]>>> {
        let Ok(bytes) = fs::read(path) else { return Ok(None) };
        let mut reader = ArchiveReader::new(path, &bytes);

        let version = reader.read_i32()?;
        if version != ACTION_HISTORY_VERSION {
            warn!(
                "action history \"{}\" has version {version}, expected {ACTION_HISTORY_VERSION}; starting empty",
                path.display()
            );
            return Ok(None);
        }

        let count = reader.read_u32()?;
        let mut fingerprints = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let item = reader.read_path()?;
            let digest: [u8; 16] = reader.read_bytes(16)?.try_into().unwrap();
            fingerprints.insert(item, digest);
        }
        trace!("read action history \"{}\" with {count} entries", path.display());
        Ok(Some(fingerprints))
    }

    /// Records the fingerprint of `command_line` as the producer of `item`.
    ///
    /// Returns `true` when the command changed — no entry existed, or the
    /// stored digest differs — meaning the item must be rebuilt.
    pub fn update_producing_command_line(&self, item: &FileItem, command_line: &str) -> bool {
        let digest = command_fingerprint(command_line);
        let mut state = self.state.lock().unwrap();
        match state.fingerprints.get(item.path()) {
            Some(stored) if *stored == digest => false,
            _ => {
                trace!("producing command for \"{item}\" changed to {}", hex::encode(digest));
                state.fingerprints.insert(item.path().to_path_buf(), digest);
                state.dirty = true;
                true
            }
        }
    }

    /// Whether `path` belongs to this history's scope.
    pub fn contains_scope(&self, path: &Path) -> bool {
        path.starts_with(&self.base_directory)
    }

    pub fn save_if_dirty(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirty {
            return Ok(());
        }
        let mut writer = ArchiveWriter::new();
        writer.write_i32(ACTION_HISTORY_VERSION);
        writer.write_u32(state.fingerprints.len() as u32);
        for (item, digest) in &state.fingerprints {
            writer.write_path(item);
            writer.write_bytes(digest);
        }
        utils::replace_file(&self.storage_path, &writer.into_bytes())?;
        state.dirty = false;
        trace!("wrote action history \"{}\"", self.storage_path.display());
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().fingerprints.len()
    }
}

/// Shared load registry plus scope routing.
///
/// Engine-scope and project-scope histories live in different storage files;
/// a lookup routes to the first scope whose base directory contains the item.
/// The registry dedups loads by storage path so two engines pointed at the
/// same tree share one instance.
#[derive(Debug, Default)]
pub struct HistoryRouter {
    loaded: Mutex<HashMap<PathBuf, Arc<ActionHistory>>>,
    scopes: Vec<Arc<ActionHistory>>,
}

impl HistoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads (or reuses) the history stored at `storage_path` and mounts it
    /// for items under `base_directory`. Scopes are consulted in mount
    /// order, so mount the most specific scope first.
    pub fn mount(&mut self, storage_path: impl Into<PathBuf>, base_directory: impl Into<PathBuf>) {
        let storage_path = utils::normalize_path(storage_path.into());
        let base_directory = utils::normalize_path(base_directory.into());
        let mut loaded = self.loaded.lock().unwrap();
        let history = loaded
            .entry(storage_path.clone())
            .or_insert_with(|| Arc::new(ActionHistory::load(storage_path, base_directory)))
            .clone();
        drop(loaded);
        self.scopes.push(history);
    }

    fn scope_for(&self, path: &Path) -> Option<&Arc<ActionHistory>> {
        self.scopes.iter().find(|scope| scope.contains_scope(path)).or(self.scopes.first())
    }

    /// Routes [`ActionHistory::update_producing_command_line`] by scope.
    /// With no scopes mounted every command counts as changed.
    pub fn update_producing_command_line(&self, item: &FileItem, command_line: &str) -> bool {
        match self.scope_for(item.path()) {
            Some(scope) => scope.update_producing_command_line(item, command_line),
            None => true,
        }
    }

    pub fn save_all_if_dirty(&self) -> Result<()> {
        for scope in &self.scopes {
            scope.save_if_dirty()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::ItemRegistry;
    use pretty_assertions::assert_eq;

    #[test]
    fn fingerprint_is_case_folded_utf16() {
        let upper = command_fingerprint("CL.EXE /C A.CPP");
        let lower = command_fingerprint("cl.exe /c a.cpp");
        assert_eq!(upper, lower);
        assert_ne!(upper, command_fingerprint("cl.exe /c b.cpp"));

        // fixed reference digest: md5 of "X" in UTF-16LE
        let expected = {
            let mut hasher = Md5::new();
            hasher.update([b'X', 0]);
            <[u8; 16]>::from(hasher.finalize())
        };
        assert_eq!(command_fingerprint("x"), expected);
    }

    #[test]
    fn update_reports_change_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();
        let history =
            ActionHistory::load(dir.path().join("history.bin"), dir.path().to_path_buf());
        let item = registry.file(dir.path().join("a.o"));

        assert!(history.update_producing_command_line(&item, "cc -c a.cpp"));
        assert!(!history.update_producing_command_line(&item, "cc -c a.cpp"));
        assert!(history.update_producing_command_line(&item, "cc -O2 -c a.cpp"));
    }

    #[test]
    fn survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("history.bin");
        let registry = ItemRegistry::new();
        let item = registry.file(dir.path().join("a.o"));

        {
            let history = ActionHistory::load(storage.clone(), dir.path().to_path_buf());
            assert!(history.update_producing_command_line(&item, "cc -c a.cpp"));
            history.save_if_dirty().unwrap();
        }

        let history = ActionHistory::load(storage, dir.path().to_path_buf());
        assert!(!history.update_producing_command_line(&item, "cc -c a.cpp"));
    }

    #[test]
    fn version_mismatch_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("history.bin");
        let mut writer = ArchiveWriter::new();
        writer.write_i32(ACTION_HISTORY_VERSION + 1);
        writer.write_u32(1);
        fs::write(&storage, writer.into_bytes()).unwrap();

        let history = ActionHistory::load(storage, dir.path().to_path_buf());
        assert_eq!(history.len(), 0);
    }

    #[test]
    fn router_routes_by_containment() {
        let engine = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();

        let mut router = HistoryRouter::new();
        router.mount(project.path().join("history.bin"), project.path());
        router.mount(engine.path().join("history.bin"), engine.path());

        let engine_item = registry.file(engine.path().join("core.o"));
        let project_item = registry.file(project.path().join("game.o"));
        assert!(router.update_producing_command_line(&engine_item, "cc core"));
        assert!(router.update_producing_command_line(&project_item, "cc game"));

        assert_eq!(router.scopes[0].len(), 1);
        assert_eq!(router.scopes[1].len(), 1);
    }
}
