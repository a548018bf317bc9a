//! Interned handles over filesystem entries.
//!
//! Every path the engine touches is represented by exactly one [`FileItem`]
//! or [`DirectoryItem`], handed out by the [`ItemRegistry`] owned by the
//! engine. Interning throttles `stat` traffic: attributes are read from disk
//! once per handle and reused by every consumer until the handle is
//! explicitly invalidated after the producing action completes.

use crate::utils;
use dashmap::DashMap;
use std::{
    fmt,
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// Cached attributes of a single filesystem entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStatus {
    pub exists: bool,
    pub length: u64,
    pub modified: Option<SystemTime>,
}

impl FileStatus {
    fn read(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => {
                Self { exists: true, length: meta.len(), modified: meta.modified().ok() }
            }
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug)]
struct FileItemInner {
    path: PathBuf,
    status: Mutex<Option<FileStatus>>,
}

/// A value-typed handle for a file, identified by its normalised absolute
/// path. Two handles for the same path returned by the same registry are the
/// same allocation; equality and hashing are by path either way.
#[derive(Clone)]
pub struct FileItem(Arc<FileItemInner>);

impl FileItem {
    fn new(path: PathBuf) -> Self {
        Self(Arc::new(FileItemInner { path, status: Mutex::new(None) }))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.path.file_name().and_then(|name| name.to_str())
    }

    /// Case-insensitive extension check, matching how toolchains treat
    /// output suffixes.
    pub fn has_extension(&self, extension: &str) -> bool {
        self.0
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    }

    /// The cached attributes, read from disk on first access.
    pub fn status(&self) -> FileStatus {
        let mut guard = self.0.status.lock().unwrap();
        *guard.get_or_insert_with(|| FileStatus::read(&self.0.path))
    }

    pub fn exists(&self) -> bool {
        self.status().exists
    }

    pub fn length(&self) -> u64 {
        self.status().length
    }

    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.status().modified
    }

    /// Drops the cached attributes. Must be called for every produced item
    /// once its action has completed, so downstream staleness checks observe
    /// the fresh timestamp.
    pub fn invalidate(&self) {
        *self.0.status.lock().unwrap() = None;
    }

    /// Seeds the attribute cache from an already-read metadata record, used
    /// by the prefetcher to avoid a second `stat`.
    pub(crate) fn prime(&self, status: FileStatus) {
        let mut guard = self.0.status.lock().unwrap();
        if guard.is_none() {
            *guard = Some(status);
        }
    }
}

impl PartialEq for FileItem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.path == other.0.path
    }
}

impl Eq for FileItem {}

impl Hash for FileItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.path.hash(state);
    }
}

impl fmt::Debug for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileItem").field(&self.0.path).finish()
    }
}

impl fmt::Display for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.path.display().fmt(f)
    }
}

#[derive(Debug, Default)]
struct DirectoryListing {
    files: Vec<FileItem>,
    directories: Vec<DirectoryItem>,
}

#[derive(Debug)]
struct DirectoryItemInner {
    path: PathBuf,
    listing: Mutex<Option<Arc<DirectoryListing>>>,
}

/// Interned handle for a directory, with lazily-cached child listings.
#[derive(Clone, Debug)]
pub struct DirectoryItem(Arc<DirectoryItemInner>);

impl DirectoryItem {
    fn new(path: PathBuf) -> Self {
        Self(Arc::new(DirectoryItemInner { path, listing: Mutex::new(None) }))
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn exists(&self) -> bool {
        self.0.path.is_dir()
    }

    fn listing(&self, registry: &ItemRegistry) -> Arc<DirectoryListing> {
        let mut guard = self.0.listing.lock().unwrap();
        if let Some(listing) = guard.as_ref() {
            return listing.clone();
        }
        let mut listing = DirectoryListing::default();
        if let Ok(entries) = fs::read_dir(&self.0.path) {
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else { continue };
                if file_type.is_dir() {
                    listing.directories.push(registry.directory(entry.path()));
                } else {
                    let item = registry.file(entry.path());
                    if let Ok(meta) = entry.metadata() {
                        item.prime(FileStatus {
                            exists: true,
                            length: meta.len(),
                            modified: meta.modified().ok(),
                        });
                    }
                    listing.files.push(item);
                }
            }
        }
        let listing = Arc::new(listing);
        *guard = Some(listing.clone());
        listing
    }

    /// Child files, interned and with their attributes primed.
    pub fn child_files(&self, registry: &ItemRegistry) -> Vec<FileItem> {
        self.listing(registry).files.clone()
    }

    /// Child directories, interned.
    pub fn child_directories(&self, registry: &ItemRegistry) -> Vec<DirectoryItem> {
        self.listing(registry).directories.clone()
    }

    /// Drops the cached child listing.
    pub fn invalidate(&self) {
        *self.0.listing.lock().unwrap() = None;
    }
}

impl PartialEq for DirectoryItem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.path == other.0.path
    }
}

impl Eq for DirectoryItem {}

impl Hash for DirectoryItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.path.hash(state);
    }
}

/// Process-wide registry interning [`FileItem`]s and [`DirectoryItem`]s by
/// normalised absolute path. Owned by the engine so that independent builds
/// (and tests) get independent registries; entries are append-only within a
/// run.
#[derive(Debug, Default)]
pub struct ItemRegistry {
    files: DashMap<PathBuf, FileItem>,
    directories: DashMap<PathBuf, DirectoryItem>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the interned handle for `path`, creating it on first use.
    pub fn file(&self, path: impl AsRef<Path>) -> FileItem {
        let path = utils::normalize_path(path);
        if let Some(existing) = self.files.get(&path) {
            return existing.clone();
        }
        self.files.entry(path.clone()).or_insert_with(|| FileItem::new(path)).clone()
    }

    /// Returns the interned handle for the directory at `path`.
    pub fn directory(&self, path: impl AsRef<Path>) -> DirectoryItem {
        let path = utils::normalize_path(path);
        if let Some(existing) = self.directories.get(&path) {
            return existing.clone();
        }
        self.directories.entry(path.clone()).or_insert_with(|| DirectoryItem::new(path)).clone()
    }

    /// Number of interned file handles, used by prefetch diagnostics.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
