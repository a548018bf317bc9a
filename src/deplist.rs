//! Parsing and memoisation of compiler-emitted dependency manifests.
//!
//! After a compile, toolchains write the set of files they actually read —
//! headers discovered during preprocessing — either as one absolute path per
//! line or as a make-style depfile. The staleness pass treats these as an
//! extended prerequisite set, so manifests are parsed once per run and
//! re-parsed only when their modification time advances.

use crate::{
    error::{BuildError, Result},
    items::{FileItem, ItemRegistry},
    utils,
};
use dashmap::DashMap;
use std::{fs, sync::Arc};

#[derive(Clone, Debug)]
struct CachedManifest {
    observed_mtime: i64,
    // None records that the manifest was missing when we looked
    files: Option<Arc<Vec<FileItem>>>,
}

/// Memoising cache of dependency manifests, keyed by manifest identity.
#[derive(Debug, Default)]
pub struct DependencyListCache {
    manifests: DashMap<FileItem, CachedManifest>,
}

impl DependencyListCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The files listed by `manifest`, or `None` when the manifest does not
    /// exist — the caller must treat that as "dependencies unknown".
    pub fn dependencies(
        &self,
        manifest: &FileItem,
        registry: &ItemRegistry,
    ) -> Result<Option<Arc<Vec<FileItem>>>> {
        let status = manifest.status();
        let mtime = status.modified.map(utils::mtime_millis).unwrap_or(0);
        if let Some(cached) = self.manifests.get(manifest) {
            if cached.observed_mtime >= mtime && (status.exists == cached.files.is_some()) {
                return Ok(cached.files.clone());
            }
        }

        let files = if status.exists {
            let content = fs::read_to_string(manifest.path())
                .map_err(|err| BuildError::io(err, manifest.path()))?;
            let paths = if manifest.has_extension("d") {
                parse_make_depfile(&content)
            } else {
                parse_path_list(&content)
            };
            trace!("parsed {} dependencies from \"{manifest}\"", paths.len());
            Some(Arc::new(paths.into_iter().map(|p| registry.file(p)).collect::<Vec<_>>()))
        } else {
            trace!("dependency manifest \"{manifest}\" is missing");
            None
        };

        self.manifests
            .insert(manifest.clone(), CachedManifest { observed_mtime: mtime, files: files.clone() });
        Ok(files)
    }
}

/// One absolute path per line, as emitted by post-processed MSVC include
/// scans.
fn parse_path_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Make-style depfile: `target: dep dep \` with backslash continuations and
/// `\ `-escaped spaces, as emitted by gcc/clang `-MD`.
fn parse_make_depfile(content: &str) -> Vec<String> {
    let joined = content.replace("\\\r\n", " ").replace("\\\n", " ");
    let body = match joined.split_once(": ") {
        Some((_, deps)) => deps,
        // a rule with no dependencies ends in a bare colon
        None => joined.trim_end().strip_suffix(':').unwrap_or(&joined),
    };

    let mut paths = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                current.push(chars.next().unwrap());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    paths.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        paths.push(current);
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_path_lists() {
        let parsed = parse_path_list("/src/a.h\n\n  /src/b.h  \n");
        assert_eq!(parsed, vec!["/src/a.h", "/src/b.h"]);
    }

    #[test]
    fn parses_make_depfiles() {
        let parsed = parse_make_depfile("obj/a.o: /src/a.cpp /src/a.h \\\n  /src/dir\\ name/b.h\n");
        assert_eq!(parsed, vec!["/src/a.cpp", "/src/a.h", "/src/dir name/b.h"]);
    }

    #[test]
    fn missing_manifest_is_none_until_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();
        let cache = DependencyListCache::new();
        let manifest = registry.file(dir.path().join("a.txt"));

        assert!(cache.dependencies(&manifest, &registry).unwrap().is_none());

        fs::write(manifest.path(), format!("{}\n", dir.path().join("a.h").display())).unwrap();
        manifest.invalidate();
        let files = cache.dependencies(&manifest, &registry).unwrap().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path().ends_with("a.h"));
    }

    #[test]
    fn memoises_until_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ItemRegistry::new();
        let cache = DependencyListCache::new();

        let path = dir.path().join("deps.txt");
        fs::write(&path, "/src/a.h\n").unwrap();
        let manifest = registry.file(&path);

        let first = cache.dependencies(&manifest, &registry).unwrap().unwrap();
        // rewrite without advancing the cached stat; the memoised list wins
        fs::write(&path, "/src/a.h\n/src/b.h\n").unwrap();
        let second = cache.dependencies(&manifest, &registry).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // once the handle observes the new mtime the list is re-parsed
        manifest.invalidate();
        filetime_bump(&path);
        let third = cache.dependencies(&manifest, &registry).unwrap().unwrap();
        assert_eq!(third.len(), 2);
    }

    fn filetime_bump(path: &std::path::Path) {
        let file = fs::OpenOptions::new().append(true).open(path).unwrap();
        let now = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        file.set_modified(now).unwrap();
    }
}
