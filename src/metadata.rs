//! Persistent per-source-file metadata: the first include of a translation
//! unit and whether the file carries reflection markup that the generated
//! code preprocessor must see. Both answers are cached against the file's
//! modification time and survive across runs.

use crate::{
    archive::{ArchiveReader, ArchiveWriter},
    error::Result,
    items::{FileItem, ItemRegistry},
    utils,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Current version of the on-disk cache format.
const METADATA_CACHE_VERSION: i32 = 3;

/// Matches the first include directive of a C/C++ source file.
static RE_FIRST_INCLUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*#\s*include\s+(?:"([^"]+)"|<([^>]+)>)"#).unwrap());

/// Matches `#import` as well, which Objective-C++ sources may use before
/// their first plain include.
static RE_FIRST_INCLUDE_OBJC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*#\s*(?:include|import)\s+(?:"([^"]+)"|<([^>]+)>)"#).unwrap());

/// Matches reflection markup at the start of a line.
static RE_REFLECTION_MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^U(CLASS|STRUCT|ENUM|INTERFACE|DELEGATE)\b").unwrap());

#[derive(Clone, Debug, PartialEq, Eq)]
struct FirstIncludeInfo {
    observed_mtime: i64,
    include_text: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReflectionMarkupInfo {
    observed_mtime: i64,
    contains_markup: bool,
}

/// Cache of parsed source metadata for files under one base directory.
///
/// Instances form a two-level hierarchy: the project-scope cache holds files
/// under the project root and delegates everything else to the engine-scope
/// parent, so engine headers are parsed once no matter how many projects
/// build against them.
#[derive(Debug)]
pub struct SourceFileMetadataCache {
    storage_path: PathBuf,
    base_directory: PathBuf,
    parent: Option<Arc<SourceFileMetadataCache>>,
    first_includes: DashMap<FileItem, FirstIncludeInfo>,
    reflection_markup: DashMap<FileItem, ReflectionMarkupInfo>,
    dirty: AtomicBool,
}

impl SourceFileMetadataCache {
    /// Loads the cache stored at `storage_path`, or starts empty when the
    /// file is absent, carries a different format version or is corrupt. A
    /// bad cache never fails the build, it only costs re-parsing.
    pub fn load_or_new(
        storage_path: impl Into<PathBuf>,
        base_directory: impl Into<PathBuf>,
        parent: Option<Arc<SourceFileMetadataCache>>,
        registry: &ItemRegistry,
    ) -> Arc<Self> {
        let cache = Self {
            storage_path: storage_path.into(),
            base_directory: utils::normalize_path(base_directory.into()),
            parent,
            first_includes: DashMap::new(),
            reflection_markup: DashMap::new(),
            dirty: AtomicBool::new(false),
        };
        if let Err(err) = cache.read_from_disk(registry) {
            warn!(
                "discarding source metadata cache \"{}\": {err}",
                cache.storage_path.display()
            );
            cache.first_includes.clear();
            cache.reflection_markup.clear();
        }
        Arc::new(cache)
    }

    fn read_from_disk(&self, registry: &ItemRegistry) -> Result<()> {
        let Ok(bytes) = fs::read(&self.storage_path) else { return Ok(()) };
        let mut reader = ArchiveReader::new(&self.storage_path, &bytes);

        let version = reader.read_i32()?;
        if version != METADATA_CACHE_VERSION {
            warn!(
                "source metadata cache \"{}\" has version {version}, expected {METADATA_CACHE_VERSION}; starting empty",
                self.storage_path.display()
            );
            return Ok(());
        }

        let include_count = reader.read_u32()?;
        for _ in 0..include_count {
            let item = registry.file(reader.read_path()?);
            let observed_mtime = reader.read_i64()?;
            let include_text = reader.read_opt_str()?;
            self.first_includes.insert(item, FirstIncludeInfo { observed_mtime, include_text });
        }

        let markup_count = reader.read_u32()?;
        for _ in 0..markup_count {
            let item = registry.file(reader.read_path()?);
            let observed_mtime = reader.read_i64()?;
            let contains_markup = reader.read_bool()?;
            self.reflection_markup
                .insert(item, ReflectionMarkupInfo { observed_mtime, contains_markup });
        }

        trace!(
            "read source metadata cache \"{}\" with {include_count} include and {markup_count} markup entries",
            self.storage_path.display()
        );
        Ok(())
    }

    /// Writes the cache back through an atomic replace if anything changed.
    pub fn save_if_dirty(&self) -> Result<()> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut writer = ArchiveWriter::new();
        writer.write_i32(METADATA_CACHE_VERSION);

        writer.write_u32(self.first_includes.len() as u32);
        for entry in self.first_includes.iter() {
            writer.write_path(entry.key().path());
            writer.write_i64(entry.value().observed_mtime);
            writer.write_opt_str(entry.value().include_text.as_deref());
        }

        writer.write_u32(self.reflection_markup.len() as u32);
        for entry in self.reflection_markup.iter() {
            writer.write_path(entry.key().path());
            writer.write_i64(entry.value().observed_mtime);
            writer.write_bool(entry.value().contains_markup);
        }

        utils::replace_file(&self.storage_path, &writer.into_bytes())?;
        self.dirty.store(false, Ordering::Relaxed);
        trace!("wrote source metadata cache \"{}\"", self.storage_path.display());
        Ok(())
    }

    fn owns(&self, item: &FileItem) -> bool {
        self.parent.is_none() || item.path().starts_with(&self.base_directory)
    }

    fn current_mtime(item: &FileItem) -> i64 {
        item.last_write_time().map(utils::mtime_millis).unwrap_or(0)
    }

    /// The first `#include` of the file, or `None` for files without one.
    /// Re-parses only when the file is newer than the cached answer.
    pub fn first_include(&self, item: &FileItem) -> Result<Option<String>> {
        if !self.owns(item) {
            return self.parent.as_ref().unwrap().first_include(item);
        }
        let mtime = Self::current_mtime(item);
        if let Some(cached) = self.first_includes.get(item) {
            if cached.observed_mtime >= mtime {
                return Ok(cached.include_text.clone());
            }
        }

        let include_text = parse_first_include(item)?;
        self.first_includes.insert(
            item.clone(),
            FirstIncludeInfo { observed_mtime: mtime, include_text: include_text.clone() },
        );
        self.dirty.store(true, Ordering::Relaxed);
        Ok(include_text)
    }

    /// Whether the file contains reflection markup that the generated-code
    /// preprocessor must process.
    pub fn contains_reflection_markup(&self, item: &FileItem) -> Result<bool> {
        if !self.owns(item) {
            return self.parent.as_ref().unwrap().contains_reflection_markup(item);
        }
        let mtime = Self::current_mtime(item);
        if let Some(cached) = self.reflection_markup.get(item) {
            if cached.observed_mtime >= mtime {
                return Ok(cached.contains_markup);
            }
        }

        let content = read_source(item)?;
        let contains_markup = RE_REFLECTION_MARKUP.is_match(&content);
        self.reflection_markup
            .insert(item.clone(), ReflectionMarkupInfo { observed_mtime: mtime, contains_markup });
        self.dirty.store(true, Ordering::Relaxed);
        Ok(contains_markup)
    }
}

fn read_source(item: &FileItem) -> Result<String> {
    fs::read_to_string(item.path())
        .map_err(|err| crate::error::BuildError::io(err, item.path()))
}

fn is_mixed_language_source(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("m") || ext.eq_ignore_ascii_case("mm")
    )
}

fn parse_first_include(item: &FileItem) -> Result<Option<String>> {
    let content = read_source(item)?;
    let regex: &Regex = if is_mixed_language_source(item.path()) {
        &RE_FIRST_INCLUDE_OBJC
    } else {
        &RE_FIRST_INCLUDE
    };
    Ok(regex.captures(&content).and_then(|caps| {
        caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
    }))
}
