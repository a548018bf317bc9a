//! Utility functions

use crate::error::{BuildError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// The tolerance applied when comparing prerequisite timestamps against the
/// last execution time of an action. Network filesystems round timestamps
/// with up to a second of drift.
pub const MTIME_SLOP: Duration = Duration::from_secs(1);

/// Returns the normalised, absolute form of `path` without touching the
/// filesystem.
///
/// `.` components are dropped and `..` components are resolved lexically.
/// Relative paths are joined onto the current working directory. On Windows
/// the result avoids UNC paths where possible, same as the toolchains the
/// engine drives.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    dunce::simplified(&normalized).to_path_buf()
}

/// Converts a file modification time into the millisecond tick count stored
/// in the persistent caches.
pub fn mtime_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}

/// Creates the parent directory of `file` and all of its ancestors.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    Ok(())
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| BuildError::io(err, path))?;
    let file = std::io::BufReader::new(file);
    let val: T = serde_json::from_reader(file)?;
    Ok(val)
}

/// Writes serializes the provided value to JSON and writes it to a file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Splits a flat command-argument string into individual arguments,
/// honouring double quotes and backslash-escaped quotes, the way toolchains
/// interpret their response lines.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = arguments.chars().peekable();
    let mut seen_any = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                current.push(chars.next().unwrap());
                seen_any = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                seen_any = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if seen_any {
                    out.push(std::mem::take(&mut current));
                    seen_any = false;
                }
            }
            c => {
                current.push(c);
                seen_any = true;
            }
        }
    }
    if seen_any {
        out.push(current);
    }
    out
}

/// Writes `contents` to `path` through a sibling temporary file followed by a
/// rename, so that readers never observe a partially written file.
pub fn replace_file(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|err| BuildError::io(err, &tmp))?;
    fs::rename(&tmp, path).map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_normalize_lexically() {
        let base = if cfg!(windows) { PathBuf::from("C:\\work") } else { PathBuf::from("/work") };
        assert_eq!(
            normalize_path(base.join("engine").join("..").join("game").join(".").join("a.cpp")),
            base.join("game").join("a.cpp")
        );
    }

    #[test]
    fn normalize_keeps_root_on_excess_parents() {
        let root = if cfg!(windows) { "C:\\" } else { "/" };
        let path = Path::new(root).join("..").join("x");
        assert_eq!(normalize_path(&path), Path::new(root).join("x"));
    }

    #[test]
    fn mtime_millis_round_trips_epoch() {
        assert_eq!(mtime_millis(UNIX_EPOCH), 0);
        assert_eq!(mtime_millis(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn splits_arguments_with_quotes() {
        assert_eq!(
            split_arguments(r#"-c "dir with space/a.cpp" -o a.o"#),
            vec!["-c", "dir with space/a.cpp", "-o", "a.o"]
        );
        assert_eq!(split_arguments(r#"-DNAME=\"game\""#), vec![r#"-DNAME="game""#]);
        assert_eq!(split_arguments("  "), Vec::<String>::new());
        assert_eq!(split_arguments(r#""" -x"#), vec!["", "-x"]);
    }

    #[test]
    fn replace_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("cache.bin");
        replace_file(&target, b"payload").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert!(!target.with_extension("tmp").exists());
    }
}
