//! Little-endian binary reader/writer for the engine's persistent files.
//!
//! The action archive, the action history and the source metadata cache all
//! share this primitive layer: fixed-width integers, length-prefixed UTF-8
//! strings and nullable strings. Field order within each format is a
//! compatibility contract; readers that encounter an unexpected version
//! report it to the caller, which treats the store as empty.

use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};

/// Serialises values into an in-memory buffer in the archive byte order.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    buffer: Vec<u8>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    pub fn write_opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.write_bool(true);
                self.write_str(value);
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_path(&mut self, value: &Path) {
        self.write_str(&value.to_string_lossy());
    }

    pub fn write_str_list<S: AsRef<str>>(&mut self, values: &[S]) {
        self.write_u32(values.len() as u32);
        for value in values {
            self.write_str(value.as_ref());
        }
    }
}

/// Deserialises values from a byte slice, tracking the read offset.
#[derive(Debug)]
pub struct ArchiveReader<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ArchiveReader<'a> {
    /// `path` names the file being decoded; it only appears in errors.
    pub fn new(path: &'a Path, bytes: &'a [u8]) -> Self {
        Self { path, bytes, offset: 0 }
    }

    fn corrupt(&self, message: impl Into<String>) -> BuildError {
        BuildError::CorruptArchive { path: self.path.to_path_buf(), message: message.into() }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.corrupt(format!("unexpected end of file at offset {}", self.offset)))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.corrupt(format!("invalid bool byte {other}"))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|err| self.corrupt(err.to_string()))
    }

    pub fn read_opt_str(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_str()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_path(&mut self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.read_str()?))
    }

    pub fn read_str_list(&mut self) -> Result<Vec<String>> {
        let len = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            values.push(self.read_str()?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut writer = ArchiveWriter::new();
        writer.write_i32(2);
        writer.write_bool(true);
        writer.write_i64(-5);
        writer.write_str("status");
        writer.write_opt_str(None);
        writer.write_opt_str(Some("first.h"));
        writer.write_str_list(&["a", "b"]);

        let bytes = writer.into_bytes();
        let path = Path::new("test.bin");
        let mut reader = ArchiveReader::new(path, &bytes);
        assert_eq!(reader.read_i32().unwrap(), 2);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i64().unwrap(), -5);
        assert_eq!(reader.read_str().unwrap(), "status");
        assert_eq!(reader.read_opt_str().unwrap(), None);
        assert_eq!(reader.read_opt_str().unwrap(), Some("first.h".to_string()));
        assert_eq!(reader.read_str_list().unwrap(), vec!["a", "b"]);
        assert!(reader.is_empty());
    }

    #[test]
    fn truncation_is_reported_as_corrupt() {
        let mut writer = ArchiveWriter::new();
        writer.write_str("abcdef");
        let mut bytes = writer.into_bytes();
        bytes.truncate(6);

        let path = Path::new("test.bin");
        let mut reader = ArchiveReader::new(path, &bytes);
        assert!(matches!(reader.read_str(), Err(BuildError::CorruptArchive { .. })));
    }
}
