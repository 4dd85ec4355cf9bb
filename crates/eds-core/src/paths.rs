//! Request path handling on raw bytes. File names reach the server exactly
//! as the client spelled them, so nothing here assumes UTF-8.

use std::ffi::OsStr;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest absolute path accepted for a request, matching common `PATH_MAX`.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("path is too long: {len} > {max}")]
    TooLong { len: usize, max: usize },
    #[error("path has no file name: {0}")]
    NoFileName(String),
}

/// A request path split the way slot names are built: `dir` always ends in
/// `/`, so `dir + name` is the full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub dir: Vec<u8>,
    pub name: Vec<u8>,
}

impl ParsedPath {
    pub fn full_path(&self) -> Vec<u8> {
        [self.dir.as_slice(), self.name.as_slice()].concat()
    }
}

#[cfg(unix)]
pub fn os_str_bytes(value: &OsStr) -> Vec<u8> {
    value.as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn os_str_bytes(value: &OsStr) -> Vec<u8> {
    value.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Makes `path` absolute against `cwd` and compresses it lexically.
///
/// Repeated slashes collapse, `.` components vanish and `..` removes the
/// previous component (or nothing at the root). Symlinks are not resolved.
pub fn normalize_path(path: &[u8], cwd: &Path) -> Result<Vec<u8>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }

    let joined = if path.starts_with(b"/") {
        path.to_vec()
    } else {
        let mut base = os_str_bytes(cwd.as_os_str());
        while base.last() == Some(&b'/') {
            base.pop();
        }
        base.push(b'/');
        base.extend_from_slice(path);
        base
    };

    let trailing_slash = joined.ends_with(b"/") && joined.len() > 1;
    let mut parts: Vec<&[u8]> = Vec::new();
    for component in joined.split(|byte| *byte == b'/') {
        match component {
            b"" | b"." => {}
            b".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut normalized = Vec::with_capacity(joined.len());
    for part in &parts {
        normalized.push(b'/');
        normalized.extend_from_slice(part);
    }
    if normalized.is_empty() || trailing_slash {
        normalized.push(b'/');
    }

    if normalized.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong {
            len: normalized.len(),
            max: MAX_PATH_LEN,
        });
    }
    Ok(normalized)
}

pub fn split_path(normalized: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match normalized.iter().rposition(|byte| *byte == b'/') {
        Some(idx) => (normalized[..=idx].to_vec(), normalized[idx + 1..].to_vec()),
        None => (Vec::new(), normalized.to_vec()),
    }
}

/// Normalizes and splits a requested file name.
pub fn parse_filename(path: &[u8], cwd: &Path) -> Result<ParsedPath, PathError> {
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong {
            len: path.len(),
            max: MAX_PATH_LEN,
        });
    }
    let normalized = normalize_path(path, cwd)?;
    let (dir, name) = split_path(&normalized);
    if name.is_empty() {
        return Err(PathError::NoFileName(
            String::from_utf8_lossy(&normalized).into_owned(),
        ));
    }
    Ok(ParsedPath { dir, name })
}
