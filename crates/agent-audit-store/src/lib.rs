#![forbid(unsafe_code)]

//! Narrow file-document adapter beneath the audit trail.
//!
//! Everything the trail persists goes through here: typed YAML documents,
//! plain-text side files, and the compact line-per-block ledger. Absence is
//! never an error (logs may legitimately not exist yet); a document that
//! exists but cannot be parsed fails loudly, because silently dropping
//! audit data defeats the trail's purpose.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document at {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },
    #[error("failed to serialize document for {path}: {detail}")]
    Serialize { path: PathBuf, detail: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read a typed YAML document. Returns `Ok(None)` when the file does not
/// exist and `StoreError::Malformed` when it exists but does not parse.
///
/// # Errors
/// Returns an error on I/O failure or a malformed document.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };

    let value = serde_yaml::from_str(&body).map_err(|err| StoreError::Malformed {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    Ok(Some(value))
}

/// Write a typed YAML document, creating parent directories as needed.
/// Existing content is replaced wholesale.
///
/// # Errors
/// Returns an error on serialization or I/O failure.
pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    ensure_parent(path)?;
    let body = serde_yaml::to_string(value).map_err(|err| StoreError::Serialize {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    fs::write(path, body).map_err(|err| StoreError::io(path, err))
}

/// Read a plain-text side file (`Ok(None)` when absent).
///
/// # Errors
/// Returns an error on I/O failure.
pub fn read_text(path: &Path) -> StoreResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(body) => Ok(Some(body)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Write a plain-text side file, creating parent directories as needed.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn write_text(path: &Path, body: &str) -> StoreResult<()> {
    ensure_parent(path)?;
    fs::write(path, body).map_err(|err| StoreError::io(path, err))
}

/// Append one line to a line-oriented ledger file.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn append_line(path: &Path, line: &str) -> StoreResult<()> {
    ensure_parent(path)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| StoreError::io(path, err))?;
    writeln!(file, "{line}").map_err(|err| StoreError::io(path, err))
}

/// All non-empty lines of a ledger file, in file order. Empty vec when the
/// file does not exist.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn read_lines(path: &Path) -> StoreResult<Vec<String>> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    Ok(body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Last non-empty line of a ledger file, or `None` when empty/absent.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn read_last_line(path: &Path) -> StoreResult<Option<String>> {
    Ok(read_lines(path)?.pop())
}

/// File stems (no extension) of every file in `dir` matching `extension`,
/// sorted lexicographically. Empty vec when the directory does not exist,
/// since a log that was never written to has no entries.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn list_stems(dir: &Path, extension: &str) -> StoreResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };

    let mut stems = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

/// Directory names directly under `dir`, sorted. Empty when absent.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn list_dirs(dir: &Path) -> StoreResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn ensure_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
    }
    Ok(())
}
