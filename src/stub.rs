//! Local placeholders for remote entries.
//!
//! A remote file that has not been downloaded is represented by a symbolic
//! link whose target is the URL-safe base64 encoding of a [`StubRecord`]. A
//! remote directory is represented by a real local directory; the marker
//! file [`DIR_CACHED_MARKER`] inside it means every child of the last remote
//! listing has been stubbed.

use std::{
    collections::HashSet,
    fs::{self, Metadata, OpenOptions},
    io::{self, ErrorKind, Write},
    os::unix::fs::symlink,
    path::Path,
    time::SystemTime,
};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::fs::{FSError, FileInfo};

pub const DIR_CACHED_MARKER: &str = ".bktls.cache";

const TEMP_SUFFIX: &str = ".kodofs-tmp";

#[derive(Debug, Serialize, Deserialize)]
struct StubRecord {
    name: String,
    size: u64,
    modified_time: SystemTime,
    is_dir: bool,
}

pub fn encode_stub(info: &FileInfo) -> Result<String, FSError> {
    let record = StubRecord {
        name: info.name.clone(),
        size: info.size,
        modified_time: info.modified_time,
        is_dir: info.is_dir,
    };
    let bytes = serde_json::to_vec(&record).map_err(|err| FSError::Decode(err.to_string()))?;
    Ok(URL_SAFE.encode(bytes))
}

pub fn decode_stub(target: &str) -> Result<FileInfo, FSError> {
    let bytes = URL_SAFE
        .decode(target)
        .map_err(|err| FSError::Decode(err.to_string()))?;
    let record: StubRecord =
        serde_json::from_slice(&bytes).map_err(|err| FSError::Decode(err.to_string()))?;

    Ok(FileInfo {
        name: record.name,
        size: record.size,
        modified_time: record.modified_time,
        is_dir: record.is_dir,
        remote: true,
    })
}

pub fn is_stubbed(meta: &Metadata) -> bool {
    meta.file_type().is_symlink()
}

pub fn is_internal(name: &str) -> bool {
    name == DIR_CACHED_MARKER || (name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}

/// Records `info` at `local`: a directory for remote directories, otherwise
/// a symbolic link carrying the encoded record. Writing the same record
/// twice leaves an identical link.
pub fn write_stub(local: &Path, info: &FileInfo) -> Result<(), FSError> {
    if info.is_dir {
        return match fs::create_dir(local) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let meta = fs::symlink_metadata(local)?;
                if meta.is_dir() {
                    return Ok(());
                }
                if is_stubbed(&meta) {
                    fs::remove_file(local)?;
                    fs::create_dir(local)?;
                    return Ok(());
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        };
    }

    let target = encode_stub(info)?;

    match fs::symlink_metadata(local) {
        Ok(meta) if is_stubbed(&meta) => {
            if link_target(local).as_deref() == Some(target.as_str()) {
                return Ok(());
            }
            remove_if_exists(local)?;
        }
        Ok(meta) if meta.is_file() => {
            if is_fresh(&meta, info) {
                return Ok(());
            }
            debug!(local=%local.display(), "replacing stale cached file with stub");
            remove_if_exists(local)?;
        }
        Ok(_) => {
            return Err(FSError::Io(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("directory in place of remote file: {}", local.display()),
            )));
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    match symlink(&target, local) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            // another writer got there first
            if link_target(local).as_deref() == Some(target.as_str()) {
                Ok(())
            } else {
                Err(err.into())
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Decodes the stub at `local`, falling back to `fallback` when `local` is
/// not a readable stub.
pub fn read_stub(local: &Path, fallback: FileInfo) -> FileInfo {
    match link_target(local) {
        None => fallback,
        Some(target) => decode_stub(&target).unwrap_or(fallback),
    }
}

pub fn check_cached(dir: &Path) -> bool {
    fs::symlink_metadata(dir.join(DIR_CACHED_MARKER)).is_ok()
}

pub fn touch_cached(dir: &Path) -> Result<(), FSError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(DIR_CACHED_MARKER))?;
    Ok(())
}

/// Stubs every entry of a remote listing under `base` and drops stubs for
/// children that are no longer listed. Returns how many entries could not
/// be stubbed. A name listed twice (a key `a` next to a prefix `a/`) keeps
/// its first entry and counts as an error.
pub fn sync_dir(base: &Path, entries: &[FileInfo]) -> usize {
    if let Err(err) = fs::create_dir_all(base) {
        warn!(error_message=%err, error_group="write_stub", base=%base.display(), "create dir failed");
        return entries.len().max(1);
    }

    let mut errors = 0;
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            debug!(error_group="write_stub", name=%entry.name, "name listed twice");
            errors += 1;
            continue;
        }
        if let Err(err) = write_stub(&base.join(&entry.name), entry) {
            debug!(error_message=%err, error_group="write_stub", name=%entry.name, "write stub failed");
            errors += 1;
        }
    }

    if let Ok(read) = fs::read_dir(base) {
        for item in read.flatten() {
            let name = item.file_name().to_string_lossy().to_string();
            if seen.contains(name.as_str()) || is_internal(&name) {
                continue;
            }
            let stale = item
                .file_type()
                .map(|t| t.is_symlink())
                .unwrap_or(false);
            if stale {
                if let Err(err) = remove_if_exists(&item.path()) {
                    debug!(error_message=%err, error_group="prune_stub", name=%name, "prune stub failed");
                }
            }
        }
    }

    errors
}

/// Writes downloaded content to `local` through a temporary sibling so a
/// half-written file is never visible, then restores the remote mtime. The
/// temporary file is unique per call, so concurrent writers of one path do
/// not share it; the last rename wins.
pub fn materialize(local: &Path, bytes: &[u8], modified_time: SystemTime) -> Result<(), FSError> {
    let parent = local
        .parent()
        .ok_or_else(|| FSError::NotFound(local.display().to_string()))?;
    let name = local
        .file_name()
        .ok_or_else(|| FSError::NotFound(local.display().to_string()))?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name.to_string_lossy()))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().set_modified(modified_time)?;
    temp.persist(local).map_err(|err| FSError::Io(err.error))?;
    Ok(())
}

fn is_fresh(meta: &Metadata, info: &FileInfo) -> bool {
    meta.len() == info.size && meta.modified().ok() == Some(info.modified_time)
}

fn link_target(local: &Path) -> Option<String> {
    fs::read_link(local)
        .ok()
        .and_then(|target| target.to_str().map(|s| s.to_string()))
}

fn remove_if_exists(local: &Path) -> io::Result<()> {
    match fs::remove_file(local) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
