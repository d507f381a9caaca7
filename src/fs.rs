//! Bucket mirrored into a local directory.
//!
//! Lookups are answered from the local tree first. A directory whose
//! cached marker is missing, a stub, or a missing name goes to the bucket
//! (unless offline); remote listings are turned into stubs in the
//! background and remote files may be materialized when closed.

use std::{
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, error, info, span, Level};

use crate::{
    bucket::Bucket,
    handle::{CachedFile, DirHandle, Handle, LocalFile, NotifyFile},
    model::fs::{FSError, FileInfo},
    stub,
    util::pool::{PoolConfig, StubWriter},
};

#[derive(Clone, Debug, Default)]
pub struct CacheOptions {
    /// Persist remote file content on close.
    pub cache_file: bool,
    pub offline: bool,
    pub pool: PoolConfig,
}

pub struct CachedFS {
    root: PathBuf,
    bucket: Bucket,
    notify: Option<Arc<dyn NotifyFile>>,
    cache_file: bool,
    offline: AtomicBool,
    writer: StubWriter,
}

impl CachedFS {
    pub fn new(
        root: &Path,
        bucket: Bucket,
        notify: Option<Arc<dyn NotifyFile>>,
        opts: &CacheOptions,
    ) -> Result<Self, FSError> {
        fs::create_dir_all(root)?;
        let writer = StubWriter::new(&opts.pool)?;

        info!(root=%root.display(), bucket=bucket.name(), offline=opts.offline, cache_file=opts.cache_file, "cached fs");

        Ok(Self {
            root: root.to_path_buf(),
            bucket,
            notify,
            cache_file: opts.cache_file,
            offline: AtomicBool::new(opts.offline),
            writer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Disables every network fallback for the rest of this instance's life.
    pub fn set_offline(&self) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            info!(root=%self.root.display(), "offline");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Waits for background stub passes, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.writer.wait_idle(timeout)
    }

    /// Local-only metadata of `name`. Directories that were never fully
    /// listed are tagged remote; stubs report the remote record.
    pub fn stat(&self, name: &str) -> Result<FileInfo, FSError> {
        let rel = clean(name)?;
        let local = self.root.join(&rel);

        let meta = match fs::symlink_metadata(&local) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FSError::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
            Ok(meta) => meta,
        };

        let info = FileInfo::from_metadata(base_name(&rel), &meta);
        if meta.is_dir() {
            if stub::check_cached(&local) {
                return Ok(info);
            }
            return Ok(info.into_remote());
        }
        if stub::is_stubbed(&meta) {
            return Ok(stub::read_stub(&local, info));
        }
        Ok(info)
    }

    pub fn open(&self, name: &str) -> Result<Handle, FSError> {
        let span = span!(Level::INFO, "open", context = "open");
        let _e = span.enter();

        let rel = clean(name)?;
        let local = self.root.join(&rel);
        let offline = self.is_offline();

        let meta = match fs::symlink_metadata(&local) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if offline {
                    return Err(FSError::NotFound(name.to_string()));
                }
                return self.sync_open(&rel);
            }
            Err(err) => return Err(err.into()),
            Ok(meta) => meta,
        };

        if meta.is_dir() {
            if offline || stub::check_cached(&local) {
                let entries = self.readdir_all(&local, offline)?;
                debug!(name = %rel, items = entries.len(), "open cached dir");
                let info = FileInfo::from_metadata(base_name(&rel), &meta);
                return Ok(Handle::Dir(DirHandle::new(info, entries)));
            }
            return self.sync_open(&rel);
        }

        if stub::is_stubbed(&meta) {
            if offline {
                return Err(FSError::NotFound(name.to_string()));
            }
            return self.sync_open(&rel);
        }

        let file = File::open(&local)?;
        Ok(Handle::Local(LocalFile::new(
            file,
            FileInfo::from_metadata(base_name(&rel), &meta),
        )))
    }

    /// Opens `rel` on the bucket. A directory listing is stubbed locally in
    /// the background; the returned handle already holds the entries.
    fn sync_open(&self, rel: &str) -> Result<Handle, FSError> {
        let handle = match self.bucket.open(rel) {
            Err(err) => {
                if !err.is_not_found() {
                    error!(error_message=%err, error_group="bucket_open", name=rel);
                }
                return Err(err);
            }
            Ok(handle) => handle,
        };

        match handle {
            Handle::Dir(dir) => {
                let base = self.root.join(rel);
                debug!(name = rel, items = dir.entries().len(), "sync dir");
                self.writer.submit(base, dir.entries().to_vec());
                Ok(Handle::Dir(dir))
            }
            Handle::Remote(file) if self.cache_file => Ok(Handle::Cached(CachedFile::new(
                file,
                &format!("/{}", rel),
                self.root.join(rel),
                self.notify.clone(),
            ))),
            other => Ok(other),
        }
    }

    /// Entries of a synced local directory. Internal files are hidden;
    /// stubs are decoded, or skipped when offline since they cannot be
    /// resolved.
    pub fn readdir_all(&self, local_dir: &Path, offline: bool) -> Result<Vec<FileInfo>, FSError> {
        let mut fis = Vec::new();

        for entry in fs::read_dir(local_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if stub::is_internal(&name) {
                continue;
            }

            let meta = entry.metadata()?;
            let info = FileInfo::from_metadata(&name, &meta);
            if stub::is_stubbed(&meta) {
                if offline {
                    continue;
                }
                fis.push(stub::read_stub(&entry.path(), info));
            } else {
                fis.push(info);
            }
        }

        fis.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(fis)
    }
}

/// Relative path of `name` inside the mirror; `""` is the root. Parent
/// components are refused so a name can never leave the local root.
fn clean(name: &str) -> Result<String, FSError> {
    let mut parts = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(FSError::NotFound(name.to_string())),
            part => parts.push(part),
        }
    }
    Ok(parts.join("/"))
}

fn base_name(rel: &str) -> &str {
    match rel.rsplit('/').next() {
        None | Some("") => ".",
        Some(name) => name,
    }
}
